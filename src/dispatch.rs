//! Multi-channel alert fan-out.
//!
//! Every event goes to every channel. Each delivery runs on its own thread
//! and is bounded by that channel's timeout; the caller waits until each
//! channel has either finished or run out of time, so a dispatch never takes
//! longer than the largest timeout. A channel that overruns is recorded as
//! failed and left to finish (or hang) on its own thread. The dispatcher
//! never retries; retry is a channel's own business.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::engine::AlertEvent;
use crate::error::ChannelError;
use crate::level::AlertLevel;

/// One independent delivery mechanism.
pub trait Channel: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Deliver one event. May block; the dispatcher bounds it.
    fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError>;
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelResult {
    pub channel: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
}

/// All channel outcomes for one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub alert_id: String,
    pub level: AlertLevel,
    /// Re-dispatch of an already announced event
    pub reminder: bool,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub results: Vec<ChannelResult>,
}

impl DispatchReport {
    pub fn result(&self, channel: &str) -> Option<&ChannelResult> {
        self.results.iter().find(|r| r.channel == channel)
    }

    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

struct ChannelSlot {
    channel: Arc<dyn Channel>,
    timeout: Duration,
    reminder: Option<Duration>,
}

/// Per-channel bookkeeping, only ever locked briefly and never across I/O.
#[derive(Default, Clone)]
struct SlotStatus {
    last_attempt: Option<Instant>,
    live: bool,
}

pub struct Dispatcher {
    slots: Vec<ChannelSlot>,
    status: Mutex<Vec<SlotStatus>>,
    /// Latest full fan-out; reminders never replace it
    last_report: Mutex<Option<DispatchReport>>,
    last_reminder: Mutex<Option<DispatchReport>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            status: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
            last_reminder: Mutex::new(None),
        }
    }

    /// Register a channel with its delivery timeout and optional reminder
    /// interval.
    pub fn add_channel(&mut self, channel: Arc<dyn Channel>, timeout: Duration, reminder: Option<Duration>) {
        log::info!(
            "Channel '{}' registered (timeout {:?}, reminder {:?})",
            channel.name(),
            timeout,
            reminder
        );
        self.slots.push(ChannelSlot {
            channel,
            timeout,
            reminder,
        });
        lock(&self.status).push(SlotStatus::default());
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.channel.name().to_string()).collect()
    }

    /// Upper bound on the wall-clock time of one dispatch.
    pub fn max_timeout(&self) -> Duration {
        self.slots.iter().map(|s| s.timeout).max().unwrap_or_default()
    }

    /// Send an event to every channel.
    pub fn dispatch(&self, event: &AlertEvent) -> DispatchReport {
        let all: Vec<usize> = (0..self.slots.len()).collect();
        self.run(event, &all, false)
    }

    /// Re-send the current event to channels whose reminder interval has
    /// elapsed. Nothing is re-sent at NORMAL.
    pub fn remind(&self, event: &AlertEvent) -> Option<DispatchReport> {
        if event.level == AlertLevel::Normal {
            return None;
        }
        let due: Vec<usize> = {
            let status = lock(&self.status);
            self.slots
                .iter()
                .enumerate()
                .filter(|(i, slot)| match (slot.reminder, status[*i].last_attempt) {
                    (Some(_), None) => true,
                    (Some(every), Some(at)) => at.elapsed() >= every,
                    (None, _) => false,
                })
                .map(|(i, _)| i)
                .collect()
        };
        if due.is_empty() {
            return None;
        }
        Some(self.run(event, &due, true))
    }

    /// Latest full report (one result per channel), without re-dispatching.
    pub fn last_report(&self) -> Option<DispatchReport> {
        lock(&self.last_report).clone()
    }

    /// Latest reminder report, covering only the channels that were due.
    pub fn last_reminder(&self) -> Option<DispatchReport> {
        lock(&self.last_reminder).clone()
    }

    /// Per-channel liveness: `true` if the last attempt succeeded.
    pub fn liveness(&self) -> Vec<(String, bool)> {
        let status = lock(&self.status);
        self.slots
            .iter()
            .zip(status.iter())
            .map(|(slot, st)| (slot.channel.name().to_string(), st.live))
            .collect()
    }

    fn run(&self, event: &AlertEvent, indices: &[usize], reminder: bool) -> DispatchReport {
        let started_at = Utc::now();
        let started = Instant::now();
        {
            let mut status = lock(&self.status);
            for &i in indices {
                status[i].last_attempt = Some(started);
            }
        }

        let (tx, rx) = mpsc::channel::<(usize, Result<(), ChannelError>, Duration)>();
        let mut outcomes: HashMap<usize, (Result<(), ChannelError>, Duration)> = HashMap::new();
        // `None` deadline: the timeout is too large to represent, wait for the worker
        let mut pending: Vec<(usize, Option<Instant>)> = Vec::with_capacity(indices.len());

        for &i in indices {
            let slot = &self.slots[i];
            let channel = Arc::clone(&slot.channel);
            let event = event.clone();
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("deliver-{}", channel.name()))
                .spawn(move || {
                    let t0 = Instant::now();
                    let result = channel.deliver(&event);
                    // Receiver is gone if we already timed out
                    let _ = tx.send((i, result, t0.elapsed()));
                });
            match spawned {
                Ok(_) => pending.push((i, started.checked_add(slot.timeout))),
                Err(e) => {
                    let err = ChannelError::Unavailable(format!("cannot spawn worker: {e}"));
                    outcomes.insert(i, (Err(err), Duration::ZERO));
                }
            }
        }
        drop(tx);

        while !pending.is_empty() {
            let received = match pending.iter().filter_map(|&(_, d)| d).min() {
                Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((i, result, latency)) => {
                    if let Some(pos) = pending.iter().position(|&(p, _)| p == i) {
                        pending.remove(pos);
                        outcomes.insert(i, (result, latency));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let (expired, waiting): (Vec<_>, Vec<_>) =
                        pending.into_iter().partition(|&(_, deadline)| deadline.is_some_and(|d| d <= now));
                    pending = waiting;
                    for (i, _) in expired {
                        let timeout = self.slots[i].timeout;
                        outcomes.insert(i, (Err(ChannelError::Timeout(timeout)), timeout));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    for (i, _) in pending.drain(..) {
                        outcomes.insert(i, (Err(ChannelError::Disconnected), started.elapsed()));
                    }
                }
            }
        }

        let results: Vec<ChannelResult> = indices
            .iter()
            .map(|&i| {
                let name = self.slots[i].channel.name().to_string();
                let (result, latency) = outcomes
                    .remove(&i)
                    .unwrap_or((Err(ChannelError::Disconnected), Duration::ZERO));
                match result {
                    Ok(()) => {
                        log::info!("Alert {} delivered via {} in {:?}", event.alert_id, name, latency);
                        ChannelResult {
                            channel: name,
                            ok: true,
                            error: None,
                            latency,
                        }
                    }
                    Err(e) => {
                        log::warn!("Alert {} failed on {}: {}", event.alert_id, name, e);
                        ChannelResult {
                            channel: name,
                            ok: false,
                            error: Some(e.to_string()),
                            latency,
                        }
                    }
                }
            })
            .collect();

        let report = DispatchReport {
            alert_id: event.alert_id.clone(),
            level: event.level,
            reminder,
            started_at,
            elapsed: started.elapsed(),
            results,
        };
        log::info!(
            "{} {} [{}]: {}/{} channels ok in {:?}",
            if reminder { "Reminder" } else { "Dispatch" },
            report.alert_id,
            report.level,
            report.delivered(),
            report.results.len(),
            report.elapsed
        );

        {
            let mut status = lock(&self.status);
            for (&i, r) in indices.iter().zip(&report.results) {
                status[i].live = r.ok;
            }
        }
        if reminder {
            *lock(&self.last_reminder) = Some(report.clone());
        } else {
            *lock(&self.last_report) = Some(report.clone());
        }
        report
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock, recovering from poisoning; the guarded data is plain bookkeeping.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChannel {
        name: &'static str,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeChannel {
        fn new(name: &'static str, delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::from_millis(delay_ms),
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Channel for FakeChannel {
        fn name(&self) -> &str {
            self.name
        }

        fn deliver(&self, _event: &AlertEvent) -> Result<(), ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.fail {
                Err(ChannelError::Unavailable("device absent".into()))
            } else {
                Ok(())
            }
        }
    }

    fn event(level: AlertLevel) -> AlertEvent {
        AlertEvent {
            alert_id: "abc12345".into(),
            level,
            previous: AlertLevel::Normal,
            water_cm: 265.0,
            timestamp: Utc::now(),
        }
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    #[test]
    fn failing_channel_does_not_affect_siblings() {
        let mut d = Dispatcher::new();
        let ms = Duration::from_millis;
        d.add_channel(FakeChannel::new("sms", 0, true), ms(500), None);
        d.add_channel(FakeChannel::new("dashboard", 20, false), ms(500), None);
        d.add_channel(FakeChannel::new("beacon", 40, false), ms(500), None);

        let report = d.dispatch(&event(AlertLevel::Danger));
        assert_eq!(report.results.len(), 3);
        assert!(!report.result("sms").unwrap().ok);
        assert!(report.result("dashboard").unwrap().ok);
        assert!(report.result("beacon").unwrap().ok);
        assert!(report.elapsed < ms(500));
        assert_eq!(report.delivered(), 2);
    }

    #[test]
    fn slow_channel_is_abandoned_at_its_timeout() {
        let mut d = Dispatcher::new();
        let ms = Duration::from_millis;
        d.add_channel(FakeChannel::new("stuck", 5_000, false), ms(100), None);
        d.add_channel(FakeChannel::new("fast", 0, false), ms(300), None);

        let report = d.dispatch(&event(AlertLevel::Warning));
        let stuck = report.result("stuck").unwrap();
        assert!(!stuck.ok);
        assert!(stuck.error.as_deref().unwrap().contains("timed out"));
        assert!(report.result("fast").unwrap().ok);
        assert!(report.elapsed < ms(1_000), "took {:?}", report.elapsed);
    }

    #[test]
    fn wall_clock_is_max_not_sum_of_delays() {
        let mut d = Dispatcher::new();
        let ms = Duration::from_millis;
        for name in ["a", "b", "c", "d"] {
            d.add_channel(FakeChannel::new(name, 150, false), ms(1_000), None);
        }
        let report = d.dispatch(&event(AlertLevel::Critical));
        assert!(report.all_ok());
        assert!(report.elapsed < ms(500), "took {:?}", report.elapsed);
    }

    #[test]
    fn every_event_attempts_every_channel() {
        let mut d = Dispatcher::new();
        let failing = FakeChannel::new("bad", 0, true);
        let good = FakeChannel::new("good", 0, false);
        d.add_channel(failing.clone(), Duration::from_millis(200), None);
        d.add_channel(good.clone(), Duration::from_millis(200), None);

        for _ in 0..3 {
            d.dispatch(&event(AlertLevel::Warning));
        }
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(good.calls.load(Ordering::SeqCst), 3);
    }

    // ── Status surface ──────────────────────────────────────────────

    #[test]
    fn last_report_and_liveness_reflect_latest_dispatch() {
        let mut d = Dispatcher::new();
        d.add_channel(FakeChannel::new("bad", 0, true), Duration::from_millis(200), None);
        d.add_channel(FakeChannel::new("good", 0, false), Duration::from_millis(200), None);

        assert!(d.last_report().is_none());
        assert_eq!(d.liveness(), [("bad".to_string(), false), ("good".to_string(), false)]);

        let report = d.dispatch(&event(AlertLevel::Danger));
        assert_eq!(d.last_report(), Some(report));
        assert_eq!(d.liveness(), [("bad".to_string(), false), ("good".to_string(), true)]);
    }

    #[test]
    fn report_serializes_latency_in_millis() {
        let r = ChannelResult {
            channel: "beacon".into(),
            ok: true,
            error: None,
            latency: Duration::from_millis(42),
        };
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"channel":"beacon","ok":true,"latency_ms":42}"#);
    }

    // ── Reminders ───────────────────────────────────────────────────

    #[test]
    fn reminder_only_hits_due_channels() {
        let mut d = Dispatcher::new();
        let beacon = FakeChannel::new("beacon", 0, false);
        let sms = FakeChannel::new("sms", 0, false);
        d.add_channel(beacon.clone(), Duration::from_millis(200), Some(Duration::from_millis(50)));
        d.add_channel(sms.clone(), Duration::from_millis(200), None);

        let ev = event(AlertLevel::Danger);
        d.dispatch(&ev);
        assert!(d.remind(&ev).is_none(), "nothing due right after dispatch");

        thread::sleep(Duration::from_millis(60));
        let report = d.remind(&ev).unwrap();
        assert!(report.reminder);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].channel, "beacon");
        assert_eq!(report.alert_id, "abc12345");
        assert_eq!(beacon.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sms.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reminder_keeps_full_report_for_status() {
        let mut d = Dispatcher::new();
        let ms = Duration::from_millis;
        d.add_channel(FakeChannel::new("dashboard", 0, false), ms(200), None);
        d.add_channel(FakeChannel::new("sms", 0, true), ms(200), Some(Duration::from_secs(300)));
        d.add_channel(FakeChannel::new("beacon", 0, false), ms(200), Some(ms(20)));

        let ev = event(AlertLevel::Critical);
        d.dispatch(&ev);
        thread::sleep(ms(30));
        let reminder = d.remind(&ev).unwrap();
        assert_eq!(reminder.results.len(), 1);

        let full = d.last_report().unwrap();
        assert!(!full.reminder);
        assert_eq!(full.results.len(), 3);
        assert!(!full.result("sms").unwrap().ok);
        assert_eq!(d.last_reminder(), Some(reminder));
    }

    #[test]
    fn unbounded_timeout_waits_for_the_worker() {
        let mut d = Dispatcher::new();
        d.add_channel(FakeChannel::new("slow", 30, false), Duration::MAX, None);
        d.add_channel(FakeChannel::new("fast", 0, false), Duration::from_millis(200), None);
        let report = d.dispatch(&event(AlertLevel::Warning));
        assert!(report.all_ok());
        assert_eq!(d.max_timeout(), Duration::MAX);
    }

    #[test]
    fn no_reminders_at_normal() {
        let mut d = Dispatcher::new();
        d.add_channel(FakeChannel::new("beacon", 0, false), Duration::from_millis(200), Some(Duration::ZERO));
        assert!(d.remind(&event(AlertLevel::Normal)).is_none());
        assert!(d.remind(&event(AlertLevel::Warning)).is_some());
    }

    #[test]
    fn max_timeout_bounds_dispatch() {
        let mut d = Dispatcher::new();
        assert_eq!(d.max_timeout(), Duration::ZERO);
        d.add_channel(FakeChannel::new("a", 0, false), Duration::from_millis(300), None);
        d.add_channel(FakeChannel::new("b", 0, false), Duration::from_millis(900), None);
        assert_eq!(d.max_timeout(), Duration::from_millis(900));
        assert_eq!(d.channel_names(), ["a", "b"]);
    }
}
