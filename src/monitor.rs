//! The host's main loop: source → engine → dispatcher → status.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::defaults::STATUS_HISTORY_LEN;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::engine::{AlertEngine, AlertEvent};
use crate::serial::DeviceReport;
use crate::source::MeasurementSource;
use crate::status::{write_status_file, ChannelLiveness, StatusBoard, StatusReport, ThresholdView};

type DeviceReports = Box<dyn Fn() -> Option<DeviceReport> + Send>;

/// What one tick did.
#[derive(Debug, Default)]
pub struct Tick {
    pub had_reading: bool,
    pub event: Option<AlertEvent>,
    pub dispatch: Option<DispatchReport>,
    pub reminder: Option<DispatchReport>,
}

pub struct Monitor<S> {
    source: S,
    engine: AlertEngine,
    dispatcher: Arc<Dispatcher>,
    board: StatusBoard,
    status_path: Option<PathBuf>,
    device_reports: Option<DeviceReports>,
    poll_interval: Duration,
}

impl<S: MeasurementSource> Monitor<S> {
    pub fn new(source: S, engine: AlertEngine, dispatcher: Arc<Dispatcher>, poll_interval: Duration) -> Self {
        Self {
            source,
            engine,
            dispatcher,
            board: StatusBoard::new(),
            status_path: None,
            device_reports: None,
            poll_interval,
        }
    }

    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    /// Where to fetch the beacon's latest report from when publishing status.
    pub fn with_device_reports(mut self, reports: impl Fn() -> Option<DeviceReport> + Send + 'static) -> Self {
        self.device_reports = Some(Box::new(reports));
        self
    }

    /// Handle to the published status.
    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn engine(&self) -> &AlertEngine {
        &self.engine
    }

    /// Poll once, ingest, fan out, remind, publish.
    pub fn tick(&mut self) -> Tick {
        let reading = self.source.next_reading();
        let event = reading.as_ref().and_then(|r| self.engine.ingest(r));
        let dispatch = event.as_ref().map(|e| self.dispatcher.dispatch(e));
        let reminder = match (&event, self.engine.latest_event()) {
            (None, Some(current)) => self.dispatcher.remind(current),
            _ => None,
        };
        self.publish();
        Tick {
            had_reading: reading.is_some(),
            event,
            dispatch,
            reminder,
        }
    }

    /// Tick until `running` clears or the source runs dry.
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!(
            "Monitoring at {:?} with channels {:?}",
            self.poll_interval,
            self.dispatcher.channel_names()
        );
        while running.load(Ordering::Relaxed) {
            let started = Instant::now();
            let tick = self.tick();
            if self.source.is_exhausted() {
                log::info!("Measurement source exhausted, stopping");
                break;
            }
            if !tick.had_reading {
                thread::sleep(self.poll_interval.saturating_sub(started.elapsed()));
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.engine.snapshot();
        let report = StatusReport {
            updated_at: Utc::now(),
            level_name: snapshot.level.name(),
            color: snapshot.level.color(),
            engine: snapshot,
            thresholds: ThresholdView::from(self.engine.thresholds()),
            channels: self
                .dispatcher
                .liveness()
                .into_iter()
                .map(|(name, active)| ChannelLiveness { name, active })
                .collect(),
            last_dispatch: self.dispatcher.last_report(),
            history: self.engine.history().rev().take(STATUS_HISTORY_LEN).cloned().collect(),
            readings: self.engine.readings().cloned().collect(),
            beacon_device: self.device_reports.as_ref().and_then(|f| f()),
            dropped_readings: self.engine.dropped(),
        };
        if let Some(path) = &self.status_path {
            if let Err(e) = write_status_file(path, &report) {
                log::warn!("Cannot write status file {}: {}", path.display(), e);
            }
        }
        self.board.publish(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::THRESHOLDS;
    use crate::dispatch::Channel;
    use crate::error::ChannelError;
    use crate::level::AlertLevel;
    use crate::source::Reading;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// `None` entries are ticks where the source has nothing new.
    struct Scripted(VecDeque<Option<f64>>);

    impl MeasurementSource for Scripted {
        fn next_reading(&mut self) -> Option<Reading> {
            self.0.pop_front().flatten().map(|v| Reading::now(v, 0.9))
        }
        fn is_exhausted(&self) -> bool {
            self.0.is_empty()
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, AlertLevel)>>,
    }

    impl Channel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
            self.seen.lock().unwrap().push((event.alert_id.clone(), event.level));
            Ok(())
        }
    }

    fn monitor(values: &[f64], reminder: Option<Duration>) -> (Monitor<Scripted>, Arc<Recorder>) {
        scripted_monitor(values.iter().copied().map(Some).collect(), reminder)
    }

    fn scripted_monitor(
        script: VecDeque<Option<f64>>,
        reminder: Option<Duration>,
    ) -> (Monitor<Scripted>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_channel(recorder.clone(), Duration::from_millis(200), reminder);
        let m = Monitor::new(
            Scripted(script),
            AlertEngine::new(THRESHOLDS, 0.5, 100),
            Arc::new(dispatcher),
            Duration::from_millis(1),
        );
        (m, recorder)
    }

    #[test]
    fn transitions_are_dispatched_and_published() {
        let (mut m, recorder) = monitor(&[100.0, 225.0, 230.0, 265.0], None);
        let ticks: Vec<Tick> = (0..4).map(|_| m.tick()).collect();

        assert!(ticks[0].event.is_none());
        assert_eq!(ticks[1].dispatch.as_ref().map(|d| d.level), Some(AlertLevel::Warning));
        assert!(ticks[2].dispatch.is_none());
        let levels: Vec<_> = recorder.seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(levels, [AlertLevel::Warning, AlertLevel::Danger]);

        let status = m.board().snapshot().unwrap();
        assert_eq!(status.engine.level, AlertLevel::Danger);
        assert_eq!(status.level_name, "DANGER");
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.history[0].level, AlertLevel::Danger, "newest first");
        assert_eq!(status.channels, [ChannelLiveness { name: "recorder".into(), active: true }]);
        assert_eq!(status.last_dispatch.map(|d| d.level), Some(AlertLevel::Danger));
        let chart: Vec<_> = status.readings.iter().map(|r| (r.water_cm, r.level)).collect();
        assert_eq!(
            chart,
            [
                (100.0, AlertLevel::Normal),
                (225.0, AlertLevel::Warning),
                (230.0, AlertLevel::Warning),
                (265.0, AlertLevel::Danger),
            ]
        );
    }

    #[test]
    fn tick_without_reading_changes_nothing() {
        let script = VecDeque::from([Some(225.0), None, None]);
        let (mut m, recorder) = scripted_monitor(script, Some(Duration::from_secs(60)));
        m.tick();
        let before = m.engine().snapshot();

        let tick = m.tick();
        assert!(!tick.had_reading);
        assert!(tick.event.is_none());
        assert!(tick.dispatch.is_none());
        assert!(tick.reminder.is_none());
        assert_eq!(m.engine().snapshot(), before);
        assert_eq!(m.engine().readings().len(), 1);
        assert_eq!(m.engine().dropped(), 0);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);

        let status = m.board().snapshot().unwrap();
        assert_eq!(status.engine, before);
        assert_eq!(status.readings.len(), 1);
    }

    #[test]
    fn quiet_ticks_send_reminders_with_same_id() {
        let (mut m, recorder) = monitor(&[265.0, 266.0, 267.0], Some(Duration::ZERO));
        m.tick();
        let tick = m.tick();
        assert!(tick.event.is_none());
        assert!(tick.reminder.as_ref().is_some_and(|r| r.reminder));

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0);
    }

    #[test]
    fn run_stops_when_source_is_exhausted() {
        let (mut m, recorder) = monitor(&[225.0, 150.0], None);
        let running = AtomicBool::new(true);
        m.run(&running);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert_eq!(m.engine().level(), AlertLevel::Normal);
    }

    #[test]
    fn run_honours_stop_flag() {
        let (mut m, recorder) = monitor(&[300.0], None);
        let running = AtomicBool::new(false);
        m.run(&running);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn status_file_written_each_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let (m, _) = monitor(&[225.0], None);
        let mut m = m.with_status_file(path.clone());
        m.tick();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["engine"]["level"], "WARNING");
    }
}
