//! In-process push hub for dashboard surfaces.
//!
//! Each subscriber gets a bounded queue. Delivery never blocks: a full queue
//! skips that subscriber, a closed one is pruned.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatch::Channel;
use crate::engine::AlertEvent;
use crate::error::ChannelError;

/// What a dashboard receives for one alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardPush {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub old_level: &'static str,
    pub new_level: &'static str,
    pub color: &'static str,
    pub water_cm: f64,
    pub message: String,
}

impl From<&AlertEvent> for DashboardPush {
    fn from(event: &AlertEvent) -> Self {
        Self {
            id: event.alert_id.clone(),
            timestamp: event.timestamp,
            old_level: event.previous.name(),
            new_level: event.level.name(),
            color: event.level.color(),
            water_cm: event.water_cm,
            message: event.message(),
        }
    }
}

pub struct DashboardFeed {
    subscribers: Mutex<Vec<SyncSender<DashboardPush>>>,
    queue_len: usize,
}

impl DashboardFeed {
    pub fn new(queue_len: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_len: queue_len.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<DashboardPush> {
        let (tx, rx) = mpsc::sync_channel(self.queue_len);
        self.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SyncSender<DashboardPush>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Channel for DashboardFeed {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        let push = DashboardPush::from(event);
        let mut subscribers = self.lock();
        let mut delivered = 0usize;
        let mut full = 0usize;
        subscribers.retain(|tx| match tx.try_send(push.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                full += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        if delivered == 0 && full > 0 {
            return Err(ChannelError::Rejected(format!("{full} dashboard queue(s) full")));
        }
        if full > 0 {
            log::warn!("Dashboard push {} skipped {} full queue(s)", push.id, full);
        }
        log::debug!("Dashboard push {} to {} subscriber(s)", push.id, delivered);
        Ok(())
    }
}
