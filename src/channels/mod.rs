//! Delivery channels plugged into the [`Dispatcher`](crate::dispatch::Dispatcher).
//!
//! The serial beacon lives in [`crate::serial`]; it implements the same
//! [`Channel`](crate::dispatch::Channel) trait.

pub mod dashboard;
pub mod sms;

pub use dashboard::{DashboardFeed, DashboardPush};
pub use sms::SmsTool;
