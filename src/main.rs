//! HydroGuard host service.
//!
//! Reads water-level readings as NDJSON (stdin or a file), classifies them,
//! and fans every confirmed level change out to the dashboard feed, the SMS
//! tool and the serial beacon. Dashboard pushes go to stdout as NDJSON; logs
//! go to stderr.
//!
//! Config path: first argument, else `$HYDROGUARD_CONFIG`, else
//! `hydroguard.toml`.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hydroguard::channels::{DashboardFeed, DashboardPush, SmsTool};
use hydroguard::config::Config;
use hydroguard::dispatch::Dispatcher;
use hydroguard::engine::AlertEngine;
use hydroguard::monitor::Monitor;
use hydroguard::protocol::VERSION;
use hydroguard::serial::SerialBeaconDriver;
use hydroguard::source::{BackgroundSource, MeasurementSource, MedianSmoother, NdjsonSource};

const CONFIG_ENV: &str = "HYDROGUARD_CONFIG";
const DEFAULT_CONFIG: &str = "hydroguard.toml";

fn main() -> Result<()> {
    init_logging();
    log::info!("HydroGuard v{} starting", VERSION);

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let thresholds = config.thresholds.table()?;

    let mut dispatcher = Dispatcher::new();

    if config.dashboard.enabled {
        let feed = Arc::new(DashboardFeed::new(config.dashboard.queue_len));
        let pushes = feed.subscribe();
        thread::Builder::new()
            .name("dashboard-out".into())
            .spawn(move || forward_pushes(pushes))
            .context("starting dashboard writer")?;
        dispatcher.add_channel(feed, Duration::from_millis(config.dashboard.timeout_ms), None);
    }

    if config.sms.enabled {
        let sms = Arc::new(SmsTool::from_config(&config.sms));
        let budget = sms.budget();
        dispatcher.add_channel(sms, budget, config.sms.reminder_secs.map(Duration::from_secs));
    }

    let beacon = config.beacon.enabled.then(|| Arc::new(SerialBeaconDriver::from_config(&config.beacon)));
    if let Some(beacon) = &beacon {
        dispatcher.add_channel(
            beacon.clone(),
            Duration::from_millis(config.beacon.timeout_ms),
            config.beacon.reminder_secs.map(Duration::from_secs),
        );
    }

    let engine = AlertEngine::new(thresholds, config.engine.min_confidence, config.engine.history_len)
        .with_reading_history(config.status.reading_history_len);
    let source = MedianSmoother::new(
        open_feed(&config.feed.path)?,
        config.feed.smoothing_window,
        config.engine.min_confidence,
    );

    let mut monitor = Monitor::new(source, engine, Arc::new(dispatcher), config.poll_interval());
    if let Some(path) = config.status.path.clone() {
        monitor = monitor.with_status_file(path);
    }
    if let Some(beacon) = beacon {
        monitor = monitor.with_device_reports(move || beacon.latest_report());
    }

    let running = AtomicBool::new(true);
    monitor.run(&running);

    log::info!(
        "Feed closed at level {} ({} readings dropped)",
        monitor.engine().level(),
        monitor.engine().dropped()
    );
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .init();
}

fn open_feed(path: &str) -> Result<impl MeasurementSource> {
    let source = if path == "-" {
        log::info!("Reading measurements from stdin");
        BackgroundSource::spawn(NdjsonSource::new(BufReader::new(io::stdin())))
    } else {
        let file = File::open(path).with_context(|| format!("opening feed {path}"))?;
        log::info!("Reading measurements from {}", path);
        BackgroundSource::spawn(NdjsonSource::new(BufReader::new(file)))
    };
    source.context("starting feed reader")
}

/// Dashboard pushes as NDJSON on stdout.
fn forward_pushes(pushes: Receiver<DashboardPush>) {
    let stdout = io::stdout();
    for push in pushes {
        let mut out = stdout.lock();
        let written = serde_json::to_writer(&mut out, &push)
            .map_err(io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            log::warn!("Dashboard output closed: {}", e);
            break;
        }
    }
}
