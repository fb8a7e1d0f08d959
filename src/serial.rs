//! Serial beacon driver (host side of the line protocol).
//!
//! Encodes each [`AlertEvent`] as one [`BeaconMessage`] line and writes it to
//! the beacon device. The port is opened on first use and reopened after a
//! transient failure. A background thread reads the device's NDJSON reports
//! and keeps the latest one for the status surface.
//!
//! Only one message is ever in flight. A send that arrives while another is
//! still writing fails at once with [`SerialError::Busy`]; the dispatcher
//! records it like any other failed attempt and the next reminder carries the
//! same alert again.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::comm::encode_message;
use crate::config::BeaconConfig;
use crate::dispatch::Channel;
use crate::engine::AlertEvent;
use crate::error::{ChannelError, SerialError};
use crate::protocol::{BeaconMessage, IdString, ID_LEN};

/// A report line from the beacon firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceReport {
    Ack {
        lvl: u8,
        cm: u16,
        id: String,
        state: String,
    },
    Error {
        reason: String,
    },
    Expired {
        lvl: u8,
        id: String,
    },
    RadioFault {
        op: String,
    },
    Status {
        state: String,
        lvl: u8,
        uptime: u32,
        accepted: u32,
        rejected: u32,
        board: String,
        version: String,
    },
}

/// Parse one line from the device. Anything that is not a report (boot
/// banners, ESP-IDF log output) yields `None`.
pub fn parse_device_line(line: &str) -> Option<DeviceReport> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Build the wire message for an event.
pub fn beacon_message(event: &AlertEvent) -> Result<BeaconMessage, SerialError> {
    let id = event.alert_id.get(..ID_LEN).unwrap_or(&event.alert_id);
    Ok(BeaconMessage {
        lvl: event.level.rank(),
        // Whole centimetres, truncated
        cm: event.water_cm.clamp(0.0, f64::from(u16::MAX)) as u16,
        id: IdString::try_from(id).map_err(|_| SerialError::Encode)?,
        ts: event.timestamp.timestamp().clamp(0, i64::from(u32::MAX)) as u32,
    })
}

/// An open link to the device: a writer and, optionally, a reader for the
/// device's reports.
pub struct Link {
    pub writer: Box<dyn Write + Send>,
    pub reader: Option<Box<dyn Read + Send>>,
}

/// Opens the serial link.
pub trait Connect: Send + Sync + 'static {
    fn describe(&self) -> &str;
    fn connect(&self) -> Result<Link, SerialError>;
}

/// [`Connect`] over a real serial port, 8N1.
pub struct SerialPortConnector {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialPortConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
        }
    }
}

impl Connect for SerialPortConnector {
    fn describe(&self) -> &str {
        &self.path
    }

    fn connect(&self) -> Result<Link, SerialError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(|e| SerialError::DeviceUnavailable {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        let reader = match port.try_clone() {
            Ok(clone) => Some(Box::new(clone) as Box<dyn Read + Send>),
            Err(e) => {
                log::warn!("Cannot clone {} for reading: {}", self.path, e);
                None
            }
        };
        log::info!("Opened beacon port {} at {} baud", self.path, self.baud_rate);
        Ok(Link {
            writer: Box::new(port),
            reader,
        })
    }
}

/// Clears the in-flight flag when a send ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SerialBeaconDriver<C = SerialPortConnector> {
    connector: C,
    write_timeout: Duration,
    port: Mutex<Option<Box<dyn Write + Send>>>,
    in_flight: AtomicBool,
    /// Bumped on every (re)open; stale reader threads exit when they see it change
    generation: Arc<AtomicU64>,
    latest_report: Arc<Mutex<Option<DeviceReport>>>,
}

impl SerialBeaconDriver<SerialPortConnector> {
    pub fn from_config(config: &BeaconConfig) -> Self {
        let write_timeout = Duration::from_millis(config.write_timeout_ms);
        Self::new(
            SerialPortConnector::new(config.port.clone(), config.baud_rate, write_timeout),
            write_timeout,
        )
    }
}

impl<C: Connect> SerialBeaconDriver<C> {
    pub fn new(connector: C, write_timeout: Duration) -> Self {
        Self {
            connector,
            write_timeout,
            port: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
            latest_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Encode and write one event.
    pub fn send(&self, event: &AlertEvent) -> Result<(), SerialError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(SerialError::Busy);
        }
        let _flight = InFlight(&self.in_flight);

        let msg = beacon_message(event)?;
        let line = encode_message(&msg).ok_or(SerialError::Encode)?;

        // Taken out of the mutex so the write happens without the lock held
        let mut port = match lock(&self.port).take() {
            Some(port) => port,
            None => self.open()?,
        };
        match self.write_line(port.as_mut(), &line) {
            Ok(()) => {}
            Err(SerialError::Io(e)) => {
                log::warn!("Beacon write failed ({}), reopening {}", e, self.connector.describe());
                drop(port);
                port = self.open()?;
                self.write_line(port.as_mut(), &line)?;
            }
            Err(e) => return Err(e),
        }
        *lock(&self.port) = Some(port);
        log::debug!("Beacon <- lvl={} cm={} id={}", msg.lvl, msg.cm, msg.id);
        Ok(())
    }

    /// Most recent report line from the device.
    pub fn latest_report(&self) -> Option<DeviceReport> {
        lock(&self.latest_report).clone()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.port).is_some()
    }

    fn write_line(&self, port: &mut (dyn Write + Send), line: &[u8]) -> Result<(), SerialError> {
        port.write_all(line)
            .and_then(|()| port.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    SerialError::WriteTimeout(self.write_timeout)
                }
                _ => SerialError::Io(e),
            })
    }

    fn open(&self) -> Result<Box<dyn Write + Send>, SerialError> {
        let Link { mut writer, reader } = self.connector.connect()?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        // Terminate whatever partial line an earlier failed write left behind
        self.write_line(writer.as_mut(), b"\n")?;
        if let Some(reader) = reader {
            self.spawn_reader(reader, generation);
        }
        Ok(writer)
    }

    fn spawn_reader(&self, reader: Box<dyn Read + Send>, generation: u64) {
        let current = Arc::clone(&self.generation);
        let latest = Arc::clone(&self.latest_report);
        let spawned = thread::Builder::new()
            .name("beacon-rx".into())
            .spawn(move || read_reports(reader, generation, &current, &latest));
        if let Err(e) = spawned {
            log::warn!("Cannot start beacon reader: {}", e);
        }
    }
}

fn read_reports(
    reader: Box<dyn Read + Send>,
    generation: u64,
    current: &AtomicU64,
    latest: &Mutex<Option<DeviceReport>>,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    while current.load(Ordering::Acquire) == generation {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) if line.last() != Some(&b'\n') => continue,
            Ok(_) => {
                handle_device_line(&String::from_utf8_lossy(&line), latest);
                line.clear();
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                log::warn!("Beacon read failed: {}", e);
                break;
            }
        }
    }
    if !line.is_empty() {
        handle_device_line(&String::from_utf8_lossy(&line), latest);
    }
    log::debug!("Beacon reader {} stopped", generation);
}

fn handle_device_line(line: &str, latest: &Mutex<Option<DeviceReport>>) {
    let Some(report) = parse_device_line(line) else {
        let line = line.trim();
        if !line.is_empty() {
            log::debug!("beacon: {}", line);
        }
        return;
    };
    match &report {
        DeviceReport::Ack { lvl, id, state, .. } => log::debug!("Beacon ack lvl={} id={} ({})", lvl, id, state),
        DeviceReport::Error { reason } => log::warn!("Beacon rejected a line: {}", reason),
        DeviceReport::Expired { lvl, id } => log::info!("Beacon idle timeout, stopped lvl={} id={}", lvl, id),
        DeviceReport::RadioFault { op } => log::warn!("Beacon radio fault on {}", op),
        DeviceReport::Status { state, uptime, board, .. } => {
            log::info!("Beacon status: {} up {}s on {}", state, uptime, board)
        }
    }
    *lock(latest) = Some(report);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl<C: Connect> Channel for SerialBeaconDriver<C> {
    fn name(&self) -> &str {
        "beacon"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        self.send(event).map_err(ChannelError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::parse_message;
    use crate::level::AlertLevel;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Fail(io::ErrorKind),
        Slow(Duration),
        /// Times out on every write, the resync newline included
        Stalled,
    }

    struct FakePort {
        sink: Arc<Mutex<Vec<u8>>>,
        behavior: Behavior,
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Behavior::Stalled = self.behavior {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "fake"));
            }
            // Otherwise the resync newline always goes through
            if buf != b"\n" {
                match self.behavior {
                    Behavior::Ok | Behavior::Stalled => {}
                    Behavior::Fail(kind) => return Err(io::Error::new(kind, "fake")),
                    Behavior::Slow(d) => thread::sleep(d),
                }
            }
            self.sink.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FakeConnector {
        opens: AtomicUsize,
        available: bool,
        sink: Arc<Mutex<Vec<u8>>>,
        behaviors: Mutex<VecDeque<Behavior>>,
        device_output: &'static [u8],
    }

    impl FakeConnector {
        fn new(behaviors: &[Behavior]) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                available: true,
                sink: Arc::new(Mutex::new(Vec::new())),
                behaviors: Mutex::new(behaviors.iter().copied().collect()),
                device_output: b"",
            }
        }
    }

    impl Connect for FakeConnector {
        fn describe(&self) -> &str {
            "fake"
        }

        fn connect(&self) -> Result<Link, SerialError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.available {
                return Err(SerialError::DeviceUnavailable {
                    path: "/dev/ttyUSB9".into(),
                    reason: "No such file or directory".into(),
                });
            }
            let behavior = self.behaviors.lock().unwrap().pop_front().unwrap_or(Behavior::Ok);
            Ok(Link {
                writer: Box::new(FakePort {
                    sink: Arc::clone(&self.sink),
                    behavior,
                }),
                reader: Some(Box::new(Cursor::new(self.device_output))),
            })
        }
    }

    fn event(level: AlertLevel, cm: f64, id: &str) -> AlertEvent {
        AlertEvent {
            alert_id: id.into(),
            level,
            previous: AlertLevel::Normal,
            water_cm: cm,
            timestamp: Utc.timestamp_opt(1_709_100_000, 0).unwrap(),
        }
    }

    fn driver(connector: FakeConnector) -> SerialBeaconDriver<FakeConnector> {
        SerialBeaconDriver::new(connector, Duration::from_millis(100))
    }

    fn sent_lines(d: &SerialBeaconDriver<FakeConnector>) -> Vec<BeaconMessage> {
        let bytes = d.connector.sink.lock().unwrap().clone();
        bytes
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| parse_message(l).unwrap())
            .collect()
    }

    // ── Encoding ────────────────────────────────────────────────────

    #[test]
    fn event_encodes_to_wire_message() {
        let msg = beacon_message(&event(AlertLevel::Critical, 285.9, "abc12345")).unwrap();
        assert_eq!(msg.lvl, 3);
        assert_eq!(msg.cm, 285);
        assert_eq!(msg.id.as_str(), "abc12345");
        assert_eq!(msg.ts, 1_709_100_000);
    }

    #[test]
    fn long_id_is_cut_and_cm_is_clamped() {
        let msg = beacon_message(&event(AlertLevel::Warning, -4.0, "0123456789abcdef")).unwrap();
        assert_eq!(msg.id.as_str(), "01234567");
        assert_eq!(msg.cm, 0);
        let msg = beacon_message(&event(AlertLevel::Warning, 1e9, "x")).unwrap();
        assert_eq!(msg.cm, u16::MAX);
    }

    // ── Sending ─────────────────────────────────────────────────────

    #[test]
    fn send_writes_one_line_and_keeps_port_open() {
        let d = driver(FakeConnector::new(&[]));
        assert!(!d.is_open());
        d.send(&event(AlertLevel::Danger, 265.0, "abc12345")).unwrap();
        d.send(&event(AlertLevel::Critical, 291.0, "def67890")).unwrap();

        let lines = sent_lines(&d);
        assert_eq!(lines.len(), 2);
        assert_eq!((lines[0].lvl, lines[0].cm), (2, 265));
        assert_eq!(lines[1].id.as_str(), "def67890");
        assert!(d.is_open());
        assert_eq!(d.connector.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_device_is_unavailable() {
        let mut connector = FakeConnector::new(&[]);
        connector.available = false;
        let d = driver(connector);
        let err = d.send(&event(AlertLevel::Warning, 225.0, "abc12345")).unwrap_err();
        assert!(matches!(err, SerialError::DeviceUnavailable { .. }));
        assert!(matches!(
            d.deliver(&event(AlertLevel::Warning, 225.0, "abc12345")),
            Err(ChannelError::Unavailable(_))
        ));
    }

    #[test]
    fn transient_error_reopens_and_retries_once() {
        let d = driver(FakeConnector::new(&[Behavior::Fail(io::ErrorKind::BrokenPipe)]));
        d.send(&event(AlertLevel::Danger, 265.0, "abc12345")).unwrap();
        assert_eq!(d.connector.opens.load(Ordering::SeqCst), 2);
        assert_eq!(sent_lines(&d).len(), 1);
    }

    #[test]
    fn second_transient_error_is_surfaced() {
        let d = driver(FakeConnector::new(&[
            Behavior::Fail(io::ErrorKind::BrokenPipe),
            Behavior::Fail(io::ErrorKind::BrokenPipe),
        ]));
        assert!(matches!(
            d.send(&event(AlertLevel::Danger, 265.0, "abc12345")),
            Err(SerialError::Io(_))
        ));
        assert_eq!(d.connector.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timeout_is_not_retried() {
        let d = driver(FakeConnector::new(&[Behavior::Fail(io::ErrorKind::TimedOut)]));
        let err = d.send(&event(AlertLevel::Danger, 265.0, "abc12345")).unwrap_err();
        assert!(matches!(err, SerialError::WriteTimeout(t) if t == Duration::from_millis(100)));
        assert_eq!(d.connector.opens.load(Ordering::SeqCst), 1);
        assert!(!d.is_open(), "handle dropped after timeout");
    }

    #[test]
    fn stalled_resync_is_a_write_timeout() {
        let d = driver(FakeConnector::new(&[Behavior::Stalled]));
        let ev = event(AlertLevel::Danger, 265.0, "abc12345");
        let err = d.send(&ev).unwrap_err();
        assert!(matches!(err, SerialError::WriteTimeout(t) if t == Duration::from_millis(100)));
        assert!(!d.is_open());
        assert_eq!(d.connector.opens.load(Ordering::SeqCst), 1);

        let d = driver(FakeConnector::new(&[Behavior::Stalled]));
        assert!(matches!(d.deliver(&ev), Err(ChannelError::Timeout(_))));
    }

    #[test]
    fn concurrent_send_is_busy() {
        let d = Arc::new(driver(FakeConnector::new(&[Behavior::Slow(Duration::from_millis(300))])));
        let first = {
            let d = Arc::clone(&d);
            thread::spawn(move || d.send(&event(AlertLevel::Danger, 265.0, "abc12345")))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            d.send(&event(AlertLevel::Critical, 295.0, "def67890")),
            Err(SerialError::Busy)
        ));
        first.join().unwrap().unwrap();
        // Free again once the first send is done
        d.send(&event(AlertLevel::Critical, 295.0, "def67890")).unwrap();
        assert_eq!(sent_lines(&d).len(), 2);
    }

    // ── Device reports ──────────────────────────────────────────────

    #[test]
    fn parses_report_lines() {
        let status = r#"{"type":"status","state":"advertising","lvl":2,"uptime":61,"accepted":3,"rejected":1,"board":"xiao_esp32s3","version":"0.1.0"}"#;
        assert!(matches!(
            parse_device_line(status),
            Some(DeviceReport::Status { lvl: 2, uptime: 61, .. })
        ));
        assert_eq!(
            parse_device_line(r#"{"type":"error","reason":"malformed"}"#),
            Some(DeviceReport::Error {
                reason: "malformed".into()
            })
        );
        assert_eq!(parse_device_line("I (312) boot: ESP-IDF v5.1"), None);
        assert_eq!(parse_device_line(r#"{"type":"unknown"}"#), None);
    }

    #[test]
    fn reader_thread_keeps_latest_report() {
        let mut connector = FakeConnector::new(&[]);
        connector.device_output = b"boot banner\n{\"type\":\"ack\",\"lvl\":2,\"cm\":265,\"id\":\"abc12345\",\"state\":\"advertising\"}\n";
        let d = driver(connector);
        d.send(&event(AlertLevel::Danger, 265.0, "abc12345")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while d.latest_report().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(d.latest_report(), Some(DeviceReport::Ack { lvl: 2, cm: 265, .. })));
    }
}
