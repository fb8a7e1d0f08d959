//! Measurement feed.
//!
//! The vision pipeline is an external process; it hands readings to the
//! engine as NDJSON, one object per line:
//!
//! ```text
//! {"cm": 231.4, "confidence": 0.92, "ts": 1709100000}
//! {"cm": null, "confidence": 0.0}
//! ```
//!
//! `cm: null` means the detector saw no waterline this frame. `confidence`
//! is required; a line without it is counted as unparsable, not trusted.

use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// One sampled water-level measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value_cm: f64,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(value_cm: f64, confidence: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value_cm,
            confidence,
            timestamp,
        }
    }

    /// Reading stamped with the current time.
    pub fn now(value_cm: f64, confidence: f64) -> Self {
        Self::new(value_cm, confidence, Utc::now())
    }
}

/// Periodic source of readings.
pub trait MeasurementSource {
    /// Next reading, or `None` when there is no new data this tick.
    fn next_reading(&mut self) -> Option<Reading>;

    /// True once the source will never yield again.
    fn is_exhausted(&self) -> bool {
        false
    }
}

// ── NDJSON feed ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FeedLine {
    cm: Option<f64>,
    confidence: f64,
    #[serde(default)]
    ts: Option<i64>,
}

/// Reads NDJSON readings from any buffered reader (stdin, a FIFO, a file).
pub struct NdjsonSource<R> {
    reader: R,
    line: String,
    exhausted: bool,
    bad_lines: u64,
}

impl<R: BufRead> NdjsonSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            exhausted: false,
            bad_lines: 0,
        }
    }

    /// Lines that could not be parsed so far.
    pub fn bad_lines(&self) -> u64 {
        self.bad_lines
    }

    fn parse_line(&mut self) -> Option<Reading> {
        let text = self.line.trim();
        if text.is_empty() {
            return None;
        }
        let parsed: FeedLine = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.bad_lines += 1;
                log::warn!("Unparsable feed line ({}): {}", e, text);
                return None;
            }
        };
        let value_cm = parsed.cm?;
        let timestamp = parsed
            .ts
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);
        Some(Reading::new(value_cm, parsed.confidence, timestamp))
    }
}

impl<R: BufRead> MeasurementSource for NdjsonSource<R> {
    fn next_reading(&mut self) -> Option<Reading> {
        if self.exhausted {
            return None;
        }
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => {
                log::info!("Measurement feed closed");
                self.exhausted = true;
                None
            }
            Ok(_) => self.parse_line(),
            Err(e) => {
                log::error!("Measurement feed read failed: {}", e);
                self.exhausted = true;
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

// ── Background reader ────────────────────────────────────────────────

/// Runs a blocking source on its own thread so the monitor can poll it
/// without stalling. The inner source must block (or at least yield) when
/// it has nothing new, as [`NdjsonSource`] does on a pipe.
pub struct BackgroundSource {
    rx: Receiver<Reading>,
    exhausted: bool,
}

impl BackgroundSource {
    pub fn spawn<S>(mut inner: S) -> io::Result<Self>
    where
        S: MeasurementSource + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new().name("feed".into()).spawn(move || {
            while !inner.is_exhausted() {
                match inner.next_reading() {
                    Some(reading) => {
                        if tx.send(reading).is_err() {
                            break;
                        }
                    }
                    None => thread::yield_now(),
                }
            }
        })?;
        Ok(Self { rx, exhausted: false })
    }
}

impl MeasurementSource for BackgroundSource {
    fn next_reading(&mut self) -> Option<Reading> {
        match self.rx.try_recv() {
            Ok(reading) => Some(reading),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.exhausted = true;
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

// ── Temporal median filter ───────────────────────────────────────────

/// Replaces each accepted reading's value with the median of the last
/// `window` accepted values. Readings below `min_confidence` pass through
/// untouched and never enter the window.
pub struct MedianSmoother<S> {
    inner: S,
    window: usize,
    min_confidence: f64,
    history: VecDeque<f64>,
}

impl<S: MeasurementSource> MedianSmoother<S> {
    pub fn new(inner: S, window: usize, min_confidence: f64) -> Self {
        Self {
            inner,
            window: window.max(1),
            min_confidence,
            history: VecDeque::with_capacity(window.max(1)),
        }
    }

    fn median(&self) -> Option<f64> {
        let mut values: Vec<f64> = self.history.iter().copied().collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        Some(if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        })
    }
}

impl<S: MeasurementSource> MeasurementSource for MedianSmoother<S> {
    fn next_reading(&mut self) -> Option<Reading> {
        let reading = self.inner.next_reading()?;
        if self.window <= 1 || !reading.value_cm.is_finite() || reading.confidence < self.min_confidence {
            return Some(reading);
        }
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(reading.value_cm);
        let value_cm = self.median().unwrap_or(reading.value_cm);
        Some(Reading { value_cm, ..reading })
    }

    fn is_exhausted(&self) -> bool {
        self.inner.is_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Scripted(VecDeque<Option<Reading>>);

    impl MeasurementSource for Scripted {
        fn next_reading(&mut self) -> Option<Reading> {
            self.0.pop_front().flatten()
        }
        fn is_exhausted(&self) -> bool {
            self.0.is_empty()
        }
    }

    fn scripted(values: &[(f64, f64)]) -> Scripted {
        Scripted(values.iter().map(|&(v, c)| Some(Reading::now(v, c))).collect())
    }

    // ── NdjsonSource ────────────────────────────────────────────────

    #[test]
    fn ndjson_parses_readings_and_nulls() {
        let feed = "{\"cm\":231.5,\"confidence\":0.9,\"ts\":1709100000}\n{\"cm\":null,\"confidence\":0.0}\n";
        let mut src = NdjsonSource::new(Cursor::new(feed));

        let r = src.next_reading().unwrap();
        assert_eq!(r.value_cm, 231.5);
        assert_eq!(r.confidence, 0.9);
        assert_eq!(r.timestamp.timestamp(), 1_709_100_000);

        assert!(src.next_reading().is_none());
        assert!(!src.is_exhausted());

        assert!(src.next_reading().is_none());
        assert!(src.is_exhausted());
    }

    #[test]
    fn ndjson_skips_garbage_without_stopping() {
        let feed = "garbage\n\n{\"cm\":100,\"confidence\":1}\n";
        let mut src = NdjsonSource::new(Cursor::new(feed));
        assert!(src.next_reading().is_none());
        assert!(src.next_reading().is_none());
        assert_eq!(src.next_reading().map(|r| r.value_cm), Some(100.0));
        assert_eq!(src.bad_lines(), 1);
    }

    #[test]
    fn ndjson_line_without_confidence_is_unparsable() {
        let feed = "{\"cm\":260.0}\n{\"cm\":null}\n{\"cm\":261.0,\"confidence\":0.8}\n";
        let mut src = NdjsonSource::new(Cursor::new(feed));
        assert!(src.next_reading().is_none());
        assert!(src.next_reading().is_none());
        assert_eq!(src.bad_lines(), 2);
        let r = src.next_reading().unwrap();
        assert_eq!((r.value_cm, r.confidence), (261.0, 0.8));
    }

    // ── BackgroundSource ────────────────────────────────────────────

    #[test]
    fn background_source_drains_then_reports_exhaustion() {
        let feed = "{\"cm\":210,\"confidence\":1}\n{\"cm\":230,\"confidence\":1}\n";
        let mut src = BackgroundSource::spawn(NdjsonSource::new(Cursor::new(feed))).unwrap();

        let mut values = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !src.is_exhausted() && std::time::Instant::now() < deadline {
            match src.next_reading() {
                Some(r) => values.push(r.value_cm),
                None => thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        assert_eq!(values, [210.0, 230.0]);
        assert!(src.is_exhausted());
    }

    // ── MedianSmoother ──────────────────────────────────────────────

    #[test]
    fn median_suppresses_single_spike() {
        let src = scripted(&[(200.0, 1.0), (201.0, 1.0), (290.0, 1.0), (202.0, 1.0)]);
        let mut smooth = MedianSmoother::new(src, 3, 0.5);
        let out: Vec<f64> = std::iter::from_fn(|| smooth.next_reading()).map(|r| r.value_cm).collect();
        assert_eq!(out, [200.0, 200.5, 201.0, 202.0]);
    }

    #[test]
    fn low_confidence_bypasses_window() {
        let src = scripted(&[(200.0, 1.0), (500.0, 0.1), (202.0, 1.0)]);
        let mut smooth = MedianSmoother::new(src, 3, 0.5);
        assert_eq!(smooth.next_reading().map(|r| r.value_cm), Some(200.0));
        let low = smooth.next_reading().unwrap();
        assert_eq!((low.value_cm, low.confidence), (500.0, 0.1));
        assert_eq!(smooth.next_reading().map(|r| r.value_cm), Some(201.0));
    }

    #[test]
    fn window_of_one_is_passthrough() {
        let src = scripted(&[(200.0, 1.0), (300.0, 1.0)]);
        let mut smooth = MedianSmoother::new(src, 1, 0.5);
        assert_eq!(smooth.next_reading().map(|r| r.value_cm), Some(200.0));
        assert_eq!(smooth.next_reading().map(|r| r.value_cm), Some(300.0));
        assert!(smooth.is_exhausted());
    }
}
