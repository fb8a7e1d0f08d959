//! SMS through an external command-line tool (KDE Connect by default).
//!
//! One invocation per recipient:
//! `<program> [program_args..] --send-sms <msg> --destination <number> <-d|-n> <device>`
//!
//! `-d` addresses the phone by id, `-n` by name. Ids that the tool cannot
//! resolve fall back to `-n` once, and the switch sticks.

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SmsConfig;
use crate::dispatch::Channel;
use crate::engine::AlertEvent;
use crate::error::ChannelError;

const POLL: Duration = Duration::from_millis(25);

pub struct SmsTool {
    program: String,
    program_args: Vec<String>,
    device: String,
    recipients: Vec<String>,
    timeout: Duration,
    by_name: AtomicBool,
}

impl SmsTool {
    pub fn new(program: impl Into<String>, device: impl Into<String>, recipients: Vec<String>, timeout: Duration) -> Self {
        let device = device.into();
        let by_name = !looks_like_device_id(&device);
        Self {
            program: program.into(),
            program_args: Vec::new(),
            device,
            recipients,
            timeout,
            by_name: AtomicBool::new(by_name),
        }
    }

    pub fn from_config(config: &SmsConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.device.clone(),
            config.recipients.clone(),
            Duration::from_millis(config.timeout_ms),
        )
        .with_program_args(config.program_args.clone())
    }

    pub fn with_program_args(mut self, args: Vec<String>) -> Self {
        self.program_args = args;
        self
    }

    /// Worst case for one delivery: every invocation hits the tool timeout,
    /// including the by-name retry while the device is still addressed by id.
    /// Saturates instead of overflowing.
    pub fn budget(&self) -> Duration {
        let per_recipient = if self.by_name.load(Ordering::Relaxed) { 1 } else { 2 };
        u32::try_from(self.recipients.len().max(1))
            .ok()
            .and_then(|n| n.checked_mul(per_recipient))
            .and_then(|runs| self.timeout.checked_mul(runs))
            .unwrap_or(Duration::MAX)
    }

    fn device_flag(&self) -> &'static str {
        if self.by_name.load(Ordering::Relaxed) {
            "-n"
        } else {
            "-d"
        }
    }

    fn send_one(&self, number: &str, message: &str) -> Result<(), ChannelError> {
        let flag = self.device_flag();
        match self.invoke(number, message, flag) {
            Err(ChannelError::Rejected(err)) if flag == "-d" && err.to_lowercase().contains("find device") => {
                log::warn!("SMS tool cannot find device id '{}', retrying by name", self.device);
                self.invoke(number, message, "-n")?;
                self.by_name.store(true, Ordering::Relaxed);
                Ok(())
            }
            other => other,
        }
    }

    fn invoke(&self, number: &str, message: &str, flag: &str) -> Result<(), ChannelError> {
        let child = Command::new(&self.program)
            .args(&self.program_args)
            .args(["--send-sms", message, "--destination", number, flag, self.device.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ChannelError::Unavailable(format!("{} not found", self.program)),
                _ => ChannelError::Unavailable(format!("cannot run {}: {}", self.program, e)),
            })?;
        wait_bounded(child, self.timeout)
    }
}

/// Wait for the tool, killing it once `timeout` has passed.
fn wait_bounded(mut child: Child, timeout: Duration) -> Result<(), ChannelError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                let stderr = stderr.trim();
                return Err(ChannelError::Rejected(if stderr.is_empty() {
                    format!("exited with {status}")
                } else {
                    stderr.to_string()
                }));
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChannelError::Timeout(timeout));
            }
            Ok(None) => thread::sleep(POLL),
            Err(e) => return Err(ChannelError::Rejected(format!("cannot wait for SMS tool: {e}"))),
        }
    }
}

/// Device ids are long runs of hex digits, `_` or `-`.
fn looks_like_device_id(device: &str) -> bool {
    device.len() >= 16 && device.chars().all(|c| c.is_ascii_hexdigit() || c == '_' || c == '-')
}

impl Channel for SmsTool {
    fn name(&self) -> &str {
        "sms"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), ChannelError> {
        if self.device.is_empty() || self.recipients.is_empty() {
            return Err(ChannelError::Unavailable("no SMS device or recipients configured".into()));
        }
        let message = event.message();
        let mut failures = Vec::new();
        for number in &self.recipients {
            match self.send_one(number, &message) {
                Ok(()) => log::info!("SMS for alert {} sent to {}", event.alert_id, number),
                // The tool itself is missing; no point trying the others
                Err(e @ ChannelError::Unavailable(_)) => return Err(e),
                Err(e) => {
                    log::error!("SMS to {} failed: {}", number, e);
                    failures.push(format!("{number}: {e}"));
                }
            }
        }
        if failures.len() == self.recipients.len() {
            return Err(ChannelError::Rejected(failures.join("; ")));
        }
        Ok(())
    }
}
