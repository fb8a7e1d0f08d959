/// Beacon-side protocol handler.
///
/// Runs on the radio beacon as a cooperative step function: the firmware
/// loop calls [`BeaconHandler::step`] on a fixed tick with whatever serial
/// bytes arrived since the last tick. The handler frames lines, applies
/// valid messages, expires stale broadcasts and drives the status LED.
/// It never blocks and never panics on input.
///
/// ```text
///            lvl > 0                      lvl > 0 (restart broadcast)
///  NORMAL ───────────► ADVERTISING ◄──────────────┐
///    ▲                  │    │                    │
///    │     lvl == 0     │    └────────────────────┘
///    ├──────────────────┘
///    │   30 s without a valid message
///    └────────────────── (idle expiry)
/// ```
///
/// Hardware is reached only through [`BeaconRadio`] and [`StatusLed`], so
/// the whole state machine runs under `cargo test` on the host.
use heapless::Vec;

use crate::comm::{parse_message, LineReader};
use crate::protocol::{adv_name, AdvName, BeaconFrame, BeaconMessage, ProtocolError, IDLE_TIMEOUT_MS};

/// Radio that broadcasts the frame.
pub trait BeaconRadio {
    type Error: core::fmt::Debug;

    /// Start (or restart) advertising with this frame and name.
    fn start(&mut self, frame: &BeaconFrame, name: &str) -> Result<(), Self::Error>;

    /// Stop advertising. Stopping an idle radio must be harmless.
    fn stop(&mut self) -> Result<(), Self::Error>;
}

/// Local visual indicator.
pub trait StatusLed {
    fn set(&mut self, on: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    Normal,
    Advertising,
}

impl BeaconState {
    pub const fn as_str(self) -> &'static str {
        match self {
            BeaconState::Normal => "normal",
            BeaconState::Advertising => "advertising",
        }
    }
}

/// LED blink pattern for a level rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkPattern {
    Off,
    Slow,
    Medium,
    Strobe,
}

impl BlinkPattern {
    pub const fn for_level(lvl: u8) -> Self {
        match lvl {
            0 => BlinkPattern::Off,
            1 => BlinkPattern::Slow,
            2 => BlinkPattern::Medium,
            _ => BlinkPattern::Strobe,
        }
    }

    /// Full on+off period, `None` when the LED stays dark.
    pub const fn period_ms(self) -> Option<u64> {
        match self {
            BlinkPattern::Off => None,
            BlinkPattern::Slow => Some(1000),
            BlinkPattern::Medium => Some(500),
            BlinkPattern::Strobe => Some(120),
        }
    }
}

/// Blink phase tracking. Only reports LED changes.
#[derive(Debug)]
struct Blinker {
    pattern: BlinkPattern,
    since_ms: u64,
    lit: bool,
}

impl Blinker {
    const fn new() -> Self {
        Self {
            pattern: BlinkPattern::Off,
            since_ms: 0,
            lit: false,
        }
    }

    fn set_pattern(&mut self, pattern: BlinkPattern, now_ms: u64) {
        if pattern != self.pattern {
            self.pattern = pattern;
            self.since_ms = now_ms;
        }
    }

    /// Desired LED state at `now_ms`, `Some` only when it changed.
    fn update(&mut self, now_ms: u64) -> Option<bool> {
        let want = match self.pattern.period_ms() {
            None => false,
            Some(period) => {
                let elapsed = now_ms.saturating_sub(self.since_ms);
                (elapsed % period) < period / 2
            }
        };
        if want != self.lit {
            self.lit = want;
            Some(want)
        } else {
            None
        }
    }
}

/// Something the firmware should report back over serial.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A valid message was applied
    Accepted(BeaconMessage),
    /// A line was rejected; state unchanged
    Rejected(ProtocolError),
    /// Idle timeout stopped the broadcast of this message
    Expired(BeaconMessage),
    /// Radio refused an operation ("start" / "stop")
    RadioFault(&'static str),
}

/// Result of one [`BeaconHandler::step`].
#[derive(Debug)]
pub struct Step {
    pub state: BeaconState,
    pub notices: Vec<Notice, 8>,
}

/// Counters for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub accepted: u32,
    pub rejected: u32,
    pub expired: u32,
}

/// The beacon protocol state machine.
pub struct BeaconHandler {
    reader: LineReader,
    state: BeaconState,
    /// Most recent valid message, kept across rejects and expiry.
    last_valid: Option<BeaconMessage>,
    last_valid_ms: u64,
    idle_timeout_ms: u64,
    blinker: Blinker,
    stats: HandlerStats,
}

impl BeaconHandler {
    pub const fn new() -> Self {
        Self::with_idle_timeout(IDLE_TIMEOUT_MS)
    }

    pub const fn with_idle_timeout(idle_timeout_ms: u64) -> Self {
        Self {
            reader: LineReader::new(),
            state: BeaconState::Normal,
            last_valid: None,
            last_valid_ms: 0,
            idle_timeout_ms,
            blinker: Blinker::new(),
            stats: HandlerStats {
                accepted: 0,
                rejected: 0,
                expired: 0,
            },
        }
    }

    pub fn state(&self) -> BeaconState {
        self.state
    }

    pub fn last_valid(&self) -> Option<&BeaconMessage> {
        self.last_valid.as_ref()
    }

    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    /// Level currently broadcast (0 when not advertising).
    pub fn current_level(&self) -> u8 {
        match (self.state, &self.last_valid) {
            (BeaconState::Advertising, Some(msg)) => msg.lvl,
            _ => 0,
        }
    }

    /// Name broadcast for the current message, if advertising.
    pub fn current_name(&self) -> Option<AdvName> {
        match (self.state, &self.last_valid) {
            (BeaconState::Advertising, Some(msg)) => Some(adv_name(msg.lvl, msg.cm)),
            _ => None,
        }
    }

    /// One cooperative tick: consume `rx` bytes, apply complete lines, check
    /// the idle timer, update the LED.
    pub fn step<R, L>(&mut self, now_ms: u64, rx: &[u8], radio: &mut R, led: &mut L) -> Step
    where
        R: BeaconRadio,
        L: StatusLed,
    {
        let mut notices: Vec<Notice, 8> = Vec::new();

        for &byte in rx {
            let parsed = match self.reader.feed(byte) {
                Some(Ok(line)) => parse_message(line),
                Some(Err(e)) => Err(e),
                None => continue,
            };
            let notice = match parsed {
                Ok(msg) => self.apply(msg, now_ms, radio, &mut notices),
                Err(e) => {
                    log::warn!("Rejected line: {}", e);
                    self.stats.rejected = self.stats.rejected.wrapping_add(1);
                    Notice::Rejected(e)
                }
            };
            push_notice(&mut notices, notice);
        }

        if let Some(notice) = self.check_idle(now_ms, radio) {
            push_notice(&mut notices, notice);
        }

        if let Some(on) = self.blinker.update(now_ms) {
            led.set(on);
        }

        Step {
            state: self.state,
            notices,
        }
    }

    fn apply<R: BeaconRadio>(
        &mut self,
        msg: BeaconMessage,
        now_ms: u64,
        radio: &mut R,
        notices: &mut Vec<Notice, 8>,
    ) -> Notice {
        self.stats.accepted = self.stats.accepted.wrapping_add(1);
        self.last_valid_ms = now_ms;

        if msg.lvl == 0 {
            if self.state == BeaconState::Advertising {
                if let Err(e) = radio.stop() {
                    log::error!("Advertising stop failed: {:?}", e);
                    push_notice(notices, Notice::RadioFault("stop"));
                }
                log::info!("All clear, advertising stopped");
            }
            self.state = BeaconState::Normal;
        } else {
            let frame = BeaconFrame::from_message(&msg);
            let name = adv_name(msg.lvl, msg.cm);
            // Stop first so scanners that cache payloads see the new frame
            if let Err(e) = radio.stop() {
                log::warn!("Advertising stop before restart failed: {:?}", e);
            }
            if let Err(e) = radio.start(&frame, &name) {
                log::error!("Advertising start failed: {:?}", e);
                push_notice(notices, Notice::RadioFault("start"));
            } else {
                log::info!("Advertising '{}' (id {})", name, msg.id);
            }
            self.state = BeaconState::Advertising;
        }

        self.blinker.set_pattern(BlinkPattern::for_level(msg.lvl), now_ms);
        self.last_valid = Some(msg.clone());
        Notice::Accepted(msg)
    }

    fn check_idle<R: BeaconRadio>(&mut self, now_ms: u64, radio: &mut R) -> Option<Notice> {
        if self.state != BeaconState::Advertising {
            return None;
        }
        if now_ms.saturating_sub(self.last_valid_ms) < self.idle_timeout_ms {
            return None;
        }
        if let Err(e) = radio.stop() {
            log::error!("Advertising stop on idle failed: {:?}", e);
        }
        log::info!("No message for {} ms, advertising expired", self.idle_timeout_ms);
        self.state = BeaconState::Normal;
        self.stats.expired = self.stats.expired.wrapping_add(1);
        self.blinker.set_pattern(BlinkPattern::Off, now_ms);
        self.last_valid.clone().map(Notice::Expired)
    }
}

impl Default for BeaconHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Notices beyond capacity are dropped; state is already applied.
fn push_notice(notices: &mut Vec<Notice, 8>, notice: Notice) {
    let _ = notices.push(notice);
}
