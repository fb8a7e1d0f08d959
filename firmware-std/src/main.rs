//! HydroGuard beacon, ESP-IDF std firmware.
//!
//! Reads alert lines from the host over the USB serial console, runs the
//! beacon protocol handler on a fixed 20 ms tick, and advertises the alert
//! frame over BLE (NimBLE via esp32-nimble) so nearby phones can relay it.
//! Reports go back to the host as NDJSON on stdout; ESP-IDF log lines share
//! the same console but never start with `{`.

#[cfg(feature = "m5stickc")]
mod buzzer;
#[cfg(feature = "m5stickc")]
mod display;

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use hydroguard::beacon::{BeaconHandler, BeaconRadio, BeaconState, HandlerStats, Notice, StatusLed};
use hydroguard::protocol::{BeaconFrame, DeviceMessage, IdString, ADV_NAME_BUDGET, MAX_LINE_LEN, VERSION};
use hydroguard::{board, comm};

use esp32_nimble::{BLEAdvertisementData, BLEDevice, BLEError};
use esp_idf_svc::hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
use esp_idf_svc::hal::peripherals::Peripherals;

/// Cooperative loop period.
const TICK: Duration = Duration::from_millis(20);

/// Periodic status report interval.
const STATUS_EVERY: Duration = Duration::from_secs(30);

// ── Shared state (read by the display thread) ────────────────────────

/// What the beacon is currently showing.
#[derive(Clone)]
pub(crate) struct Shown {
    pub state: BeaconState,
    pub lvl: u8,
    pub cm: u16,
    pub id: IdString,
    pub stats: HandlerStats,
}

pub(crate) static SHOWN: Mutex<Shown> = Mutex::new(Shown {
    state: BeaconState::Normal,
    lvl: 0,
    cm: 0,
    id: IdString::new(),
    stats: HandlerStats {
        accepted: 0,
        rejected: 0,
        expired: 0,
    },
});

static BOOT: OnceLock<Instant> = OnceLock::new();

pub(crate) fn uptime_secs() -> u32 {
    BOOT.get().map_or(0, |boot| boot.elapsed().as_secs() as u32)
}

fn uptime_millis() -> u64 {
    BOOT.get().map_or(0, |boot| boot.elapsed().as_millis() as u64)
}

// ── Hardware seams ───────────────────────────────────────────────────

/// NimBLE legacy advertising: name + manufacturer data.
struct NimbleRadio {
    ble: &'static BLEDevice,
}

impl BeaconRadio for NimbleRadio {
    type Error = BLEError;

    fn start(&mut self, frame: &BeaconFrame, name: &str) -> Result<(), BLEError> {
        let name = name.get(..ADV_NAME_BUDGET).unwrap_or(name);
        let mut data = BLEAdvertisementData::new();
        data.name(name).manufacturer_data(&frame.manufacturer_data());
        let mut advertising = self.ble.get_advertising().lock();
        advertising.set_data(&mut data)?;
        advertising.start()
    }

    fn stop(&mut self) -> Result<(), BLEError> {
        self.ble.get_advertising().lock().stop()
    }
}

struct Led {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl StatusLed for Led {
    fn set(&mut self, on: bool) {
        let high = on != board::LED_ACTIVE_LOW;
        let _ = if high { self.pin.set_high() } else { self.pin.set_low() };
    }
}

// ── Reports to the host ──────────────────────────────────────────────

fn report(msg: &DeviceMessage) {
    let mut buf = [0u8; MAX_LINE_LEN];
    if let Some(len) = comm::serialize_message(msg, &mut buf) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(&buf[..len]);
        let _ = out.flush();
    }
}

fn report_notice(notice: &Notice, state: BeaconState) {
    let msg = match notice {
        Notice::Accepted(m) => DeviceMessage::Ack {
            lvl: m.lvl,
            cm: m.cm,
            id: &m.id,
            state: state.as_str(),
        },
        Notice::Rejected(e) => DeviceMessage::Error { reason: e.as_str() },
        Notice::Expired(m) => DeviceMessage::Expired { lvl: m.lvl, id: &m.id },
        Notice::RadioFault(op) => DeviceMessage::RadioFault { op: *op },
    };
    report(&msg);
}

fn report_status(handler: &BeaconHandler) {
    let stats = handler.stats();
    report(&DeviceMessage::Status {
        state: handler.state().as_str(),
        lvl: handler.current_level(),
        uptime: uptime_secs(),
        accepted: stats.accepted,
        rejected: stats.rejected,
        board: board::BOARD_NAME,
        version: VERSION,
    });
}

// ── Serial input ─────────────────────────────────────────────────────

/// Moves console bytes to the main loop. The console read may block or
/// return nothing; either way the main loop never waits on it.
fn serial_thread(tx: SyncSender<Vec<u8>>) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(10)),
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                log::error!("Console read failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();
    let _ = BOOT.set(Instant::now());

    log::info!("HydroGuard beacon v{} starting on {}", VERSION, board::BOARD_NAME);

    let peripherals = Peripherals::take()?;

    // Hold power on (M5StickC Plus2)
    #[cfg(feature = "m5stickc")]
    let _power_hold = {
        let mut p = PinDriver::output(peripherals.pins.gpio4)?;
        p.set_high()?;
        p
    };

    #[cfg(feature = "m5stickc")]
    let led_pin = peripherals.pins.gpio19.downgrade_output();
    #[cfg(not(feature = "m5stickc"))]
    let led_pin = peripherals.pins.gpio21.downgrade_output();
    let mut led = Led {
        pin: PinDriver::output(led_pin)?,
    };
    led.set(false);
    log::info!(
        "Status LED on GPIO{} (display: {}, buzzer: {})",
        board::LED_PIN,
        board::HAS_DISPLAY,
        board::HAS_BUZZER
    );

    // ── Buzzer thread (M5StickC) ─────────────────────────────────────

    #[cfg(feature = "m5stickc")]
    let buzzer_tx = {
        let (tx, rx) = mpsc::sync_channel::<u8>(2);
        let ledc_timer = peripherals.ledc.timer0;
        let ledc_channel = peripherals.ledc.channel0;
        let buzzer_pin = peripherals.pins.gpio2;
        thread::Builder::new()
            .name("buzzer".into())
            .stack_size(2048)
            .spawn(move || buzzer::buzzer_thread(rx, ledc_timer, ledc_channel, buzzer_pin))?;
        log::info!("Buzzer thread spawned");
        tx
    };

    // ── Display thread (M5StickC) ────────────────────────────────────

    #[cfg(feature = "m5stickc")]
    {
        let spi2 = peripherals.spi2;
        let mosi = peripherals.pins.gpio15;
        let clk = peripherals.pins.gpio13;
        let cs_pin = peripherals.pins.gpio5;
        let dc_pin = peripherals.pins.gpio14;
        let rst_pin = peripherals.pins.gpio12;
        let bl_pin = peripherals.pins.gpio27;
        thread::Builder::new()
            .name("display".into())
            .stack_size(4096)
            .spawn(move || display::display_thread(spi2, mosi, clk, cs_pin, dc_pin, rst_pin, bl_pin))?;
        log::info!("Display thread spawned");
    }

    // ── Serial input thread ──────────────────────────────────────────

    let (serial_tx, serial_rx) = mpsc::sync_channel::<Vec<u8>>(8);
    thread::Builder::new()
        .name("serial".into())
        .stack_size(4096)
        .spawn(move || serial_thread(serial_tx))?;

    // ── BLE ──────────────────────────────────────────────────────────

    let mut radio = NimbleRadio { ble: BLEDevice::take() };
    log::info!("BLE ready, idle until the first alert");

    // ── Protocol loop ────────────────────────────────────────────────

    let mut handler = BeaconHandler::new();
    let mut rx = Vec::with_capacity(MAX_LINE_LEN);
    let mut last_status = Instant::now();
    report_status(&handler);

    loop {
        rx.clear();
        while let Ok(chunk) = serial_rx.try_recv() {
            rx.extend_from_slice(&chunk);
        }

        #[cfg(feature = "m5stickc")]
        let level_before = handler.current_level();

        let step = handler.step(uptime_millis(), &rx, &mut radio, &mut led);
        for notice in &step.notices {
            report_notice(notice, step.state);
        }

        #[cfg(feature = "m5stickc")]
        {
            let level = handler.current_level();
            if level > level_before {
                let _ = buzzer_tx.try_send(level);
            }
        }

        if !step.notices.is_empty() {
            if let Ok(mut shown) = SHOWN.lock() {
                shown.state = step.state;
                shown.stats = handler.stats();
                if let Some(msg) = handler.last_valid() {
                    shown.lvl = handler.current_level();
                    shown.cm = msg.cm;
                    shown.id = msg.id.clone();
                }
            }
        }

        if last_status.elapsed() >= STATUS_EVERY {
            report_status(&handler);
            last_status = Instant::now();
        }

        thread::sleep(TICK);
    }
}
