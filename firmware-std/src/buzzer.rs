//! Buzzer driver using ESP-IDF LEDC PWM.
//!
//! Drives a passive buzzer at the board-configured frequency. Each value
//! received is an alert level; the buzzer beeps that many times.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use esp_idf_svc::hal::gpio::OutputPin;
use esp_idf_svc::hal::ledc::{config::TimerConfig, LedcChannel, LedcDriver, LedcTimer, LedcTimerDriver, Resolution};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::units::Hertz;

use hydroguard::board;

const GAP_MS: u64 = 100;

pub fn buzzer_thread<T, C>(
    level_rx: mpsc::Receiver<u8>,
    timer: impl Peripheral<P = T> + 'static,
    channel: impl Peripheral<P = C> + 'static,
    pin: impl Peripheral<P = impl OutputPin> + 'static,
) where
    T: LedcTimer + 'static,
    C: LedcChannel<SpeedMode = T::SpeedMode> + 'static,
{
    let timer_config = TimerConfig::new()
        .frequency(Hertz(board::BUZZER_FREQ_HZ))
        .resolution(Resolution::Bits8);

    let timer_driver = match LedcTimerDriver::new(timer, &timer_config) {
        Ok(t) => t,
        Err(e) => {
            log::error!("LEDC timer init failed: {:?}", e);
            return;
        }
    };

    let mut channel_driver = match LedcDriver::new(channel, &timer_driver, pin) {
        Ok(c) => c,
        Err(e) => {
            log::error!("LEDC channel init failed: {:?}", e);
            return;
        }
    };

    let max_duty = channel_driver.get_max_duty();
    log::info!("Buzzer ready on GPIO{}", board::BUZZER_PIN);

    while let Ok(level) = level_rx.recv() {
        for _ in 0..level {
            channel_driver.set_duty(max_duty / 2).ok();
            thread::sleep(Duration::from_millis(board::BUZZER_BEEP_MS));
            channel_driver.set_duty(0).ok();
            thread::sleep(Duration::from_millis(GAP_MS));
        }
    }
}
