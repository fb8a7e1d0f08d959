/// Hardware constants for supported beacon boards.
///
/// Each board module defines pin assignments and capabilities
/// selected at compile time via feature flags.

#[cfg(feature = "board-xiao")]
mod hw {
    pub const LED_PIN: u8 = 21; // User LED, active low
    pub const LED_ACTIVE_LOW: bool = true;
    pub const HAS_DISPLAY: bool = false;
    pub const HAS_BUZZER: bool = false;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(feature = "board-m5stickc")]
mod hw {
    pub const LED_PIN: u8 = 19; // Red LED
    pub const LED_ACTIVE_LOW: bool = false;
    pub const HAS_DISPLAY: bool = true;
    pub const HAS_BUZZER: bool = true;
    pub const DISPLAY_WIDTH: u16 = 135;
    pub const DISPLAY_HEIGHT: u16 = 240;
    pub const DISPLAY_SPI_FREQ_MHZ: u32 = 40;
    pub const BUZZER_PIN: u8 = 2;
    pub const BUZZER_FREQ_HZ: u32 = 4000;
    pub const BUZZER_BEEP_MS: u64 = 120;
    pub const BOARD_NAME: &str = "m5stickc_plus2";
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
mod hw {
    pub const HAS_DISPLAY: bool = false;
    pub const HAS_BUZZER: bool = false;
    pub const BOARD_NAME: &str = "host";
}

pub use hw::*;
