//! Status screen for the M5StickC Plus2 (ST7789V2, 135x240, used landscape).
//!
//! A banner in the level's color names the level being broadcast. The rows
//! under it show water height, alert id, beacon state, message counters and
//! uptime. Only the parts that changed since the last frame are redrawn.

use core::fmt::Write;
use std::thread;
use std::time::Duration;

use embedded_graphics::mono_font::ascii::{FONT_10X20, FONT_6X10};
use embedded_graphics::mono_font::MonoTextStyleBuilder;
use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};
use esp_idf_svc::hal::delay::Delay;
use esp_idf_svc::hal::gpio::*;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::spi::config::Config as SpiConfig;
use esp_idf_svc::hal::spi::config::DriverConfig as SpiDriverConfig;
use esp_idf_svc::hal::spi::{SpiDeviceDriver, SpiDriver};
use esp_idf_svc::hal::units::Hertz;
use mipidsi::interface::SpiInterface;
use mipidsi::models::ST7789;
use mipidsi::options::{ColorInversion, ColorOrder, Orientation, Rotation};
use mipidsi::Builder;

use hydroguard::beacon::BeaconState;
use hydroguard::board;
use hydroguard::level::AlertLevel;
use hydroguard::protocol::VERSION;

const W: u32 = 240;
const H: u32 = 135;
const BANNER_H: u32 = 40;
const ROWS_TOP: i32 = BANNER_H as i32 + 8;
const ROW_H: i32 = 16;
const ROWS: usize = 5;
const REFRESH: Duration = Duration::from_millis(250);

const BG: Rgb565 = Rgb565::BLACK;
const FG: Rgb565 = Rgb565::WHITE;
const DIM: Rgb565 = Rgb565::new(12, 24, 12);

type Line = heapless::String<40>;

fn banner_color(lvl: u8) -> Rgb565 {
    match lvl {
        0 => Rgb565::GREEN,
        1 => Rgb565::YELLOW,
        2 => Rgb565::new(31, 40, 0),
        _ => Rgb565::RED,
    }
}

/// One frame's worth of text, compared against the previous frame.
#[derive(PartialEq)]
struct View {
    lvl: u8,
    rows: [Line; ROWS],
}

impl View {
    fn capture() -> Option<Self> {
        let shown = crate::SHOWN.lock().ok()?.clone();
        let mut rows: [Line; ROWS] = Default::default();

        if shown.id.is_empty() {
            let _ = write!(rows[0], "Water   ---");
            let _ = write!(rows[1], "Alert   ---");
        } else {
            let _ = write!(rows[0], "Water   {} cm", shown.cm);
            let _ = write!(rows[1], "Alert   {}", shown.id);
        }
        let _ = write!(
            rows[2],
            "Beacon  {}",
            if shown.state == BeaconState::Advertising { "ADVERTISING" } else { "idle" }
        );
        let _ = write!(
            rows[3],
            "Msgs    {} ok  {} bad  {} exp",
            shown.stats.accepted, shown.stats.rejected, shown.stats.expired
        );
        let up = crate::uptime_secs();
        let _ = write!(
            rows[4],
            "Up {:02}:{:02}:{:02}  {}",
            up / 3600,
            (up % 3600) / 60,
            up % 60,
            board::BOARD_NAME
        );

        Some(Self { lvl: shown.lvl, rows })
    }
}

fn draw_banner(display: &mut impl DrawTarget<Color = Rgb565>, lvl: u8) {
    let _ = Rectangle::new(Point::zero(), Size::new(W, BANNER_H))
        .into_styled(PrimitiveStyle::with_fill(banner_color(lvl)))
        .draw(display);
    let name = AlertLevel::from_rank(lvl).map_or("?", AlertLevel::name);
    let _ = Text::with_text_style(
        name,
        Point::new(W as i32 / 2, BANNER_H as i32 / 2),
        MonoTextStyleBuilder::new().font(&FONT_10X20).text_color(BG).build(),
        TextStyleBuilder::new()
            .alignment(Alignment::Center)
            .baseline(Baseline::Middle)
            .build(),
    )
    .draw(display);
}

fn draw_row(display: &mut impl DrawTarget<Color = Rgb565>, index: usize, text: &str) {
    let y = ROWS_TOP + index as i32 * ROW_H;
    let color = if index < 3 { FG } else { DIM };
    // Blank the row so a shorter line leaves no tail
    let _ = Rectangle::new(Point::new(0, y), Size::new(W, ROW_H as u32))
        .into_styled(PrimitiveStyle::with_fill(BG))
        .draw(display);
    let _ = Text::with_baseline(
        text,
        Point::new(6, y + 3),
        MonoTextStyleBuilder::new()
            .font(&FONT_6X10)
            .text_color(color)
            .background_color(BG)
            .build(),
        Baseline::Top,
    )
    .draw(display);
}

fn draw_splash(display: &mut impl DrawTarget<Color = Rgb565>) {
    let _ = display.clear(BG);
    let centered = TextStyleBuilder::new().alignment(Alignment::Center).build();
    let _ = Text::with_text_style(
        "HYDROGUARD",
        Point::new(W as i32 / 2, 60),
        MonoTextStyleBuilder::new().font(&FONT_10X20).text_color(FG).build(),
        centered,
    )
    .draw(display);
    let mut version = Line::new();
    let _ = write!(version, "flood beacon v{}", VERSION);
    let _ = Text::with_text_style(
        &version,
        Point::new(W as i32 / 2, 84),
        MonoTextStyleBuilder::new().font(&FONT_6X10).text_color(DIM).build(),
        centered,
    )
    .draw(display);
}

// ── Display thread ───────────────────────────────────────────────────

pub fn display_thread(
    spi: impl Peripheral<P = impl esp_idf_svc::hal::spi::SpiAnyPins> + 'static,
    mosi: impl Peripheral<P = impl OutputPin> + 'static,
    clk: impl Peripheral<P = impl OutputPin> + 'static,
    cs_pin: impl Peripheral<P = impl OutputPin> + 'static,
    dc_pin: impl Peripheral<P = impl OutputPin> + 'static,
    rst_pin: impl Peripheral<P = impl IOPin> + 'static,
    bl_pin: impl Peripheral<P = impl OutputPin> + 'static,
) {
    if let Err(e) = run(spi, mosi, clk, cs_pin, dc_pin, rst_pin, bl_pin) {
        // The beacon keeps working without its screen
        log::error!("Display unavailable: {:?}", e);
    }
}

fn run(
    spi: impl Peripheral<P = impl esp_idf_svc::hal::spi::SpiAnyPins> + 'static,
    mosi: impl Peripheral<P = impl OutputPin> + 'static,
    clk: impl Peripheral<P = impl OutputPin> + 'static,
    cs_pin: impl Peripheral<P = impl OutputPin> + 'static,
    dc_pin: impl Peripheral<P = impl OutputPin> + 'static,
    rst_pin: impl Peripheral<P = impl IOPin> + 'static,
    bl_pin: impl Peripheral<P = impl OutputPin> + 'static,
) -> anyhow::Result<()> {
    let mut rst = PinDriver::output(rst_pin)?;
    rst.set_low()?;
    thread::sleep(Duration::from_millis(20));
    rst.set_high()?;
    thread::sleep(Duration::from_millis(120));

    let bus = SpiDriver::new(spi, clk, mosi, None::<AnyIOPin>, &SpiDriverConfig::new())?;
    let device = SpiDeviceDriver::new(
        bus,
        Some(cs_pin),
        &SpiConfig::new()
            .baudrate(Hertz(board::DISPLAY_SPI_FREQ_MHZ * 1_000_000))
            .data_mode(embedded_hal::spi::MODE_0),
    )?;
    let mut buffer = [0u8; 512];
    let interface = SpiInterface::new(device, PinDriver::output(dc_pin)?, &mut buffer);

    let mut display = Builder::new(ST7789, interface)
        .display_size(board::DISPLAY_WIDTH, board::DISPLAY_HEIGHT)
        .display_offset(52, 40)
        .invert_colors(ColorInversion::Inverted)
        .color_order(ColorOrder::Bgr)
        .orientation(Orientation::new().rotate(Rotation::Deg90))
        .init(&mut Delay::new_default())
        .map_err(|e| anyhow::anyhow!("ST7789 init failed: {:?}", e))?;
    log::info!("Display ready ({}x{})", W, H);

    let mut backlight = PinDriver::output(bl_pin)?;
    backlight.set_high()?;

    draw_splash(&mut display);
    thread::sleep(Duration::from_secs(2));
    let _ = display.clear(BG);

    let mut prev: Option<View> = None;
    loop {
        if let Some(view) = View::capture() {
            if prev.as_ref().map_or(true, |p| p.lvl != view.lvl) {
                draw_banner(&mut display, view.lvl);
            }
            for (i, row) in view.rows.iter().enumerate() {
                if prev.as_ref().map_or(true, |p| p.rows[i] != *row) {
                    draw_row(&mut display, i, row);
                }
            }
            prev = Some(view);
        }
        thread::sleep(REFRESH);
    }
}
