//! Pump and indicator outputs. The `gpio` feature gates the real rppal
//! driver; without it, a mock board logs state changes.

use anyhow::Result;

use crate::config::Hardware;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Actuation capability consumed by the control loop.
pub trait Outputs {
    fn set_pump(&mut self, on: bool);
    fn set_indicator(&mut self, on: bool);
}

// ---------------------------------------------------------------------------
// Real GPIO board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct OutputBoard {
    pump: OutputPin,
    indicator: OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl OutputBoard {
    pub(crate) fn new(hw: &Hardware) -> Result<Self> {
        let gpio = Gpio::new()?;
        let pump = gpio.get(u8::try_from(hw.pump_gpio_pin)?)?.into_output();
        let indicator = gpio.get(u8::try_from(hw.indicator_gpio_pin)?)?.into_output();

        let mut board = Self {
            pump,
            indicator,
            active_low: hw.active_low,
        };

        // Fail-safe: ensure "OFF" at startup
        board.all_off();
        tracing::info!(
            pump_pin = hw.pump_gpio_pin,
            indicator_pin = hw.indicator_gpio_pin,
            active_low = hw.active_low,
            "output board initialised"
        );
        Ok(board)
    }

    fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    pub(crate) fn all_off(&mut self) {
        self.set_pump(false);
        self.set_indicator(false);
    }
}

#[cfg(feature = "gpio")]
impl Outputs for OutputBoard {
    fn set_pump(&mut self, on: bool) {
        Self::drive(&mut self.pump, on, self.active_low);
        tracing::debug!(on, "pump output");
    }

    fn set_indicator(&mut self, on: bool) {
        // The indicator LED is wired straight to the pin, never through a relay.
        Self::drive(&mut self.indicator, on, false);
        tracing::debug!(on, "indicator output");
    }
}

// ---------------------------------------------------------------------------
// Mock board (no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct OutputBoard {
    pub(super) pump: bool,
    pub(super) indicator: bool,
}

#[cfg(not(feature = "gpio"))]
impl OutputBoard {
    pub(crate) fn new(hw: &Hardware) -> Result<Self> {
        tracing::info!(
            pump_pin = hw.pump_gpio_pin,
            indicator_pin = hw.indicator_gpio_pin,
            "[mock-gpio] output board initialised (no hardware)"
        );
        let mut board = Self {
            pump: false,
            indicator: false,
        };
        board.all_off();
        Ok(board)
    }

    pub(crate) fn all_off(&mut self) {
        self.set_pump(false);
        self.set_indicator(false);
    }
}

#[cfg(not(feature = "gpio"))]
impl Outputs for OutputBoard {
    fn set_pump(&mut self, on: bool) {
        self.pump = on;
        tracing::info!("[mock-gpio] pump set {}", if on { "ON" } else { "OFF" });
    }

    fn set_indicator(&mut self, on: bool) {
        self.indicator = on;
        tracing::debug!("[mock-gpio] indicator set {}", if on { "ON" } else { "OFF" });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
