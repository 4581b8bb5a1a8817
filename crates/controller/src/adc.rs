//! ADS1115 16-bit ADC driver over I2C for the soil moisture probe.
//!
//! Reads one single-ended channel at PGA ±4.096 V, 128 SPS, single-shot
//! mode.  The 15-bit single-ended result is scaled down to 12 bits so the
//! thresholds in `config.toml` use the same units as a microcontroller ADC,
//! and a saturated input lands exactly on the default sentinel (4095).

use rppal::i2c::I2c;
use std::{thread, time::Duration};

use crate::sensor::MoistureSensor;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS   write 1 to start single-shot conversion
//   [14:12] MUX  input multiplexer (channel selection)
//   [11:9]  PGA  programmable gain amplifier
//   [8]     MODE 0 = continuous, 1 = single-shot
//   [7:5]   DR   data rate
//   [4:0]   comparator bits, COMP_QUE = 11 disables it

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

/// 15-bit single-ended counts to 12-bit counts.
const SCALE_SHIFT: u32 = 3;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Clamp a raw conversion to the single-ended range and scale to 12 bits.
fn to_twelve_bit(raw: i16) -> i32 {
    i32::from(raw).clamp(0, i32::from(i16::MAX)) >> SCALE_SHIFT
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Ads1115 {
    i2c: I2c,
    channel: usize,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16, channel: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
        );

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            "ads1115 initialised"
        );

        Ok(Self { i2c, channel })
    }

    fn convert(&mut self) -> anyhow::Result<i16> {
        let config = config_for_channel(self.channel);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

impl MoistureSensor for Ads1115 {
    fn read_moisture(&mut self) -> anyhow::Result<i32> {
        self.convert().map(to_twelve_bit)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
