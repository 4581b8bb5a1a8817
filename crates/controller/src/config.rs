//! TOML config file loading, environment overrides, and validation for the
//! controller's broker session, topics, thresholds, and hardware wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub topics: Topics,
    pub thresholds: Thresholds,
    pub timing: Timing,
    pub hardware: Hardware,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Fixed delay between failed connect attempts.
    pub reconnect_delay_secs: u64,
    /// How long boot waits for the first connect before running offline.
    pub boot_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub status: String,
    pub logs: String,
    pub heartbeat: String,
    pub trigger: String,
}

/// Control tunables.  Raw values are ADC counts; higher means drier soil.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub moisture_threshold: i32,
    pub anomaly_threshold: i32,
    /// Saturated ADC value that marks a disconnected or shorted sensor.
    pub sentinel: i32,
    pub watering_secs: u64,
    pub cooldown_secs: u64,
    pub sample_interval_secs: u64,
    pub sub_tick_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub pass_interval_ms: u64,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Hardware {
    pub pump_gpio_pin: i64,
    pub indicator_gpio_pin: i64,
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub adc_address: u16,
    pub adc_channel: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "plant-controller".to_string(),
            keep_alive_secs: 30,
            reconnect_delay_secs: 5,
            boot_grace_secs: 10,
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            status: "status".to_string(),
            logs: "logs".to_string(),
            heartbeat: "logs_temp".to_string(),
            trigger: "trigger".to_string(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            moisture_threshold: 2600,
            anomaly_threshold: 400,
            sentinel: 4095,
            watering_secs: 10,
            cooldown_secs: 60,
            sample_interval_secs: 30,
            sub_tick_secs: 2,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            pass_interval_ms: 100,
            maintenance_interval_secs: 5,
        }
    }
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            pump_gpio_pin: 22,
            indicator_gpio_pin: 23,
            active_low: true,
            adc_address: 0x48,
            adc_channel: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived durations
// ---------------------------------------------------------------------------

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn boot_grace(&self) -> Duration {
        Duration::from_secs(self.boot_grace_secs)
    }
}

impl Thresholds {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn sub_tick(&self) -> Duration {
        Duration::from_secs(self.sub_tick_secs)
    }

    /// Sub-ticks needed to cover the watering duration (rounded up, at least 1).
    pub fn watering_ticks(&self) -> u32 {
        ticks_for(self.watering_secs, self.sub_tick_secs)
    }

    /// Sub-ticks needed to cover the cooldown duration (rounded up, at least 1).
    pub fn cooldown_ticks(&self) -> u32 {
        ticks_for(self.cooldown_secs, self.sub_tick_secs)
    }
}

impl Timing {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

fn ticks_for(total_secs: u64, sub_tick_secs: u64) -> u32 {
    if sub_tick_secs == 0 {
        return 1;
    }
    let ticks = total_secs.div_ceil(sub_tick_secs).max(1);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Highest single-ended ADS1115 input.
const MAX_ADC_CHANNEL: usize = 3;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_hardware(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }
        // rumqttc rejects keep-alives under five seconds.
        if m.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt: keep_alive_secs must be at least 5, got {}",
                m.keep_alive_secs
            ));
        }
        if m.reconnect_delay_secs == 0 {
            errors.push("mqtt: reconnect_delay_secs must be positive, got 0".to_string());
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let t = &self.topics;
        let mut seen: HashSet<&str> = HashSet::new();

        for (name, topic) in [
            ("status", &t.status),
            ("logs", &t.logs),
            ("heartbeat", &t.heartbeat),
            ("trigger", &t.trigger),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("topics: {name} is empty"));
                continue;
            }
            if topic.contains(['+', '#']) {
                errors.push(format!(
                    "topics: {name} '{topic}' must not contain MQTT wildcards"
                ));
            }
            if !seen.insert(topic.as_str()) {
                errors.push(format!(
                    "topics: {name} '{topic}' is already used by another topic"
                ));
            }
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let th = &self.thresholds;

        if th.sentinel <= 0 {
            errors.push(format!(
                "thresholds: sentinel must be positive, got {}",
                th.sentinel
            ));
        }
        if th.moisture_threshold <= 0 || th.moisture_threshold >= th.sentinel {
            errors.push(format!(
                "thresholds: moisture_threshold {} out of range (0, sentinel {})",
                th.moisture_threshold, th.sentinel
            ));
        }
        if th.anomaly_threshold <= 0 {
            errors.push(format!(
                "thresholds: anomaly_threshold must be positive, got {}",
                th.anomaly_threshold
            ));
        }

        for (name, value) in [
            ("watering_secs", th.watering_secs),
            ("cooldown_secs", th.cooldown_secs),
            ("sample_interval_secs", th.sample_interval_secs),
            ("sub_tick_secs", th.sub_tick_secs),
        ] {
            if value == 0 {
                errors.push(format!("thresholds: {name} must be positive, got 0"));
            }
        }

        if th.sub_tick_secs > 0 {
            if th.watering_secs > 0 && th.sub_tick_secs > th.watering_secs {
                errors.push(format!(
                    "thresholds: sub_tick_secs ({}) exceeds watering_secs ({})",
                    th.sub_tick_secs, th.watering_secs
                ));
            }
            if th.cooldown_secs > 0 && th.sub_tick_secs > th.cooldown_secs {
                errors.push(format!(
                    "thresholds: sub_tick_secs ({}) exceeds cooldown_secs ({})",
                    th.sub_tick_secs, th.cooldown_secs
                ));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.timing.pass_interval_ms == 0 {
            errors.push("timing: pass_interval_ms must be positive, got 0".to_string());
        }
        if self.timing.maintenance_interval_secs == 0 {
            errors.push("timing: maintenance_interval_secs must be positive, got 0".to_string());
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let hw = &self.hardware;

        for (name, pin) in [
            ("pump_gpio_pin", hw.pump_gpio_pin),
            ("indicator_gpio_pin", hw.indicator_gpio_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if hw.pump_gpio_pin == hw.indicator_gpio_pin {
            errors.push(format!(
                "hardware: pump and indicator share GPIO pin {}",
                hw.pump_gpio_pin
            ));
        }

        if hw.adc_channel > MAX_ADC_CHANNEL {
            errors.push(format!(
                "hardware: adc_channel {} out of range (0-{MAX_ADC_CHANNEL})",
                hw.adc_channel
            ));
        }
    }

    /// Apply `MQTT_HOST` / `MQTT_PORT` / `MQTT_CLIENT_ID` overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(host) = get("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = get("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(id) = get("MQTT_CLIENT_ID") {
            self.mqtt.client_id = id;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

fn parse(contents: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        return load(path);
    }

    tracing::warn!(path, "config file not found — using built-in defaults");
    let mut config = Config::default();
    config.apply_env();
    config.validate().context("invalid default config")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
