//! Control loop driver.
//!
//! [`Controller`] bundles everything the loop mutates: sampler, anomaly
//! baseline, pump state machine, outputs, and telemetry.  [`run`] drives it
//! with short cooperative passes.  Each pass drains link events (connectivity
//! changes and remote commands), then services whichever cadences are due:
//!
//! - every pass: the [`Maintenance`] hook
//! - maintenance cadence: heartbeat on the heartbeat topic
//! - Idle: sample → filter → evaluate, every `sample_interval`
//! - Watering / Cooldown: re-sample, republish, advance the counter, every
//!   `sub_tick`
//!
//! Nothing inside a pass blocks, so commands and connectivity are serviced
//! while the pump runs.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::{self, Inbound, RemoteCommand};
use crate::config::Config;
use crate::filter::{AnomalyFilter, Verdict};
use crate::link::LinkEvent;
use crate::machine::{IrrigationMachine, PumpState, StatusCode, Transition};
use crate::outputs::Outputs;
use crate::sensor::{MoistureReading, MoistureSensor, Sample, Sampler};
use crate::telemetry::{Publisher, Telemetry};

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

/// Fixed-period work item checked by elapsed time, never by sleeping.
#[derive(Debug)]
pub struct Cadence {
    every: Duration,
    last: Instant,
}

impl Cadence {
    pub fn new(every: Duration, now: Instant) -> Self {
        Self { every, last: now }
    }

    /// True (and re-armed) once `every` has elapsed since the last service.
    pub fn due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.every {
            self.last = now;
            true
        } else {
            false
        }
    }

    pub fn restart(&mut self, now: Instant) {
        self.last = now;
    }
}

// ---------------------------------------------------------------------------
// Maintenance hook
// ---------------------------------------------------------------------------

/// Housekeeping serviced on every pass, such as polling for a firmware
/// update.  Must return promptly.
pub trait Maintenance {
    fn service(&mut self, now: Instant);
}

/// Firmware updates are delivered out of band on this device.
pub struct NoUpdates;

impl Maintenance for NoUpdates {
    fn service(&mut self, _now: Instant) {}
}

// ---------------------------------------------------------------------------
// Controller context
// ---------------------------------------------------------------------------

pub struct Controller<S, O, P> {
    sampler: Sampler<S>,
    filter: AnomalyFilter,
    machine: IrrigationMachine,
    outputs: O,
    telemetry: Telemetry<P>,
    maintenance: Box<dyn Maintenance>,
    trigger_topic: String,

    sample_every: Cadence,
    sub_tick_every: Cadence,
    maintenance_every: Cadence,

    /// Most recent raw reading, malfunctions included; `None` until boot.
    last_raw: Option<i32>,
    last_sampled_at: Option<Instant>,
    started_at: Instant,
}

impl<S, O, P> Controller<S, O, P>
where
    S: MoistureSensor,
    O: Outputs,
    P: Publisher,
{
    pub fn new(
        cfg: &Config,
        sensor: S,
        mut outputs: O,
        telemetry: Telemetry<P>,
        now: Instant,
    ) -> Self {
        let th = &cfg.thresholds;

        // Fail-safe: pump off until the first decision.
        outputs.set_pump(false);
        outputs.set_indicator(false);

        Self {
            sampler: Sampler::new(sensor, th.sentinel),
            filter: AnomalyFilter::new(th.anomaly_threshold),
            machine: IrrigationMachine::new(
                th.moisture_threshold,
                th.watering_ticks(),
                th.cooldown_ticks(),
            ),
            outputs,
            telemetry,
            maintenance: Box::new(NoUpdates),
            trigger_topic: cfg.topics.trigger.clone(),
            sample_every: Cadence::new(th.sample_interval(), now),
            sub_tick_every: Cadence::new(th.sub_tick(), now),
            maintenance_every: Cadence::new(cfg.timing.maintenance_interval(), now),
            last_raw: None,
            last_sampled_at: None,
            started_at: now,
        }
    }

    pub fn with_maintenance(mut self, hook: impl Maintenance + 'static) -> Self {
        self.maintenance = Box::new(hook);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> PumpState {
        self.machine.state()
    }

    /// One sample, the startup status, then the first real evaluation.
    pub fn boot(&mut self, now: Instant) {
        let sample = self.sampler.sample(now);
        let raw = sample.reading().raw;
        self.record(sample.reading());

        info!(raw, "controller booting");
        self.telemetry.publish_status(StatusCode::Startup, raw);

        self.sample_every.restart(now);
        self.maintenance_every.restart(now);
        self.process(sample, now);
    }

    /// One cooperative pass.  Never blocks.
    pub fn pass(&mut self, now: Instant) {
        self.maintenance.service(now);

        if self.maintenance_every.due(now) {
            self.maintain(now);
        }

        if self.machine.state().is_timed() {
            if self.sub_tick_every.due(now) {
                self.sub_tick(now);
            }
        } else if self.sample_every.due(now) {
            let sample = self.sampler.sample(now);
            self.process(sample, now);
        }
    }

    pub fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Connected { failed_attempts } => {
                self.telemetry.publish_log(&format!(
                    "connected to broker after {failed_attempts} failed attempt(s)"
                ));
                // Retained status may be stale on the broker after an outage.
                self.publish_status();
            }
            LinkEvent::Disconnected { reason, retry_in } => {
                // Dropped while the link is down; kept for the local log.
                self.telemetry.publish_log(&format!(
                    "connection failed: {reason}; retrying in {}s",
                    retry_in.as_secs()
                ));
            }
            LinkEvent::Message { topic, payload } => {
                match command::listen(&self.trigger_topic, &topic, &payload) {
                    Some(Inbound::Command(cmd)) => self.command(cmd, now),
                    Some(Inbound::Ignored(text)) => {
                        warn!(payload = ?text, "ignoring unrecognised trigger payload");
                        self.telemetry
                            .publish_log(&format!("ignored trigger payload {text:?}"));
                    }
                    None => debug!(topic = %topic, "message on unexpected topic"),
                }
            }
        }
    }

    // -- Tick handlers -------------------------------------------------------

    /// Idle tick: reject malfunctions and anomalies, evaluate the rest.
    fn process(&mut self, sample: Sample, now: Instant) {
        let raw = sample.reading().raw;
        self.record(sample.reading());

        let reading = match sample {
            Sample::Valid(r) => r,
            Sample::Malfunction(_) => {
                self.report_malfunction(raw);
                self.publish_status();
                return;
            }
        };

        match self.filter.accept(reading.raw) {
            Verdict::Reject { delta } => {
                self.report_anomaly(raw, delta);
                self.publish_status();
            }
            Verdict::Accept(raw) => {
                debug!(raw, "reading accepted");
                match self.machine.evaluate(raw) {
                    Some(t) => self.apply(t, now),
                    None => self.publish_status(),
                }
            }
        }
    }

    /// Watering/Cooldown tick: re-sample, republish, advance the counter.
    fn sub_tick(&mut self, now: Instant) {
        let sample = self.sampler.sample(now);
        let raw = sample.reading().raw;
        self.record(sample.reading());

        // Keep the baseline tracking the soil while the pump runs so the
        // first idle reading after cooldown is not flagged as a glitch.
        match sample {
            Sample::Malfunction(_) => self.report_malfunction(raw),
            Sample::Valid(r) => {
                if let Verdict::Reject { delta } = self.filter.accept(r.raw) {
                    self.report_anomaly(raw, delta);
                }
            }
        }

        self.publish_status();

        if let Some(t) = self.machine.sub_tick() {
            self.apply(t, now);
        }
    }

    fn command(&mut self, cmd: RemoteCommand, now: Instant) {
        info!(%cmd, state = %self.machine.state(), "remote command");
        match self.machine.command(cmd) {
            Some(t) => self.apply(t, now),
            None => {
                self.telemetry.publish_log(&format!(
                    "remote {cmd} ignored while {}",
                    self.machine.state()
                ));
                self.publish_status();
            }
        }
    }

    fn maintain(&mut self, now: Instant) {
        let uptime = now.saturating_duration_since(self.started_at).as_secs();
        let state = self.machine.state();
        let moisture = or_dash(self.last_raw);
        let baseline = or_dash(self.filter.baseline());
        let sample_age = or_dash(
            self.last_sampled_at
                .map(|at| format!("{}s", now.saturating_duration_since(at).as_secs())),
        );
        debug!(uptime, %state, "heartbeat");
        self.telemetry.publish_heartbeat(&format!(
            "alive uptime={uptime}s state={state} moisture={moisture} baseline={baseline} \
             sample_age={sample_age}"
        ));
    }

    // -- Effects -------------------------------------------------------------

    fn record(&mut self, reading: MoistureReading) {
        self.last_raw = Some(reading.raw);
        self.last_sampled_at = Some(reading.at);
    }

    fn apply(&mut self, t: Transition, now: Instant) {
        info!(from = %t.from, to = %t.to, cause = %t.cause, "pump state change");

        let on = t.to.pump_on();
        self.outputs.set_pump(on);
        self.outputs.set_indicator(on);

        if t.to.is_timed() {
            self.sub_tick_every.restart(now);
        }

        self.telemetry
            .publish_log(&format!("{} -> {} ({})", t.from, t.to, t.cause));
        self.publish_status();
    }

    fn publish_status(&self) {
        if let Some(raw) = self.last_raw {
            self.telemetry.publish_status(self.machine.state().status(), raw);
        }
    }

    fn report_malfunction(&self, raw: i32) {
        warn!(raw, "sensor malfunction — reading skipped");
        self.telemetry.publish_log(&format!(
            "sensor malfunction: reading {raw} is the saturation value"
        ));
    }

    fn report_anomaly(&self, raw: i32, delta: i32) {
        warn!(raw, delta, "anomalous reading — evaluation skipped");
        self.telemetry
            .publish_log(&format!("anomaly: reading {raw} jumped by {delta}"));
    }
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

// ---------------------------------------------------------------------------
// Driver loop
// ---------------------------------------------------------------------------

/// Run the control loop.  Returns only if the link task goes away.
pub async fn run<S, O, P>(
    mut controller: Controller<S, O, P>,
    mut events: mpsc::Receiver<LinkEvent>,
    boot_grace: Duration,
    pass_interval: Duration,
) -> Result<()>
where
    S: MoistureSensor,
    O: Outputs,
    P: Publisher,
{
    // Give the broker a moment so the startup status is not dropped.
    match timeout(boot_grace, await_link(&mut controller, &mut events)).await {
        Ok(linked) => linked?,
        Err(_) => warn!(
            grace_secs = boot_grace.as_secs(),
            "broker not reachable yet — starting offline"
        ),
    }

    controller.boot(Instant::now());

    let mut ticker = interval(pass_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        drain(&mut controller, &mut events)?;
        controller.pass(Instant::now());
    }
}

async fn await_link<S, O, P>(
    controller: &mut Controller<S, O, P>,
    events: &mut mpsc::Receiver<LinkEvent>,
) -> Result<()>
where
    S: MoistureSensor,
    O: Outputs,
    P: Publisher,
{
    while let Some(event) = events.recv().await {
        let connected = matches!(event, LinkEvent::Connected { .. });
        controller.handle_link_event(event, Instant::now());
        if connected {
            return Ok(());
        }
    }
    bail!("mqtt session ended before the first connect")
}

fn drain<S, O, P>(
    controller: &mut Controller<S, O, P>,
    events: &mut mpsc::Receiver<LinkEvent>,
) -> Result<()>
where
    S: MoistureSensor,
    O: Outputs,
    P: Publisher,
{
    loop {
        match events.try_recv() {
            Ok(event) => controller.handle_link_event(event, Instant::now()),
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => bail!("mqtt session ended"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
