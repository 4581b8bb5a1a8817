//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::outputs::Outputs;
use crate::sensor::MoistureSensor;
use crate::telemetry::Publisher;

/// Replays a fixed list of readings, then repeats the last one.
pub(crate) struct ScriptedSensor {
    queue: VecDeque<i32>,
    last: i32,
    fail_next: bool,
}

impl ScriptedSensor {
    pub(crate) fn new(readings: impl IntoIterator<Item = i32>) -> Self {
        Self {
            queue: readings.into_iter().collect(),
            last: 0,
            fail_next: false,
        }
    }

    pub(crate) fn fail_next(&mut self) {
        self.fail_next = true;
    }
}

impl MoistureSensor for ScriptedSensor {
    fn read_moisture(&mut self) -> anyhow::Result<i32> {
        if std::mem::take(&mut self.fail_next) {
            return Err(anyhow!("i2c bus timeout"));
        }
        if let Some(next) = self.queue.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }
}

/// Remembers the last value written to each output, `None` if never written.
#[derive(Debug, Default)]
pub(crate) struct RecordingOutputs {
    pub(crate) pump: Option<bool>,
    pub(crate) indicator: Option<bool>,
    pub(crate) pump_history: Vec<bool>,
}

impl Outputs for RecordingOutputs {
    fn set_pump(&mut self, on: bool) {
        self.pump = Some(on);
        self.pump_history.push(on);
    }

    fn set_indicator(&mut self, on: bool) {
        self.indicator = Some(on);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub(crate) topic: String,
    pub(crate) payload: String,
    pub(crate) retain: bool,
}

#[derive(Clone, Default)]
pub(crate) struct Recorder {
    sent: Arc<Mutex<Vec<Sent>>>,
    failing: Arc<Mutex<bool>>,
}

impl Recorder {
    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn on_topic(&self, topic: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload)
            .collect()
    }

    /// Status codes published so far, in order.
    pub(crate) fn statuses(&self) -> Vec<i64> {
        self.on_topic("status")
            .iter()
            .map(|p| {
                let json: serde_json::Value = serde_json::from_str(p).unwrap();
                json["status"].as_i64().unwrap()
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub(crate) fn fail_sends(&self) {
        *self.failing.lock().unwrap() = true;
    }
}

impl Publisher for Recorder {
    fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("request channel full"));
        }
        self.sent.lock().unwrap().push(Sent {
            topic: topic.to_string(),
            payload: String::from_utf8(payload)?,
            retain,
        });
        Ok(())
    }
}
