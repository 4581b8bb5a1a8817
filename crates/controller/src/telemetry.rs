//! Status, log, and heartbeat publishing.
//!
//! Every publish is fire-and-forget and retained.  While the link is down
//! messages are dropped on the floor: nothing is queued and nothing is
//! retried.  Only the session itself is retried, by the link task.

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::config::Topics;
use crate::link::ConnectivityState;
use crate::machine::StatusCode;

/// Minimal non-blocking publish seam so the controller can be exercised
/// without a broker.
pub trait Publisher {
    fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()>;
}

impl Publisher for AsyncClient {
    fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> anyhow::Result<()> {
        // try_publish never waits on the request channel.
        self.try_publish(topic, QoS::AtMostOnce, retain, payload)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusMsg {
    status: i32,
    soil_moisture: i32,
}

fn status_payload(status: StatusCode, raw: i32) -> Vec<u8> {
    let msg = StatusMsg {
        status: status.code(),
        soil_moisture: raw,
    };
    // Two integer fields; serialization cannot fail.
    serde_json::to_vec(&msg).unwrap_or_default()
}

/// Prefix a log line with the current UTC wall-clock time.
fn stamped(text: &str) -> String {
    let now = OffsetDateTime::now_utc();
    match now.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    )) {
        Ok(ts) => format!("{ts} {text}"),
        Err(_) => format!("{} {text}", now.unix_timestamp()),
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Telemetry<P> {
    publisher: P,
    topics: Topics,
    link: watch::Receiver<ConnectivityState>,
}

impl<P: Publisher> Telemetry<P> {
    pub fn new(publisher: P, topics: Topics, link: watch::Receiver<ConnectivityState>) -> Self {
        Self {
            publisher,
            topics,
            link,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow() == ConnectivityState::Connected
    }

    /// `{"status": <code>, "soil_moisture": <raw>}` on the status topic.
    pub fn publish_status(&self, status: StatusCode, raw: i32) -> bool {
        self.emit(&self.topics.status, status_payload(status, raw))
    }

    pub fn publish_log(&self, text: &str) -> bool {
        self.emit(&self.topics.logs, stamped(text).into_bytes())
    }

    pub fn publish_heartbeat(&self, text: &str) -> bool {
        self.emit(&self.topics.heartbeat, stamped(text).into_bytes())
    }

    /// Returns whether the message was handed to the client.
    fn emit(&self, topic: &str, payload: Vec<u8>) -> bool {
        if !self.is_connected() {
            tracing::debug!(topic, "link down — telemetry dropped");
            return false;
        }
        match self.publisher.send(topic, payload, true) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(topic, "publish failed, dropping: {e}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
