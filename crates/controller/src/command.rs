//! Remote ON/OFF decoding for the trigger topic.

use std::fmt;

// ---------------------------------------------------------------------------
// Remote override commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    On,
    Off,
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
        }
    }
}

/// A decoded trigger payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(RemoteCommand),
    /// Anything other than the exact `ON` / `OFF` payloads.
    Ignored(String),
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Decode a trigger payload.  Matching is exact: no trimming, no case
/// folding.
pub fn decode(payload: &[u8]) -> Inbound {
    match payload {
        b"ON" => Inbound::Command(RemoteCommand::On),
        b"OFF" => Inbound::Command(RemoteCommand::Off),
        other => Inbound::Ignored(String::from_utf8_lossy(other).into_owned()),
    }
}

/// Decode a message if it arrived on the trigger topic.
pub fn listen(trigger_topic: &str, topic: &str, payload: &[u8]) -> Option<Inbound> {
    (topic == trigger_topic).then(|| decode(payload))
}

// ===========================================================================
// Tests
// ===========================================================================
