//! Pump state machine for a single plant.
//!
//! Pure decision logic: it never touches outputs or the network.  Callers
//! feed it accepted readings, sub-ticks, and remote commands, and act on the
//! [`Transition`]s it returns.
//!
//! ```text
//! Idle ──[reading >= threshold | ON]──▶ Watering ──[ticks elapsed]──▶ Cooldown
//!  ▲                                        │                            │
//!  ├────────────────────[OFF]───────────────┘                            │
//!  └───────────────────────────[ticks elapsed | OFF]─────────────────────┘
//! ```
//!
//! Durations are counted in sub-ticks.  Readings that cross the threshold
//! while Watering or Cooldown are ignored; they do not restart the counters.

use std::fmt;

use crate::command::RemoteCommand;

/// Numeric status published on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Startup,
    Idle,
    Watering,
    Cooldown,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Startup => -1,
            Self::Idle => 0,
            Self::Watering => 1,
            Self::Cooldown => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Pump off; waiting for a dry reading or a remote ON.
    Idle,
    /// Pump on; `remaining` sub-ticks until cooldown.
    Watering { remaining: u32 },
    /// Pump off; `remaining` sub-ticks until idle.
    Cooldown { remaining: u32 },
}

impl PumpState {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Idle => StatusCode::Idle,
            Self::Watering { .. } => StatusCode::Watering,
            Self::Cooldown { .. } => StatusCode::Cooldown,
        }
    }

    /// Watering and Cooldown are driven by sub-ticks instead of samples.
    pub fn is_timed(self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn pump_on(self) -> bool {
        matches!(self, Self::Watering { .. })
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Watering { .. } => write!(f, "watering"),
            Self::Cooldown { .. } => write!(f, "cooldown"),
        }
    }
}

/// What caused a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Threshold(i32),
    Elapsed,
    Remote(RemoteCommand),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threshold(raw) => write!(f, "moisture {raw} at or above threshold"),
            Self::Elapsed => write!(f, "duration elapsed"),
            Self::Remote(cmd) => write!(f, "remote {cmd}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PumpState,
    pub to: PumpState,
    pub cause: Cause,
}

pub struct IrrigationMachine {
    state: PumpState,
    threshold: i32,
    watering_ticks: u32,
    cooldown_ticks: u32,
}

impl IrrigationMachine {
    pub fn new(threshold: i32, watering_ticks: u32, cooldown_ticks: u32) -> Self {
        Self {
            state: PumpState::Idle,
            threshold,
            watering_ticks: watering_ticks.max(1),
            cooldown_ticks: cooldown_ticks.max(1),
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Feed an accepted reading.  Only Idle reacts to it.
    pub fn evaluate(&mut self, raw: i32) -> Option<Transition> {
        if self.state == PumpState::Idle && raw >= self.threshold {
            Some(self.enter_watering(Cause::Threshold(raw)))
        } else {
            None
        }
    }

    /// Advance the Watering/Cooldown counter by one sub-tick.
    pub fn sub_tick(&mut self) -> Option<Transition> {
        match self.state {
            PumpState::Idle => None,
            PumpState::Watering { remaining } => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    let to = PumpState::Cooldown {
                        remaining: self.cooldown_ticks,
                    };
                    Some(self.move_to(to, Cause::Elapsed))
                } else {
                    self.state = PumpState::Watering { remaining };
                    None
                }
            }
            PumpState::Cooldown { remaining } => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    Some(self.move_to(PumpState::Idle, Cause::Elapsed))
                } else {
                    self.state = PumpState::Cooldown { remaining };
                    None
                }
            }
        }
    }

    /// Apply a remote override.  Returns `None` for commands that leave the
    /// state alone (ON while Watering or Cooldown, OFF while Idle); callers
    /// still republish status.  Cooldown only ends early on OFF.
    pub fn command(&mut self, cmd: RemoteCommand) -> Option<Transition> {
        let cause = Cause::Remote(cmd);
        match (cmd, self.state) {
            (RemoteCommand::On, PumpState::Watering { .. } | PumpState::Cooldown { .. }) => None,
            (RemoteCommand::On, PumpState::Idle) => Some(self.enter_watering(cause)),
            (RemoteCommand::Off, PumpState::Idle) => None,
            (RemoteCommand::Off, _) => Some(self.move_to(PumpState::Idle, cause)),
        }
    }

    fn enter_watering(&mut self, cause: Cause) -> Transition {
        let to = PumpState::Watering {
            remaining: self.watering_ticks,
        };
        self.move_to(to, cause)
    }

    fn move_to(&mut self, to: PumpState, cause: Cause) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        Transition { from, to, cause }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
