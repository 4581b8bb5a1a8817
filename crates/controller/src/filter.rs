//! Delta-based glitch rejection between consecutive moisture readings.

/// Outcome of comparing a reading against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept(i32),
    Reject { delta: i32 },
}

/// Pure comparison: `|reading - last| > threshold` rejects.  With no
/// baseline yet the reading is always accepted.
pub fn judge(reading: i32, last_accepted: Option<i32>, threshold: i32) -> Verdict {
    match last_accepted {
        None => Verdict::Accept(reading),
        Some(last) => {
            let delta = reading.abs_diff(last);
            if delta > threshold.unsigned_abs() {
                Verdict::Reject {
                    delta: i32::try_from(delta).unwrap_or(i32::MAX),
                }
            } else {
                Verdict::Accept(reading)
            }
        }
    }
}

/// Tracks the baseline across ticks.
///
/// The baseline advances on both verdicts so one large jump cannot leave
/// every following reading rejected.  Malfunction samples must never be fed
/// in here.
#[derive(Debug)]
pub struct AnomalyFilter {
    threshold: i32,
    last: Option<i32>,
}

impl AnomalyFilter {
    pub fn new(threshold: i32) -> Self {
        Self {
            threshold,
            last: None,
        }
    }

    pub fn accept(&mut self, reading: i32) -> Verdict {
        let verdict = judge(reading, self.last, self.threshold);
        self.last = Some(reading);
        verdict
    }

    pub fn baseline(&self) -> Option<i32> {
        self.last
    }
}

// ===========================================================================
// Tests
// ===========================================================================
