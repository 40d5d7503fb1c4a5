//! Cooldown timer: a three-state machine defining segment boundaries.
//!
//! ```text
//!            resetting event              now - last >= cooldown
//!   IDLE ─────────────────────▶ ACTIVE ─────────────────────────▶ CLOSING
//!    ▲                            ▲  │ resetting event (reset)       │
//!    │                            │  └───────────┐                   │
//!    │                            └──────────────┴── resetting event ┘
//!    └──────────────────────── close_segment() ──────────────────────┘
//! ```
//!
//! A resetting event that arrives while CLOSING moves the timer back to
//! ACTIVE; a segment that expired is not closed until `close_segment` runs.

use crate::error::CooldownError;
use chrono::{DateTime, Utc};

/// Externally visible state of the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    Idle,
    Active,
    Closing,
}

impl CooldownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownState::Idle => "idle",
            CooldownState::Active => "active",
            CooldownState::Closing => "closing",
        }
    }
}

/// Working state of the open segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentState {
    pub start: DateTime<Utc>,
    pub last_event: DateTime<Utc>,
    pub resets_count: u32,
}

/// Outcome of a resetting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownSignal {
    /// A new segment was opened.
    Opened,
    /// The open segment's countdown restarted.
    Reset,
}

/// The segment state lives inside the phase, so IDLE can never hold one and
/// ACTIVE/CLOSING can never lack one.
#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Active(SegmentState),
    Closing(SegmentState),
}

/// Cooldown-driven segment state machine.
#[derive(Debug, Clone)]
pub struct CooldownTimer {
    cooldown_seconds: f64,
    phase: Phase,
}

impl CooldownTimer {
    /// Create a timer. `cooldown_seconds` must be positive and finite.
    pub fn new(cooldown_seconds: f64) -> Result<Self, CooldownError> {
        validate_cooldown(cooldown_seconds)?;
        Ok(Self {
            cooldown_seconds,
            phase: Phase::Idle,
        })
    }

    pub fn cooldown_seconds(&self) -> f64 {
        self.cooldown_seconds
    }

    /// Change the cooldown interval; applies to the open segment too.
    pub fn set_cooldown(&mut self, cooldown_seconds: f64) -> Result<(), CooldownError> {
        validate_cooldown(cooldown_seconds)?;
        self.cooldown_seconds = cooldown_seconds;
        Ok(())
    }

    pub fn state(&self) -> CooldownState {
        match self.phase {
            Phase::Idle => CooldownState::Idle,
            Phase::Active(_) => CooldownState::Active,
            Phase::Closing(_) => CooldownState::Closing,
        }
    }

    pub fn segment_state(&self) -> Option<&SegmentState> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Active(s) | Phase::Closing(s) => Some(s),
        }
    }

    /// Record an event from a resetting plugin.
    pub fn on_resetting_event(&mut self, ts: DateTime<Utc>) -> CooldownSignal {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                self.phase = Phase::Active(SegmentState {
                    start: ts,
                    last_event: ts,
                    resets_count: 0,
                });
                CooldownSignal::Opened
            }
            Phase::Active(mut s) | Phase::Closing(mut s) => {
                s.last_event = ts;
                s.resets_count += 1;
                self.phase = Phase::Active(s);
                CooldownSignal::Reset
            }
        }
    }

    /// Record an event from a non-resetting plugin.
    ///
    /// Only moves `last_event` forward; never changes state or counts.
    pub fn on_non_resetting_event(&mut self, ts: DateTime<Utc>) {
        if let Phase::Active(s) | Phase::Closing(s) = &mut self.phase
            && ts > s.last_event
        {
            s.last_event = ts;
        }
    }

    /// Returns true once the open segment has been quiet for the cooldown.
    pub fn check_expiration(&mut self, now: DateTime<Utc>) -> bool {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => false,
            Phase::Closing(s) => {
                self.phase = Phase::Closing(s);
                true
            }
            Phase::Active(s) => {
                let expired = elapsed_seconds(s.last_event, now) >= self.cooldown_seconds;
                self.phase = if expired {
                    Phase::Closing(s)
                } else {
                    Phase::Active(s)
                };
                expired
            }
        }
    }

    /// Hand over the open segment and return to IDLE.
    pub fn close_segment(&mut self) -> Result<SegmentState, CooldownError> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => Err(CooldownError::NoOpenSegment),
            Phase::Active(s) | Phase::Closing(s) => Ok(s),
        }
    }
}

fn validate_cooldown(cooldown_seconds: f64) -> Result<(), CooldownError> {
    if cooldown_seconds.is_finite() && cooldown_seconds > 0.0 {
        Ok(())
    } else {
        Err(CooldownError::InvalidCooldown(cooldown_seconds))
    }
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}
