//! Preconditions for running the engine
//!
//! The tick timer only runs while the user has the feature enabled, is
//! signed in, a location fix is available and at least one venue is known.
//! Closing the gate for a user-level reason (disabled, signed out) wipes
//! all engine state; closing it for an environmental reason (no fix, no
//! venues) only drops the dwell.

use std::fmt;
use tracing::info;

/// Why the engine is not running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateBlocker {
    Disabled,
    SignedOut,
    NoFix,
    NoVenues,
}

impl GateBlocker {
    /// Whether closing for this reason discards suppression and undo state
    pub fn requires_full_reset(self) -> bool {
        matches!(self, GateBlocker::Disabled | GateBlocker::SignedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GateBlocker::Disabled => "disabled",
            GateBlocker::SignedOut => "signed_out",
            GateBlocker::NoFix => "no_fix",
            GateBlocker::NoVenues => "no_venues",
        }
    }
}

impl fmt::Display for GateBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current values of every gate condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInputs {
    pub enabled: bool,
    pub authenticated: bool,
    pub has_fix: bool,
    pub venue_count: usize,
}

impl GateInputs {
    /// First unmet condition, in priority order
    pub fn blocker(&self) -> Option<GateBlocker> {
        if !self.enabled {
            Some(GateBlocker::Disabled)
        } else if !self.authenticated {
            Some(GateBlocker::SignedOut)
        } else if !self.has_fix {
            Some(GateBlocker::NoFix)
        } else if self.venue_count == 0 {
            Some(GateBlocker::NoVenues)
        } else {
            None
        }
    }
}

/// Result of re-evaluating the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateChange {
    Opened,
    Closed(GateBlocker),
    /// Still closed, but for a different reason
    Reblocked(GateBlocker),
    Unchanged,
}

/// Tracks whether the engine should be running
#[derive(Debug)]
pub struct SettingsGate {
    blocker: Option<GateBlocker>,
}

impl Default for SettingsGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsGate {
    /// Starts closed; the first evaluation decides
    pub fn new() -> Self {
        Self { blocker: Some(GateBlocker::Disabled) }
    }

    pub fn is_open(&self) -> bool {
        self.blocker.is_none()
    }

    pub fn blocker(&self) -> Option<GateBlocker> {
        self.blocker
    }

    pub fn evaluate(&mut self, inputs: &GateInputs) -> GateChange {
        let next = inputs.blocker();
        if next == self.blocker {
            return GateChange::Unchanged;
        }

        let was_open = self.blocker.is_none();
        self.blocker = next;

        match next {
            None => {
                info!(venues = %inputs.venue_count, "engine_activated");
                GateChange::Opened
            }
            Some(reason) if was_open => {
                info!(reason = %reason, "engine_deactivated");
                GateChange::Closed(reason)
            }
            Some(reason) => GateChange::Reblocked(reason),
        }
    }
}
