//! Reset state machine.
//!
//! A power request runs only if the reset type is allow-listed for the
//! system's vendor and model, and the `(current, desired, reset type)`
//! transition is permitted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Observed or desired power state of a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "On",
            Self::Off => "Off",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerState {
    type Err = String;

    /// Transitional Redfish states (`PoweringOn`, `PoweringOff`) map to
    /// where the system is heading.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" | "poweringon" => Ok(Self::On),
            "off" | "poweringoff" => Ok(Self::Off),
            other => Err(format!("unknown power state: {other}")),
        }
    }
}

// Reset types as spelled by Redfish `ResetType`.
pub const ON: &str = "On";
pub const FORCE_ON: &str = "ForceOn";
pub const FORCE_OFF: &str = "ForceOff";
pub const GRACEFUL_SHUTDOWN: &str = "GracefulShutdown";
pub const GRACEFUL_RESTART: &str = "GracefulRestart";
pub const FORCE_RESTART: &str = "ForceRestart";
pub const NMI: &str = "Nmi";
pub const PUSH_POWER_BUTTON: &str = "PushPowerButton";
pub const POWER_CYCLE: &str = "PowerCycle";

/// Reset types supported by a vendor/model pair; `None` for unknown pairs.
pub fn allowed_reset_types(vendor: &str, model: &str) -> Option<&'static [&'static str]> {
    const HPE_GEN10: &[&str] = &[
        ON,
        FORCE_OFF,
        GRACEFUL_SHUTDOWN,
        FORCE_RESTART,
        NMI,
        PUSH_POWER_BUTTON,
        GRACEFUL_RESTART,
    ];
    const HPE_GEN11: &[&str] = &[
        ON,
        FORCE_OFF,
        GRACEFUL_SHUTDOWN,
        FORCE_RESTART,
        NMI,
        PUSH_POWER_BUTTON,
        GRACEFUL_RESTART,
        POWER_CYCLE,
    ];
    const DELL: &[&str] = &[
        ON,
        FORCE_OFF,
        FORCE_RESTART,
        GRACEFUL_RESTART,
        GRACEFUL_SHUTDOWN,
        PUSH_POWER_BUTTON,
        NMI,
        POWER_CYCLE,
    ];
    const LENOVO: &[&str] = &[
        ON,
        FORCE_ON,
        FORCE_OFF,
        GRACEFUL_SHUTDOWN,
        GRACEFUL_RESTART,
        FORCE_RESTART,
        NMI,
    ];

    let vendor = vendor.to_ascii_lowercase();
    let model = model.to_ascii_lowercase();

    if vendor == "hpe" || vendor.starts_with("hewlett packard enterprise") {
        return match model.as_str() {
            "proliant dl360 gen10" | "proliant dl380 gen10" | "proliant dl360 gen10 plus"
            | "proliant dl380 gen10 plus" => Some(HPE_GEN10),
            "proliant dl360 gen11" | "proliant dl380 gen11" | "proliant dl385 gen11" => {
                Some(HPE_GEN11)
            }
            _ => None,
        };
    }

    match (vendor.as_str(), model.as_str()) {
        ("dell inc." | "dell", "poweredge r640" | "poweredge r650" | "poweredge r740"
        | "poweredge r750" | "poweredge r760") => Some(DELL),
        ("lenovo", "thinksystem sr630" | "thinksystem sr650" | "thinksystem sr650 v2") => {
            Some(LENOVO)
        }
        _ => None,
    }
}

/// Whether `reset_type` is a legal way from `current` to `desired`.
pub fn is_transition_allowed(current: PowerState, desired: PowerState, reset_type: &str) -> bool {
    use PowerState::{Off, On};

    match (current, desired) {
        (On, On) => matches!(
            reset_type,
            FORCE_RESTART | GRACEFUL_RESTART | POWER_CYCLE | NMI
        ),
        (Off, Off) => false,
        (On, Off) => matches!(reset_type, FORCE_OFF | GRACEFUL_SHUTDOWN | PUSH_POWER_BUTTON),
        (Off, On) => matches!(reset_type, ON | FORCE_ON | PUSH_POWER_BUTTON),
    }
}

/// Both layers: vendor/model allow-list, then the transition table.
pub fn is_reset_allowed(
    vendor: &str,
    model: &str,
    current: PowerState,
    desired: PowerState,
    reset_type: &str,
) -> bool {
    let Some(allowed) = allowed_reset_types(vendor, model) else {
        return false;
    };
    allowed.contains(&reset_type) && is_transition_allowed(current, desired, reset_type)
}

/// Reset type used to bring a system to `desired` when reverting drift.
pub fn revert_reset_type(desired: PowerState) -> &'static str {
    match desired {
        PowerState::On => ON,
        PowerState::Off => FORCE_OFF,
    }
}
