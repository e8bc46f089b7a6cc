//! Body Control Status Types
//!
//! Positional bytes from the body control module are mapped onto small
//! enumerations by numeric thresholds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw positions at or below this are treated as fully closed
pub const CLOSED_MAX: u8 = 0x05;
/// Raw window positions at or above this are treated as fully open
pub const WINDOW_OPEN_MIN: u8 = 0xFA;
/// Raw sunroof positions at or above this are in the tilt range
pub const SUNROOF_TILT_MIN: u8 = 0x80;

/// Window position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Open,
    Closed,
    Partial,
    #[default]
    Unknown,
}

impl WindowState {
    /// Map a raw position byte
    pub fn from_position(raw: u8) -> Self {
        if raw <= CLOSED_MAX {
            WindowState::Closed
        } else if raw >= WINDOW_OPEN_MIN {
            WindowState::Open
        } else {
            WindowState::Partial
        }
    }
}

/// Sunroof position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SunroofState {
    Open,
    Closed,
    Tilted,
    #[default]
    Unknown,
}

impl SunroofState {
    /// Map a raw position byte
    pub fn from_position(raw: u8) -> Self {
        if raw <= CLOSED_MAX {
            SunroofState::Closed
        } else if raw >= SUNROOF_TILT_MIN {
            SunroofState::Tilted
        } else {
            SunroofState::Open
        }
    }
}

/// State of all four windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsStatus {
    pub front_left: WindowState,
    pub front_right: WindowState,
    pub rear_left: WindowState,
    pub rear_right: WindowState,
}

impl WindowsStatus {
    /// True when no window reported a position
    pub fn is_unknown(&self) -> bool {
        [
            self.front_left,
            self.front_right,
            self.rear_left,
            self.rear_right,
        ]
        .iter()
        .all(|w| *w == WindowState::Unknown)
    }
}

/// Snapshot of body state, rebuilt from scratch on every full read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleStatus {
    /// Remote start enabled
    pub remote_start_enabled: bool,
    /// Window positions
    pub windows: WindowsStatus,
    /// Sunroof position
    pub sunroof: SunroofState,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl VehicleStatus {
    /// Snapshot with every field at its default
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            remote_start_enabled: false,
            windows: WindowsStatus::default(),
            sunroof: SunroofState::Unknown,
            captured_at,
        }
    }
}
