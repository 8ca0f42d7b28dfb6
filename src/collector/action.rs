use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::{MoveCommand, RotateCommand};

/// Magnitude below which an explicit hover move is honored on every axis.
pub const HOVER_MOVE_EPSILON: f32 = 0.05;

/// Magnitude a legacy move must exceed on some axis to change the label.
pub const LEGACY_MOVE_THRESHOLD: f32 = 0.1;

/// Yaw magnitude separating a rotation from a stop.
pub const YAW_THRESHOLD: f32 = 0.01;

/// Discrete movement class attached to every observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ActionLabel {
    StrafeRight = 0,
    StrafeLeft = 1,
    Forward = 2,
    Backward = 3,
    Ascend = 4,
    Descend = 5,
    YawRight = 6,
    YawLeft = 7,
    Hover = 8,
}

impl ActionLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StrafeRight => "strafe_right",
            Self::StrafeLeft => "strafe_left",
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::Ascend => "ascend",
            Self::Descend => "descend",
            Self::YawRight => "yaw_right",
            Self::YawLeft => "yaw_left",
            Self::Hover => "hover",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::StrafeRight),
            1 => Some(Self::StrafeLeft),
            2 => Some(Self::Forward),
            3 => Some(Self::Backward),
            4 => Some(Self::Ascend),
            5 => Some(Self::Descend),
            6 => Some(Self::YawRight),
            7 => Some(Self::YawLeft),
            8 => Some(Self::Hover),
            _ => None,
        }
    }

    pub const fn all() -> [Self; 9] {
        [
            Self::StrafeRight,
            Self::StrafeLeft,
            Self::Forward,
            Self::Backward,
            Self::Ascend,
            Self::Descend,
            Self::YawRight,
            Self::YawLeft,
            Self::Hover,
        ]
    }

    /// Labels 0 through 5.
    pub const fn is_translational(self) -> bool {
        (self as u8) <= 5
    }

    pub const fn is_yaw(self) -> bool {
        matches!(self, Self::YawRight | Self::YawLeft)
    }
}

impl fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ActionLabel> for u8 {
    fn from(label: ActionLabel) -> Self {
        label as u8
    }
}

impl TryFrom<u8> for ActionLabel {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_u8(v).ok_or_else(|| format!("unknown action label: {v}"))
    }
}

/// Classifies a legacy (unlabelled) move by its dominant axis.
///
/// Returns `None` when no axis exceeds [`LEGACY_MOVE_THRESHOLD`]. Ties go to
/// x, then y, then z.
pub fn classify_translation(dx: f32, dy: f32, dz: f32) -> Option<ActionLabel> {
    let (ax, ay, az) = (dx.abs(), dy.abs(), dz.abs());
    if ax <= LEGACY_MOVE_THRESHOLD && ay <= LEGACY_MOVE_THRESHOLD && az <= LEGACY_MOVE_THRESHOLD
    {
        return None;
    }

    let dominant = ax.max(ay).max(az);
    let label = if ax == dominant {
        if dx > 0.0 {
            ActionLabel::StrafeRight
        } else {
            ActionLabel::StrafeLeft
        }
    } else if ay == dominant {
        if dy > 0.0 {
            ActionLabel::Forward
        } else {
            ActionLabel::Backward
        }
    } else if dz > 0.0 {
        ActionLabel::Ascend
    } else {
        ActionLabel::Descend
    };
    Some(label)
}

/// Fuses the move and rotate control streams into one current label.
#[derive(Debug, Clone)]
pub struct ActionTracker {
    current: ActionLabel,
}

impl Default for ActionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionTracker {
    pub fn new() -> Self {
        Self {
            current: ActionLabel::Hover,
        }
    }

    pub fn current(&self) -> ActionLabel {
        self.current
    }

    /// Applies a move event. Returns true if the label changed.
    pub fn on_move(&mut self, cmd: &MoveCommand) -> bool {
        let next = match cmd.label {
            Some(ActionLabel::Hover) => {
                let still = cmd.dx.abs() < HOVER_MOVE_EPSILON
                    && cmd.dy.abs() < HOVER_MOVE_EPSILON
                    && cmd.dz.abs() < HOVER_MOVE_EPSILON;
                if !still {
                    return false;
                }
                ActionLabel::Hover
            }
            Some(label) => label,
            None => match classify_translation(cmd.dx, cmd.dy, cmd.dz) {
                Some(label) => label,
                None => return false,
            },
        };
        self.set(next)
    }

    /// Applies a rotate event. Returns true if the label changed.
    pub fn on_rotate(&mut self, cmd: &RotateCommand) -> bool {
        let next = match cmd.label {
            Some(label) if label.is_yaw() => label,
            Some(ActionLabel::Hover) if cmd.delta.abs() < YAW_THRESHOLD => ActionLabel::Hover,
            Some(_) => return false,
            None if cmd.delta.abs() > YAW_THRESHOLD => {
                if cmd.delta > 0.0 {
                    ActionLabel::YawRight
                } else {
                    ActionLabel::YawLeft
                }
            }
            // A stopped rotation must not clobber an active translation.
            None if self.current.is_translational() => return false,
            None => ActionLabel::Hover,
        };
        self.set(next)
    }

    fn set(&mut self, next: ActionLabel) -> bool {
        let changed = self.current != next;
        self.current = next;
        changed
    }
}
