//! Motor command vocabulary

use std::fmt;

use serde::{Deserialize, Serialize};

/// Axes that have a homing routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomingAxis {
    X,
    Y,
    A,
}

/// One physical movement of the machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotorCommand {
    /// Carriage (X) to the center position
    MoveToCenter,
    /// Carriage (X) to the left stop
    MoveLeft,
    /// Carriage (X) to the right stop, where the screw engages the hopper
    MoveRight,
    /// Y axis to a hopper slot
    MoveToHopper { hopper_index: u32 },
    /// Screw (Z) counter-clockwise
    RotateLeft { rotations: f64 },
    /// Screw (Z) clockwise, pushing material out
    RotateRight { rotations: f64 },
    /// Dispense gate (A) open
    GateOpen,
    /// Dispense gate (A) closed
    GateClose,
    /// Run the homing routine of one axis
    Home { axis: HomingAxis },
}

impl MotorCommand {
    /// Controller command name
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::MoveToCenter => "MOVE_X_TO_CENTER",
            Self::MoveLeft => "MOVE_X_TO_LEFT",
            Self::MoveRight => "MOVE_X_TO_RIGHT",
            Self::MoveToHopper { .. } => "MOVE_Y_TO_HOPPER",
            Self::RotateLeft { .. } => "MOVE_Z_LEFT_ROTATION",
            Self::RotateRight { .. } => "MOVE_Z_RIGHT_ROTATION",
            Self::GateOpen => "MOVE_A_OPEN",
            Self::GateClose => "MOVE_A_CLOSE",
            Self::Home {
                axis: HomingAxis::X,
            } => "MOVE_X_HOME",
            Self::Home {
                axis: HomingAxis::Y,
            } => "MOVE_Y_HOME",
            Self::Home {
                axis: HomingAxis::A,
            } => "MOVE_A_HOME",
        }
    }

    /// Numeric argument sent as `value`
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::MoveToHopper { hopper_index } => Some(f64::from(*hopper_index)),
            Self::RotateLeft { rotations } | Self::RotateRight { rotations } => Some(*rotations),
            _ => None,
        }
    }

    /// Re-running would move material again instead of reaching the same position
    #[must_use]
    pub const fn is_incremental(&self) -> bool {
        matches!(self, Self::RotateLeft { .. } | Self::RotateRight { .. })
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => write!(f, "{}({value})", self.wire_name()),
            None => f.write_str(self.wire_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rotations_are_incremental() {
        assert!(MotorCommand::RotateRight { rotations: 1.0 }.is_incremental());
        assert!(MotorCommand::RotateLeft { rotations: 0.5 }.is_incremental());
        assert!(!MotorCommand::MoveToHopper { hopper_index: 2 }.is_incremental());
        assert!(!MotorCommand::GateOpen.is_incremental());
        assert!(
            !MotorCommand::Home {
                axis: HomingAxis::A
            }
            .is_incremental()
        );
    }

    #[test]
    fn wire_names_and_values() {
        let hopper = MotorCommand::MoveToHopper { hopper_index: 3 };
        assert_eq!(hopper.wire_name(), "MOVE_Y_TO_HOPPER");
        assert_eq!(hopper.value(), Some(3.0));
        assert_eq!(hopper.to_string(), "MOVE_Y_TO_HOPPER(3)");

        let home = MotorCommand::Home {
            axis: HomingAxis::X,
        };
        assert_eq!(home.wire_name(), "MOVE_X_HOME");
        assert_eq!(home.value(), None);
    }

    #[test]
    fn serde_shape() {
        let cmd = MotorCommand::RotateRight { rotations: 1.5 };
        assert_eq!(
            serde_json::to_value(cmd).unwrap(),
            json!({"kind": "rotate_right", "rotations": 1.5})
        );

        let home: MotorCommand =
            serde_json::from_value(json!({"kind": "home", "axis": "Y"})).unwrap();
        assert_eq!(
            home,
            MotorCommand::Home {
                axis: HomingAxis::Y
            }
        );
    }
}
