//! Command Mixer: scalar torque and yaw differential to per-side commands.

use crate::error::BalanceError;

/// Per-side actuator commands, each in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorCommand {
    pub left: f32,
    pub right: f32,
}

impl MotorCommand {
    pub const STOP: MotorCommand = MotorCommand {
        left: 0.0,
        right: 0.0,
    };
}

/// `left = clamp(torque - differential)`, `right = clamp(torque + differential)`.
pub fn mix(torque: f32, differential: f32) -> Result<MotorCommand, BalanceError> {
    if !(torque.is_finite() && differential.is_finite()) {
        return Err(BalanceError::State(format!(
            "non-finite mixer input (torque {torque}, differential {differential})"
        )));
    }
    Ok(MotorCommand {
        left: (torque - differential).clamp(-1.0, 1.0),
        right: (torque + differential).clamp(-1.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_torque_drives_both_sides_equally() {
        assert_eq!(
            mix(0.4, 0.0).unwrap(),
            MotorCommand {
                left: 0.4,
                right: 0.4
            }
        );
    }

    #[test]
    fn positive_differential_speeds_up_the_right_wheel() {
        let c = mix(0.0, 0.25).unwrap();
        assert_eq!(c.left, -0.25);
        assert_eq!(c.right, 0.25);
    }

    #[test]
    fn saturates_each_side_independently() {
        let c = mix(0.9, 0.5).unwrap();
        assert_eq!(c.right, 1.0);
        assert!((c.left - 0.4).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_finite() {
        assert!(mix(f32::NAN, 0.0).is_err());
        assert!(mix(0.0, f32::NEG_INFINITY).is_err());
    }
}
