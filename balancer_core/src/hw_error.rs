//! Maps `Box<dyn Error>` from trait boundaries to typed `BalanceError`.
//!
//! The traits in `balancer_traits` use `Box<dyn Error + Send + Sync>`; every
//! failure behind them is a hardware fault for the control loop. With the
//! `hardware-errors` feature, `balancer_hardware::HwError` is downcast for a
//! more precise message.

use crate::error::BalanceError;

/// Map a trait-boundary error to `BalanceError::HardwareFault`.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> BalanceError {
    #[cfg(feature = "hardware-errors")]
    {
        use balancer_hardware::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => BalanceError::HardwareFault("device timeout".into()),
                HwError::Poisoned => {
                    BalanceError::HardwareFault("backend state poisoned by a panic".into())
                }
                other => BalanceError::HardwareFault(other.to_string()),
            };
        }
    }

    BalanceError::HardwareFault(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_errors_become_hardware_faults() {
        let e = std::io::Error::other("bus stuck");
        assert_eq!(
            map_hw_error(&e),
            BalanceError::HardwareFault("bus stuck".into())
        );
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_timeout_is_named() {
        let e = balancer_hardware::HwError::Timeout;
        assert_eq!(
            map_hw_error(&e),
            BalanceError::HardwareFault("device timeout".into())
        );
    }
}
