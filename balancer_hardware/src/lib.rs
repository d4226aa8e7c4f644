//! Sensor and actuator backends for the balance controller.
//!
//! The simulation is always available; Raspberry Pi adapters need the
//! `hardware` feature.

pub mod error;
pub mod sim;
pub mod util;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod hardware;

pub use error::HwError;
pub use sim::{PlantParams, PlantSnapshot, SimulatedPlant};

/// Which wheel a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}
