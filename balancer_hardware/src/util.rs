use std::time::{Duration, Instant};

use crate::error::{HwError, Result};

/// Poll `ready` until it reports true, or a timeout expires.
/// Sleeps in small intervals to avoid CPU spinning; errors from the probe
/// are returned immediately.
pub fn poll_until(
    mut ready: impl FnMut() -> Result<bool>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !ready()? {
        if Instant::now() >= deadline {
            return Err(HwError::Timeout);
        }
        std::thread::sleep(poll_interval);
    }
    Ok(())
}

/// Little-endian signed 16-bit register pair in 1/16 units (BNO055 Euler
/// and gyro output in degree mode).
#[inline]
pub fn decode_sixteenths(lsb_msb: [u8; 2]) -> f32 {
    f32::from(i16::from_le_bytes(lsb_msb)) / 16.0
}

/// 10-bit two's complement ADC sample packed MSB-first in two bytes with
/// the two low bits of the second byte unused.
#[inline]
pub fn decode_adc10(bytes: [u8; 2]) -> i32 {
    let value = ((i32::from(bytes[1]) >> 2) | (i32::from(bytes[0]) << 6)) & 0x3FF;
    if value & 0x200 != 0 {
        value - 1024
    } else {
        value
    }
}

// Indexed by (previous_state << 2) | current_state, state = (a << 1) | b.
const QUADRATURE_TABLE: [i8; 16] = [0, -1, 1, 0, 1, 0, 0, -1, -1, 0, 0, 1, 0, 1, -1, 0];

/// Quadrature state machine. Invalid double transitions count as zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadratureDecoder {
    state: u8,
}

impl QuadratureDecoder {
    pub fn new(a: bool, b: bool) -> Self {
        Self {
            state: encode_ab(a, b),
        }
    }

    /// Feed the current channel levels and return the step (-1, 0 or +1).
    pub fn step(&mut self, a: bool, b: bool) -> i8 {
        let next = encode_ab(a, b);
        let delta = QUADRATURE_TABLE[usize::from((self.state << 2) | next)];
        self.state = next;
        delta
    }
}

#[inline]
fn encode_ab(a: bool, b: bool) -> u8 {
    (u8::from(a) << 1) | u8::from(b)
}
