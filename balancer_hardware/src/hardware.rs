//! Raspberry Pi adapters: BNO055 IMU and current ADCs over I2C, PWM motor
//! drivers, GPIO quadrature encoders.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use balancer_traits::{Actuator, CurrentSource, PositionSource, TiltSensor};
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use rppal::i2c::I2c;
use rppal::pwm::{Channel, Polarity, Pwm};
use tracing::{debug, info, warn};

use crate::Side;
use crate::error::{HwError, Result};
use crate::util::{QuadratureDecoder, decode_adc10, decode_sixteenths, poll_until};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const REG_OPR_MODE: u8 = 0x3D;
const REG_EULER_PITCH_LSB: u8 = 0x1E;
const REG_GYRO_Y_LSB: u8 = 0x16;
const REG_GYRO_Z_LSB: u8 = 0x18;
const MODE_CONFIG: u8 = 0b0000;
const MODE_NDOF: u8 = 0b1100;
/// The sensor is mounted on its side; Euler pitch reads -90 when upright.
const EULER_PITCH_MOUNT_DEG: f32 = 90.0;

#[derive(Debug, Clone, Copy)]
pub struct ImuConfig {
    pub bus: u8,
    pub address: u16,
    pub init_timeout: Duration,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            bus: 1,
            address: 0x28,
            init_timeout: Duration::from_millis(100),
        }
    }
}

pub struct Bno055Imu {
    i2c: I2c,
}

impl Bno055Imu {
    pub fn new(cfg: ImuConfig) -> Result<Self> {
        let mut i2c = I2c::with_bus(cfg.bus).map_err(|e| HwError::I2c(e.to_string()))?;
        i2c.set_slave_address(cfg.address)
            .map_err(|e| HwError::I2c(e.to_string()))?;
        let imu = Self { i2c };
        imu.set_mode(MODE_CONFIG, cfg.init_timeout)?;
        imu.set_mode(MODE_NDOF, cfg.init_timeout)?;
        info!(bus = cfg.bus, address = cfg.address, "imu initialized (NDOF)");
        Ok(imu)
    }

    fn set_mode(&self, mode: u8, timeout: Duration) -> Result<()> {
        self.i2c
            .smbus_write_byte(REG_OPR_MODE, mode)
            .map_err(|e| HwError::I2c(e.to_string()))?;
        poll_until(
            || {
                self.i2c
                    .smbus_read_byte(REG_OPR_MODE)
                    .map(|m| m == mode)
                    .map_err(|e| HwError::I2c(e.to_string()))
            },
            timeout,
            Duration::from_millis(2),
        )
        .map_err(|e| match e {
            HwError::Timeout => HwError::Init(format!("imu did not enter mode {mode:#06b}")),
            other => other,
        })
    }

    fn read_pair(&self, reg: u8) -> Result<[u8; 2]> {
        let mut buf = [0u8; 2];
        self.i2c
            .block_read(reg, &mut buf)
            .map_err(|e| HwError::I2c(e.to_string()))?;
        Ok(buf)
    }
}

impl TiltSensor for Bno055Imu {
    fn read_tilt(&mut self) -> std::result::Result<f32, BoxError> {
        Ok(decode_sixteenths(self.read_pair(REG_EULER_PITCH_LSB)?) + EULER_PITCH_MOUNT_DEG)
    }

    fn read_angular_rate_pitch(&mut self) -> std::result::Result<f32, BoxError> {
        Ok(decode_sixteenths(self.read_pair(REG_GYRO_Y_LSB)?))
    }

    fn read_angular_rate_yaw(&mut self) -> std::result::Result<f32, BoxError> {
        Ok(decode_sixteenths(self.read_pair(REG_GYRO_Z_LSB)?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MotorPins {
    /// Hardware PWM channel (0 or 1).
    pub pwm_channel: u8,
    pub dir_pin: u8,
    pub enable_pin: u8,
    pub frequency_hz: f64,
    /// Mirror-mounted motor: positive command spins the shaft the other way.
    pub reverse: bool,
}

impl MotorPins {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Left => Self {
                pwm_channel: 1,
                dir_pin: 23,
                enable_pin: 17,
                frequency_hz: 50_000.0,
                reverse: false,
            },
            Side::Right => Self {
                pwm_channel: 0,
                dir_pin: 24,
                enable_pin: 18,
                frequency_hz: 50_000.0,
                reverse: true,
            },
        }
    }
}

/// PWM + direction + enable motor driver. The driver's PWM input is active
/// low, so duty = 1 - |command|.
pub struct PwmMotor {
    pwm: Pwm,
    dir: OutputPin,
    enable: OutputPin,
    reverse: bool,
}

impl PwmMotor {
    pub fn new(pins: MotorPins) -> Result<Self> {
        let channel = match pins.pwm_channel {
            0 => Channel::Pwm0,
            1 => Channel::Pwm1,
            other => return Err(HwError::Init(format!("no pwm channel {other}"))),
        };
        let pwm = Pwm::with_frequency(channel, pins.frequency_hz, 1.0, Polarity::Normal, false)
            .map_err(|e| HwError::Pwm(e.to_string()))?;
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        let dir = gpio
            .get(pins.dir_pin)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_output_low();
        let enable = gpio
            .get(pins.enable_pin)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_output_low();
        Ok(Self {
            pwm,
            dir,
            enable,
            reverse: pins.reverse,
        })
    }

    fn write(&mut self, value: f32) -> Result<()> {
        let duty = 1.0 - f64::from(value.abs().min(1.0));
        self.pwm
            .set_duty_cycle(duty)
            .map_err(|e| HwError::Pwm(e.to_string()))?;
        if (value < 0.0) ^ self.reverse {
            self.dir.set_high();
        } else {
            self.dir.set_low();
        }
        Ok(())
    }
}

impl Actuator for PwmMotor {
    fn start(&mut self) -> std::result::Result<(), BoxError> {
        self.write(0.0)?;
        self.pwm.enable().map_err(|e| HwError::Pwm(e.to_string()))?;
        self.enable.set_high();
        debug!("motor enabled");
        Ok(())
    }

    fn stop(&mut self) -> std::result::Result<(), BoxError> {
        self.write(0.0)?;
        self.pwm.disable().map_err(|e| HwError::Pwm(e.to_string()))?;
        self.enable.set_low();
        debug!("motor disabled");
        Ok(())
    }

    fn set_command(&mut self, value: f32) -> std::result::Result<(), BoxError> {
        if !value.is_finite() {
            return Err(HwError::InvalidReading(format!("motor command {value}")).into());
        }
        Ok(self.write(value)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderPins {
    pub a: u8,
    pub b: u8,
    /// Left wheel counts backwards when driving forward.
    pub invert: bool,
}

impl EncoderPins {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Left => Self {
                a: 19,
                b: 20,
                invert: true,
            },
            Side::Right => Self {
                a: 9,
                b: 10,
                invert: false,
            },
        }
    }
}

#[derive(Default)]
struct EncoderShared {
    count: AtomicI64,
    travel: AtomicU64,
    a: AtomicBool,
    b: AtomicBool,
}

/// Interrupt-driven quadrature counter on two GPIO inputs.
pub struct QuadratureEncoder {
    _a: InputPin,
    _b: InputPin,
    shared: Arc<EncoderShared>,
    invert: bool,
    origin: i64,
    last_sample: Option<(i64, Instant)>,
    last_velocity: f32,
}

impl QuadratureEncoder {
    pub fn new(pins: EncoderPins) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        let mut a = gpio
            .get(pins.a)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_input_pullup();
        let mut b = gpio
            .get(pins.b)
            .map_err(|e| HwError::Gpio(e.to_string()))?
            .into_input_pullup();

        let shared = Arc::new(EncoderShared::default());
        shared.a.store(a.is_high(), Ordering::Relaxed);
        shared.b.store(b.is_high(), Ordering::Relaxed);
        let decoder = Arc::new(Mutex::new(QuadratureDecoder::new(a.is_high(), b.is_high())));

        for (pin, is_a) in [(&mut a, true), (&mut b, false)] {
            let shared = Arc::clone(&shared);
            let decoder = Arc::clone(&decoder);
            pin.set_async_interrupt(Trigger::Both, move |level: Level| {
                let high = level == Level::High;
                if is_a {
                    shared.a.store(high, Ordering::Relaxed);
                } else {
                    shared.b.store(high, Ordering::Relaxed);
                }
                let (la, lb) = (shared.a.load(Ordering::Relaxed), shared.b.load(Ordering::Relaxed));
                let Ok(mut dec) = decoder.lock() else {
                    return;
                };
                let step = dec.step(la, lb);
                if step != 0 {
                    shared.count.fetch_add(i64::from(step), Ordering::Relaxed);
                    shared.travel.fetch_add(1, Ordering::Relaxed);
                }
            })
            .map_err(|e| HwError::Gpio(e.to_string()))?;
        }

        Ok(Self {
            _a: a,
            _b: b,
            shared,
            invert: pins.invert,
            origin: 0,
            last_sample: None,
            last_velocity: 0.0,
        })
    }

    fn raw_count(&self) -> i64 {
        let c = self.shared.count.load(Ordering::Relaxed);
        if self.invert { -c } else { c }
    }

    /// Total ticks travelled in either direction since construction.
    pub fn travel(&self) -> u64 {
        self.shared.travel.load(Ordering::Relaxed)
    }
}

impl PositionSource for QuadratureEncoder {
    fn position(&mut self) -> std::result::Result<i64, BoxError> {
        Ok(self.raw_count() - self.origin)
    }

    fn velocity(&mut self) -> std::result::Result<f32, BoxError> {
        let now = Instant::now();
        let count = self.raw_count();
        if let Some((prev, at)) = self.last_sample {
            let dt = now.saturating_duration_since(at).as_secs_f32();
            if dt > 0.0 {
                self.last_velocity = (count - prev) as f32 / dt;
            }
        }
        self.last_sample = Some((count, now));
        Ok(self.last_velocity)
    }

    fn reset(&mut self) -> std::result::Result<(), BoxError> {
        self.origin = self.raw_count();
        self.last_sample = None;
        self.last_velocity = 0.0;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CurrentAdcConfig {
    pub bus: u8,
    pub address: u16,
}

impl CurrentAdcConfig {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Left => Self {
                bus: 1,
                address: 0x4B,
            },
            Side::Right => Self {
                bus: 1,
                address: 0x4D,
            },
        }
    }
}

/// 10-bit I2C ADC on the motor current shunt.
pub struct CurrentAdc {
    i2c: I2c,
}

impl CurrentAdc {
    pub fn new(cfg: CurrentAdcConfig) -> Result<Self> {
        let mut i2c = I2c::with_bus(cfg.bus).map_err(|e| HwError::I2c(e.to_string()))?;
        i2c.set_slave_address(cfg.address)
            .map_err(|e| HwError::I2c(e.to_string()))?;
        Ok(Self { i2c })
    }
}

impl CurrentSource for CurrentAdc {
    fn read_current(&mut self) -> std::result::Result<i32, BoxError> {
        let mut buf = [0u8; 2];
        if let Err(e) = self.i2c.block_read(0x00, &mut buf) {
            warn!(error = %e, "current adc read failed");
            return Err(HwError::I2c(e.to_string()).into());
        }
        Ok(decode_adc10(buf))
    }
}
