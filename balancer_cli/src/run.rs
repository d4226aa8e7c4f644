//! Backend assembly and the `run` / `self-check` commands.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use balancer_config::{BackendKind, Config};
use balancer_core::{BalanceCfg, BalanceError, BalanceLoop, SafetyState, TimingStats};
use balancer_traits::{Actuator, CurrentSource, PositionSource, TiltSensor};
use eyre::WrapErr;

use crate::cli::RunArgs;
use crate::rt;

/// Test hook: `imu` makes every simulated IMU read fail.
pub const SIM_FAULT_ENV: &str = "BALANCER_TEST_SIM_FAULT";

/// Every device the loop can use, boxed behind the collaborator traits.
pub struct Devices {
    pub tilt: Box<dyn TiltSensor + Send>,
    pub actuators: [Box<dyn Actuator + Send>; 2],
    pub positions: [Box<dyn PositionSource + Send>; 2],
    pub currents: [Box<dyn CurrentSource + Send>; 2],
}

pub fn open_backend(cfg: &Config, kind: BackendKind) -> eyre::Result<Devices> {
    match kind {
        BackendKind::Sim => sim_devices(cfg),
        BackendKind::Hardware => hardware_devices(cfg),
    }
}

fn sim_devices(cfg: &Config) -> eyre::Result<Devices> {
    use balancer_hardware::{Side, SimulatedPlant};
    use balancer_traits::MonotonicClock;

    let plant = SimulatedPlant::new(MonotonicClock::new())
        .with_read_latency(Duration::from_micros(cfg.backend.sim_read_latency_us));
    if std::env::var(SIM_FAULT_ENV).is_ok_and(|v| v == "imu") {
        plant.fail_imu(true).wrap_err("arming simulated imu fault")?;
    }
    tracing::info!(
        read_latency_us = cfg.backend.sim_read_latency_us,
        "using simulated plant"
    );
    Ok(Devices {
        tilt: Box::new(plant.imu()),
        actuators: [
            Box::new(plant.motor(Side::Left)),
            Box::new(plant.motor(Side::Right)),
        ],
        positions: [
            Box::new(plant.encoder(Side::Left)),
            Box::new(plant.encoder(Side::Right)),
        ],
        currents: [
            Box::new(plant.current_sensor(Side::Left)),
            Box::new(plant.current_sensor(Side::Right)),
        ],
    })
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn hardware_devices(cfg: &Config) -> eyre::Result<Devices> {
    use balancer_hardware::Side;
    use balancer_hardware::hardware::{
        Bno055Imu, CurrentAdc, CurrentAdcConfig, EncoderPins, ImuConfig, MotorPins, PwmMotor,
        QuadratureEncoder,
    };

    let hw = &cfg.hardware;
    let imu = Bno055Imu::new(ImuConfig {
        bus: hw.i2c_bus,
        address: hw.imu_address,
        init_timeout: Duration::from_millis(hw.imu_init_timeout_ms),
    })
    .map_err(hw_fault)
    .wrap_err("open imu")?;

    let side_pins = |side: Side| match side {
        Side::Left => &hw.left,
        Side::Right => &hw.right,
    };
    let motor = |side: Side| -> eyre::Result<Box<dyn Actuator + Send>> {
        let p = side_pins(side);
        let pins = MotorPins {
            pwm_channel: p.pwm_channel,
            dir_pin: p.dir_pin,
            enable_pin: p.enable_pin,
            frequency_hz: hw.pwm_frequency_hz,
            ..MotorPins::for_side(side)
        };
        let m = PwmMotor::new(pins)
            .map_err(hw_fault)
            .wrap_err_with(|| format!("open {side:?} motor pins"))?;
        Ok(Box::new(m))
    };
    let encoder = |side: Side| -> eyre::Result<Box<dyn PositionSource + Send>> {
        let p = side_pins(side);
        let pins = EncoderPins {
            a: p.encoder_a,
            b: p.encoder_b,
            ..EncoderPins::for_side(side)
        };
        let e = QuadratureEncoder::new(pins)
            .map_err(hw_fault)
            .wrap_err_with(|| format!("open {side:?} encoder"))?;
        Ok(Box::new(e))
    };
    let adc = |side: Side| -> eyre::Result<Box<dyn CurrentSource + Send>> {
        let a = CurrentAdc::new(CurrentAdcConfig {
            bus: hw.i2c_bus,
            address: side_pins(side).current_adc_address,
        })
        .map_err(hw_fault)
        .wrap_err_with(|| format!("open {side:?} current adc"))?;
        Ok(Box::new(a))
    };

    Ok(Devices {
        tilt: Box::new(imu),
        actuators: [motor(Side::Left)?, motor(Side::Right)?],
        positions: [encoder(Side::Left)?, encoder(Side::Right)?],
        currents: [adc(Side::Left)?, adc(Side::Right)?],
    })
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn hw_fault(e: balancer_hardware::HwError) -> eyre::Report {
    eyre::Report::new(BalanceError::HardwareFault(e.to_string()))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn hardware_devices(_cfg: &Config) -> eyre::Result<Devices> {
    Err(eyre::Report::new(BalanceError::HardwareFault(
        "hardware backend not compiled in (rebuild with --features hardware on Linux)".into(),
    )))
}

fn build_loop(cfg: &Config, devices: Devices) -> eyre::Result<BalanceLoop> {
    let runtime = BalanceCfg::try_from(cfg)?;
    let Devices {
        tilt,
        actuators: [left, right],
        positions: [pos_l, pos_r],
        currents: [cur_l, cur_r],
    } = devices;
    BalanceLoop::builder()
        .with_tilt_sensor(tilt)
        .with_actuators(left, right)
        .with_position_sources(pos_l, pos_r)
        .with_current_sources(cur_l, cur_r)
        .with_config(runtime)
        .build()
        .wrap_err("assembling control loop")
}

/// Outcome of a completed `run`.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub stats: TimingStats,
    pub period: Duration,
    pub trips: u64,
    pub state: SafetyState,
    pub duration: Duration,
}

pub fn run_balance(
    cfg: &Config,
    kind: BackendKind,
    args: &RunArgs,
    shutdown: Arc<AtomicBool>,
) -> eyre::Result<RunSummary> {
    let devices = open_backend(cfg, kind)?;
    let mut lp = build_loop(cfg, devices)?;
    let period = lp.period();

    if args.console {
        spawn_console(&lp, Arc::clone(&shutdown))?;
    }

    let max = args.duration_ms.map(Duration::from_millis);
    let rt_args = args.rt.clone();
    let began = Instant::now();
    let control = thread::Builder::new()
        .name("balance-loop".into())
        .spawn(move || -> eyre::Result<(TimingStats, BalanceLoop)> {
            let applied = rt::apply(&rt_args);
            tracing::debug!(?applied, "control thread ready");
            let stats = lp.run(&shutdown, max)?;
            Ok((stats, lp))
        })
        .wrap_err("spawning control thread")?;

    let (stats, lp) = control
        .join()
        .map_err(|_| eyre::Report::new(BalanceError::State("control thread panicked".into())))??;
    let t = lp.telemetry();
    Ok(RunSummary {
        stats,
        period,
        trips: t.trips,
        state: t.state,
        duration: began.elapsed(),
    })
}

/// The console thread is detached: it may be blocked on stdin when the
/// loop ends.
fn spawn_console(lp: &BalanceLoop, shutdown: Arc<AtomicBool>) -> eyre::Result<()> {
    let console = balancer_ui::Console::new(lp.operator_handle());
    thread::Builder::new()
        .name("operator-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            if let Err(e) = console.run(stdin.lock(), std::io::stdout(), &shutdown) {
                tracing::warn!(error = %e, "operator console failed");
            }
        })
        .wrap_err("spawning console thread")?;
    Ok(())
}

/// Readings taken by `self-check`.
#[derive(Debug, Clone, Copy)]
pub struct SelfCheckReport {
    pub tilt: f32,
    pub pitch_rate: f32,
    pub yaw_rate: f32,
    pub positions: [i64; 2],
    pub currents: [i32; 2],
}

fn device<T>(
    r: Result<T, Box<dyn std::error::Error + Send + Sync>>,
    what: &'static str,
) -> eyre::Result<T> {
    r.map_err(|e| eyre::Report::new(BalanceError::HardwareFault(e.to_string())))
        .wrap_err(what)
}

/// One read of every sensor, then start, zero and stop both actuators.
pub fn self_check(cfg: &Config, kind: BackendKind) -> eyre::Result<SelfCheckReport> {
    let mut d = open_backend(cfg, kind)?;
    let tilt = device(d.tilt.read_tilt(), "read tilt")?;
    let pitch_rate = device(d.tilt.read_angular_rate_pitch(), "read pitch rate")?;
    let yaw_rate = device(d.tilt.read_angular_rate_yaw(), "read yaw rate")?;
    let [pl, pr] = &mut d.positions;
    let positions = [
        device(pl.position(), "read left position")?,
        device(pr.position(), "read right position")?,
    ];
    let [cl, cr] = &mut d.currents;
    let currents = [
        device(cl.read_current(), "read left current")?,
        device(cr.read_current(), "read right current")?,
    ];
    for a in &mut d.actuators {
        device(a.start(), "start actuator")?;
        device(a.set_command(0.0), "zero actuator")?;
        device(a.stop(), "stop actuator")?;
    }
    tracing::info!(tilt, pitch_rate, yaw_rate, "self-check passed");
    Ok(SelfCheckReport {
        tilt,
        pitch_rate,
        yaw_rate,
        positions,
        currents,
    })
}

/// Print tick timing stats to stderr.
pub fn print_stats(s: &RunSummary) {
    let st = &s.stats;
    eprintln!("\n--- Balancer Stats ---");
    eprintln!("Ticks: {}", st.ticks);
    eprintln!("Period (us): {}", s.period.as_micros());
    eprintln!(
        "Tick min/avg/max (us): {} / {} / {}",
        st.min.as_micros(),
        st.avg().as_micros(),
        st.max.as_micros()
    );
    eprintln!("Budget used (avg/period): {:.1}%", st.budget_ratio(s.period) * 100.0);
    eprintln!(
        "Overruns: {} (longest current run {}){}",
        st.overruns,
        st.consecutive_overruns,
        if st.sustained { ", SUSTAINED" } else { "" }
    );
    eprintln!("Safety trips: {}", s.trips);
    eprintln!("----------------------\n");
}
