//! Lock-free telemetry snapshot shared between the control thread (single
//! writer) and any number of readers.
//!
//! `SnapshotCell` is a sequence lock over plain atomic words: the writer
//! makes the sequence odd, stores every word, then makes it even again;
//! readers copy all words and retry if the sequence moved or was odd. No
//! reader can observe a torn multi-field record, and the writer never waits.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::mixer::MotorCommand;
use crate::operator::StageId;
use crate::pid::PidGains;
use crate::safety::{SafetyState, SafetyZone};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StageTelemetry {
    pub enabled: bool,
    pub gains: PidGains,
    pub setpoint: f32,
    pub output: f32,
}

/// One control tick as seen from outside the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Telemetry {
    pub tick: u64,
    /// Microseconds since the loop started.
    pub uptime_us: u64,
    pub raw_angle: f32,
    pub filtered_angle: f32,
    pub angular_rate: Option<f32>,
    /// Tilt target handed to the tilt stage (after any neutral override).
    pub target_angle: f32,
    /// Operator / preset target offset.
    pub target_offset: f32,
    pub torque: f32,
    pub differential: f32,
    /// Mean wheel velocity, ticks/s, when the velocity loop is enabled.
    pub velocity: Option<f32>,
    /// Cumulative mean wheel travel in ticks.
    pub travel: f32,
    pub command: MotorCommand,
    pub state: SafetyState,
    pub zone: SafetyZone,
    pub trips: u64,
    pub overruns: u64,
    pub consecutive_overruns: u64,
    pub sustained_overrun: bool,
    pub last_tick_us: u64,
    pub stages: [StageTelemetry; StageId::COUNT],
}

impl Telemetry {
    pub fn stage(&self, id: StageId) -> &StageTelemetry {
        &self.stages[id.index()]
    }
}

const HEADER_WORDS: usize = 19;
const STAGE_WORDS: usize = 6;
const WORDS: usize = HEADER_WORDS + STAGE_WORDS * StageId::COUNT;

struct Enc<'a> {
    buf: &'a mut [u64; WORDS],
    i: usize,
}

impl Enc<'_> {
    fn u(&mut self, v: u64) {
        self.buf[self.i] = v;
        self.i += 1;
    }
    fn f(&mut self, v: f32) {
        self.u(u64::from(v.to_bits()));
    }
    fn b(&mut self, v: bool) {
        self.u(u64::from(v));
    }
}

struct Dec<'a> {
    buf: &'a [u64; WORDS],
    i: usize,
}

impl Dec<'_> {
    fn u(&mut self) -> u64 {
        let v = self.buf[self.i];
        self.i += 1;
        v
    }
    fn f(&mut self) -> f32 {
        f32::from_bits(self.u() as u32)
    }
    fn b(&mut self) -> bool {
        self.u() != 0
    }
    fn opt(&mut self) -> Option<f32> {
        let v = self.f();
        (!v.is_nan()).then_some(v)
    }
}

fn state_word(s: SafetyState) -> u64 {
    match s {
        SafetyState::Running => 0,
        SafetyState::Tripped => 1,
    }
}

fn zone_word(z: SafetyZone) -> u64 {
    match z {
        SafetyZone::Safe => 0,
        SafetyZone::Soft => 1,
        SafetyZone::Hard => 2,
    }
}

fn encode(t: &Telemetry, buf: &mut [u64; WORDS]) {
    let mut e = Enc { buf, i: 0 };
    e.u(t.tick);
    e.u(t.uptime_us);
    e.f(t.raw_angle);
    e.f(t.filtered_angle);
    e.f(t.angular_rate.unwrap_or(f32::NAN));
    e.f(t.target_angle);
    e.f(t.target_offset);
    e.f(t.torque);
    e.f(t.differential);
    e.f(t.velocity.unwrap_or(f32::NAN));
    e.f(t.travel);
    e.f(t.command.left);
    e.f(t.command.right);
    e.u(state_word(t.state) | (zone_word(t.zone) << 8));
    e.u(t.trips);
    e.u(t.overruns);
    e.u(t.consecutive_overruns);
    e.b(t.sustained_overrun);
    e.u(t.last_tick_us);
    for s in &t.stages {
        e.b(s.enabled);
        e.f(s.gains.kp);
        e.f(s.gains.ki);
        e.f(s.gains.kd);
        e.f(s.setpoint);
        e.f(s.output);
    }
}

fn decode(buf: &[u64; WORDS]) -> Telemetry {
    let mut d = Dec { buf, i: 0 };
    let mut t = Telemetry {
        tick: d.u(),
        uptime_us: d.u(),
        raw_angle: d.f(),
        filtered_angle: d.f(),
        angular_rate: d.opt(),
        target_angle: d.f(),
        target_offset: d.f(),
        torque: d.f(),
        differential: d.f(),
        velocity: d.opt(),
        travel: d.f(),
        command: MotorCommand {
            left: d.f(),
            right: d.f(),
        },
        ..Telemetry::default()
    };
    let sz = d.u();
    t.state = if sz & 0xFF == 1 {
        SafetyState::Tripped
    } else {
        SafetyState::Running
    };
    t.zone = match (sz >> 8) & 0xFF {
        1 => SafetyZone::Soft,
        2 => SafetyZone::Hard,
        _ => SafetyZone::Safe,
    };
    t.trips = d.u();
    t.overruns = d.u();
    t.consecutive_overruns = d.u();
    t.sustained_overrun = d.b();
    t.last_tick_us = d.u();
    for s in &mut t.stages {
        s.enabled = d.b();
        s.gains = PidGains::new(d.f(), d.f(), d.f());
        s.setpoint = d.f();
        s.output = d.f();
    }
    t
}

/// Single-writer, multi-reader telemetry slot.
pub struct SnapshotCell {
    seq: AtomicU64,
    words: [AtomicU64; WORDS],
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SnapshotCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCell")
            .field("version", &self.version())
            .finish()
    }
}

impl SnapshotCell {
    pub fn new() -> Self {
        let cell = Self {
            seq: AtomicU64::new(0),
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        };
        cell.publish(&Telemetry::default());
        cell
    }

    /// Store a new snapshot. Must only be called from one thread at a time.
    pub fn publish(&self, t: &Telemetry) {
        let mut buf = [0u64; WORDS];
        encode(t, &mut buf);
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (slot, v) in self.words.iter().zip(buf) {
            slot.store(v, Ordering::Relaxed);
        }
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }

    /// Copy the latest complete snapshot.
    pub fn read(&self) -> Telemetry {
        let mut buf = [0u64; WORDS];
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            for (v, slot) in buf.iter_mut().zip(&self.words) {
                *v = slot.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            let s2 = self.seq.load(Ordering::Relaxed);
            if s1 == s2 {
                return decode(&buf);
            }
            std::hint::spin_loop();
        }
    }

    /// Number of completed publishes.
    pub fn version(&self) -> u64 {
        self.seq.load(Ordering::Acquire) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn sample(tick: u64) -> Telemetry {
        let x = tick as f32;
        let mut t = Telemetry {
            tick,
            uptime_us: tick * 5_000,
            raw_angle: x,
            filtered_angle: x,
            angular_rate: Some(-x),
            target_angle: x,
            target_offset: 0.5,
            torque: x,
            differential: -0.1,
            velocity: None,
            travel: x,
            command: MotorCommand { left: x, right: x },
            state: SafetyState::Tripped,
            zone: SafetyZone::Hard,
            trips: 3,
            overruns: tick,
            consecutive_overruns: 2,
            sustained_overrun: true,
            last_tick_us: 4_200,
            ..Telemetry::default()
        };
        t.stages[StageId::Yaw.index()] = StageTelemetry {
            enabled: true,
            gains: PidGains::new(0.1, 0.2, 0.3),
            setpoint: 45.0,
            output: x,
        };
        t
    }

    #[test]
    fn publish_then_read_returns_the_same_record() {
        let cell = SnapshotCell::new();
        assert_eq!(cell.version(), 1);
        let t = sample(7);
        cell.publish(&t);
        assert_eq!(cell.read(), t);
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn concurrent_reader_never_sees_a_torn_record() {
        let cell = Arc::new(SnapshotCell::new());
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let cell = Arc::clone(&cell);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let t = cell.read();
                    // every f32 field of a record carries the same tick value
                    let x = t.tick as f32;
                    assert_eq!(t.raw_angle, x);
                    assert_eq!(t.torque, x);
                    assert_eq!(t.command.right, x);
                    assert_eq!(t.overruns, t.tick);
                    reads += 1;
                }
                reads
            })
        };
        for tick in 1..20_000 {
            cell.publish(&sample(tick));
        }
        done.store(true, Ordering::Relaxed);
        let reads = reader.join().expect("reader thread");
        assert!(reads > 0);
    }
}
