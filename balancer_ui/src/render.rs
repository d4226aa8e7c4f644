//! Text rendering of telemetry snapshots.

use std::fmt::Write as _;

use balancer_core::{SafetyState, SafetyZone, StageId, Telemetry};

fn state_name(s: SafetyState) -> &'static str {
    match s {
        SafetyState::Running => "running",
        SafetyState::Tripped => "TRIPPED",
    }
}

fn zone_name(z: SafetyZone) -> &'static str {
    match z {
        SafetyZone::Safe => "safe",
        SafetyZone::Soft => "soft",
        SafetyZone::Hard => "hard",
    }
}

fn opt(v: Option<f32>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:+.2}"))
}

/// One-line status, the same fields as the loop's periodic debug line.
pub fn status_line(t: &Telemetry) -> String {
    format!(
        "#{tick} {state}/{zone} angle {raw:+.2} -> {filt:+.2} target {target:+.2} torque {torque:+.3} L {l:+.3} R {r:+.3}",
        tick = t.tick,
        state = state_name(t.state),
        zone = zone_name(t.zone),
        raw = t.raw_angle,
        filt = t.filtered_angle,
        target = t.target_angle,
        torque = t.torque,
        l = t.command.left,
        r = t.command.right,
    )
}

/// Multi-line report with the per-stage table.
pub fn render(t: &Telemetry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", status_line(t));
    let _ = writeln!(
        out,
        "  rate {rate}  offset {off:+.2}  diff {diff:+.3}  velocity {vel}  travel {travel:.0}",
        rate = opt(t.angular_rate),
        off = t.target_offset,
        diff = t.differential,
        vel = opt(t.velocity),
        travel = t.travel,
    );
    let _ = writeln!(
        out,
        "  uptime {up:.1}s  trips {trips}  tick {last}us  overruns {ov} (run {cons}{sus})",
        up = t.uptime_us as f64 / 1e6,
        trips = t.trips,
        last = t.last_tick_us,
        ov = t.overruns,
        cons = t.consecutive_overruns,
        sus = if t.sustained_overrun { ", SUSTAINED" } else { "" },
    );
    let _ = writeln!(
        out,
        "  {:<9}{:<4}{:>9}{:>9}{:>9}{:>10}{:>9}",
        "stage", "on", "kp", "ki", "kd", "setpoint", "output"
    );
    for id in StageId::ALL {
        let s = t.stage(id);
        let _ = writeln!(
            out,
            "  {:<9}{:<4}{:>9.4}{:>9.4}{:>9.4}{:>10.2}{:>9.3}",
            id.name(),
            if s.enabled { "yes" } else { "no" },
            s.gains.kp,
            s.gains.ki,
            s.gains.kd,
            s.setpoint,
            s.output,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tripped_state_is_loud() {
        let t = Telemetry {
            state: SafetyState::Tripped,
            zone: SafetyZone::Hard,
            ..Telemetry::default()
        };
        assert!(status_line(&t).contains("TRIPPED/hard"));
    }

    #[test]
    fn report_lists_every_stage() {
        let mut t = Telemetry::default();
        t.stages[StageId::Tilt.index()].enabled = true;
        t.stages[StageId::Tilt.index()].gains.kp = 0.03;
        let text = render(&t);
        for id in StageId::ALL {
            assert!(text.contains(id.name()), "{text}");
        }
        let tilt = text
            .lines()
            .find(|l| l.trim_start().starts_with("tilt"))
            .unwrap();
        assert!(tilt.contains("yes") && tilt.contains("0.0300"), "{tilt}");
        assert!(text.contains("velocity -"));
    }

    #[test]
    fn sustained_overrun_is_flagged() {
        let t = Telemetry {
            overruns: 60,
            consecutive_overruns: 55,
            sustained_overrun: true,
            ..Telemetry::default()
        };
        assert!(render(&t).contains("overruns 60 (run 55, SUSTAINED)"));
    }
}
