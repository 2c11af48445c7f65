// src/extras/endstop_trim.rs
// Endstop-trim leveling: probe near the base of each tower and adjust
// the per-tower trims until the three depths agree.
//
// The correction is proportional to each tower's deviation from the
// shallowest reading. When an iteration fails to improve, the
// proportionality constant is backed off; naive proportional
// correction can otherwise oscillate without converging. A successful
// pass normalizes the trims so the largest is zero, since positive
// trim would grind the belt at homing.

use crate::extras::geometry::GeometryFacade;
use crate::extras::session::ProbeSession;
use crate::machine::Machine;
use crate::probe::{ProbeError, ZProbe};

const MAX_ITERATIONS: usize = 20;
const INITIAL_TRIMSCALE: f32 = 1.3;

pub fn calibrate_delta_endstops(
    session: &mut ProbeSession,
    facade: &mut GeometryFacade,
    zprobe: &mut ZProbe,
    machine: &Machine,
    target: f32,
    keep: bool,
) -> Result<(), ProbeError> {
    machine.stream.respond(format!(
        "[ES] Calibrating endstops: target {:.3}mm, radius {:.3}mm",
        target, session.probe_radius
    ));

    let mut trimscale = INITIAL_TRIMSCALE;
    let towers = ProbeSession::tower_coordinates(session.probe_radius);

    let mut trim = [0.0f32; 3];
    if keep {
        // Iterate from the current trim.
        trim = facade.get_trim(machine);
        machine.stream.respond(format!(
            "[ES] Current Trim: x={:.3}, y={:.3}, z={:.3}",
            trim[0], trim[1], trim[2]
        ));
    } else {
        facade.set_trim(machine, trim, &machine.stream);
    }

    session.prepare_to_probe(zprobe, machine)?;

    let probe_towers = |session: &mut ProbeSession,
                            zprobe: &mut ZProbe|
     -> Result<[f32; 3], ProbeError> {
        let mut depths = [0.0f32; 3];
        for (i, tower) in towers.iter().enumerate() {
            let steps = session.do_probe_at(zprobe, machine, tower[0], tower[1])?;
            depths[i] = zprobe.zsteps_to_mm(machine, steps as f32);
        }
        Ok(depths)
    };

    let depths = probe_towers(session, zprobe)?;
    let (mut min, mut max) = min_max(depths);
    let mut deviation = max - min;

    if deviation <= target {
        machine.stream.respond(format!(
            "[ES] Trim already set within required parameters: difference = {:.3}",
            deviation
        ));
        return Ok(());
    }
    machine.stream.respond(format!(
        "[ES] Towers out of spec by {:.3} - will need to level the endstops",
        deviation - target
    ));
    let mut last_deviation = deviation;

    // Start with every tower pulled down toward the shallowest reading;
    // trims must start negative (positive trim grinds the belt).
    for i in 0..3 {
        trim[i] += (min - depths[i]) * trimscale;
    }

    for _ in 1..=MAX_ITERATIONS {
        facade.set_trim(machine, trim, &machine.stream);
        session.prepare_to_probe(zprobe, machine)?;

        let depths = probe_towers(session, zprobe)?;
        let mm = min_max(depths);
        min = mm.0;
        max = mm.1;
        deviation = max - min;

        if deviation > target {
            machine.stream.respond(format!(
                "[ES] ~ Towers still out of spec by {:.3}",
                deviation - target
            ));

            if deviation >= last_deviation && trimscale * 0.95 >= 0.9 {
                trimscale *= 0.9;
                machine.stream.respond(format!(
                    "[ES] ~ Deviation same or worse vs. last time - reducing trim scale to {:.3}",
                    trimscale
                ));
            }
            last_deviation = deviation;

            for i in 0..3 {
                trim[i] += (min - depths[i]) * trimscale;
            }
            continue;
        }

        log::debug!("endstop trim converged, deviation {:.4}", deviation);
        machine.stream.respond(format!(
            "[ES] Trim set to within required parameters: want {:.3}, difference is {:.3}",
            target, deviation
        ));

        // Normalize so max(trim) == 0, or the trims creep downward a
        // little more on every pass that keeps existing trim.
        let top = trim[0].max(trim[1]).max(trim[2]);
        machine.stream.respond(format!(
            "[ES] Trim is {{{:.3}, {:.3}, {:.3}}} - normalizing...",
            trim[0], trim[1], trim[2]
        ));
        for t in trim.iter_mut() {
            *t -= top;
        }

        facade.set_trim(machine, trim, &machine.stream);
        machine.stream.respond(format!(
            "[ES] New values: {{{:.3}, {:.3}, {:.3}}}.",
            trim[0], trim[1], trim[2]
        ));
        return Ok(());
    }

    machine.stream.respond(format!(
        "[ES] Trim did not resolve to within required parameters: delta {:.3}",
        deviation
    ));
    Err(ProbeError::Nonconvergence("endstop trim"))
}

fn min_max(values: [f32; 3]) -> (f32, f32) {
    (
        values[0].min(values[1]).min(values[2]),
        values[0].max(values[1]).max(values[2]),
    )
}
