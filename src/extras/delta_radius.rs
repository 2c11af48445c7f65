// src/extras/delta_radius.rs
// Delta-radius calibration: compare the probed depth at bed center
// against the mean of the three tower-base depths and adjust the
// radius until they agree. A radius error shows up as a bowl or dome;
// when the center measures low the radius is too small.

use crate::extras::geometry::GeometryFacade;
use crate::extras::session::ProbeSession;
use crate::machine::Machine;
use crate::probe::{ProbeError, ZProbe};

const MAX_ITERATIONS: usize = 10;
// Empirical gain from measured center offset to radius correction.
const RADIUS_GAIN: f32 = 2.5;

pub fn calibrate_delta_radius(
    session: &mut ProbeSession,
    facade: &mut GeometryFacade,
    zprobe: &mut ZProbe,
    machine: &Machine,
    target: f32,
) -> Result<(), ProbeError> {
    machine.stream.respond(format!(
        "[DR] Calibrating delta radius: target {:.3}, radius {:.3}",
        target, session.probe_radius
    ));

    let towers = ProbeSession::tower_coordinates(session.probe_radius);

    session.prepare_to_probe(zprobe, machine)?;

    // Center reference at this probing elevation; the tower probes are
    // compared against it on every iteration.
    let center_steps = session.do_probe_at(zprobe, machine, 0.0, 0.0)?;
    let center_mm = zprobe.zsteps_to_mm(machine, center_steps as f32);
    machine.stream.respond(format!(
        "[DR] Center Z: {:.3}mm ({} steps)",
        center_mm, center_steps
    ));

    let mut delta_radius = facade
        .get_delta_radius(machine)
        .ok_or_else(|| ProbeError::Config("Delta radius not available from arm solution".into()))?;
    if delta_radius == 0.0 {
        machine
            .stream
            .respond("[DR] ERROR: Delta radius not set in config! Is this a delta?");
        return Err(ProbeError::Config("delta radius is zero".into()));
    }

    for i in 1..=MAX_ITERATIONS {
        let mut tower_steps = [0i32; 3];
        for (t, tower) in towers.iter().enumerate() {
            tower_steps[t] = session.do_probe_at(zprobe, machine, tower[0], tower[1])?;
        }

        let mean_mm = zprobe.zsteps_to_mm(
            machine,
            (tower_steps[0] + tower_steps[1] + tower_steps[2]) as f32 / 3.0,
        );
        let d = center_mm - mean_mm;
        machine.stream.respond(format!(
            "[DR] C-{} Z-ave:{:.4} delta: {:.3}",
            i, mean_mm, d
        ));

        if d.abs() <= target {
            return Ok(());
        }

        // Center low reads as more travel: grow the radius.
        delta_radius += d * RADIUS_GAIN;
        log::debug!("delta radius adjusted to {:.4}", delta_radius);
        facade.set_delta_radius(machine, delta_radius);
        machine
            .stream
            .respond(format!("[DR] Setting delta radius to: {:.4}", delta_radius));

        session.prepare_to_probe(zprobe, machine)?;
    }

    Err(ProbeError::Nonconvergence("delta radius"))
}
