// tests/calibration.rs
// End-to-end calibration scenarios: the G32 compound (endstop trims +
// delta radius), the repeatability test and probe smoothing, all
// against the simulated bed.

use delta_autocal::extras::session::ProbeSession;
use delta_autocal::extras::ProbeDispatch;
use delta_autocal::gcode::GCodeCommand;
use delta_autocal::kinematics::{ArmOptions, ArmSolution};
use delta_autocal::probe::ZProbe;
use delta_autocal::test_utils::{sim_probe_config, BedModel, SimMachine, SimOptions};

fn fast_options() -> SimOptions {
    // A short tower keeps the simulated probe times down; the finer
    // step resolution keeps quantization out of the tolerance checks.
    SimOptions {
        gamma_max: 100.0,
        steps_per_mm: 200.0,
        ..Default::default()
    }
}

fn setup(
    options: SimOptions,
    tweak: impl FnOnce(&mut delta_autocal::configfile::Configfile),
) -> (SimMachine, ProbeDispatch) {
    let mut config = sim_probe_config(&options);
    tweak(&mut config);
    let sim = SimMachine::build(options);
    let dispatch = ProbeDispatch::from_config(&config, Some(sim.pin_source.clone()))
        .unwrap()
        .expect("zprobe enabled");
    dispatch.register_handlers(&sim.machine);
    (sim, dispatch)
}

fn run(dispatch: &mut ProbeDispatch, sim: &SimMachine, line: &str) {
    let cmd = GCodeCommand::parse(line).unwrap();
    dispatch.on_gcode_received(&cmd, &sim.machine);
}

fn delta_radius(sim: &SimMachine) -> f32 {
    let mut options = ArmOptions::new();
    sim.machine.arm_solution.lock().get_options(&mut options);
    options[&'R']
}

#[test]
fn level_bed_converges_immediately() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});

    run(&mut dispatch, &sim, "G32");

    // Endstops already in spec, radius untouched.
    assert!(sim.machine.stream.contains("[ES] Trim already set within required parameters"));
    assert!(sim.machine.stream.contains("Basic calibration complete"));
    assert_eq!(sim.machine.endstops.lock().get_trim(), [0.0, 0.0, 0.0]);
    assert!((delta_radius(&sim) - 124.0).abs() < 1e-3);
}

#[test]
fn tilted_bed_levels_into_trims() {
    let options = SimOptions {
        bed: BedModel::tilted_tower(0, -1.0),
        ..fast_options()
    };
    let (sim, mut dispatch) = setup(options, |_| {});

    run(&mut dispatch, &sim, "G32");

    assert!(sim.machine.stream.contains("[ES] Trim set to within required parameters"));
    let trim = sim.machine.endstops.lock().get_trim();

    // Tower X probes 1 mm deep, so it ends up a millimeter low and the
    // others at zero after normalization.
    assert!((trim[0] + 1.0).abs() < 0.08, "trim {:?}", trim);
    assert!(trim[1].abs() < 0.05 && trim[2].abs() < 0.05, "trim {:?}", trim);
    let max = trim[0].max(trim[1]).max(trim[2]);
    assert!(max.abs() < 1e-4, "max trim must normalize to zero, got {:?}", trim);

    // Convergence within the documented handful of iterations.
    let retries = sim
        .machine
        .stream
        .lines()
        .iter()
        .filter(|l| l.contains("still out of spec"))
        .count();
    assert!(retries <= 5, "took {} correction rounds", retries);
}

#[test]
fn bowl_shaped_bed_grows_delta_radius() {
    let options = SimOptions {
        bed: BedModel::bowl(-0.5),
        ..fast_options()
    };
    let (sim, mut dispatch) = setup(options, |_| {});

    run(&mut dispatch, &sim, "G32");

    // 0.5 mm of center sag at gain 2.5 is about +1.25 mm of radius.
    let radius = delta_radius(&sim);
    assert!(
        (radius - 125.25).abs() < 0.1,
        "delta radius {} expected ~125.25",
        radius
    );
    assert!(sim.machine.stream.contains("Basic calibration complete"));
}

#[test]
fn keep_mode_is_idempotent() {
    let options = SimOptions {
        bed: BedModel::tilted_tower(0, -1.0),
        ..fast_options()
    };
    let (sim, mut dispatch) = setup(options, |_| {});

    run(&mut dispatch, &sim, "G32 K");
    let trim_first = sim.machine.endstops.lock().get_trim();
    sim.machine.stream.take_lines();

    // A second keep-mode run finds the towers already level and leaves
    // the trims alone.
    run(&mut dispatch, &sim, "G32 K");
    assert!(sim.machine.stream.contains("[ES] Trim already set within required parameters"));
    let trim_second = sim.machine.endstops.lock().get_trim();
    for axis in 0..3 {
        assert!(
            (trim_first[axis] - trim_second[axis]).abs() < 1e-4,
            "trim changed: {:?} -> {:?}",
            trim_first,
            trim_second
        );
    }
}

#[test]
fn g32_skip_flags() {
    let options = SimOptions {
        bed: BedModel::bowl(-0.5),
        ..fast_options()
    };
    let (sim, mut dispatch) = setup(options, |_| {});

    // R skips the endstop pass entirely.
    run(&mut dispatch, &sim, "G32 R E");
    assert!(!sim.machine.stream.contains("[ES]"));
    assert!(!sim.machine.stream.contains("[DR]"));
    assert!(sim.machine.stream.contains("Basic calibration complete"));
    sim.machine.stream.take_lines();

    // E leaves the radius alone.
    run(&mut dispatch, &sim, "G32 E");
    assert!(sim.machine.stream.contains("[ES]"));
    assert!(!sim.machine.stream.contains("[DR]"));
    assert!((delta_radius(&sim) - 124.0).abs() < 1e-3);
}

#[test]
fn noisy_probe_smoothing_averages_out() {
    // Any three consecutive samples of this jitter pattern cancel.
    let options = SimOptions {
        noise_steps: vec![2, -1, -1],
        ..fast_options()
    };
    let mut config = sim_probe_config(&options);
    config.set("comprehensive-delta", "probe_smoothing", "3");
    let sim = SimMachine::build(options);
    let mut probe = ZProbe::from_config(&config, Some(sim.pin_source.clone())).unwrap();
    probe.register_handlers(&sim.machine);
    let mut session = ProbeSession::from_config(&config).unwrap();

    session.prepare_to_probe(&mut probe, &sim.machine).unwrap();
    let first = session.do_probe_at(&mut probe, &sim.machine, 0.0, 0.0).unwrap();
    let second = session.do_probe_at(&mut probe, &sim.machine, 0.0, 0.0).unwrap();
    assert!(
        (first - second).abs() < 2,
        "smoothed counts differ: {} vs {}",
        first,
        second
    );
}

#[test]
fn repeatability_test_classifies_noisy_probe() {
    let options = SimOptions {
        noise_steps: vec![2, -1, -1],
        ..fast_options()
    };
    let (sim, mut dispatch) = setup(options, |config| {
        config.set("comprehensive-delta", "probe_smoothing", "3");
    });

    run(&mut dispatch, &sim, "G29 S4");

    assert!(sim.machine.stream.contains("[RT] Stats:"));
    assert!(
        sim.machine.stream.contains("This score is very good!"),
        "lines: {:#?}",
        sim.machine.stream.lines()
    );
}

#[test]
fn repeatability_test_rejects_excess_samples() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});

    run(&mut dispatch, &sim, "G29 S31");
    assert!(sim.machine.stream.contains("[RT] Too many samples!"));
    assert!(!sim.machine.stream.contains("[RT] Stats:"));
}

#[test]
fn external_geometry_change_forces_recalibration() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});

    run(&mut dispatch, &sim, "G32");
    sim.machine.stream.take_lines();

    // M665 touching a geometry letter dirties the model; the next
    // surface operation recalibrates first.
    run(&mut dispatch, &sim, "M665 D0.05");
    run(&mut dispatch, &sim, "G31");
    assert!(
        sim.machine.stream.contains("[EC] Geometry has been changed"),
        "lines: {:#?}",
        sim.machine.stream.lines()
    );
    assert!(sim.machine.stream.contains("[DM]"));
}

#[test]
fn heuristic_loop_leaves_calibrated_geometry_alone() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});

    run(&mut dispatch, &sim, "G32");
    let radius_before = delta_radius(&sim);
    sim.machine.stream.take_lines();

    run(&mut dispatch, &sim, "G31");

    // On an already-flat response every trial perturbation is reverted.
    let radius_after = delta_radius(&sim);
    assert!(
        (radius_before - radius_after).abs() < 1e-3,
        "radius drifted {} -> {}",
        radius_before,
        radius_after
    );
    assert!(sim.machine.stream.contains("[TQ] Heuristic calibration done"));
}

#[test]
fn probe_refused_when_pin_already_triggered() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});

    // Park the effector on the surface; the pin reads active.
    sim.machine.relative_move(0.0, 0.0, -100.5, 100.0);

    run(&mut dispatch, &sim, "G32");
    assert!(sim.machine.stream.contains("ZProbe triggered before move, aborting command."));
}

#[test]
fn m500_prints_probe_settings() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});
    run(&mut dispatch, &sim, "M503");
    assert!(sim.machine.stream.contains(";Probe feedrates"));
    assert!(sim.machine.stream.contains("M670 S5.00 K100.00"));
}

#[test]
fn m665_z_sets_bed_height() {
    let (sim, mut dispatch) = setup(fast_options(), |_| {});
    run(&mut dispatch, &sim, "M665 Z123.5");
    assert_eq!(sim.machine.endstops.lock().gamma_max(), 123.5);
}
