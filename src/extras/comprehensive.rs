// src/extras/comprehensive.rs
// Comprehensive delta calibration strategy: probe repeatability test
// (G29), depth map and heuristic calibration (G31), and the standard
// endstop-trim + delta-radius calibration compound (G32). Owns the
// probing session, the geometry facade and the 12-point test pattern.

use crate::extras::delta_radius::calibrate_delta_radius;
use crate::extras::endstop_trim::calibrate_delta_endstops;
use crate::extras::geometry::GeometryFacade;
use crate::extras::session::ProbeSession;
use crate::extras::LevelingStrategy;
use crate::configfile::{ConfigError, Configfile};
use crate::gcode::GCodeCommand;
use crate::machine::Machine;
use crate::mathutil::{distance, intersextile_mean, mean, midpoint, rotate2d, std_dev, vector_unit};
use crate::probe::{ProbeError, ZProbe};

// Indices into the 12-point test pattern.
pub const TP_X: usize = 0;
pub const TP_Y: usize = 1;
pub const TP_Z: usize = 2;
pub const TP_OPP_X: usize = 3;
pub const TP_OPP_Y: usize = 4;
pub const TP_OPP_Z: usize = 5;
pub const TP_MID_XY: usize = 6;
pub const TP_MID_YZ: usize = 7;
pub const TP_MID_ZX: usize = 8;
pub const TP_OPP_MID_XY: usize = 9;
pub const TP_OPP_MID_YZ: usize = 10;
pub const TP_OPP_MID_ZX: usize = 11;

const DEPTH_MAP_POINTS: usize = 12;

const DEFAULT_TARGET: f32 = 0.03;

// Repeatability-test sample limits.
const MAX_REPEATABILITY_SAMPLES: usize = 30;
const SANE_PROBE_STEPS: i32 = 50_000;
// The eccentricity excursion always uses this radius, independent of
// the configured probe radius.
const ECCENTRICITY_RADIUS: f32 = 10.0;

// Heuristic loop bounds.
const HEURISTIC_ITERATIONS: usize = 10;
const HEURISTIC_TRIAL_STEP: f32 = 0.05;
const HEURISTIC_WORSEN_TOLERANCE: f32 = 0.03;

/// Triforce scoring: six depths (towers and tower midpoints) measured
/// against the bed-center trigger height.
pub struct TriforceReport {
    pub depth: [f32; 6],
    pub score: [f32; 6],
    pub score_avg: f32,
    pub score_ism: f32,
    pub phtt: f32,
}

#[derive(Clone, Copy)]
enum TrialScalar {
    DeltaRadius,
    ArmLength,
    RadiusOffset(usize),
}

impl TrialScalar {
    fn name(self) -> &'static str {
        match self {
            TrialScalar::DeltaRadius => "delta radius",
            TrialScalar::ArmLength => "arm length",
            TrialScalar::RadiusOffset(0) => "X radius offset",
            TrialScalar::RadiusOffset(1) => "Y radius offset",
            TrialScalar::RadiusOffset(_) => "Z radius offset",
        }
    }

    fn get(self, facade: &GeometryFacade, machine: &Machine) -> Option<f32> {
        match self {
            TrialScalar::DeltaRadius => facade.get_delta_radius(machine),
            TrialScalar::ArmLength => facade.get_arm_length(machine),
            TrialScalar::RadiusOffset(i) => {
                facade.get_tower_radius_offsets(machine).map(|o| o[i])
            }
        }
    }

    fn set(self, facade: &mut GeometryFacade, machine: &Machine, value: f32) -> bool {
        match self {
            TrialScalar::DeltaRadius => facade.set_delta_radius(machine, value),
            TrialScalar::ArmLength => facade.set_arm_length(machine, value),
            TrialScalar::RadiusOffset(i) => {
                let Some(mut offsets) = facade.get_tower_radius_offsets(machine) else {
                    return false;
                };
                offsets[i] = value;
                facade.set_tower_radius_offsets(machine, offsets)
            }
        }
    }
}

pub struct ComprehensiveDeltaStrategy {
    pub session: ProbeSession,
    pub facade: GeometryFacade,
    test_point: [[f32; 2]; DEPTH_MAP_POINTS],
    cur_depth_map: [i32; DEPTH_MAP_POINTS],
    last_depth_map: [i32; DEPTH_MAP_POINTS],
}

impl ComprehensiveDeltaStrategy {
    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        let session = ProbeSession::from_config(config)?;
        let test_point = Self::build_test_points(session.probe_radius);
        Ok(ComprehensiveDeltaStrategy {
            session,
            facade: GeometryFacade::new(),
            test_point,
            cur_depth_map: [0; DEPTH_MAP_POINTS],
            last_depth_map: [0; DEPTH_MAP_POINTS],
        })
    }

    /// Twelve test points on a circle of `probe_radius`: the three
    /// tower bases, their diametric opposites, the midpoints between
    /// adjacent towers and the midpoints between the opposite points.
    fn build_test_points(probe_radius: f32) -> [[f32; 2]; DEPTH_MAP_POINTS] {
        // Towers sit 60 degrees off the centerline.
        let x_deg = 0.866_025f32;
        let y_deg = 0.5f32;
        let r = probe_radius;

        let mut tp = [[0.0f32; 2]; DEPTH_MAP_POINTS];
        tp[TP_X] = [-x_deg * r, -y_deg * r];
        tp[TP_Y] = [x_deg * r, -y_deg * r];
        tp[TP_Z] = [0.0, r];

        // Mirrored about the origin.
        tp[TP_OPP_X] = [x_deg * r, y_deg * r];
        tp[TP_OPP_Y] = [-x_deg * r, y_deg * r];
        tp[TP_OPP_Z] = [0.0, -r];

        tp[TP_MID_XY] = midpoint(tp[TP_X], tp[TP_Y]);
        tp[TP_MID_YZ] = midpoint(tp[TP_Y], tp[TP_Z]);
        tp[TP_MID_ZX] = midpoint(tp[TP_Z], tp[TP_X]);

        // Halfway between the origin and the opposite-tower points.
        tp[TP_OPP_MID_XY] = [tp[TP_MID_XY][0], -tp[TP_MID_XY][1]];
        tp[TP_OPP_MID_ZX] = [tp[TP_OPP_X][0] / 2.0, -tp[TP_OPP_X][1] / 2.0];
        tp[TP_OPP_MID_YZ] = [tp[TP_OPP_Y][0] / 2.0, -tp[TP_OPP_Y][1] / 2.0];

        tp
    }

    pub fn last_depth_map(&self) -> &[i32; DEPTH_MAP_POINTS] {
        &self.last_depth_map
    }

    pub fn current_depth_map(&self) -> &[i32; DEPTH_MAP_POINTS] {
        &self.cur_depth_map
    }

    fn save_depth_map(&mut self) {
        self.last_depth_map = self.cur_depth_map;
        self.cur_depth_map = [0; DEPTH_MAP_POINTS];
    }

    /// Run the endstop and delta-radius calibrations if any geometry
    /// scalar changed since the last time they both succeeded.
    pub fn require_clean_geometry(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<(), ProbeError> {
        if !self.facade.is_dirty() {
            return Ok(());
        }
        machine.stream.respond(
            "[EC] Geometry has been changed since last endstop/delta radius calibration - redoing.",
        );
        calibrate_delta_endstops(
            &mut self.session,
            &mut self.facade,
            zprobe,
            machine,
            DEFAULT_TARGET,
            false,
        )?;
        calibrate_delta_radius(
            &mut self.session,
            &mut self.facade,
            zprobe,
            machine,
            DEFAULT_TARGET,
        )?;
        self.facade.clear_dirty();
        Ok(())
    }

    pub fn print_geometry(&self, machine: &Machine) {
        let Some((arm_length, arm_radius)) = self.facade.get_basic_geometry(machine) else {
            return;
        };
        let rad = self.facade.get_tower_radius_offsets(machine).unwrap_or_default();
        let ang = self.facade.get_tower_angle_offsets(machine).unwrap_or_default();
        let arm = self.facade.get_tower_arm_offsets(machine).unwrap_or_default();

        machine.stream.respond(format!(
            "[PG] Basic - Arm length: {:.3}  Radius: {:.3}",
            arm_length, arm_radius
        ));
        machine.stream.respond(format!(
            "[PG] Radius offsets (ABC): {{{:.3}, {:.3}, {:.3}}}",
            rad[0], rad[1], rad[2]
        ));
        machine.stream.respond(format!(
            "[PG]  Angle offsets (DEF): {{{:.3}, {:.3}, {:.3}}}",
            ang[0], ang[1], ang[2]
        ));
        machine.stream.respond(format!(
            "[PG]    Arm offsets (TUV): {{{:.3}, {:.3}, {:.3}}}",
            arm[0], arm[1], arm[2]
        ));
    }

    // -- repeatability test (G29) -------------------------------------------

    pub fn measure_probe_repeatability(
        &mut self,
        gcmd: &GCodeCommand,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<(), ProbeError> {
        let mut n_samples = 10usize;
        let mut want_acceleration = self.session.probe_acceleration;
        let mut do_eccentricity_test = true;

        if let Some(a) = gcmd.get_value('A') {
            if (1.0..=1000.0).contains(&a) {
                want_acceleration = a;
            }
        }
        if let Some(b) = gcmd.get_value('B') {
            zprobe.set_debounce_count(b.max(0.0) as u32);
        }
        if let Some(d) = gcmd.get_value('D') {
            zprobe.set_decelerate_on_trigger(d != 0.0, machine);
        }
        if gcmd.has_letter('E') {
            do_eccentricity_test = false;
        }
        if let Some(p) = gcmd.get_value('P') {
            self.session.probe_smoothing = (p as i32).clamp(1, 10) as u32;
        }
        if let Some(u) = gcmd.get_value('U') {
            zprobe.set_fast_feedrate(u);
        }
        if let Some(v) = gcmd.get_value('V') {
            zprobe.set_slow_feedrate(v);
        }
        if let Some(s) = gcmd.get_value('S') {
            n_samples = s as usize;
            if n_samples > MAX_REPEATABILITY_SAMPLES {
                machine.stream.respond("[RT] Too many samples!");
                return Ok(());
            }
        }

        machine.stream.respond(format!(
            "[RT]    Repeatability test: {} samples (S)",
            n_samples
        ));
        machine.stream.respond(format!(
            "[RT]      Acceleration (A): {:.1}",
            want_acceleration
        ));
        machine.stream.respond(format!(
            "[RT]    Debounce count (B): {}",
            zprobe.debounce_count()
        ));
        machine.stream.respond(format!(
            "[RT]  Smooth decel (D0|D1): {}",
            zprobe.decelerate_on_trigger()
        ));
        machine.stream.respond(format!(
            "[RT] Eccentricity test (E): {}",
            if do_eccentricity_test { "on" } else { "off" }
        ));
        machine.stream.respond(format!(
            "[RT]   Probe smoothing (P): {}",
            self.session.probe_smoothing
        ));
        machine.stream.respond(format!(
            "[RT]             Feedrates: Fast (U) = {:.3}, Slow (V) = {:.3}",
            zprobe.fast_feedrate(),
            zprobe.slow_feedrate()
        ));
        machine.stream.respond(format!(
            "[RT] 1 step = {:.5} mm.",
            zprobe.zsteps_to_mm(machine, 1.0)
        ));

        self.session.prepare_to_probe(zprobe, machine)?;

        self.session.save_acceleration(machine);
        self.session.set_acceleration(machine, want_acceleration);
        let result =
            self.repeatability_samples(zprobe, machine, n_samples, do_eccentricity_test);
        self.session.restore_acceleration(machine);
        result
    }

    fn repeatability_samples(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
        n_samples: usize,
        do_eccentricity_test: bool,
    ) -> Result<(), ProbeError> {
        let x_deg = 0.866_025f32;
        let y_deg = 0.5f32;
        let radius = ECCENTRICITY_RADIUS;

        let mut samples: Vec<f32> = Vec::with_capacity(n_samples);
        while samples.len() < n_samples {
            if do_eccentricity_test {
                // Shake the effector toward each tower; a loose probe
                // or sloppy joints will show up in the spread.
                let fast = zprobe.fast_feedrate();
                machine.absolute_machine_move(
                    Some(-x_deg * radius),
                    Some(-y_deg * radius),
                    None,
                    fast,
                );
                machine.absolute_machine_move(Some(0.0), Some(0.0), None, fast);
                machine.absolute_machine_move(
                    Some(x_deg * radius),
                    Some(-y_deg * radius),
                    None,
                    fast,
                );
                machine.absolute_machine_move(Some(0.0), Some(0.0), None, fast);
                machine.absolute_machine_move(Some(0.0), Some(radius), None, fast);
                machine.absolute_machine_move(Some(0.0), Some(0.0), None, fast);
            }

            let steps = self.session.do_probe_at(zprobe, machine, 0.0, 0.0)?;
            machine.stream.respond(format!(
                "[RT] Test {} of {}: Measured {} steps ({:.3} mm)",
                samples.len() + 1,
                n_samples,
                steps,
                zprobe.zsteps_to_mm(machine, steps as f32)
            ));

            if steps > SANE_PROBE_STEPS {
                machine
                    .stream
                    .respond("[RT] Discarding result and trying again. Check probe_height.");
                continue;
            }
            samples.push(steps as f32);
        }

        let mu = mean(&samples);
        let sigma = std_dev(&samples);
        let min = samples.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = samples.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let rep = zprobe.zsteps_to_mm(machine, max - min);

        machine.stream.respond("[RT] Stats:");
        machine.stream.respond(format!(
            "[RT]   range: {} steps ({:.4} mm)",
            (max - min) as i32,
            rep
        ));
        machine.stream.respond(format!(
            "[RT]      mu: {:.3} steps ({:.3} mm)",
            mu,
            zprobe.zsteps_to_mm(machine, mu)
        ));
        machine.stream.respond(format!(
            "[RT]   sigma: {:.3} steps ({:.3} mm)",
            sigma,
            zprobe.zsteps_to_mm(machine, sigma)
        ));
        machine.stream.respond(format!(
            "[RT] Repeatability: {:.4} (add a little to be sure)",
            rep
        ));

        let verdict = if rep < 0.015 {
            "very good!"
        } else if rep <= 0.03 {
            "average."
        } else if rep <= 0.04 {
            "borderline."
        } else {
            "UNUSABLE! Please fix!"
        };
        machine.stream.respond(format!("[RT] This score is {}", verdict));

        Ok(())
    }

    // -- depth map (G31) -----------------------------------------------------

    pub fn depth_map_print_surface(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
        display_results: bool,
    ) -> Result<(), ProbeError> {
        self.require_clean_geometry(zprobe, machine)?;
        self.print_geometry(machine);

        self.session.prepare_to_probe(zprobe, machine)?;
        let origin_steps = self.session.do_probe_at(zprobe, machine, 0.0, 0.0)?;
        machine.stream.respond(format!(
            "[DM] Steps to bed surface at center: {} ({:.3} mm)",
            origin_steps,
            zprobe.zsteps_to_mm(machine, origin_steps as f32)
        ));

        let mut best = f32::INFINITY;
        let mut worst = 0.0f32;
        for i in 0..DEPTH_MAP_POINTS {
            let steps =
                self.session
                    .do_probe_at(zprobe, machine, self.test_point[i][0], self.test_point[i][1])?;
            self.cur_depth_map[i] = origin_steps - steps;

            let deviation = zprobe.zsteps_to_mm(machine, self.cur_depth_map[i] as f32);
            if deviation.abs() < best.abs() {
                best = deviation;
            }
            if deviation.abs() > worst.abs() {
                worst = deviation;
            }
            if display_results && i % 3 == 2 {
                machine.stream.respond(format!(
                    "[DM]  {:.3}  {:.3}  {:.3}",
                    zprobe.zsteps_to_mm(machine, self.cur_depth_map[i - 2] as f32),
                    zprobe.zsteps_to_mm(machine, self.cur_depth_map[i - 1] as f32),
                    deviation
                ));
            }
        }

        machine.stream.respond(format!(
            "[DM] Deviation: Best = {:.3}, Worst = {:.3}",
            best, worst
        ));
        Ok(())
    }

    // -- triforce scoring ----------------------------------------------------

    /// Probe the towers and the midpoints between them, scoring each
    /// depth against the bed-center trigger height measured by
    /// `find_bed_center_height`.
    pub fn probe_triforce(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<TriforceReport, ProbeError> {
        let order = [TP_Z, TP_MID_ZX, TP_X, TP_MID_XY, TP_Y, TP_MID_YZ];

        self.session.prepare_to_probe(zprobe, machine)?;
        let phtt = self.session.mm_probe_height_to_trigger;

        let mut depth = [0.0f32; 6];
        let mut score = [0.0f32; 6];
        for (i, &tp) in order.iter().enumerate() {
            machine.stream.respond(format!(
                "[PT] Probing point {} at <{:.3}, {:.3}>.",
                i, self.test_point[tp][0], self.test_point[tp][1]
            ));
            let steps = self.session.do_probe_at(
                zprobe,
                machine,
                self.test_point[tp][0],
                self.test_point[tp][1],
            )?;
            depth[i] = zprobe.zsteps_to_mm(machine, steps as f32);
            score[i] = (depth[i] - phtt).abs();
        }

        let score_avg = mean(&score);
        let score_ism = intersextile_mean(&score);

        machine.stream.respond(format!(
            "[TQ] Probe height to trigger at bed center (PHTT) - this is the target depth: {:.3}",
            phtt
        ));
        machine.stream.respond(format!(
            "[TQ]        Current depths: {{{:.3}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3}}}",
            depth[0], depth[1], depth[2], depth[3], depth[4], depth[5]
        ));
        machine.stream.respond(format!(
            "[TQ]  Score (lower=better): avg={:.3}, ISM={:.3}",
            score_avg, score_ism
        ));

        Ok(TriforceReport {
            depth,
            score,
            score_avg,
            score_ism,
            phtt,
        })
    }

    // -- segmented line probe ------------------------------------------------

    /// Probe `segments + 1` points along the line from `first` to
    /// `second`, each with two perpendicular companions one segment
    /// length off-line. Reports depths relative to bed center.
    pub fn depth_map_segmented_line(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
        first: [f32; 2],
        second: [f32; 2],
        segments: u8,
    ) -> Result<Vec<[i32; 3]>, ProbeError> {
        let vec = vector_unit([second[0] - first[0], second[1] - first[1], 0.0]);
        let dist = distance(first, second);
        let seg_dist = dist / segments as f32;

        self.require_clean_geometry(zprobe, machine)?;
        self.session.prepare_to_probe(zprobe, machine)?;

        let origin_steps = self.session.do_probe_at(zprobe, machine, 0.0, 0.0)?;
        machine.stream.respond(format!(
            "[SL] Steps from probe_from_height to bed surface at center: {}",
            origin_steps
        ));

        let mut depths = Vec::with_capacity(segments as usize + 1);
        for i in 0..=segments as i32 {
            let tp = [
                first[0] + vec[0] * seg_dist * i as f32,
                first[1] + vec[1] * seg_dist * i as f32,
            ];
            let ahead = [
                first[0] + vec[0] * seg_dist * (i + 1) as f32,
                first[1] + vec[1] * seg_dist * (i + 1) as f32,
            ];
            let mut tp_pos = ahead;
            let mut tp_neg = ahead;
            rotate2d(&mut tp_pos, tp, 90.0);
            rotate2d(&mut tp_neg, tp, -90.0);

            let pos_steps = self.session.do_probe_at(zprobe, machine, tp_pos[0], tp_pos[1])?;
            let center_steps = self.session.do_probe_at(zprobe, machine, tp[0], tp[1])?;
            let neg_steps = self.session.do_probe_at(zprobe, machine, tp_neg[0], tp_neg[1])?;
            depths.push([pos_steps, center_steps, neg_steps]);

            machine.stream.respond(format!(
                "[SL] Segment {} endpoint at <{:.3}, {:.3}> - depths: pos={:.3}, center={:.3}, neg={:.3}",
                i,
                tp[0],
                tp[1],
                zprobe.zsteps_to_mm(machine, (origin_steps - pos_steps) as f32),
                zprobe.zsteps_to_mm(machine, (origin_steps - center_steps) as f32),
                zprobe.zsteps_to_mm(machine, (origin_steps - neg_steps) as f32),
            ));
        }

        Ok(depths)
    }

    // -- heuristic calibration loop (G31) ------------------------------------

    /// Greedy bounded improvement over the adjustable geometry scalars:
    /// each iteration perturbs one scalar, re-scores the triforce, and
    /// keeps the change only when both the average and intersextile
    /// mean improve without any single point worsening past tolerance.
    pub fn heuristic_calibration(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<(), ProbeError> {
        self.depth_map_print_surface(zprobe, machine, true)?;
        self.save_depth_map();

        let mut best = self.probe_triforce(zprobe, machine)?;

        let scalars = [
            TrialScalar::DeltaRadius,
            TrialScalar::ArmLength,
            TrialScalar::RadiusOffset(0),
            TrialScalar::RadiusOffset(1),
            TrialScalar::RadiusOffset(2),
        ];

        let mut dry_runs = 0usize;
        for iteration in 0..HEURISTIC_ITERATIONS {
            let scalar = scalars[iteration % scalars.len()];
            let Some(original) = scalar.get(&self.facade, machine) else {
                continue;
            };

            let mut improved = false;
            for direction in [1.0f32, -1.0] {
                let candidate = original + direction * HEURISTIC_TRIAL_STEP;
                if !scalar.set(&mut self.facade, machine, candidate) {
                    break;
                }

                let report = self.probe_triforce(zprobe, machine)?;
                let worsened = report
                    .score
                    .iter()
                    .zip(best.score.iter())
                    .any(|(new, old)| new - old > HEURISTIC_WORSEN_TOLERANCE);

                if report.score_avg < best.score_avg
                    && report.score_ism <= best.score_ism
                    && !worsened
                {
                    log::debug!(
                        "heuristic kept {} at {:.4}",
                        scalar.name(),
                        candidate
                    );
                    machine.stream.respond(format!(
                        "[TQ] Keeping {} at {:.4} (avg {:.3} -> {:.3})",
                        scalar.name(),
                        candidate,
                        best.score_avg,
                        report.score_avg
                    ));
                    best = report;
                    improved = true;
                    break;
                }

                scalar.set(&mut self.facade, machine, original);
            }

            if improved {
                dry_runs = 0;
            } else {
                dry_runs += 1;
                if dry_runs >= scalars.len() {
                    break;
                }
            }
        }

        machine.stream.respond(format!(
            "[TQ] Heuristic calibration done: avg={:.3}, ISM={:.3}",
            best.score_avg, best.score_ism
        ));
        Ok(())
    }

    // -- standard calibration compound (G32) ---------------------------------

    fn handle_g32(
        &mut self,
        gcmd: &GCodeCommand,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<(), ProbeError> {
        machine.wait_for_empty_queue();

        let target = gcmd.get_value('I').unwrap_or(DEFAULT_TARGET);
        if let Some(radius) = gcmd.get_value('J') {
            self.session.probe_radius = radius;
        }
        let keep = gcmd.has_letter('K');
        let skip_endstops = gcmd.has_letter('R');
        let skip_radius = gcmd.has_letter('E');

        if !skip_endstops {
            match calibrate_delta_endstops(
                &mut self.session,
                &mut self.facade,
                zprobe,
                machine,
                target,
                keep,
            ) {
                Ok(()) => {}
                Err(ProbeError::Halted) => return Err(ProbeError::Halted),
                Err(_) => {
                    machine
                        .stream
                        .respond("Calibration failed to complete, probe not triggered");
                    return Ok(());
                }
            }
        }

        if !skip_radius {
            match calibrate_delta_radius(
                &mut self.session,
                &mut self.facade,
                zprobe,
                machine,
                target,
            ) {
                Ok(()) => {}
                Err(ProbeError::Halted) => return Err(ProbeError::Halted),
                Err(_) => {
                    machine
                        .stream
                        .respond("Calibration failed to complete, probe not triggered");
                    return Ok(());
                }
            }
        }

        if !skip_endstops && !skip_radius {
            self.facade.clear_dirty();
        }

        machine
            .stream
            .respond("Basic calibration complete, save settings with M500");
        Ok(())
    }
}

impl LevelingStrategy for ComprehensiveDeltaStrategy {
    fn handle_gcode(
        &mut self,
        gcmd: &GCodeCommand,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<bool, ProbeError> {
        if gcmd.letter == 'G' {
            match gcmd.number {
                29 => {
                    self.measure_probe_repeatability(gcmd, zprobe, machine)?;
                    return Ok(true);
                }
                31 => {
                    machine
                        .stream
                        .respond("Depth-mapping the bed. Please stand by...");
                    self.heuristic_calibration(zprobe, machine)?;
                    return Ok(true);
                }
                32 => {
                    self.handle_g32(gcmd, zprobe, machine)?;
                    return Ok(true);
                }
                _ => return Ok(false),
            }
        }

        if gcmd.is_m(665) {
            // Externally modified geometry invalidates the calibration;
            // gamma max (Z) alone does not.
            for letter in ['A', 'B', 'C', 'D', 'E', 'F', 'T', 'U', 'V', 'L', 'R'] {
                if gcmd.has_letter(letter) {
                    self.facade.mark_dirty();
                    break;
                }
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(radius: f32) -> ComprehensiveDeltaStrategy {
        let mut config = Configfile::new();
        config.set("comprehensive-delta", "probe_radius", &radius.to_string());
        ComprehensiveDeltaStrategy::from_config(&config).unwrap()
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_test_points_tower_geometry() {
        let s = strategy(100.0);
        let tp = s.test_point;

        // Towers on the circle, opposites mirrored about the origin.
        for i in [TP_X, TP_Y, TP_Z] {
            let r = (tp[i][0].powi(2) + tp[i][1].powi(2)).sqrt();
            assert!(approx(r, 100.0), "tower {} radius {}", i, r);
        }
        assert!(approx(tp[TP_OPP_X][0], -tp[TP_X][0]) && approx(tp[TP_OPP_X][1], -tp[TP_X][1]));
        assert!(approx(tp[TP_OPP_Y][0], -tp[TP_Y][0]) && approx(tp[TP_OPP_Y][1], -tp[TP_Y][1]));
        assert!(approx(tp[TP_OPP_Z][0], -tp[TP_Z][0]) && approx(tp[TP_OPP_Z][1], -tp[TP_Z][1]));
    }

    #[test]
    fn test_test_points_midpoints() {
        let s = strategy(100.0);
        let tp = s.test_point;

        let mid = midpoint(tp[TP_X], tp[TP_Y]);
        assert!(approx(tp[TP_MID_XY][0], mid[0]) && approx(tp[TP_MID_XY][1], mid[1]));

        let mid = midpoint(tp[TP_Z], tp[TP_X]);
        assert!(approx(tp[TP_MID_ZX][0], mid[0]) && approx(tp[TP_MID_ZX][1], mid[1]));

        // Opposite midpoints sit halfway between origin and the
        // opposite-tower points.
        assert!(approx(tp[TP_OPP_MID_ZX][0], tp[TP_OPP_X][0] / 2.0));
        assert!(approx(tp[TP_OPP_MID_ZX][1], -tp[TP_OPP_X][1] / 2.0));
    }

    #[test]
    fn test_save_depth_map_swaps_buffers() {
        let mut s = strategy(100.0);
        s.cur_depth_map = [7; DEPTH_MAP_POINTS];
        s.save_depth_map();
        assert_eq!(s.last_depth_map, [7; DEPTH_MAP_POINTS]);
        assert_eq!(s.cur_depth_map, [0; DEPTH_MAP_POINTS]);
    }

    #[test]
    fn test_points_scale_with_radius() {
        let s = strategy(50.0);
        let tp = s.test_point;
        assert!(approx(tp[TP_Z][1], 50.0));
        assert!(approx(tp[TP_X][0], -0.866_025 * 50.0));
    }
}
