// src/extras/session.rs
// Shared probing session for the calibration strategies: probe radius
// and offsets, smoothing, the lazily measured bed-center height, and
// the averaged probe-at-point primitive everything else is built on.

use crate::configfile::{ConfigError, Configfile};
use crate::machine::Machine;
use crate::planner::MotionPlanner;
use crate::probe::{ProbeError, ZProbe};

/// Sentinel for "not measured yet"; `find_bed_center_height` runs once
/// per session to replace it.
const PROBE_FROM_HEIGHT_UNSET: f32 = -1.0;

pub struct ProbeSession {
    pub probe_radius: f32,
    pub probe_smoothing: u32,
    pub probe_acceleration: f32,
    pub probe_offset_x: f32,
    pub probe_offset_y: f32,
    pub probe_offset_z: f32,
    pub probe_ignore_bed_temp: bool,

    pub probe_from_height: f32,
    pub mm_probe_height_to_trigger: f32,
    pub bed_height: f32,

    saved_acceleration: f32,
}

impl ProbeSession {
    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        let section = "comprehensive-delta";

        // The probe radius may also live in the zprobe section on older
        // configs.
        let mut probe_radius = config.getfloat(section, "probe_radius", Some(-1.0), None, None)?;
        if probe_radius < 0.0 {
            probe_radius = config.getfloat("zprobe", "probe_radius", Some(100.0), None, None)?;
        }

        let probe_smoothing =
            config.getint(section, "probe_smoothing", Some(1), None, None)?.clamp(1, 10) as u32;

        Ok(ProbeSession {
            probe_radius,
            probe_smoothing,
            probe_acceleration: config.getfloat(section, "probe_acceleration", Some(200.0), Some(0.0), None)?,
            probe_offset_x: config.getfloat(section, "probe_offset_x", Some(0.0), None, None)?,
            probe_offset_y: config.getfloat(section, "probe_offset_y", Some(0.0), None, None)?,
            probe_offset_z: config.getfloat(section, "probe_offset_z", Some(0.0), None, None)?,
            probe_ignore_bed_temp: config.getboolean(section, "probe_ignore_bed_temp", Some(true))?,
            probe_from_height: PROBE_FROM_HEIGHT_UNSET,
            mm_probe_height_to_trigger: 0.0,
            bed_height: 0.0,
            saved_acceleration: 0.0,
        })
    }

    /// Reset the per-session measurements, forcing a fresh
    /// `find_bed_center_height` on the next probing operation.
    pub fn reset_bed_height(&mut self) {
        self.probe_from_height = PROBE_FROM_HEIGHT_UNSET;
        self.mm_probe_height_to_trigger = 0.0;
    }

    /// X/Y positions of the three tower-base test points on a circle of
    /// `radius`: X tower rear-left, Y tower rear-right, Z tower front.
    pub fn tower_coordinates(radius: f32) -> [[f32; 2]; 3] {
        let px = 0.866_025 * radius; // sin 60
        let py = 0.5 * radius; // cos 60
        [[-px, -py], [px, -py], [0.0, radius]]
    }

    pub fn save_acceleration(&mut self, machine: &Machine) {
        self.saved_acceleration = machine.planner.lock().acceleration();
    }

    pub fn set_acceleration(&self, machine: &Machine, accel: f32) {
        machine.planner.lock().set_acceleration(accel);
    }

    pub fn restore_acceleration(&self, machine: &Machine) {
        self.set_acceleration(machine, self.saved_acceleration);
        machine.stream.respond(format!(
            "[RA] Acceleration restored to {:.3}",
            self.saved_acceleration
        ));
    }

    /// Measure the bed height at center and remember where probing
    /// starts from. Refreshes `probe_from_height`,
    /// `mm_probe_height_to_trigger` and `bed_height`, then pushes the
    /// new homed height to the endstops.
    pub fn find_bed_center_height(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<(), ProbeError> {
        machine.home();

        if self.probe_from_height < 0.0 {
            machine
                .stream
                .respond("[BH] First time through, so I need to determine the probe-from height.");
            let cycle = zprobe.run_probe_fast(machine)?;
            if !cycle.triggered || cycle.overrun {
                return Err(ProbeError::NotTriggered);
            }
            let measured = zprobe.zsteps_to_mm(machine, cycle.steps_at_trigger as f32);
            self.probe_from_height = measured - zprobe.probe_height();
            machine.home();
        }

        // Descend to the probing elevation, then apply the XY probe
        // offset as a second move: the top of a delta's build envelope
        // is domed, so combining them could ask for an unreachable
        // position.
        machine.relative_move(0.0, 0.0, -self.probe_from_height, zprobe.fast_feedrate());
        machine.relative_move(self.probe_offset_x, self.probe_offset_y, 0.0, zprobe.fast_feedrate());

        let cycle = zprobe.run_probe_slow(machine)?;
        if !cycle.triggered || cycle.overrun {
            return Err(ProbeError::NotTriggered);
        }
        self.mm_probe_height_to_trigger =
            zprobe.zsteps_to_mm(machine, cycle.steps_at_trigger as f32);

        self.bed_height =
            self.probe_from_height + self.mm_probe_height_to_trigger + self.probe_offset_z;
        machine.stream.respond(format!(
            "[BH] probe_from_height ({:.3}) + mm_PHTT ({:.3}) + probe_offset_z ({:.3})",
            self.probe_from_height, self.mm_probe_height_to_trigger, self.probe_offset_z
        ));
        machine
            .stream
            .respond(format!("[BH] Bed height set to {:.3}", self.bed_height));

        machine.endstops.lock().set_gamma_max(self.bed_height);
        Ok(())
    }

    /// Home and descend to the probing elevation, measuring the bed
    /// height first if this session has not done so yet.
    pub fn prepare_to_probe(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<(), ProbeError> {
        if self.probe_from_height < 0.0 {
            self.find_bed_center_height(zprobe, machine)?;
        }

        machine.home();
        machine.relative_move(0.0, 0.0, -self.probe_from_height, zprobe.fast_feedrate());
        Ok(())
    }

    /// Probe at an XY position (probe offset applied), averaging
    /// `probe_smoothing` cycles. Reports steps from the probing
    /// elevation to the trigger.
    pub fn do_probe_at(
        &mut self,
        zprobe: &mut ZProbe,
        machine: &Machine,
        x: f32,
        y: f32,
    ) -> Result<i32, ProbeError> {
        machine.absolute_machine_move(
            Some(x + self.probe_offset_x),
            Some(y + self.probe_offset_y),
            None,
            zprobe.fast_feedrate(),
        );

        let mut total: i64 = 0;
        for _ in 0..self.probe_smoothing {
            let cycle = zprobe.run_probe_slow(machine)?;
            if cycle.overrun {
                return Err(ProbeError::Overrun);
            }
            if !cycle.triggered {
                machine.stream.respond(format!(
                    "do_probe_at({:.3}, {:.3}) - probe was not triggered.",
                    x + self.probe_offset_x,
                    y + self.probe_offset_y
                ));
                return Err(ProbeError::NotTriggered);
            }

            let return_steps = if zprobe.decelerate_on_trigger() {
                cycle.steps_at_decel_end
            } else {
                cycle.steps_at_trigger
            };
            zprobe.return_probe(machine, return_steps, false);

            total += cycle.steps_at_trigger as i64;
        }

        let steps = (total / self.probe_smoothing as i64) as i32;

        // A tiny count means the probe started nearly touching the
        // surface; the configuration is wrong.
        if steps < 100 {
            machine.stream.respond(format!(
                "do_probe_at(): steps={} - this is much too small - is probe_height high enough?",
                steps
            ));
            return Err(ProbeError::Config(format!(
                "probe step count {} below sanity floor",
                steps
            )));
        }

        Ok(steps)
    }
}
