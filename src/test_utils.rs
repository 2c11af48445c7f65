// src/test_utils.rs
// Deterministic simulated machine for exercising probe cycles and
// calibration end-to-end. One reactor tick advances the world by
// 1/ticks_per_second: the acceleration tick adjusts actuator rates,
// then the simulation steps every moving actuator.
//
// The bed responds linearly to the controller's state: endstop trims
// tilt the effector plane through barycentric tower weights, and a
// believed-delta-radius change shifts the center depth relative to the
// rim. That is a first-order model of the real kinematics, which is
// exactly the regime the calibration loops operate in.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::configfile::Configfile;
use crate::endstops::Endstops;
use crate::extras::session::ProbeSession;
use crate::gcode::OutputStream;
use crate::kinematics::delta::LinearDeltaSolution;
use crate::kinematics::{ArmOptions, ArmSolution};
use crate::machine::Machine;
use crate::planner::MotionPlanner;
use crate::probe::PinSource;
use crate::reactor::Reactor;
use crate::stepper::{Actuator, ActuatorHandle};
use crate::Z_AXIS;

// -- simulated actuator ------------------------------------------------------

pub struct SimActuator {
    steps_per_mm: f32,
    rate: u32,
    moving: bool,
    dir: bool,
    target_steps: u32,
    stepped: u32,
    step_accum: f32,
    position: f32,
    force_finished: bool,
}

impl SimActuator {
    pub fn new(steps_per_mm: f32) -> Self {
        SimActuator {
            steps_per_mm,
            rate: 0,
            moving: false,
            dir: false,
            target_steps: 0,
            stepped: 0,
            step_accum: 0.0,
            position: 0.0,
            force_finished: false,
        }
    }

    /// Advance one tick at the current rate. Returns the signed number
    /// of steps taken, negative for the bed-ward direction.
    fn advance(&mut self, ticks_per_second: f32) -> i32 {
        if !self.moving || self.rate == 0 {
            return 0;
        }
        self.step_accum += self.rate as f32 / ticks_per_second;
        let mut n = self.step_accum as u32;
        if n == 0 {
            return 0;
        }
        self.step_accum -= n as f32;

        let remaining = self.target_steps - self.stepped;
        if n >= remaining {
            n = remaining;
            self.moving = false;
        }
        self.stepped += n;

        let delta_mm = n as f32 / self.steps_per_mm;
        if self.dir {
            self.position -= delta_mm;
            -(n as i32)
        } else {
            self.position += delta_mm;
            n as i32
        }
    }

    fn take_force_finished(&mut self) -> bool {
        std::mem::take(&mut self.force_finished)
    }

    fn reset_for_home(&mut self, position: f32) {
        self.moving = false;
        self.rate = 0;
        self.stepped = 0;
        self.step_accum = 0.0;
        self.force_finished = false;
        self.position = position;
    }
}

impl Actuator for SimActuator {
    fn move_steps(&mut self, dir: bool, steps: u32) {
        if steps == 0 {
            // Hard stop; the step counter stays readable.
            self.moving = false;
            return;
        }
        self.dir = dir;
        self.target_steps = steps;
        self.stepped = 0;
        self.step_accum = 0.0;
        self.moving = true;
    }

    fn set_speed(&mut self, steps_per_second: u32) {
        self.rate = steps_per_second;
    }

    fn get_steps_per_second(&self) -> u32 {
        self.rate
    }

    fn is_moving(&self) -> bool {
        self.moving
    }

    fn get_stepped(&self) -> u32 {
        self.stepped
    }

    fn get_current_position(&self) -> f32 {
        self.position
    }

    fn set_current_position(&mut self, mm: f32) {
        self.position = mm;
    }

    fn steps_per_mm(&self) -> f32 {
        self.steps_per_mm
    }

    fn enable(&mut self) {}

    fn force_finish_move(&mut self) {
        self.moving = false;
        self.force_finished = true;
    }

    fn set_moved_last_block(&mut self, _moved: bool) {}
}

// -- bed model ---------------------------------------------------------------

/// Bed-shape deviations in millimeters, negative meaning deeper
/// (farther from the nozzle).
#[derive(Debug, Clone, Default)]
pub struct BedModel {
    /// Deviation at each tower base; the surface is the plane through
    /// the three.
    pub tower_dev: [f32; 3],
    /// Additional deviation at the center, fading to zero at the probe
    /// radius (a bowl for negative values, a dome for positive).
    pub bowl: f32,
}

impl BedModel {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn tilted_tower(tower: usize, dev_mm: f32) -> Self {
        let mut bed = Self::default();
        bed.tower_dev[tower] = dev_mm;
        bed
    }

    pub fn bowl(center_dev_mm: f32) -> Self {
        BedModel {
            tower_dev: [0.0; 3],
            bowl: center_dev_mm,
        }
    }

    fn contact_z(&self, x: f32, y: f32, probe_radius: f32) -> f32 {
        let w = tower_weights(x, y, probe_radius);
        let plane =
            w[0] * self.tower_dev[0] + w[1] * self.tower_dev[1] + w[2] * self.tower_dev[2];
        let r_sq = (x * x + y * y) / (probe_radius * probe_radius);
        plane + self.bowl * (1.0 - r_sq).max(0.0)
    }
}

/// Affine interpolation weights over the tower triangle: 1 at the
/// matching tower base, 0 at the other two, 1/3 at center.
fn tower_weights(x: f32, y: f32, probe_radius: f32) -> [f32; 3] {
    let towers = ProbeSession::tower_coordinates(probe_radius);
    let r_sq = probe_radius * probe_radius;
    let mut w = [0.0f32; 3];
    for i in 0..3 {
        w[i] = 1.0 / 3.0 + 2.0 * (x * towers[i][0] + y * towers[i][1]) / (3.0 * r_sq);
    }
    w
}

// -- simulation core ---------------------------------------------------------

pub struct SimCore {
    /// Physical effector position (the believed position can drift
    /// from this during raw probe moves, like on the real machine).
    pub actual: [f32; 3],
    pub bed: BedModel,
    pub probe_radius: f32,
    /// Measured change in rim depth per millimeter of believed
    /// delta-radius change (first-order response).
    pub radius_response: f32,
    pub initial_delta_radius: f32,
    pub steps_per_mm: f32,
    noise_steps: Vec<i32>,
    noise_index: usize,
    current_noise: i32,
}

impl SimCore {
    fn roll_noise(&mut self) {
        if self.noise_steps.is_empty() {
            return;
        }
        self.current_noise = self.noise_steps[self.noise_index % self.noise_steps.len()];
        self.noise_index += 1;
    }

    /// The believed-Z elevation at which the probe reads active at
    /// (x, y), given the current trims and believed delta radius.
    ///
    /// A radius error leaves the center alone and bends the rim: a
    /// larger believed radius drops the rim relative to the center,
    /// which is the distortion the delta-radius pass corrects.
    fn trigger_z(&self, x: f32, y: f32, trim: [f32; 3], delta_radius: f32) -> f32 {
        let w = tower_weights(x, y, self.probe_radius);
        let contact = self.bed.contact_z(x, y, self.probe_radius);
        let r_sq = (x * x + y * y) / (self.probe_radius * self.probe_radius);
        contact - (w[0] * trim[0] + w[1] * trim[1] + w[2] * trim[2])
            - (delta_radius - self.initial_delta_radius) * self.radius_response * r_sq
            + self.current_noise as f32 / self.steps_per_mm
    }
}

// -- simulated planner -------------------------------------------------------

pub struct SimPlanner {
    core: Arc<Mutex<SimCore>>,
    actuators: [Arc<Mutex<SimActuator>>; 3],
    arm_solution: Arc<Mutex<dyn ArmSolution>>,
    endstops: Arc<Mutex<Endstops>>,
    reactor: Arc<Reactor>,
    acceleration: f32,
    z_acceleration: Option<f32>,
}

impl SimPlanner {
    fn sync_carriages(&self, pos: [f32; 3]) {
        let actuator_mm = self.arm_solution.lock().inverse(&pos);
        for (i, actuator) in self.actuators.iter().enumerate() {
            actuator.lock().set_current_position(actuator_mm[i]);
        }
    }

    fn execute_move(&self, machine: &Machine, from: [f32; 3], to: [f32; 3], feedrate: f32) {
        // The planner believes every move completes; a cut-short move
        // is corrected afterwards from the actuator positions. Raw
        // probe cycles shift the physical frame away from the believed
        // one, so planner motion applies the commanded delta to the
        // physical position rather than the believed coordinates.
        machine.set_axis_position(to);

        let delta = [to[0] - from[0], to[1] - from[1], to[2] - from[2]];
        let dist = (delta[0].powi(2) + delta[1].powi(2) + delta[2].powi(2)).sqrt();
        let start = self.core.lock().actual;

        if dist < 1e-6 {
            self.sync_carriages(start);
            self.core.lock().roll_noise();
            return;
        }

        let ticks = ((dist / feedrate) * self.reactor.ticks_per_second()).ceil().max(1.0) as u32;
        for t in 1..=ticks {
            let frac = t as f32 / ticks as f32;
            let pos = [
                start[0] + delta[0] * frac,
                start[1] + delta[1] * frac,
                start[2] + delta[2] * frac,
            ];
            self.core.lock().actual = pos;
            self.sync_carriages(pos);

            self.reactor.yield_idle();

            let mut interrupted = false;
            for actuator in &self.actuators {
                interrupted |= actuator.lock().take_force_finished();
            }
            if interrupted {
                return;
            }
        }
        self.core.lock().roll_noise();
    }
}

impl MotionPlanner for SimPlanner {
    fn wait_for_empty_queue(&mut self, _machine: &Machine) {}

    fn relative_move(&mut self, machine: &Machine, dx: f32, dy: f32, dz: f32, feedrate: f32) {
        let from = machine.get_axis_position();
        let to = [from[0] + dx, from[1] + dy, from[2] + dz];
        self.execute_move(machine, from, to, feedrate);
    }

    fn absolute_machine_move(
        &mut self,
        machine: &Machine,
        x: Option<f32>,
        y: Option<f32>,
        z: Option<f32>,
        feedrate: f32,
    ) {
        let from = machine.get_axis_position();
        let to = [x.unwrap_or(from[0]), y.unwrap_or(from[1]), z.unwrap_or(from[2])];
        self.execute_move(machine, from, to, feedrate);
    }

    fn home(&mut self, machine: &Machine) {
        let gamma_max = self.endstops.lock().gamma_max();
        let pos = [0.0, 0.0, gamma_max];
        machine.set_axis_position(pos);

        let actuator_mm = self.arm_solution.lock().inverse(&pos);
        for (i, actuator) in self.actuators.iter().enumerate() {
            actuator.lock().reset_for_home(actuator_mm[i]);
        }

        let mut core = self.core.lock();
        core.actual = pos;
        core.roll_noise();
    }

    fn acceleration(&self) -> f32 {
        self.acceleration
    }

    fn z_acceleration(&self) -> f32 {
        self.z_acceleration.unwrap_or(self.acceleration)
    }

    fn set_acceleration(&mut self, accel: f32) {
        self.acceleration = accel;
    }
}

// -- harness -----------------------------------------------------------------

pub struct SimOptions {
    pub steps_per_mm: f32,
    pub gamma_max: f32,
    pub probe_radius: f32,
    pub arm_length: f32,
    pub delta_radius: f32,
    pub bed: BedModel,
    /// Per-cycle trigger jitter in steps, cycled in order.
    pub noise_steps: Vec<i32>,
    pub radius_response: f32,
    pub acceleration: f32,
    pub z_acceleration: Option<f32>,
    pub ticks_per_second: f32,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            steps_per_mm: 80.0,
            gamma_max: 300.0,
            probe_radius: 100.0,
            arm_length: 250.0,
            delta_radius: 124.0,
            bed: BedModel::flat(),
            noise_steps: Vec::new(),
            radius_response: 0.4,
            acceleration: 200.0,
            z_acceleration: None,
            ticks_per_second: 1000.0,
        }
    }
}

pub struct SimMachine {
    pub machine: Arc<Machine>,
    pub core: Arc<Mutex<SimCore>>,
    pub actuators: [Arc<Mutex<SimActuator>>; 3],
    pub pin_source: PinSource,
}

impl SimMachine {
    pub fn build(options: SimOptions) -> Self {
        let reactor = Arc::new(Reactor::new(options.ticks_per_second));

        let arm_solution: Arc<Mutex<LinearDeltaSolution>> = Arc::new(Mutex::new(
            LinearDeltaSolution::new(options.arm_length, options.delta_radius),
        ));

        let mut endstop_config = Configfile::new();
        endstop_config.set("endstops", "gamma_max", &options.gamma_max.to_string());
        endstop_config.set("endstops", "delta_homing", "true");
        let endstops = Arc::new(Mutex::new(
            Endstops::from_config(&endstop_config).expect("endstop config"),
        ));

        let actuators: [Arc<Mutex<SimActuator>>; 3] = [
            Arc::new(Mutex::new(SimActuator::new(options.steps_per_mm))),
            Arc::new(Mutex::new(SimActuator::new(options.steps_per_mm))),
            Arc::new(Mutex::new(SimActuator::new(options.steps_per_mm))),
        ];

        let core = Arc::new(Mutex::new(SimCore {
            actual: [0.0; 3],
            bed: options.bed,
            probe_radius: options.probe_radius,
            radius_response: options.radius_response,
            initial_delta_radius: options.delta_radius,
            steps_per_mm: options.steps_per_mm,
            noise_steps: options.noise_steps,
            noise_index: 0,
            current_noise: 0,
        }));

        let arm_solution_dyn: Arc<Mutex<dyn ArmSolution>> = arm_solution.clone();
        let planner = Arc::new(Mutex::new(SimPlanner {
            core: core.clone(),
            actuators: actuators.clone(),
            arm_solution: arm_solution_dyn.clone(),
            endstops: endstops.clone(),
            reactor: reactor.clone(),
            acceleration: options.acceleration,
            z_acceleration: options.z_acceleration,
        }));

        let actuator_handles: [ActuatorHandle; 3] = [
            actuators[0].clone(),
            actuators[1].clone(),
            actuators[2].clone(),
        ];

        let machine = Arc::new(Machine::new(
            reactor.clone(),
            planner,
            actuator_handles,
            arm_solution_dyn,
            endstops.clone(),
            Arc::new(OutputStream::new()),
        ));

        // World advance: one simulation step per reactor tick, after
        // the registered tick handlers have adjusted rates.
        {
            let core = core.clone();
            let actuators = actuators.clone();
            let steps_per_mm = options.steps_per_mm;
            let ticks_per_second = options.ticks_per_second;
            reactor.register_idle_handler(Box::new(move || {
                let mut z_steps = 0i32;
                for (i, actuator) in actuators.iter().enumerate() {
                    let moved = actuator.lock().advance(ticks_per_second);
                    if i == Z_AXIS {
                        z_steps = moved;
                    }
                }
                if z_steps != 0 {
                    core.lock().actual[2] += z_steps as f32 / steps_per_mm;
                }
            }));
        }

        let pin_source: PinSource = {
            let core = core.clone();
            let endstops = endstops.clone();
            let arm_solution = arm_solution.clone();
            Arc::new(move || {
                let core = core.lock();
                let trim = endstops.lock().get_trim();
                let mut options = ArmOptions::new();
                arm_solution.lock().get_options(&mut options);
                let delta_radius = options[&'R'];
                let trigger =
                    core.trigger_z(core.actual[0], core.actual[1], trim, delta_radius);
                core.actual[2] <= trigger
            })
        };

        // Start from a homed machine so the pin reads inactive.
        machine.home();

        SimMachine {
            machine,
            core,
            actuators,
            pin_source,
        }
    }
}

/// Configuration matching a simulated machine built from `options`,
/// ready for `ZProbe::from_config` / `ProbeDispatch::from_config`.
pub fn sim_probe_config(options: &SimOptions) -> Configfile {
    let mut config = Configfile::new();
    config.set("zprobe", "enable", "true");
    config.set("zprobe", "probe_pin", "probe");
    config.set("zprobe", "slow_feedrate", "5");
    config.set("zprobe", "fast_feedrate", "100");
    config.set("zprobe", "probe_height", "5");
    config.set("endstops", "gamma_max", &options.gamma_max.to_string());
    config.set("endstops", "delta_homing", "true");
    config.set(
        "comprehensive-delta",
        "probe_radius",
        &options.probe_radius.to_string(),
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tower_weights_properties() {
        let towers = ProbeSession::tower_coordinates(100.0);
        for (i, t) in towers.iter().enumerate() {
            let w = tower_weights(t[0], t[1], 100.0);
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (w[j] - expect).abs() < 1e-3,
                    "weight[{}] at tower {} = {}",
                    j,
                    i,
                    w[j]
                );
            }
        }

        let w = tower_weights(0.0, 0.0, 100.0);
        for j in 0..3 {
            assert!((w[j] - 1.0 / 3.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_bed_model_shapes() {
        let flat = BedModel::flat();
        assert_eq!(flat.contact_z(0.0, 0.0, 100.0), 0.0);

        let tilted = BedModel::tilted_tower(0, -1.0);
        let towers = ProbeSession::tower_coordinates(100.0);
        assert!((tilted.contact_z(towers[0][0], towers[0][1], 100.0) + 1.0).abs() < 1e-3);
        assert!(tilted.contact_z(towers[1][0], towers[1][1], 100.0).abs() < 1e-3);
        // Center sees a third of the tilt.
        assert!((tilted.contact_z(0.0, 0.0, 100.0) + 1.0 / 3.0).abs() < 1e-3);

        let bowl = BedModel::bowl(-0.5);
        assert!((bowl.contact_z(0.0, 0.0, 100.0) + 0.5).abs() < 1e-4);
        assert!(bowl.contact_z(towers[2][0], towers[2][1], 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_sim_actuator_advance_and_stop() {
        let mut actuator = SimActuator::new(80.0);
        actuator.move_steps(true, 100);
        actuator.set_speed(400);

        // 0.4 steps per tick at 1 kHz.
        let mut total = 0;
        for _ in 0..10 {
            total += -actuator.advance(1000.0);
        }
        assert_eq!(total, 4);
        assert_eq!(actuator.get_stepped(), 4);
        assert!((actuator.get_current_position() + 4.0 / 80.0).abs() < 1e-6);

        // Exhausting the commanded steps stops the move.
        for _ in 0..1000 {
            actuator.advance(1000.0);
        }
        assert!(!actuator.is_moving());
        assert_eq!(actuator.get_stepped(), 100);
    }

    #[test]
    fn test_sim_machine_homes_to_gamma_max() {
        let options = SimOptions::default();
        let sim = SimMachine::build(options);
        let pos = sim.machine.get_axis_position();
        assert_eq!(pos, [0.0, 0.0, 300.0]);
        assert_eq!(sim.core.lock().actual, [0.0, 0.0, 300.0]);
        // Probe inactive well above the bed.
        assert!(!(sim.pin_source)());
    }

    #[test]
    fn test_trigger_responds_to_trim_and_radius() {
        let options = SimOptions::default();
        let sim = SimMachine::build(options);
        let towers = ProbeSession::tower_coordinates(100.0);

        {
            let core = sim.core.lock();
            // Flat bed, no trim: triggers at 0.
            assert!(core.trigger_z(0.0, 0.0, [0.0; 3], 124.0).abs() < 1e-4);
            // Negative X trim sets that carriage lower, so the probe
            // reads the surface a full millimeter earlier there.
            let tz = core.trigger_z(towers[0][0], towers[0][1], [-1.0, 0.0, 0.0], 124.0);
            assert!((tz - 1.0).abs() < 1e-3);
            // Raising the believed radius leaves the center alone but
            // sinks the rim.
            assert!(core.trigger_z(0.0, 0.0, [0.0; 3], 125.0).abs() < 1e-4);
            let tz = core.trigger_z(towers[2][0], towers[2][1], [0.0; 3], 125.0);
            assert!((tz + 0.4).abs() < 1e-3);
        }
    }
}
