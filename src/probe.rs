// src/probe.rs
// Z-probe module: the probe cycle state machine, the acceleration tick
// that ramps the raw probing moves, and the G-code surface for single
// probes (G30), straight probes (G38.2/G38.3) and probe settings
// (M119/M500/M503/M670).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::configfile::{ConfigError, Configfile};
use crate::gcode::GCodeCommand;
use crate::kinematics::ArmSolution;
use crate::machine::Machine;
use crate::planner::MotionPlanner;
use crate::stepper::{Actuator, ActuatorHandle};
use crate::{X_AXIS, Y_AXIS, Z_AXIS};

// Pulse generators refuse rates below this floor; the decel ramp snaps
// to zero once it decays under it.
const MIN_ACTUATOR_RATE: f32 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeError {
    NotConnected,
    AlreadyTriggered,
    NotTriggered,
    Overrun,
    Halted,
    ProbeFail,
    Config(String),
    Nonconvergence(&'static str),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::NotConnected => write!(f, "ZProbe not connected"),
            ProbeError::AlreadyTriggered => write!(f, "ZProbe triggered before move"),
            ProbeError::NotTriggered => write!(f, "ZProbe not triggered"),
            ProbeError::Overrun => write!(f, "ZProbe decel runout exceeded"),
            ProbeError::Halted => write!(f, "Halted"),
            ProbeError::ProbeFail => write!(f, "Probe fail"),
            ProbeError::Config(msg) => write!(f, "{}", msg),
            ProbeError::Nonconvergence(what) => write!(f, "{} did not converge", what),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<ConfigError> for ProbeError {
    fn from(e: ConfigError) -> Self {
        ProbeError::Config(e.to_string())
    }
}

/// Outcome of a single probe cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeCycle {
    pub triggered: bool,
    /// Z-actuator step count at the moment the debounce threshold was
    /// reached, before any stopping motion.
    pub steps_at_trigger: i32,
    /// Step count once the decel ramp (or hard stop) finished.
    pub steps_at_decel_end: i32,
    pub overrun: bool,
}

pub type PinSource = Arc<dyn Fn() -> bool + Send + Sync>;

/// Debounced, invertible probe input.
pub struct ProbePin {
    source: Option<PinSource>,
    inverting: bool,
}

impl ProbePin {
    pub fn new(pin_name: &str, source: Option<PinSource>) -> Self {
        let mut name = pin_name.trim();
        let mut inverting = false;
        if let Some(stripped) = name.strip_prefix('!') {
            inverting = true;
            name = stripped;
        }
        let source = if name.is_empty() || name == "nc" { None } else { source };
        ProbePin { source, inverting }
    }

    pub fn connected(&self) -> bool {
        self.source.is_some()
    }

    pub fn get(&self) -> bool {
        match &self.source {
            Some(source) => source() != self.inverting,
            None => false,
        }
    }

    pub fn is_inverting(&self) -> bool {
        self.inverting
    }

    pub fn set_inverting(&mut self, inverting: bool) {
        self.inverting = inverting;
    }
}

/// Motion state shared between the probing foreground and the
/// acceleration tick. The foreground writes the mode fields
/// (`running`, `accelerating`, `current_feedrate`, `runout_steps`)
/// before a cycle; the tick writes the outcome fields
/// (`has_exceeded_runout`, `steps_at_decel_end`) which the foreground
/// reads only after all actuators have stopped.
#[derive(Debug, Default)]
pub struct ProbeTickState {
    pub running: bool,
    pub accelerating: bool,
    /// Target rate in steps/second for the Z actuator.
    pub current_feedrate: f32,
    pub runout_steps: u32,
    pub steps_at_decel_end: u32,
    pub has_exceeded_runout: bool,
}

/// Periodic callback ramping the raw probe move toward the target rate,
/// or down to zero after a trigger. Runs in interrupt context on
/// hardware: no allocation, no logging, nothing but the rate math.
pub struct AccelTick {
    state: Arc<Mutex<ProbeTickState>>,
    actuators: [ActuatorHandle; 3],
    planner: Arc<Mutex<dyn MotionPlanner>>,
    is_delta: bool,
    ticks_per_second: f32,
}

impl AccelTick {
    pub fn new(
        state: Arc<Mutex<ProbeTickState>>,
        actuators: [ActuatorHandle; 3],
        planner: Arc<Mutex<dyn MotionPlanner>>,
        is_delta: bool,
        ticks_per_second: f32,
    ) -> Self {
        AccelTick {
            state,
            actuators,
            planner,
            is_delta,
            ticks_per_second,
        }
    }

    pub fn on_tick(&mut self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }

        let (accel, z_accel) = {
            let planner = self.planner.lock();
            (planner.acceleration(), planner.z_acceleration())
        };

        if self.actuators[Z_AXIS].lock().is_moving() {
            self.process_axis(&mut state, Z_AXIS, z_accel);
        }

        if self.is_delta {
            for axis in [X_AXIS, Y_AXIS] {
                if self.actuators[axis].lock().is_moving() {
                    self.process_axis(&mut state, axis, accel);
                }
            }
        }
    }

    fn process_axis(&self, state: &mut ProbeTickState, axis: usize, accel: f32) {
        if state.accelerating {
            self.accelerate(state, axis, accel);
        } else {
            self.decelerate(state, axis, accel);
        }
    }

    fn accelerate(&self, state: &ProbeTickState, axis: usize, accel: f32) {
        let mut actuator = self.actuators[axis].lock();
        let target_rate = state.current_feedrate.floor() as u32;
        let mut rate = actuator.get_steps_per_second();

        if rate < target_rate {
            let increase = ((accel / self.ticks_per_second) * actuator.steps_per_mm()).floor() as u32;
            rate = target_rate.min(rate + increase);
        }
        if rate > target_rate {
            rate = target_rate;
        }
        actuator.set_speed(rate);
    }

    fn decelerate(&self, state: &mut ProbeTickState, axis: usize, accel: f32) {
        let mut actuator = self.actuators[axis].lock();

        // Runout guard first: past the permitted overshoot the move is
        // terminated immediately, smooth stop or not.
        let stepped = actuator.get_stepped();
        if stepped >= state.runout_steps {
            actuator.set_speed(0);
            actuator.move_steps(false, 0);
            state.steps_at_decel_end = stepped;
            state.has_exceeded_runout = true;
            return;
        }

        let mut rate = actuator.get_steps_per_second() as f32;
        if rate > 0.0 {
            rate -= (accel / self.ticks_per_second) * actuator.steps_per_mm();
            // The pulse generator clamps anything under its minimum
            // rate, so a ramp ending there would coast forever.
            if rate <= MIN_ACTUATOR_RATE + 0.1 {
                rate = 0.0;
            }
        }

        if rate <= 0.0 {
            actuator.set_speed(0);
            actuator.move_steps(false, 0);
            state.steps_at_decel_end = stepped;
        } else {
            actuator.set_speed(rate as u32);
        }
    }
}

/// Armed state of the straight-probe (G38) detector, polled from the
/// slow ticker.
#[derive(Debug, Default)]
pub struct StraightProbeState {
    pub probing: bool,
    pub probe_detected: bool,
}

pub struct ZProbe {
    pin: Arc<Mutex<ProbePin>>,
    debounce_count: u32,
    slow_feedrate: f32,
    fast_feedrate: f32,
    return_feedrate: f32,
    probe_height: f32,
    max_z: f32,
    reverse_z: bool,
    invert_override: bool,
    decelerate_on_trigger: bool,
    decelerate_runout: f32,
    is_delta: bool,
    is_rdelta: bool,
    tick_state: Arc<Mutex<ProbeTickState>>,
    straight: Arc<Mutex<StraightProbeState>>,
}

impl ZProbe {
    pub fn from_config(config: &Configfile, pin_source: Option<PinSource>) -> Result<Self, ConfigError> {
        let pin_name = config.get("zprobe", "probe_pin", Some("nc"))?;
        let decelerate_runout =
            config.getfloat("zprobe", "decelerate_runout", Some(-1.0), None, None)?;
        let mut decelerate_on_trigger =
            config.getboolean("zprobe", "decelerate_on_trigger", Some(false))?;
        if decelerate_on_trigger && decelerate_runout < 0.0 {
            log::warn!("decelerate_on_trigger requested without decelerate_runout; disabled");
            decelerate_on_trigger = false;
        }

        Ok(ZProbe {
            pin: Arc::new(Mutex::new(ProbePin::new(&pin_name, pin_source))),
            debounce_count: config.getint("zprobe", "debounce_count", Some(0), Some(0), None)? as u32,
            slow_feedrate: config.getfloat("zprobe", "slow_feedrate", Some(5.0), Some(0.0), None)?,
            fast_feedrate: config.getfloat("zprobe", "fast_feedrate", Some(100.0), Some(0.0), None)?,
            return_feedrate: config.getfloat("zprobe", "return_feedrate", Some(0.0), Some(0.0), None)?,
            probe_height: config.getfloat("zprobe", "probe_height", Some(5.0), None, None)?,
            max_z: config.getfloat("endstops", "gamma_max", Some(500.0), Some(0.0), None)?,
            reverse_z: config.getboolean("zprobe", "reverse_z", Some(false))?,
            invert_override: false,
            decelerate_on_trigger,
            decelerate_runout,
            is_delta: config.getboolean("endstops", "delta_homing", Some(false))?,
            is_rdelta: config.getboolean("endstops", "rdelta_homing", Some(false))?,
            tick_state: Arc::new(Mutex::new(ProbeTickState {
                accelerating: true,
                ..Default::default()
            })),
            straight: Arc::new(Mutex::new(StraightProbeState::default())),
        })
    }

    /// Register the acceleration tick and the straight-probe detector
    /// with the machine's reactor. Call once at module load.
    pub fn register_handlers(&self, machine: &Machine) {
        let mut tick = AccelTick::new(
            self.tick_state.clone(),
            machine.actuators.clone(),
            machine.planner.clone(),
            self.is_delta || self.is_rdelta,
            machine.reactor.ticks_per_second(),
        );
        machine.reactor.register_tick_handler(Box::new(move || tick.on_tick()));

        let straight = self.straight.clone();
        let pin = self.pin.clone();
        let actuators = machine.actuators.clone();
        machine.reactor.register_tick_handler(Box::new(move || {
            let mut state = straight.lock();
            if !state.probing || state.probe_detected {
                return;
            }
            if pin.lock().get() {
                state.probe_detected = true;
                for actuator in &actuators {
                    actuator.lock().force_finish_move();
                }
            }
        }));
    }

    // -- accessors used by the calibration strategies ------------------------

    pub fn pin_connected(&self) -> bool {
        self.pin.lock().connected()
    }

    pub fn pin_state(&self) -> bool {
        self.pin.lock().get()
    }

    pub fn slow_feedrate(&self) -> f32 {
        self.slow_feedrate
    }

    pub fn set_slow_feedrate(&mut self, feedrate: f32) {
        self.slow_feedrate = feedrate;
    }

    pub fn fast_feedrate(&self) -> f32 {
        self.fast_feedrate
    }

    pub fn set_fast_feedrate(&mut self, feedrate: f32) {
        self.fast_feedrate = feedrate;
    }

    pub fn probe_height(&self) -> f32 {
        self.probe_height
    }

    pub fn max_z(&self) -> f32 {
        self.max_z
    }

    pub fn debounce_count(&self) -> u32 {
        self.debounce_count
    }

    pub fn set_debounce_count(&mut self, count: u32) {
        self.debounce_count = count;
    }

    pub fn decelerate_on_trigger(&self) -> bool {
        self.decelerate_on_trigger
    }

    /// Enable or disable on-trigger deceleration. Enabling is refused
    /// while `decelerate_runout` is unset.
    pub fn set_decelerate_on_trigger(&mut self, on: bool, machine: &Machine) {
        if on && self.decelerate_runout < 0.0 {
            machine
                .stream
                .respond("Can't enable on-trigger deceleration because decelerate_runout isn't set.");
            self.decelerate_on_trigger = false;
        } else {
            self.decelerate_on_trigger = on;
        }
    }

    pub fn is_delta(&self) -> bool {
        self.is_delta || self.is_rdelta
    }

    pub fn is_rdelta(&self) -> bool {
        self.is_rdelta
    }

    pub fn z_steps_per_mm(&self, machine: &Machine) -> f32 {
        machine.actuators[Z_AXIS].lock().steps_per_mm()
    }

    pub fn zsteps_to_mm(&self, machine: &Machine, steps: f32) -> f32 {
        steps / self.z_steps_per_mm(machine)
    }

    // -- probe cycles --------------------------------------------------------

    /// Drive the probe toward the surface at `feedrate_mm_s` for at
    /// most `max_dist_mm` (negative means twice `max_z`), watching the
    /// pin with debounce. All three actuators move on delta geometry.
    pub fn run_probe(
        &mut self,
        machine: &Machine,
        feedrate_mm_s: f32,
        max_dist_mm: f32,
        reverse: bool,
    ) -> Result<ProbeCycle, ProbeError> {
        {
            let pin = self.pin.lock();
            if !pin.connected() {
                return Err(ProbeError::NotConnected);
            }
            if pin.get() {
                return Err(ProbeError::AlreadyTriggered);
            }
        }

        let z_steps_per_mm = self.z_steps_per_mm(machine);
        {
            let mut state = self.tick_state.lock();
            state.has_exceeded_runout = false;
            state.steps_at_decel_end = 0;
            state.accelerating = true;
            state.current_feedrate = feedrate_mm_s * z_steps_per_mm;
        }

        let max_dist = if max_dist_mm < 0.0 { self.max_z * 2.0 } else { max_dist_mm };
        let dir = !self.reverse_z != reverse; // xor

        // Raw moves, not planner blocks.
        for handle in &machine.actuators {
            let mut actuator = handle.lock();
            actuator.set_moved_last_block(false);
            actuator.enable();
        }

        {
            let mut z = machine.actuators[Z_AXIS].lock();
            let steps = (max_dist * z.steps_per_mm()) as u32;
            z.move_steps(dir, steps);
        }
        if self.is_delta() {
            for axis in [X_AXIS, Y_AXIS] {
                let mut actuator = machine.actuators[axis].lock();
                let steps = (max_dist * actuator.steps_per_mm()) as u32;
                actuator.move_steps(dir, steps);
            }
        }

        self.tick_state.lock().running = true;
        let result = self.wait_for_probe(machine, z_steps_per_mm);
        self.tick_state.lock().running = false;

        result
    }

    pub fn run_probe_fast(&mut self, machine: &Machine) -> Result<ProbeCycle, ProbeError> {
        let feedrate = self.fast_feedrate;
        self.run_probe(machine, feedrate, -1.0, false)
    }

    pub fn run_probe_slow(&mut self, machine: &Machine) -> Result<ProbeCycle, ProbeError> {
        let feedrate = self.slow_feedrate;
        self.run_probe(machine, feedrate, -1.0, false)
    }

    fn wait_for_probe(
        &mut self,
        machine: &Machine,
        z_steps_per_mm: f32,
    ) -> Result<ProbeCycle, ProbeError> {
        let delta = self.is_delta();
        let mut debounce = 0u32;

        loop {
            machine.reactor.yield_idle();
            if machine.reactor.is_halted() {
                return Err(ProbeError::Halted);
            }

            let z_moving = machine.actuators[Z_AXIS].lock().is_moving();
            let xy_moving = machine.actuators[X_AXIS].lock().is_moving()
                || machine.actuators[Y_AXIS].lock().is_moving();

            // All moves exhausted without contact.
            if !z_moving && (!delta || !xy_moving) {
                return Ok(ProbeCycle::default());
            }

            if !self.pin.lock().get() {
                debounce = 0;
                continue;
            }
            if debounce < self.debounce_count {
                debounce += 1;
                continue;
            }

            // Trigger confirmed: capture the step count before any
            // stopping motion alters it.
            let steps = machine.actuators[Z_AXIS].lock().get_stepped();

            if self.decelerate_on_trigger {
                {
                    let mut state = self.tick_state.lock();
                    state.runout_steps =
                        steps + (self.decelerate_runout * z_steps_per_mm) as u32;
                    state.accelerating = false;
                }

                // Let the tick handler ramp the actuators down.
                loop {
                    let still_moving = machine.actuators[Z_AXIS].lock().is_moving()
                        || (delta
                            && (machine.actuators[X_AXIS].lock().is_moving()
                                || machine.actuators[Y_AXIS].lock().is_moving()));
                    if !still_moving {
                        break;
                    }
                    machine.reactor.yield_idle();
                    if machine.reactor.is_halted() {
                        return Err(ProbeError::Halted);
                    }
                }

                let (overrun, decel_end) = {
                    let mut state = self.tick_state.lock();
                    state.accelerating = true;
                    (state.has_exceeded_runout, state.steps_at_decel_end)
                };
                let decel_end = if decel_end > 0 {
                    decel_end
                } else {
                    machine.actuators[Z_AXIS].lock().get_stepped()
                };

                if overrun {
                    machine.stream.respond("[!!] Runout protection was triggered!");
                    machine.stream.respond(
                        "[!!] Check zprobe.decelerate_runout in config and/or try higher accel/lower speed.",
                    );
                }

                return Ok(ProbeCycle {
                    triggered: true,
                    steps_at_trigger: steps as i32,
                    steps_at_decel_end: decel_end as i32,
                    overrun,
                });
            }

            // Hard stop every moving actuator.
            for handle in &machine.actuators {
                let mut actuator = handle.lock();
                if actuator.is_moving() {
                    actuator.move_steps(false, 0);
                }
            }

            return Ok(ProbeCycle {
                triggered: true,
                steps_at_trigger: steps as i32,
                steps_at_decel_end: steps as i32,
                overrun: false,
            });
        }
    }

    /// Move the probe back up by `steps` through the planner. The
    /// return direction mirrors the probing direction: a reversed probe
    /// returns downward.
    pub fn return_probe(&mut self, machine: &Machine, steps: i32, reverse: bool) {
        self.tick_state.lock().accelerating = true;

        let mut feedrate = if self.return_feedrate > 0.0 {
            self.return_feedrate
        } else {
            self.slow_feedrate * 2.0
        };
        if feedrate > self.fast_feedrate {
            feedrate = self.fast_feedrate;
        }

        let mut dz = self.zsteps_to_mm(machine, steps as f32);
        if reverse {
            dz = -dz;
        }
        machine.relative_move(0.0, 0.0, dz, feedrate);

        self.tick_state.lock().running = false;
        for handle in &machine.actuators {
            handle.lock().move_steps(false, 0);
        }
    }

    /// Coordinated XY move, one slow probe cycle, return. Reports the
    /// step count at trigger.
    pub fn probe_at(&mut self, machine: &Machine, x: f32, y: f32) -> Result<i32, ProbeError> {
        machine.absolute_machine_move(Some(x), Some(y), None, self.fast_feedrate);

        let cycle = self.run_probe_slow(machine)?;
        if cycle.overrun {
            return Err(ProbeError::Overrun);
        }
        if !cycle.triggered {
            return Err(ProbeError::NotTriggered);
        }

        let return_steps = if self.decelerate_on_trigger {
            cycle.steps_at_decel_end
        } else {
            cycle.steps_at_trigger
        };
        self.return_probe(machine, return_steps, false);

        Ok(cycle.steps_at_trigger)
    }

    pub fn probe_distance(&mut self, machine: &Machine, x: f32, y: f32) -> Result<f32, ProbeError> {
        let steps = self.probe_at(machine, x, y)?;
        Ok(self.zsteps_to_mm(machine, steps as f32))
    }

    // -- G-code handlers -----------------------------------------------------

    /// G30: single probe. `R` probes in reverse, `F` sets the feedrate
    /// in mm/min, `Z` resets the Z axis to the given value after a
    /// successful probe instead of returning.
    pub fn handle_g30(&mut self, gcmd: &GCodeCommand, machine: &Machine) -> Result<(), ProbeError> {
        machine.wait_for_empty_queue();

        let reverse = gcmd.get_value('R').map_or(false, |v| v != 0.0);
        let feedrate = gcmd
            .get_value('F')
            .map(|f| f / 60.0)
            .unwrap_or(self.slow_feedrate);

        let cycle = self.run_probe(machine, feedrate, -1.0, reverse)?;

        let actuator_pos = |axis: usize| machine.actuators[axis].lock().get_current_position();

        if cycle.triggered && !cycle.overrun {
            let steps = cycle.steps_at_trigger;
            machine.stream.respond(format!(
                "Z:{:.4} C:{}",
                self.zsteps_to_mm(machine, steps as f32),
                steps
            ));
            machine.set_last_probe_position((
                actuator_pos(X_AXIS),
                actuator_pos(Y_AXIS),
                actuator_pos(Z_AXIS),
                1,
            ));

            match gcmd.get_value('Z') {
                Some(z_override) if !self.is_rdelta => {
                    // Leave the probe where it is; redefine Z there.
                    machine.reset_axis_position_single(Z_AXIS, z_override);
                }
                _ => {
                    let return_steps = if self.decelerate_on_trigger {
                        cycle.steps_at_decel_end
                    } else {
                        cycle.steps_at_trigger
                    };
                    self.return_probe(machine, return_steps, reverse);
                }
            }
        } else {
            machine.stream.respond("ZProbe not triggered");
            machine.set_last_probe_position((
                actuator_pos(X_AXIS),
                actuator_pos(Y_AXIS),
                actuator_pos(Z_AXIS),
                0,
            ));
        }

        Ok(())
    }

    /// G38.2/G38.3: straight probe along a single axis using planned
    /// motion; an asynchronous detector stops the machine on contact.
    pub fn handle_g38(&mut self, gcmd: &GCodeCommand, machine: &Machine) -> Result<(), ProbeError> {
        match gcmd.subcode {
            Some(2) | Some(3) => {}
            _ => {
                machine.stream.respond("error:Only G38.2 and G38.3 are supported");
                return Ok(());
            }
        }

        {
            let pin = self.pin.lock();
            if !pin.connected() {
                machine.stream.respond("error:ZProbe not connected.");
                return Ok(());
            }
            if pin.get() {
                machine.stream.respond("error:ZProbe triggered before move, aborting command.");
                return Ok(());
            }
        }

        machine.wait_for_empty_queue();

        // Compensation must not bend a straight probe; always restored.
        let saved_transform = machine.take_compensation_transform();

        let result = if gcmd.has_letter('X') {
            self.probe_xyz(gcmd, machine, X_AXIS)
        } else if gcmd.has_letter('Y') {
            self.probe_xyz(gcmd, machine, Y_AXIS)
        } else if gcmd.has_letter('Z') {
            self.probe_xyz(gcmd, machine, Z_AXIS)
        } else {
            machine.stream.respond("error:at least one of X Y or Z must be specified");
            Ok(())
        };

        machine.set_compensation_transform(saved_transform);
        result
    }

    fn probe_xyz(
        &mut self,
        gcmd: &GCodeCommand,
        machine: &Machine,
        axis: usize,
    ) -> Result<(), ProbeError> {
        {
            let mut state = self.straight.lock();
            state.probing = true;
            state.probe_detected = false;
        }
        machine.set_disable_segmentation(true);

        let feedrate = gcmd
            .get_value('F')
            .map(|f| f / 60.0)
            .unwrap_or(self.slow_feedrate);
        let distance = gcmd.get_value(['X', 'Y', 'Z'][axis]).unwrap_or(0.0);

        let mut delta = [0.0f32; 3];
        delta[axis] = distance;
        machine.relative_move(delta[0], delta[1], delta[2], feedrate);

        self.straight.lock().probing = false;
        machine.set_disable_segmentation(false);

        let actuator_mm = [
            machine.actuators[X_AXIS].lock().get_current_position(),
            machine.actuators[Y_AXIS].lock().get_current_position(),
            machine.actuators[Z_AXIS].lock().get_current_position(),
        ];
        let pos = machine.arm_solution.lock().forward(&actuator_mm);

        let probe_ok = self.straight.lock().probe_detected;
        machine.stream.respond(format!(
            "[PRB:{:.3},{:.3},{:.3}:{}]",
            pos[X_AXIS],
            pos[Y_AXIS],
            pos[Z_AXIS],
            probe_ok as u8
        ));
        machine.set_last_probe_position((pos[X_AXIS], pos[Y_AXIS], pos[Z_AXIS], probe_ok as u8));

        if !probe_ok && gcmd.subcode == Some(2) {
            machine.stream.respond("ALARM:Probe fail");
            machine.halt();
        } else if probe_ok {
            // The probe cut the move short; correct the believed
            // position to where the actuators really are.
            machine.reset_position_from_current_actuator_position();
        }

        Ok(())
    }

    /// M-code handling. Returns true when the command was consumed;
    /// M500/M503 print their settings but stay unconsumed so the
    /// calibration strategies see them too.
    pub fn handle_mcode(&mut self, gcmd: &GCodeCommand, machine: &Machine) -> bool {
        match gcmd.number {
            119 => {
                machine
                    .stream
                    .respond(format!("Probe: {}", self.pin_state() as u8));
                true
            }
            670 => {
                if let Some(v) = gcmd.get_value('S') {
                    self.slow_feedrate = v;
                }
                if let Some(v) = gcmd.get_value('K') {
                    self.fast_feedrate = v;
                }
                if let Some(v) = gcmd.get_value('R') {
                    self.return_feedrate = v;
                }
                if let Some(v) = gcmd.get_value('Z') {
                    self.max_z = v;
                }
                if let Some(v) = gcmd.get_value('H') {
                    self.probe_height = v;
                }
                if let Some(v) = gcmd.get_value('I') {
                    // Runtime toggle of the pin inversion.
                    self.invert_override = v != 0.0;
                    let mut pin = self.pin.lock();
                    let inverting = pin.is_inverting();
                    pin.set_inverting(inverting != self.invert_override);
                }
                true
            }
            500 | 503 => {
                machine.stream.respond(
                    ";Probe feedrates Slow/fast(K)/Return (mm/sec) max_z (mm) height (mm):",
                );
                machine.stream.respond(format!(
                    "M670 S{:.2} K{:.2} R{:.2} Z{:.2} H{:.2}",
                    self.slow_feedrate,
                    self.fast_feedrate,
                    self.return_feedrate,
                    self.max_z,
                    self.probe_height
                ));
                false
            }
            _ => false,
        }
    }

    pub fn get_status(&self) -> HashMap<String, serde_json::Value> {
        let mut status = HashMap::new();
        status.insert("pin_triggered".to_string(), serde_json::json!(self.pin_state()));
        status.insert("slow_feedrate".to_string(), serde_json::json!(self.slow_feedrate));
        status.insert("fast_feedrate".to_string(), serde_json::json!(self.fast_feedrate));
        status.insert("probe_height".to_string(), serde_json::json!(self.probe_height));
        status.insert("max_z".to_string(), serde_json::json!(self.max_z));
        status.insert(
            "decelerate_on_trigger".to_string(),
            serde_json::json!(self.decelerate_on_trigger),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endstops::Endstops;
    use crate::gcode::OutputStream;
    use crate::kinematics::delta::LinearDeltaSolution;
    use crate::reactor::Reactor;
    use crate::stepper::Actuator;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubActuator {
        rate: u32,
        moving: bool,
        stepped: u32,
        position: f32,
        steps_per_mm: f32,
    }

    impl StubActuator {
        fn new(steps_per_mm: f32) -> Self {
            StubActuator {
                rate: 0,
                moving: false,
                stepped: 0,
                position: 0.0,
                steps_per_mm,
            }
        }
    }

    impl Actuator for StubActuator {
        fn move_steps(&mut self, _dir: bool, steps: u32) {
            self.moving = steps > 0;
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
        }
        fn set_moved_last_block(&mut self, _moved: bool) {}
    }

    struct RecordingPlanner {
        moves: Vec<(f32, f32, f32, f32)>,
        accel: f32,
        z_accel: f32,
    }

    impl RecordingPlanner {
        fn new() -> Self {
            RecordingPlanner {
                moves: Vec::new(),
                accel: 200.0,
                z_accel: 200.0,
            }
        }
    }

    impl MotionPlanner for RecordingPlanner {
        fn wait_for_empty_queue(&mut self, _machine: &Machine) {}
        fn relative_move(&mut self, _machine: &Machine, dx: f32, dy: f32, dz: f32, feedrate: f32) {
            self.moves.push((dx, dy, dz, feedrate));
        }
        fn absolute_machine_move(
            &mut self,
            _machine: &Machine,
            _x: Option<f32>,
            _y: Option<f32>,
            _z: Option<f32>,
            _feedrate: f32,
        ) {
        }
        fn home(&mut self, _machine: &Machine) {}
        fn acceleration(&self) -> f32 {
            self.accel
        }
        fn z_acceleration(&self) -> f32 {
            self.z_accel
        }
        fn set_acceleration(&mut self, accel: f32) {
            self.accel = accel;
        }
    }

    fn stub_machine(planner: Arc<Mutex<RecordingPlanner>>) -> Machine {
        let actuators: [ActuatorHandle; 3] = [
            Arc::new(Mutex::new(StubActuator::new(80.0))),
            Arc::new(Mutex::new(StubActuator::new(80.0))),
            Arc::new(Mutex::new(StubActuator::new(80.0))),
        ];
        Machine::new(
            Arc::new(Reactor::new(1000.0)),
            planner,
            actuators,
            Arc::new(Mutex::new(LinearDeltaSolution::new(250.0, 124.0))),
            Arc::new(Mutex::new(Endstops::from_config(&Configfile::new()).unwrap())),
            Arc::new(OutputStream::new()),
        )
    }

    fn probe_config() -> Configfile {
        let mut config = Configfile::new();
        config.set("zprobe", "probe_pin", "probe");
        config.set("zprobe", "slow_feedrate", "5");
        config.set("zprobe", "fast_feedrate", "100");
        config.set("endstops", "delta_homing", "true");
        config
    }

    fn pin_source(active: Arc<AtomicBool>) -> PinSource {
        Arc::new(move || active.load(Ordering::Relaxed))
    }

    #[test]
    fn test_pin_parsing_and_inversion() {
        let active = Arc::new(AtomicBool::new(false));
        let pin = ProbePin::new("probe", Some(pin_source(active.clone())));
        assert!(pin.connected());
        assert!(!pin.get());
        active.store(true, Ordering::Relaxed);
        assert!(pin.get());

        let inverted = ProbePin::new("!probe", Some(pin_source(active.clone())));
        assert!(!inverted.get());

        let unconnected = ProbePin::new("nc", Some(pin_source(active)));
        assert!(!unconnected.connected());
        assert!(!unconnected.get());
    }

    #[test]
    fn test_run_probe_refused_when_pin_active() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner);
        let active = Arc::new(AtomicBool::new(true));
        let mut probe =
            ZProbe::from_config(&probe_config(), Some(pin_source(active))).unwrap();

        let err = probe.run_probe_slow(&machine).unwrap_err();
        assert_eq!(err, ProbeError::AlreadyTriggered);
        // No motion was commanded.
        assert!(!machine.actuators[Z_AXIS].lock().is_moving());
    }

    #[test]
    fn test_run_probe_refused_when_not_connected() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner);
        let mut config = probe_config();
        config.set("zprobe", "probe_pin", "nc");
        let mut probe = ZProbe::from_config(&config, None).unwrap();

        assert_eq!(probe.run_probe_slow(&machine).unwrap_err(), ProbeError::NotConnected);
    }

    #[test]
    fn test_return_probe_direction_combinations() {
        // The return move undoes the probing motion: forward probes
        // return upward (+Z), reversed probes downward, for either
        // reverse_z setting.
        for reverse_z in [false, true] {
            for reverse in [false, true] {
                let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
                let machine = stub_machine(planner.clone());
                let mut config = probe_config();
                config.set("zprobe", "reverse_z", if reverse_z { "true" } else { "false" });
                let active = Arc::new(AtomicBool::new(false));
                let mut probe =
                    ZProbe::from_config(&config, Some(pin_source(active))).unwrap();

                probe.return_probe(&machine, 800, reverse);

                let moves = planner.lock().moves.clone();
                assert_eq!(moves.len(), 1);
                let (dx, dy, dz, _) = moves[0];
                assert_eq!((dx, dy), (0.0, 0.0));
                let expected = if reverse { -10.0 } else { 10.0 };
                assert!(
                    (dz - expected).abs() < 1e-4,
                    "reverse_z={} reverse={}: dz={} expected={}",
                    reverse_z,
                    reverse,
                    dz,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_return_probe_feedrate_capped_by_fast() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner.clone());
        let mut config = probe_config();
        config.set("zprobe", "slow_feedrate", "60");
        config.set("zprobe", "fast_feedrate", "100");
        let active = Arc::new(AtomicBool::new(false));
        let mut probe = ZProbe::from_config(&config, Some(pin_source(active))).unwrap();

        probe.return_probe(&machine, 80, false);
        let (_, _, _, feedrate) = planner.lock().moves[0];
        // 2 * slow would be 120; capped at fast.
        assert_eq!(feedrate, 100.0);
    }

    #[test]
    fn test_accel_tick_ramps_to_target() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner.clone());
        let state = Arc::new(Mutex::new(ProbeTickState {
            running: true,
            accelerating: true,
            current_feedrate: 400.0,
            ..Default::default()
        }));
        let mut tick = AccelTick::new(
            state.clone(),
            machine.actuators.clone(),
            planner,
            false,
            1000.0,
        );

        {
            let mut z = machine.actuators[Z_AXIS].lock();
            z.move_steps(true, 10_000);
        }

        // accel 200 mm/s^2 at 80 steps/mm and 1 kHz => +16 steps/s per
        // tick; 400 steps/s needs 25 ticks.
        for _ in 0..24 {
            tick.on_tick();
        }
        let rate = machine.actuators[Z_AXIS].lock().get_steps_per_second();
        assert!(rate < 400, "rate {} should still be ramping", rate);

        tick.on_tick();
        assert_eq!(machine.actuators[Z_AXIS].lock().get_steps_per_second(), 400);

        // Never exceeds the target.
        tick.on_tick();
        assert_eq!(machine.actuators[Z_AXIS].lock().get_steps_per_second(), 400);
    }

    #[test]
    fn test_decel_tick_overrun_stops_immediately() {
        let planner: Arc<Mutex<RecordingPlanner>> = Arc::new(Mutex::new(RecordingPlanner::new()));
        let z_stub = Arc::new(Mutex::new(StubActuator::new(80.0)));
        let actuators: [ActuatorHandle; 3] = [
            Arc::new(Mutex::new(StubActuator::new(80.0))),
            Arc::new(Mutex::new(StubActuator::new(80.0))),
            z_stub.clone(),
        ];
        let state = Arc::new(Mutex::new(ProbeTickState {
            running: true,
            accelerating: false,
            current_feedrate: 400.0,
            runout_steps: 100,
            ..Default::default()
        }));
        let mut tick = AccelTick::new(state.clone(), actuators, planner, false, 1000.0);

        {
            // Moving, past the runout budget already.
            let mut z = z_stub.lock();
            z.move_steps(true, 10_000);
            z.set_speed(400);
            z.stepped = 150;
        }

        tick.on_tick();
        let st = state.lock();
        assert!(st.has_exceeded_runout);
        assert_eq!(st.steps_at_decel_end, 150);
        assert!(!z_stub.lock().is_moving());
    }

    #[test]
    fn test_decel_tick_snaps_below_minimum_rate() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner.clone());
        let state = Arc::new(Mutex::new(ProbeTickState {
            running: true,
            accelerating: false,
            current_feedrate: 400.0,
            runout_steps: u32::MAX,
            ..Default::default()
        }));
        let mut tick = AccelTick::new(
            state.clone(),
            machine.actuators.clone(),
            planner,
            false,
            1000.0,
        );

        {
            let mut z = machine.actuators[Z_AXIS].lock();
            z.move_steps(true, 10_000);
            z.set_speed(30);
        }

        // One decel step of 16 leaves 14 < the 20 steps/s floor: stop.
        tick.on_tick();
        assert!(!machine.actuators[Z_AXIS].lock().is_moving());
        assert_eq!(machine.actuators[Z_AXIS].lock().get_steps_per_second(), 0);
    }

    #[test]
    fn test_set_decelerate_on_trigger_requires_runout() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner);
        let active = Arc::new(AtomicBool::new(false));
        let mut probe =
            ZProbe::from_config(&probe_config(), Some(pin_source(active.clone()))).unwrap();

        probe.set_decelerate_on_trigger(true, &machine);
        assert!(!probe.decelerate_on_trigger());
        assert!(machine.stream.contains("decelerate_runout isn't set"));

        let mut config = probe_config();
        config.set("zprobe", "decelerate_runout", "0.5");
        let mut probe = ZProbe::from_config(&config, Some(pin_source(active))).unwrap();
        probe.set_decelerate_on_trigger(true, &machine);
        assert!(probe.decelerate_on_trigger());
    }

    #[test]
    fn test_m670_updates_settings_and_inversion() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner);
        let active = Arc::new(AtomicBool::new(true));
        let mut probe =
            ZProbe::from_config(&probe_config(), Some(pin_source(active))).unwrap();

        let cmd = GCodeCommand::parse("M670 S7 K120 R12 Z450 H4.5").unwrap();
        assert!(probe.handle_mcode(&cmd, &machine));
        assert_eq!(probe.slow_feedrate(), 7.0);
        assert_eq!(probe.fast_feedrate(), 120.0);
        assert_eq!(probe.probe_height(), 4.5);
        assert_eq!(probe.max_z(), 450.0);

        assert!(probe.pin_state());
        let cmd = GCodeCommand::parse("M670 I1").unwrap();
        probe.handle_mcode(&cmd, &machine);
        assert!(!probe.pin_state());
        let cmd = GCodeCommand::parse("M670 I0").unwrap();
        probe.handle_mcode(&cmd, &machine);
        assert!(probe.pin_state());
    }

    #[test]
    fn test_m503_prints_settings_unconsumed() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner);
        let active = Arc::new(AtomicBool::new(false));
        let mut probe =
            ZProbe::from_config(&probe_config(), Some(pin_source(active))).unwrap();

        let cmd = GCodeCommand::parse("M503").unwrap();
        assert!(!probe.handle_mcode(&cmd, &machine));
        assert!(machine.stream.contains("M670 S5.00 K100.00"));
    }

    #[test]
    fn test_g38_rejects_unknown_subcode() {
        let planner = Arc::new(Mutex::new(RecordingPlanner::new()));
        let machine = stub_machine(planner);
        let active = Arc::new(AtomicBool::new(false));
        let mut probe =
            ZProbe::from_config(&probe_config(), Some(pin_source(active))).unwrap();

        let cmd = GCodeCommand::parse("G38.4 X10").unwrap();
        probe.handle_g38(&cmd, &machine).unwrap();
        assert!(machine.stream.contains("Only G38.2 and G38.3"));
    }
}
