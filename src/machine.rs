// src/machine.rs
// Explicit machine context. Everything the probing core touches hangs
// off this handle: the reactor, the planner facade, the three tower
// actuators, the arm solution, the endstop trim store and the command
// stream. No global kernel accessor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::endstops::Endstops;
use crate::gcode::OutputStream;
use crate::kinematics::ArmSolution;
use crate::planner::MotionPlanner;
use crate::reactor::Reactor;
use crate::stepper::{Actuator, ActuatorHandle};
use crate::{X_AXIS, Y_AXIS, Z_AXIS};

/// Bed-shape correction applied by the planner to outgoing moves.
/// Saved and cleared for the duration of straight probes.
pub type CompensationTransform = Box<dyn Fn([f32; 3]) -> [f32; 3] + Send>;

/// Position and trigger flag of the most recent probe, in actuator
/// coordinates for raw cycles and machine coordinates for straight
/// probes.
pub type LastProbePosition = (f32, f32, f32, u8);

pub struct Machine {
    pub reactor: Arc<Reactor>,
    pub planner: Arc<Mutex<dyn MotionPlanner>>,
    pub actuators: [ActuatorHandle; 3],
    pub arm_solution: Arc<Mutex<dyn ArmSolution>>,
    pub endstops: Arc<Mutex<Endstops>>,
    pub stream: Arc<OutputStream>,

    position: Mutex<[f32; 3]>,
    compensation_transform: Mutex<Option<CompensationTransform>>,
    disable_segmentation: AtomicBool,
    last_probe_position: Mutex<LastProbePosition>,
}

impl Machine {
    pub fn new(
        reactor: Arc<Reactor>,
        planner: Arc<Mutex<dyn MotionPlanner>>,
        actuators: [ActuatorHandle; 3],
        arm_solution: Arc<Mutex<dyn ArmSolution>>,
        endstops: Arc<Mutex<Endstops>>,
        stream: Arc<OutputStream>,
    ) -> Self {
        Machine {
            reactor,
            planner,
            actuators,
            arm_solution,
            endstops,
            stream,
            position: Mutex::new([0.0; 3]),
            compensation_transform: Mutex::new(None),
            disable_segmentation: AtomicBool::new(false),
            last_probe_position: Mutex::new((0.0, 0.0, 0.0, 0)),
        }
    }

    // -- planner conveniences ------------------------------------------------

    pub fn wait_for_empty_queue(&self) {
        self.planner.lock().wait_for_empty_queue(self);
    }

    pub fn relative_move(&self, dx: f32, dy: f32, dz: f32, feedrate_mm_s: f32) {
        self.planner.lock().relative_move(self, dx, dy, dz, feedrate_mm_s);
    }

    pub fn absolute_machine_move(
        &self,
        x: Option<f32>,
        y: Option<f32>,
        z: Option<f32>,
        feedrate_mm_s: f32,
    ) {
        self.planner
            .lock()
            .absolute_machine_move(self, x, y, z, feedrate_mm_s);
    }

    pub fn home(&self) {
        self.planner.lock().home(self);
    }

    // -- axis position -------------------------------------------------------

    pub fn get_axis_position(&self) -> [f32; 3] {
        *self.position.lock()
    }

    /// Record a new believed position without motion (planner moves and
    /// homing use this).
    pub fn set_axis_position(&self, pos: [f32; 3]) {
        *self.position.lock() = pos;
    }

    /// Declare `pos` as the current position and re-solve the actuator
    /// positions through inverse kinematics. This is the re-sync that
    /// must follow every geometry change: without it the next planned
    /// move starts from stale carriage positions and jumps.
    pub fn reset_axis_position(&self, pos: [f32; 3]) {
        let actuator_mm = self.arm_solution.lock().inverse(&pos);
        for (axis, handle) in self.actuators.iter().enumerate() {
            handle.lock().set_current_position(actuator_mm[axis]);
        }
        *self.position.lock() = pos;
    }

    /// Variant for a single axis (G30 with a Z override).
    pub fn reset_axis_position_single(&self, axis: usize, value: f32) {
        let mut pos = self.get_axis_position();
        pos[axis] = value;
        self.reset_axis_position(pos);
    }

    /// Re-derive the believed position from wherever the actuators
    /// actually stopped (forward kinematics). Needed after a move was
    /// cut short by the probe.
    pub fn reset_position_from_current_actuator_position(&self) {
        let actuator_mm = [
            self.actuators[X_AXIS].lock().get_current_position(),
            self.actuators[Y_AXIS].lock().get_current_position(),
            self.actuators[Z_AXIS].lock().get_current_position(),
        ];
        let cartesian = self.arm_solution.lock().forward(&actuator_mm);
        *self.position.lock() = cartesian;
    }

    // -- probing collaborators ----------------------------------------------

    pub fn take_compensation_transform(&self) -> Option<CompensationTransform> {
        self.compensation_transform.lock().take()
    }

    pub fn set_compensation_transform(&self, transform: Option<CompensationTransform>) {
        *self.compensation_transform.lock() = transform;
    }

    pub fn has_compensation_transform(&self) -> bool {
        self.compensation_transform.lock().is_some()
    }

    pub fn set_disable_segmentation(&self, disable: bool) {
        self.disable_segmentation.store(disable, Ordering::Relaxed);
    }

    pub fn segmentation_disabled(&self) -> bool {
        self.disable_segmentation.load(Ordering::Relaxed)
    }

    pub fn set_last_probe_position(&self, pos: LastProbePosition) {
        *self.last_probe_position.lock() = pos;
    }

    pub fn last_probe_position(&self) -> LastProbePosition {
        *self.last_probe_position.lock()
    }

    /// Raise the machine-wide halt event (ALARM state).
    pub fn halt(&self) {
        self.reactor.halt();
    }
}
