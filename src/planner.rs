// src/planner.rs
// Boundary to the motion planner. Probing issues coordinated moves
// directly through this facade instead of synthesizing G-code lines;
// the planner owns queueing, junction limits and segmentation.

use crate::machine::Machine;

/// Coordinated-motion facade. Moves return once the motion is complete
/// (the queue has drained past them); implementations yield to the
/// reactor while motion is in flight so tick handlers keep running.
pub trait MotionPlanner: Send {
    /// Block (cooperatively) until no queued moves remain.
    fn wait_for_empty_queue(&mut self, machine: &Machine);

    /// Relative move in machine coordinates; axes at 0.0 do not move.
    fn relative_move(&mut self, machine: &Machine, dx: f32, dy: f32, dz: f32, feedrate_mm_s: f32);

    /// Absolute move in machine coordinates; `None` axes keep their
    /// current coordinate.
    fn absolute_machine_move(
        &mut self,
        machine: &Machine,
        x: Option<f32>,
        y: Option<f32>,
        z: Option<f32>,
        feedrate_mm_s: f32,
    );

    /// Home all towers to their endstops (delegated G28).
    fn home(&mut self, machine: &Machine);

    fn acceleration(&self) -> f32;
    fn z_acceleration(&self) -> f32;
    fn set_acceleration(&mut self, accel_mm_s2: f32);
}
