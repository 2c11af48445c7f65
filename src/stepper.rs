// src/stepper.rs
// Boundary to the per-axis stepper pulse generators. The pulse timing
// itself (step/dir pins, timers) lives outside this crate; probing only
// needs rate control and step accounting on each actuator.

use std::sync::Arc;

use parking_lot::Mutex;

/// One tower actuator as seen by the probing core.
///
/// `move_steps(dir, steps)` commands a raw move of `steps` steps; the
/// pulse generator ramps at whatever rate `set_speed` last requested
/// (the acceleration tick adjusts it continuously). `dir = true` is the
/// direction that carries the probe toward the bed on a machine with
/// normal Z orientation. A zero-step move is a hard stop.
pub trait Actuator: Send {
    fn move_steps(&mut self, dir: bool, steps: u32);
    fn set_speed(&mut self, steps_per_second: u32);
    fn get_steps_per_second(&self) -> u32;
    fn is_moving(&self) -> bool;

    /// Steps executed since the current raw move began.
    fn get_stepped(&self) -> u32;

    /// Carriage position in millimeters.
    fn get_current_position(&self) -> f32;
    fn set_current_position(&mut self, mm: f32);

    fn steps_per_mm(&self) -> f32;

    fn enable(&mut self);

    /// Immediately terminate any motion, raw or planned. Used by the
    /// straight-probe detector from tick context.
    fn force_finish_move(&mut self);

    /// Clear the planner's last-block bookkeeping before a raw move.
    fn set_moved_last_block(&mut self, moved: bool);
}

pub type ActuatorHandle = Arc<Mutex<dyn Actuator>>;
