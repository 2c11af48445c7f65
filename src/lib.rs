// src/lib.rs

// Probing and auto-calibration core for linear delta machines.
//
// The crate drives a contact Z-probe against the build surface and
// adjusts the kinematic model (endstop trims, delta radius, tower
// offsets) so commanded cartesian coordinates match the effector's
// real position above the bed. Stepper pulse generation and the motion
// planner are external collaborators reached through the traits in
// `stepper` and `planner`; commands arrive pre-parsed through `gcode`.

pub mod configfile;
pub mod endstops;
pub mod extras;
pub mod gcode;
pub mod kinematics;
pub mod machine;
pub mod mathutil;
pub mod planner;
pub mod probe;
pub mod reactor;
pub mod stepper;
pub mod test_utils;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;
