// src/kinematics/mod.rs
// Arm-solution boundary: forward/inverse kinematics plus a
// named-parameter option map for the geometry scalars.

use std::collections::HashMap;

pub mod delta;

/// Geometry scalars addressed by single-character keys:
/// 'L' arm length, 'R' delta radius, 'A'/'B'/'C' per-tower radius
/// offsets, 'D'/'E'/'F' per-tower angle offsets, 'T'/'U'/'V' per-tower
/// arm-length offsets.
pub type ArmOptions = HashMap<char, f32>;

pub const OPTION_KEYS: [char; 11] = ['L', 'R', 'A', 'B', 'C', 'D', 'E', 'F', 'T', 'U', 'V'];

pub trait ArmSolution: Send {
    /// Cartesian position from the three carriage heights.
    fn forward(&self, actuator_mm: &[f32; 3]) -> [f32; 3];

    /// Carriage heights for a cartesian position.
    fn inverse(&self, cartesian_mm: &[f32; 3]) -> [f32; 3];

    /// Fill `options` with the current geometry. Returns false when the
    /// solution has no adjustable geometry.
    fn get_options(&self, options: &mut ArmOptions) -> bool;

    /// Apply the keys present in `options`. Returns false when none of
    /// them is recognized. Callers must re-synchronize machine position
    /// afterwards (see `Machine::reset_axis_position`).
    fn set_options(&mut self, options: &ArmOptions) -> bool;
}
