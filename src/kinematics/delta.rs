// src/kinematics/delta.rs
// Linear delta arm solution. Three vertical towers spaced 120 degrees
// apart on a circle of `delta_radius`; the effector hangs from the
// carriages on rods of `arm_length`. Per-tower radius, angle and
// arm-length offsets absorb build imperfections.

use crate::configfile::{ConfigError, Configfile};
use crate::mathutil::{
    vector_add, vector_cross, vector_dot, vector_mag, vector_mul_scalar, vector_sub, vector_unit,
    Vector3,
};

use super::{ArmOptions, ArmSolution};

// Tower base angles, degrees from the +X axis: X tower rear-left,
// Y tower rear-right, Z tower front.
const TOWER_ANGLES: [f32; 3] = [210.0, 330.0, 90.0];

#[derive(Debug, Clone)]
pub struct LinearDeltaSolution {
    arm_length: f32,
    delta_radius: f32,
    radius_offset: [f32; 3],
    angle_offset: [f32; 3],
    arm_offset: [f32; 3],

    // Derived per-tower state, rebuilt on any geometry change.
    tower: [[f32; 2]; 3],
    arm_length_sq: [f32; 3],
}

impl LinearDeltaSolution {
    pub fn new(arm_length: f32, delta_radius: f32) -> Self {
        let mut solution = LinearDeltaSolution {
            arm_length,
            delta_radius,
            radius_offset: [0.0; 3],
            angle_offset: [0.0; 3],
            arm_offset: [0.0; 3],
            tower: [[0.0; 2]; 3],
            arm_length_sq: [0.0; 3],
        };
        solution.init();
        solution
    }

    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        let arm_length = config.getfloat("delta", "arm_length", Some(250.0), Some(0.0), None)?;
        let delta_radius = config.getfloat("delta", "arm_radius", Some(124.0), Some(0.0), None)?;
        Ok(Self::new(arm_length, delta_radius))
    }

    fn init(&mut self) {
        for i in 0..3 {
            let radius = self.delta_radius + self.radius_offset[i];
            let angle = (TOWER_ANGLES[i] + self.angle_offset[i]).to_radians();
            self.tower[i] = [radius * angle.cos(), radius * angle.sin()];
            let arm = self.arm_length + self.arm_offset[i];
            self.arm_length_sq[i] = arm * arm;
        }
    }
}

impl ArmSolution for LinearDeltaSolution {
    fn inverse(&self, cartesian_mm: &[f32; 3]) -> [f32; 3] {
        let mut actuator = [0.0f32; 3];
        for i in 0..3 {
            let dx = self.tower[i][0] - cartesian_mm[0];
            let dy = self.tower[i][1] - cartesian_mm[1];
            actuator[i] = cartesian_mm[2] + (self.arm_length_sq[i] - dx * dx - dy * dy).sqrt();
        }
        actuator
    }

    fn forward(&self, actuator_mm: &[f32; 3]) -> [f32; 3] {
        // Trilateration of the three spheres centered on the carriages.
        let p1: Vector3 = [self.tower[0][0], self.tower[0][1], actuator_mm[0]];
        let p2: Vector3 = [self.tower[1][0], self.tower[1][1], actuator_mm[1]];
        let p3: Vector3 = [self.tower[2][0], self.tower[2][1], actuator_mm[2]];

        let ex = vector_unit(vector_sub(p2, p1));
        let p13 = vector_sub(p3, p1);
        let i = vector_dot(ex, p13);
        let ey = vector_unit(vector_sub(p13, vector_mul_scalar(ex, i)));
        let ez = vector_cross(ex, ey);

        let d = vector_mag(vector_sub(p2, p1));
        let j = vector_dot(ey, p13);

        let r1_sq = self.arm_length_sq[0];
        let r2_sq = self.arm_length_sq[1];
        let r3_sq = self.arm_length_sq[2];

        let x = (r1_sq - r2_sq + d * d) / (2.0 * d);
        let y = (r1_sq - r3_sq + i * i + j * j) / (2.0 * j) - (i / j) * x;
        // The effector hangs below the carriage plane.
        let z = -(r1_sq - x * x - y * y).max(0.0).sqrt();

        vector_add(
            p1,
            vector_add(
                vector_mul_scalar(ex, x),
                vector_add(vector_mul_scalar(ey, y), vector_mul_scalar(ez, z)),
            ),
        )
    }

    fn get_options(&self, options: &mut ArmOptions) -> bool {
        options.insert('L', self.arm_length);
        options.insert('R', self.delta_radius);
        options.insert('A', self.radius_offset[0]);
        options.insert('B', self.radius_offset[1]);
        options.insert('C', self.radius_offset[2]);
        options.insert('D', self.angle_offset[0]);
        options.insert('E', self.angle_offset[1]);
        options.insert('F', self.angle_offset[2]);
        options.insert('T', self.arm_offset[0]);
        options.insert('U', self.arm_offset[1]);
        options.insert('V', self.arm_offset[2]);
        true
    }

    fn set_options(&mut self, options: &ArmOptions) -> bool {
        let mut any = false;
        let mut take = |key: char, slot: &mut f32| {
            if let Some(&value) = options.get(&key) {
                *slot = value;
                any = true;
            }
        };
        take('L', &mut self.arm_length);
        take('R', &mut self.delta_radius);
        take('A', &mut self.radius_offset[0]);
        take('B', &mut self.radius_offset[1]);
        take('C', &mut self.radius_offset[2]);
        take('D', &mut self.angle_offset[0]);
        take('E', &mut self.angle_offset[1]);
        take('F', &mut self.angle_offset[2]);
        take('T', &mut self.arm_offset[0]);
        take('U', &mut self.arm_offset[1]);
        take('V', &mut self.arm_offset[2]);
        if any {
            self.init();
        }
        any
    }
}
