// src/endstops.rs
// Endstop trim store and the machine's homed Z height (gamma max).
// Trims are per-tower software offsets applied at homing; the
// calibration strategies read and write them through the machine
// context instead of a key-addressed data bus.

use crate::configfile::{ConfigError, Configfile};

#[derive(Debug, Clone)]
pub struct Endstops {
    trim: [f32; 3],
    gamma_max: f32,
    delta_homing: bool,
    rdelta_homing: bool,
}

impl Endstops {
    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        Ok(Endstops {
            trim: [0.0; 3],
            gamma_max: config.getfloat("endstops", "gamma_max", Some(500.0), Some(0.0), None)?,
            delta_homing: config.getboolean("endstops", "delta_homing", Some(false))?,
            rdelta_homing: config.getboolean("endstops", "rdelta_homing", Some(false))?,
        })
    }

    pub fn get_trim(&self) -> [f32; 3] {
        self.trim
    }

    pub fn set_trim(&mut self, trim: [f32; 3]) {
        self.trim = trim;
    }

    pub fn gamma_max(&self) -> f32 {
        self.gamma_max
    }

    pub fn set_gamma_max(&mut self, gamma_max: f32) {
        self.gamma_max = gamma_max;
    }

    pub fn delta_homing(&self) -> bool {
        self.delta_homing
    }

    pub fn rdelta_homing(&self) -> bool {
        self.rdelta_homing
    }
}
