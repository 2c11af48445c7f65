// src/extras/mod.rs
// Leveling strategies and the probe module dispatcher wiring them to
// the G-code boundary.

pub mod comprehensive;
pub mod delta_radius;
pub mod endstop_trim;
pub mod geometry;
pub mod session;

use crate::configfile::{ConfigError, Configfile};
use crate::gcode::GCodeCommand;
use crate::machine::Machine;
use crate::planner::MotionPlanner;
use crate::probe::{PinSource, ProbeError, ZProbe};

use comprehensive::ComprehensiveDeltaStrategy;

/// A bed-leveling / calibration strategy. Strategies are chosen at
/// config load and fixed afterwards; each gets a chance to consume a
/// command (`Ok(true)`) or pass (`Ok(false)`).
pub trait LevelingStrategy: Send {
    fn handle_gcode(
        &mut self,
        gcmd: &GCodeCommand,
        zprobe: &mut ZProbe,
        machine: &Machine,
    ) -> Result<bool, ProbeError>;
}

/// The probe module as seen from the G-code dispatcher: the probe
/// driver plus the configured strategy list.
pub struct ProbeDispatch {
    pub zprobe: ZProbe,
    strategies: Vec<Box<dyn LevelingStrategy>>,
}

impl ProbeDispatch {
    /// Build from configuration. Returns `None` when the zprobe module
    /// is disabled. The comprehensive delta strategy is registered when
    /// enabled explicitly, or by default on delta machines.
    pub fn from_config(
        config: &Configfile,
        pin_source: Option<PinSource>,
    ) -> Result<Option<Self>, ConfigError> {
        if !config.getboolean("zprobe", "enable", Some(false))? {
            return Ok(None);
        }

        let zprobe = ZProbe::from_config(config, pin_source)?;

        let mut strategies: Vec<Box<dyn LevelingStrategy>> = Vec::new();
        let comprehensive_enabled =
            config.getboolean("comprehensive-delta", "enable", Some(false))?;
        if comprehensive_enabled || zprobe.is_delta() {
            strategies.push(Box::new(ComprehensiveDeltaStrategy::from_config(config)?));
        }

        Ok(Some(ProbeDispatch { zprobe, strategies }))
    }

    pub fn register_handlers(&self, machine: &Machine) {
        self.zprobe.register_handlers(machine);
    }

    /// Entry point from the G-code dispatcher. Errors are rendered on
    /// the command stream; a halt is left pending on the reactor.
    pub fn on_gcode_received(&mut self, gcmd: &GCodeCommand, machine: &Machine) {
        if let Err(e) = self.dispatch(gcmd, machine) {
            machine.stream.respond(format!("error:{}", e));
        }
    }

    fn dispatch(&mut self, gcmd: &GCodeCommand, machine: &Machine) -> Result<(), ProbeError> {
        if gcmd.letter == 'G' && (29..=32).contains(&gcmd.number) {
            // Refuse to move anything on a missing or already-triggered
            // probe.
            if !self.zprobe.pin_connected() {
                machine.stream.respond("ZProbe not connected.");
                return Ok(());
            }
            if self.zprobe.pin_state() {
                machine
                    .stream
                    .respond("ZProbe triggered before move, aborting command.");
                return Ok(());
            }

            if gcmd.number == 30 {
                return self.zprobe.handle_g30(gcmd, machine);
            }

            for strategy in self.strategies.iter_mut() {
                if strategy.handle_gcode(gcmd, &mut self.zprobe, machine)? {
                    return Ok(());
                }
            }
            machine
                .stream
                .respond(format!("No strategy found to handle G{}", gcmd.number));
            return Ok(());
        }

        if gcmd.letter == 'G' && gcmd.number == 38 {
            return self.zprobe.handle_g38(gcmd, machine);
        }

        if gcmd.letter == 'M' {
            match gcmd.number {
                204 => {
                    if let Some(accel) = gcmd.get_value('S') {
                        machine.planner.lock().set_acceleration(accel);
                    }
                    return Ok(());
                }
                665 => {
                    // Gamma max is ours; the geometry letters are
                    // watched by the strategies for the dirty flag.
                    if let Some(z) = gcmd.get_value('Z') {
                        machine.endstops.lock().set_gamma_max(z);
                    }
                }
                _ => {}
            }

            if self.zprobe.handle_mcode(gcmd, machine) {
                return Ok(());
            }
            for strategy in self.strategies.iter_mut() {
                if strategy.handle_gcode(gcmd, &mut self.zprobe, machine)? {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
