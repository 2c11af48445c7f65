// src/extras/geometry.rs
// Read/write ports for the delta geometry: arm length and delta radius
// ('L'/'R'), per-tower radius offsets ('A'..'C'), angle offsets
// ('D'..'F'), arm-length offsets ('T'..'V'), plus the endstop trims.
// Every write re-synchronizes the kinematics from the current position
// so the next planned move starts from consistent carriage positions.

use crate::gcode::OutputStream;
use crate::kinematics::{ArmOptions, ArmSolution};
use crate::machine::Machine;

pub struct GeometryFacade {
    // Set whenever a geometric scalar changes; cleared only by a
    // successful endstop-trim plus delta-radius calibration pair.
    dirty: bool,
}

impl Default for GeometryFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryFacade {
    pub fn new() -> Self {
        // Until the first calibration, the geometry is unproven.
        GeometryFacade { dirty: true }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn read_options(&self, machine: &Machine) -> Option<ArmOptions> {
        let mut options = ArmOptions::new();
        if machine.arm_solution.lock().get_options(&mut options) {
            Some(options)
        } else {
            None
        }
    }

    fn write_options(&mut self, machine: &Machine, options: &ArmOptions) -> bool {
        let ok = machine.arm_solution.lock().set_options(options);
        if ok {
            self.post_adjust_kinematics(machine);
            self.dirty = true;
        }
        ok
    }

    /// Re-evaluate the actuator positions for the current cartesian
    /// position. A no-op for the coordinates themselves, but it forces
    /// the inverse kinematics through the changed geometry so the next
    /// move has no step discontinuity. Much cheaper than homing.
    pub fn post_adjust_kinematics(&self, machine: &Machine) {
        let pos = machine.get_axis_position();
        machine.reset_axis_position(pos);
    }

    /// Variant applying per-axis offsets during the reset. Use when the
    /// endstop offsets themselves changed, since those never enter
    /// motion planning.
    pub fn post_adjust_kinematics_offsets(&mut self, machine: &Machine, offsets: [f32; 3]) {
        let pos = machine.get_axis_position();
        machine.reset_axis_position([
            pos[0] + offsets[0],
            pos[1] + offsets[1],
            pos[2] + offsets[2],
        ]);
        self.dirty = true;
    }

    // -- basic geometry ------------------------------------------------------

    pub fn get_basic_geometry(&self, machine: &Machine) -> Option<(f32, f32)> {
        let options = self.read_options(machine)?;
        Some((options[&'L'], options[&'R']))
    }

    pub fn set_basic_geometry(&mut self, machine: &Machine, arm_length: f32, delta_radius: f32) -> bool {
        let mut options = ArmOptions::new();
        options.insert('L', arm_length);
        options.insert('R', delta_radius);
        self.write_options(machine, &options)
    }

    pub fn get_delta_radius(&self, machine: &Machine) -> Option<f32> {
        self.read_options(machine).map(|o| o[&'R'])
    }

    pub fn set_delta_radius(&mut self, machine: &Machine, delta_radius: f32) -> bool {
        let mut options = ArmOptions::new();
        options.insert('R', delta_radius);
        self.write_options(machine, &options)
    }

    pub fn get_arm_length(&self, machine: &Machine) -> Option<f32> {
        self.read_options(machine).map(|o| o[&'L'])
    }

    pub fn set_arm_length(&mut self, machine: &Machine, arm_length: f32) -> bool {
        let mut options = ArmOptions::new();
        options.insert('L', arm_length);
        self.write_options(machine, &options)
    }

    // -- per-tower offsets ---------------------------------------------------

    pub fn get_tower_radius_offsets(&self, machine: &Machine) -> Option<[f32; 3]> {
        self.read_options(machine)
            .map(|o| [o[&'A'], o[&'B'], o[&'C']])
    }

    pub fn set_tower_radius_offsets(&mut self, machine: &Machine, offsets: [f32; 3]) -> bool {
        let mut options = ArmOptions::new();
        options.insert('A', offsets[0]);
        options.insert('B', offsets[1]);
        options.insert('C', offsets[2]);
        self.write_options(machine, &options)
    }

    pub fn get_tower_angle_offsets(&self, machine: &Machine) -> Option<[f32; 3]> {
        self.read_options(machine)
            .map(|o| [o[&'D'], o[&'E'], o[&'F']])
    }

    pub fn set_tower_angle_offsets(&mut self, machine: &Machine, offsets: [f32; 3]) -> bool {
        let mut options = ArmOptions::new();
        options.insert('D', offsets[0]);
        options.insert('E', offsets[1]);
        options.insert('F', offsets[2]);
        self.write_options(machine, &options)
    }

    pub fn get_tower_arm_offsets(&self, machine: &Machine) -> Option<[f32; 3]> {
        self.read_options(machine)
            .map(|o| [o[&'T'], o[&'U'], o[&'V']])
    }

    pub fn set_tower_arm_offsets(&mut self, machine: &Machine, offsets: [f32; 3]) -> bool {
        let mut options = ArmOptions::new();
        options.insert('T', offsets[0]);
        options.insert('U', offsets[1]);
        options.insert('V', offsets[2]);
        self.write_options(machine, &options)
    }

    // -- endstop trims -------------------------------------------------------

    pub fn get_trim(&self, machine: &Machine) -> [f32; 3] {
        machine.endstops.lock().get_trim()
    }

    pub fn set_trim(&self, machine: &Machine, trim: [f32; 3], stream: &OutputStream) -> bool {
        machine.endstops.lock().set_trim(trim);
        stream.respond(format!(
            "[ES] Set trim to: X={:.3} Y={:.3} Z={:.3}",
            trim[0], trim[1], trim[2]
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configfile::Configfile;
    use crate::endstops::Endstops;
    use crate::gcode::OutputStream;
    use crate::kinematics::delta::LinearDeltaSolution;
    use crate::planner::MotionPlanner;
    use crate::reactor::Reactor;
    use crate::stepper::{Actuator, ActuatorHandle};
    use crate::Z_AXIS;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct NullPlanner;
    impl MotionPlanner for NullPlanner {
        fn wait_for_empty_queue(&mut self, _machine: &Machine) {}
        fn relative_move(&mut self, _m: &Machine, _dx: f32, _dy: f32, _dz: f32, _f: f32) {}
        fn absolute_machine_move(
            &mut self,
            _m: &Machine,
            _x: Option<f32>,
            _y: Option<f32>,
            _z: Option<f32>,
            _f: f32,
        ) {
        }
        fn home(&mut self, _machine: &Machine) {}
        fn acceleration(&self) -> f32 {
            200.0
        }
        fn z_acceleration(&self) -> f32 {
            200.0
        }
        fn set_acceleration(&mut self, _accel: f32) {}
    }

    struct PosActuator {
        position: f32,
    }
    impl Actuator for PosActuator {
        fn move_steps(&mut self, _dir: bool, _steps: u32) {}
        fn set_speed(&mut self, _rate: u32) {}
        fn get_steps_per_second(&self) -> u32 {
            0
        }
        fn is_moving(&self) -> bool {
            false
        }
        fn get_stepped(&self) -> u32 {
            0
        }
        fn get_current_position(&self) -> f32 {
            self.position
        }
        fn set_current_position(&mut self, mm: f32) {
            self.position = mm;
        }
        fn steps_per_mm(&self) -> f32 {
            80.0
        }
        fn enable(&mut self) {}
        fn force_finish_move(&mut self) {}
        fn set_moved_last_block(&mut self, _moved: bool) {}
    }

    fn test_machine() -> Machine {
        let actuators: [ActuatorHandle; 3] = [
            Arc::new(Mutex::new(PosActuator { position: 0.0 })),
            Arc::new(Mutex::new(PosActuator { position: 0.0 })),
            Arc::new(Mutex::new(PosActuator { position: 0.0 })),
        ];
        Machine::new(
            Arc::new(Reactor::new(1000.0)),
            Arc::new(Mutex::new(NullPlanner)),
            actuators,
            Arc::new(Mutex::new(LinearDeltaSolution::new(250.0, 124.0))),
            Arc::new(Mutex::new(Endstops::from_config(&Configfile::new()).unwrap())),
            Arc::new(OutputStream::new()),
        )
    }

    #[test]
    fn test_geometry_roundtrip_through_facade() {
        let machine = test_machine();
        let mut facade = GeometryFacade::new();

        assert!(facade.set_basic_geometry(&machine, 251.5, 125.25));
        assert_eq!(facade.get_basic_geometry(&machine), Some((251.5, 125.25)));

        assert!(facade.set_tower_radius_offsets(&machine, [0.125, -0.25, 0.5]));
        assert_eq!(
            facade.get_tower_radius_offsets(&machine),
            Some([0.125, -0.25, 0.5])
        );

        assert!(facade.set_tower_angle_offsets(&machine, [0.5, -0.5, 0.0]));
        assert_eq!(facade.get_tower_angle_offsets(&machine), Some([0.5, -0.5, 0.0]));

        assert!(facade.set_tower_arm_offsets(&machine, [1.0, 0.0, -1.0]));
        assert_eq!(facade.get_tower_arm_offsets(&machine), Some([1.0, 0.0, -1.0]));
    }

    #[test]
    fn test_set_geometry_resynchronizes_actuators() {
        let machine = test_machine();
        let mut facade = GeometryFacade::new();

        machine.reset_axis_position([10.0, -20.0, 50.0]);
        facade.set_delta_radius(&machine, 130.0);

        // Position is preserved and the carriages agree with it under
        // the new geometry: FK(actuators) == believed position.
        let actuator_mm = [
            machine.actuators[0].lock().get_current_position(),
            machine.actuators[1].lock().get_current_position(),
            machine.actuators[Z_AXIS].lock().get_current_position(),
        ];
        let cartesian = machine.arm_solution.lock().forward(&actuator_mm);
        let believed = machine.get_axis_position();
        for axis in 0..3 {
            assert!(
                (cartesian[axis] - believed[axis]).abs() < 0.01,
                "axis {} out of sync: {} vs {}",
                axis,
                cartesian[axis],
                believed[axis]
            );
        }
    }

    #[test]
    fn test_dirty_flag_lifecycle() {
        let machine = test_machine();
        let mut facade = GeometryFacade::new();
        assert!(facade.is_dirty());

        facade.clear_dirty();
        assert!(!facade.is_dirty());

        facade.set_delta_radius(&machine, 124.5);
        assert!(facade.is_dirty());

        facade.clear_dirty();
        facade.post_adjust_kinematics_offsets(&machine, [0.0, 0.0, -0.1]);
        assert!(facade.is_dirty());
    }

    #[test]
    fn test_trim_port() {
        let machine = test_machine();
        let facade = GeometryFacade::new();
        let stream = OutputStream::new();

        assert!(facade.set_trim(&machine, [-0.5, -0.1, 0.0], &stream));
        assert_eq!(facade.get_trim(&machine), [-0.5, -0.1, 0.0]);
        assert!(stream.contains("[ES] Set trim to"));
    }
}
