//! End-to-end scenarios for the pack/array controller, driven through
//! the public API against the mock HAL: staged connection, bus current
//! distribution, thermal warning/fault behavior, fault-reset hold,
//! hardware-safety independence, overcurrent warning and weld detection.

use petrel_ess::config::{N_MODULES, VOLTAGE_MATCH_MV};
use petrel_ess::hal::mock::MockHal;
use petrel_ess::soc::ocv_mv_from_soc;
use petrel_ess::types::PersistentSnapshot;
use petrel_ess::{ContactorState, Controller, EmsCommand, EmsMessage, PackArray, PackMode};

const DT: u32 = 10;

fn pack_hal(soc_hundredths: u16, temp_deci_c: i16) -> MockHal {
    let mut hal = MockHal::new();
    hal.persistent = Some(PersistentSnapshot {
        soc_hundredths,
        ..PersistentSnapshot::default()
    });
    hal.set_all_cells(ocv_mv_from_soc(soc_hundredths));
    hal.set_all_temps(temp_deci_c);
    hal
}

/// Array of packs brought to READY (full scan rotation + self-test).
fn ready_array(socs: &[u16], temp_deci_c: i16) -> PackArray<MockHal> {
    let mut array = PackArray::new();
    for (i, &soc) in socs.iter().enumerate() {
        array
            .add_pack(Controller::new(i as u8, pack_hal(soc, temp_deci_c)))
            .unwrap();
    }
    for _ in 0..(N_MODULES + 5) {
        array.step(None, 0, DT);
    }
    for ctrl in array.controllers() {
        assert_eq!(ctrl.pack().mode, PackMode::Ready);
    }
    array
}

struct Sim {
    array: PackArray<MockHal>,
    now_ms: u32,
}

impl Sim {
    fn new(array: PackArray<MockHal>) -> Self {
        let now_ms = array.controllers()[0].pack().uptime_ms;
        Sim { array, now_ms }
    }

    fn send(&mut self, command: EmsCommand, requested_ma: i32) {
        self.now_ms += DT;
        let msg = EmsMessage {
            command,
            timestamp_ms: self.now_ms,
        };
        self.array.step(Some(msg), requested_ma, DT);
    }

    /// Run with a keepalive each tick so the EMS watchdog stays fed.
    fn run(&mut self, ms: u32, requested_ma: i32) {
        let mut elapsed = 0;
        while elapsed < ms {
            self.send(EmsCommand::None, requested_ma);
            elapsed += DT;
        }
    }

    fn modes(&self) -> Vec<PackMode> {
        self.array
            .controllers()
            .iter()
            .map(|c| c.pack().mode)
            .collect()
    }

    fn currents_ma(&self) -> Vec<i32> {
        self.array
            .controllers()
            .iter()
            .map(|c| c.pack().pack_current_ma)
            .collect()
    }
}

/// Scenario 1: pre-charge pack first, then parallel connection.
/// Three packs at 45/55/65 % SoC, all at 40 degC.
#[test]
fn precharge_then_parallel_connection() {
    let mut sim = Sim::new(ready_array(&[4500, 5500, 6500], 400));

    // The voltage-match window must hold across the whole fleet.
    let bus = sim.array.bus_voltage_mv();
    for ctrl in sim.array.controllers() {
        let delta = ctrl.pack().pack_voltage_mv.abs_diff(bus);
        assert!(delta <= VOLTAGE_MATCH_MV, "gate violated: {} mV", delta);
    }

    sim.send(EmsCommand::ConnectForCharge, 0);

    // Only the lowest-SoC pack may be connecting.
    assert_eq!(
        sim.modes(),
        vec![PackMode::Connecting, PackMode::Ready, PackMode::Ready]
    );

    // It must reach CONNECTED well inside the 5 s pre-charge window.
    let mut waited = 0;
    while sim.array.controllers()[0].pack().mode != PackMode::Connected {
        sim.run(DT, 0);
        waited += DT;
        assert!(waited < 5_000, "pre-charge exceeded its window");
    }

    // The remaining two are requested together on the very next cycle.
    sim.run(DT, 0);
    assert_eq!(
        sim.modes(),
        vec![
            PackMode::Connected,
            PackMode::Connecting,
            PackMode::Connecting
        ]
    );

    sim.run(500, 0);
    assert!(sim.modes().iter().all(|&m| m == PackMode::Connected));
}

/// Scenario 2: driven charge distribution. 200 A into three packs; the
/// emptiest pack takes the largest share, the fullest the smallest.
#[test]
fn driven_charge_distribution() {
    let mut sim = Sim::new(ready_array(&[4500, 5500, 6500], 400));
    sim.send(EmsCommand::ConnectForCharge, 200_000);
    sim.run(3_000, 200_000);
    assert!(sim.modes().iter().all(|&m| m == PackMode::Connected));

    let currents = sim.currents_ma();
    let total: i64 = currents.iter().map(|&c| c as i64).sum();
    assert!(
        (total - 200_000).abs() <= 2_000,
        "sum {} mA is not 200 A within 2 A",
        total
    );
    assert!(currents[0] > currents[1] && currents[1] > currents[2]);
    assert!(currents[0] > 0);
}

/// Scenario 3: equalization at zero load. Low-SoC pack charges from the
/// high-SoC pack; KCL holds on the bus.
#[test]
fn equalization_at_zero_load() {
    let mut sim = Sim::new(ready_array(&[4000, 5000, 6000], 400));
    sim.send(EmsCommand::ConnectForCharge, 0);
    sim.run(2_000, 0);
    assert!(sim.modes().iter().all(|&m| m == PackMode::Connected));

    let currents = sim.currents_ma();
    assert!(currents[0] > 0, "lowest SoC should charge: {:?}", currents);
    assert!(
        currents[2] < 0,
        "highest SoC should discharge: {:?}",
        currents
    );
    let total: i64 = currents.iter().map(|&c| c as i64).sum();
    assert!(total.abs() <= 1_000, "KCL residual {} mA", total);
}

/// Scenario 4: thermal warning then fault, with hysteresis. 60 degC
/// warns after 5 s, 65 degC faults after 5 s, contactors open and the
/// limits go to zero; cooling just below the clear level does not drop
/// the warning.
#[test]
fn thermal_warning_then_fault_with_hysteresis() {
    let mut sim = Sim::new(ready_array(&[5000], 350));
    sim.send(EmsCommand::ConnectForCharge, 0);
    sim.run(1_000, 0);
    assert_eq!(sim.modes(), vec![PackMode::Connected]);

    // Heat to the warning level.
    sim.array.controller_mut(0).hal_mut().set_all_temps(600);
    sim.run(1_000, 0);
    assert!(!sim.array.controllers()[0].pack().has_warning);
    sim.run(6_000, 0);
    let pack = sim.array.controllers()[0].pack();
    assert!(pack.has_warning);
    assert!(pack.warning_message.contains("OT warning"));
    assert!(!pack.fault_latched);

    // Heat on to the fault level.
    sim.array.controller_mut(0).hal_mut().set_all_temps(650);
    sim.run(7_000, 0);
    let pack = sim.array.controllers()[0].pack();
    assert!(pack.fault_latched);
    assert!(pack.faults.cell_ot);
    assert_eq!(pack.mode, PackMode::Fault);
    assert_eq!(pack.charge_limit_ma, 0);
    assert_eq!(pack.discharge_limit_ma, 0);

    sim.run(500, 0);
    assert_eq!(
        sim.array.controllers()[0].pack().contactor_state,
        ContactorState::Open
    );

    // Cool into the deadband: the warning must not clear immediately.
    sim.array.controller_mut(0).hal_mut().set_all_temps(569);
    sim.run(2_000, 0);
    assert!(sim.array.controllers()[0].pack().has_warning);
}

/// Scenario 5: fault reset hold time. A reset at ~30 s of safe state is
/// denied; past the 60 s hold it is accepted and the pack returns to
/// READY.
#[test]
fn fault_reset_hold_time() {
    let mut sim = Sim::new(ready_array(&[5000], 400));

    // Latch an overtemperature fault.
    sim.array.controller_mut(0).hal_mut().set_all_temps(660);
    sim.run(7_000, 0);
    assert_eq!(sim.modes(), vec![PackMode::Fault]);

    // Condition clears; 30 s of safe state is not enough.
    sim.array.controller_mut(0).hal_mut().set_all_temps(400);
    sim.run(30_000, 0);
    sim.send(EmsCommand::ResetFaults, 0);
    assert_eq!(sim.modes(), vec![PackMode::Fault]);
    assert!(sim.array.controllers()[0].pack().fault_latched);

    // Past the hold: accepted, faults and timers cleared.
    sim.run(35_000, 0);
    sim.send(EmsCommand::ResetFaults, 0);
    let pack = sim.array.controllers()[0].pack();
    assert_eq!(pack.mode, PackMode::Ready);
    assert!(!pack.fault_latched);
    assert!(!pack.faults.any());
    assert!(pack.fault_message.is_empty());
}

/// Scenario 6: hardware-safety independence. With a software fault
/// already latched, a cell driven into hardware territory still trips
/// the hardware layer, and its message is appended, not substituted.
#[test]
fn hardware_safety_fires_while_software_latched() {
    let mut sim = Sim::new(ready_array(&[5000], 250));

    // Software OV fault on cell 12.
    sim.array.controller_mut(0).hal_mut().set_cell(12, 4230);
    sim.run(6_000, 0);
    let pack = sim.array.controllers()[0].pack();
    assert!(pack.fault_latched);
    assert!(pack.faults.cell_ov);
    assert!(!pack.faults.hw_ov);

    // Same cell into hardware territory: 1 s later the independent
    // layer has latched as well.
    sim.array.controller_mut(0).hal_mut().set_cell(12, 4301);
    sim.run(1_500, 0);
    let pack = sim.array.controllers()[0].pack();
    assert!(pack.faults.hw_ov);
    assert!(pack.hw_fault_latched);
    assert!(pack.fault_message.contains("SE OV fault"));
    assert!(pack.fault_message.contains("HW SAFETY"));
}

/// Scenario 7: overcurrent warning. At 25 degC the charge limit is
/// 384 A; ~428 A sustained for 10 s raises the warning (message "OC"),
/// never a fault above freezing.
#[test]
fn overcurrent_warning_without_fault() {
    let mut sim = Sim::new(ready_array(&[5000], 250));
    sim.array.controller_mut(0).hal_mut().current_ma = 428_200;

    sim.run(9_000, 0);
    assert!(!sim.array.controllers()[0].pack().has_warning);

    sim.run(2_000, 0);
    let pack = sim.array.controllers()[0].pack();
    assert!(pack.has_warning);
    assert!(pack.warning_message.contains("OC"));
    assert!(!pack.fault_latched);
    assert!(!pack.faults.oc_charge);
}

/// Scenario 8: contactor weld. Open commanded from CLOSED with 50 A
/// still flowing; 200 ms later the sequencer lands in WELDED and the
/// pack faults.
#[test]
fn contactor_weld_detection() {
    let mut sim = Sim::new(ready_array(&[5000], 250));
    sim.send(EmsCommand::ConnectForCharge, 0);
    sim.run(1_000, 0);
    assert_eq!(sim.modes(), vec![PackMode::Connected]);

    // The driver keeps reporting 50 A after the open command.
    sim.array.controller_mut(0).hal_mut().current_ma = 50_000;
    sim.send(EmsCommand::Disconnect, 0);
    sim.run(400, 0);

    let pack = sim.array.controllers()[0].pack();
    assert_eq!(pack.contactor_state, ContactorState::Welded);
    assert!(pack.faults.contactor_weld);
    assert!(pack.fault_latched);
    assert_eq!(pack.mode, PackMode::Fault);

    // Terminal: even a guard-passing reset cannot revive a welded
    // pack; the sequencer re-latches and the pack drops back to FAULT.
    sim.run(61_000, 0);
    sim.send(EmsCommand::ResetFaults, 0);
    sim.run(100, 0);
    let pack = sim.array.controllers()[0].pack();
    assert_eq!(pack.contactor_state, ContactorState::Welded);
    assert!(pack.faults.contactor_weld);
    assert_eq!(pack.mode, PackMode::Fault);
}
