//! Pack operating-mode state machine.
//!
//! Seven modes, evaluated once per cycle as a total function of the
//! current mode and the inputs; EMS commands that are illegal for the
//! current mode do nothing. A latched fault forces FAULT from any mode,
//! and FAULT is left only through an operator reset that passes the
//! protection engine's safe-state guard; a denied reset is logged,
//! never silently dropped.

use crate::config::{EMS_WATCHDOG_MS, VOLTAGE_MATCH_MV};
use crate::contactor::ContactorCtx;
use crate::hal::BmsHal;
use crate::monitor;
use crate::protection::ProtectionState;
use crate::types::{
    ContactorState, EmsCommand, EmsMessage, FaultEvent, FaultKind, PackMode, PackState,
};

/// Force the pack into FAULT: zero both limits and request the
/// contactors open. Called on latch detection and by the watchdog.
pub fn enter_fault(pack: &mut PackState, contactor: &mut ContactorCtx) {
    if pack.mode != PackMode::Fault {
        info!("state: {} -> FAULT", pack.mode.as_str());
    }
    pack.mode = PackMode::Fault;
    pack.charge_limit_ma = 0;
    pack.discharge_limit_ma = 0;
    contactor.request_open();
}

/// One state-machine pass.
///
/// `bus_voltage_mv` is the coordinator's current bus estimate, used for
/// the connect voltage-match gate and handed to the contactor sequencer
/// as the pre-charge target.
pub fn step<H: BmsHal>(
    hal: &mut H,
    pack: &mut PackState,
    contactor: &mut ContactorCtx,
    prot: &mut ProtectionState,
    cmd: Option<&EmsMessage>,
    bus_voltage_mv: u32,
) {
    // Reception alone feeds the EMS watchdog, whatever the command.
    if let Some(msg) = cmd {
        pack.note_ems_message(msg.timestamp_ms);
    }

    // A latched fault overrides everything.
    if pack.fault_latched && pack.mode != PackMode::Fault {
        enter_fault(pack, contactor);
        return;
    }

    // EMS watchdog: a live bus with a silent supervisor is a fault.
    if matches!(pack.mode, PackMode::Connecting | PackMode::Connected) {
        let elapsed = pack.uptime_ms.wrapping_sub(pack.last_ems_msg_ms);
        if elapsed > EMS_WATCHDOG_MS {
            warn!("state: EMS watchdog expired after {} ms", elapsed);
            pack.faults.ems_timeout = true;
            pack.fault_latched = true;
            pack.append_fault_msg("EMS watchdog timeout");
            hal.log_fault_event(FaultEvent {
                timestamp_ms: pack.uptime_ms,
                kind: FaultKind::EmsTimeout,
                index: FaultEvent::NO_INDEX,
                value: elapsed as i32,
            });
            enter_fault(pack, contactor);
            return;
        }
    }

    let command = cmd.map(|m| m.command).unwrap_or(EmsCommand::None);

    match pack.mode {
        PackMode::NotReady => {
            // Self-test: every module must be reporting in.
            if monitor::all_modules_ok(pack) {
                info!("state: NOT_READY -> READY");
                pack.mode = PackMode::Ready;
            }
        }

        PackMode::Ready => match command {
            EmsCommand::ConnectForCharge | EmsCommand::ConnectForDischarge => {
                let delta = pack.pack_voltage_mv.abs_diff(bus_voltage_mv);
                if delta <= VOLTAGE_MATCH_MV {
                    contactor.request_close(bus_voltage_mv);
                    pack.mode = PackMode::Connecting;
                    pack.note_ems_message(pack.uptime_ms);
                    info!("state: READY -> CONNECTING");
                } else {
                    // Stay READY; the coordinator retries next cycle.
                    debug!(
                        "state: connect gated, |dV| = {} mV exceeds {} mV",
                        delta, VOLTAGE_MATCH_MV
                    );
                }
            }
            EmsCommand::PowerSave => {
                info!("state: READY -> POWER_SAVE");
                pack.mode = PackMode::PowerSave;
            }
            _ => {}
        },

        PackMode::Connecting => {
            if command == EmsCommand::Disconnect {
                contactor.request_open();
                pack.mode = PackMode::Ready;
                info!("state: CONNECTING -> READY (disconnect)");
            } else if contactor.is_faulted() {
                enter_fault(pack, contactor);
            } else if contactor.state() == ContactorState::Closed {
                pack.mode = PackMode::Connected;
                info!("state: CONNECTING -> CONNECTED");
            } else if contactor.state() == ContactorState::Open {
                // Pre-charge timed out or close verification failed.
                pack.mode = PackMode::Ready;
                info!("state: CONNECTING -> READY (contactor open)");
            }
        }

        PackMode::Connected => {
            match command {
                EmsCommand::Disconnect => {
                    contactor.request_open();
                    pack.mode = PackMode::Ready;
                    info!("state: CONNECTED -> READY (disconnect)");
                }
                EmsCommand::SetLimits {
                    charge_ma,
                    discharge_ma,
                } => {
                    // EMS may lower limits, never raise them.
                    pack.ems_charge_cap_ma = charge_ma.max(0);
                    pack.ems_discharge_cap_ma = discharge_ma.max(0);
                    pack.charge_limit_ma = pack.charge_limit_ma.min(pack.ems_charge_cap_ma);
                    pack.discharge_limit_ma =
                        pack.discharge_limit_ma.min(pack.ems_discharge_cap_ma);
                }
                _ => {}
            }
            if contactor.is_faulted() {
                enter_fault(pack, contactor);
            }
        }

        PackMode::PowerSave => {
            if !matches!(command, EmsCommand::None | EmsCommand::PowerSave) {
                info!("state: POWER_SAVE -> READY");
                pack.mode = PackMode::Ready;
            }
        }

        PackMode::Fault => {
            if command == EmsCommand::ResetFaults {
                if prot.can_reset(pack) {
                    prot.reset(pack);
                    pack.mode = PackMode::Ready;
                    info!("state: FAULT -> READY (reset accepted)");
                } else {
                    warn!("state: fault reset denied, safe-state hold incomplete");
                }
            }
        }

        PackMode::Off => {
            // Power-on initialization moves the pack to NOT_READY; OFF is
            // never re-entered at runtime.
        }
    }
}
