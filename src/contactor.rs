//! Contactor sequencing with weld detection.
//!
//! OPEN -> PRE_CHARGE -> CLOSING -> CLOSED -> OPENING -> OPEN | WELDED.
//!
//! Pre-charge energizes the pre-charge relay and the main negative
//! contactor and waits for the pack to rise to 95 % of the bus voltage;
//! closing energizes the main positive and verifies both feedback
//! inputs; opening drops every line and watches the current actually
//! cease. Current persisting past the weld window is the one and only
//! path into WELDED, which is terminal until hardware service and a
//! manual fault reset.

use crate::config::{
    CONTACTOR_CLOSE_MS, OPEN_CONFIRM_MA, PRECHARGE_TIMEOUT_MS, PRECHARGE_VOLT_PCT, WELD_DETECT_MS,
};
use crate::hal::{BmsHal, ContactorFeedback, ContactorLine};
use crate::types::{ContactorState, FaultEvent, FaultKind, PackState};

/// Sequencer state, owned by the pack controller's contactor stage.
#[derive(Debug, Clone)]
pub struct ContactorCtx {
    state: ContactorState,
    /// Time in the current state.
    state_timer_ms: u32,
    /// Bus voltage captured with the close request, for the pre-charge
    /// target.
    bus_voltage_mv: u32,
    close_requested: bool,
    open_requested: bool,
}

impl ContactorCtx {
    pub fn new() -> Self {
        Self {
            state: ContactorState::Open,
            state_timer_ms: 0,
            bus_voltage_mv: 0,
            close_requested: false,
            open_requested: false,
        }
    }

    /// De-energize every line at initialization; the sequencer state is
    /// already OPEN.
    pub fn init<H: BmsHal>(&mut self, hal: &mut H) {
        all_lines_off(hal);
    }

    /// Request the close sequence. Only honored from OPEN.
    pub fn request_close(&mut self, bus_voltage_mv: u32) {
        if self.state == ContactorState::Open {
            self.close_requested = true;
            self.bus_voltage_mv = bus_voltage_mv;
        }
    }

    /// Request the open sequence from any energized state.
    pub fn request_open(&mut self) {
        if matches!(
            self.state,
            ContactorState::Closed | ContactorState::PreCharge | ContactorState::Closing
        ) {
            self.open_requested = true;
        }
    }

    pub fn state(&self) -> ContactorState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.state == ContactorState::Welded
    }

    fn enter(&mut self, state: ContactorState) {
        self.state = state;
        self.state_timer_ms = 0;
    }

    /// Advance the sequencer. Reads pack voltage and current, drives the
    /// contactor lines, and mirrors the resulting state into the pack
    /// record.
    pub fn run<H: BmsHal>(&mut self, hal: &mut H, pack: &mut PackState, dt_ms: u32) {
        self.state_timer_ms = self.state_timer_ms.saturating_add(dt_ms);

        match self.state {
            ContactorState::Open => {
                if self.close_requested {
                    self.close_requested = false;
                    self.enter(ContactorState::PreCharge);
                    hal.set_contactor(ContactorLine::MainNegative, true);
                    hal.set_contactor(ContactorLine::PreCharge, true);
                    debug!("contactor: OPEN -> PRE_CHARGE");
                }
            }

            ContactorState::PreCharge => {
                if self.open_requested {
                    self.open_requested = false;
                    self.enter(ContactorState::Opening);
                    all_lines_off(hal);
                    debug!("contactor: PRE_CHARGE -> OPENING (abort)");
                } else {
                    let target_mv = (self.bus_voltage_mv * PRECHARGE_VOLT_PCT) / 100;
                    if pack.pack_voltage_mv >= target_mv {
                        self.enter(ContactorState::Closing);
                        hal.set_contactor(ContactorLine::MainPositive, true);
                        hal.set_contactor(ContactorLine::PreCharge, false);
                        debug!("contactor: PRE_CHARGE -> CLOSING");
                    } else if self.state_timer_ms >= PRECHARGE_TIMEOUT_MS {
                        warn!(
                            "contactor: pre-charge timeout at {} of {} mV",
                            pack.pack_voltage_mv, target_mv
                        );
                        self.enter(ContactorState::Open);
                        all_lines_off(hal);
                    }
                }
            }

            ContactorState::Closing => {
                if self.open_requested {
                    self.open_requested = false;
                    self.enter(ContactorState::Opening);
                    all_lines_off(hal);
                } else {
                    let pos_fb = hal.contactor_feedback(ContactorFeedback::Positive);
                    let neg_fb = hal.contactor_feedback(ContactorFeedback::Negative);
                    if pos_fb && neg_fb {
                        self.enter(ContactorState::Closed);
                        debug!("contactor: CLOSING -> CLOSED");
                    } else if self.state_timer_ms >= CONTACTOR_CLOSE_MS {
                        warn!("contactor: close feedback timeout");
                        self.enter(ContactorState::Open);
                        all_lines_off(hal);
                    }
                }
            }

            ContactorState::Closed => {
                if self.open_requested {
                    self.open_requested = false;
                    self.enter(ContactorState::Opening);
                    all_lines_off(hal);
                    debug!("contactor: CLOSED -> OPENING");
                }
            }

            ContactorState::Opening => {
                if pack.pack_current_ma.unsigned_abs() < OPEN_CONFIRM_MA as u32 {
                    self.enter(ContactorState::Open);
                    debug!("contactor: OPENING -> OPEN");
                } else if self.state_timer_ms >= WELD_DETECT_MS {
                    // Current is still flowing with every line dropped.
                    self.enter(ContactorState::Welded);
                    pack.faults.contactor_weld = true;
                    pack.fault_latched = true;
                    error!(
                        "contactor: weld detected, {} mA after open",
                        pack.pack_current_ma
                    );
                    pack.append_fault_msg("contactor weld detected");
                    hal.log_fault_event(FaultEvent {
                        timestamp_ms: pack.uptime_ms,
                        kind: FaultKind::ContactorWeld,
                        index: FaultEvent::NO_INDEX,
                        value: pack.pack_current_ma,
                    });
                }
            }

            ContactorState::Welded => {
                // Terminal until hardware service; keep everything off
                // and keep the pack latched, so a software fault reset
                // cannot bring a welded pack back.
                pack.faults.contactor_weld = true;
                pack.fault_latched = true;
            }
        }

        pack.contactor_state = self.state;
    }
}

impl Default for ContactorCtx {
    fn default() -> Self {
        Self::new()
    }
}

fn all_lines_off<H: BmsHal>(hal: &mut H) {
    hal.set_contactor(ContactorLine::MainPositive, false);
    hal.set_contactor(ContactorLine::MainNegative, false);
    hal.set_contactor(ContactorLine::PreCharge, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;

    const DT: u32 = 50;

    fn run_for(ctx: &mut ContactorCtx, hal: &mut MockHal, pack: &mut PackState, ms: u32) {
        let mut elapsed = 0;
        while elapsed < ms {
            ctx.run(hal, pack, DT);
            elapsed += DT;
        }
    }

    #[test]
    fn close_sequence_with_matching_voltages() {
        let mut ctx = ContactorCtx::new();
        let mut hal = MockHal::new();
        let mut pack = PackState::new(0);
        pack.pack_voltage_mv = 1_131_900;

        ctx.request_close(1_131_900);
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::PreCharge);
        assert!(hal.outputs[1], "main negative energized");
        assert!(hal.outputs[2], "pre-charge relay energized");

        // Pack already at 95 % of bus: pre-charge completes immediately.
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::Closing);
        assert!(hal.outputs[0], "main positive energized");
        assert!(!hal.outputs[2], "pre-charge relay released");

        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::Closed);
        assert_eq!(pack.contactor_state, ContactorState::Closed);
    }

    #[test]
    fn precharge_times_out_back_to_open() {
        let mut ctx = ContactorCtx::new();
        let mut hal = MockHal::new();
        let mut pack = PackState::new(0);
        pack.pack_voltage_mv = 900_000; // far below the bus

        ctx.request_close(1_131_900);
        run_for(&mut ctx, &mut hal, &mut pack, 4_950);
        assert_eq!(ctx.state(), ContactorState::PreCharge);

        run_for(&mut ctx, &mut hal, &mut pack, 200);
        assert_eq!(ctx.state(), ContactorState::Open);
        assert_eq!(hal.outputs, [false, false, false]);
    }

    #[test]
    fn close_feedback_timeout_aborts() {
        let mut ctx = ContactorCtx::new();
        let mut hal = MockHal::new();
        let mut pack = PackState::new(0);
        pack.pack_voltage_mv = 1_131_900;
        hal.feedback_override = Some([false, false]); // stuck aux contacts

        ctx.request_close(1_131_900);
        ctx.run(&mut hal, &mut pack, DT); // -> PRE_CHARGE
        ctx.run(&mut hal, &mut pack, DT); // -> CLOSING
        run_for(&mut ctx, &mut hal, &mut pack, 150);
        assert_eq!(ctx.state(), ContactorState::Open);
    }

    #[test]
    fn abort_during_precharge_opens_cleanly() {
        let mut ctx = ContactorCtx::new();
        let mut hal = MockHal::new();
        let mut pack = PackState::new(0);
        pack.pack_voltage_mv = 900_000;

        ctx.request_close(1_131_900);
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::PreCharge);

        ctx.request_open();
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::Opening);
        assert_eq!(hal.outputs, [false, false, false]);

        // No current flowing: confirm open immediately.
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::Open);
        assert!(!pack.fault_latched);
    }

    #[test]
    fn weld_detection_is_the_only_path_to_welded() {
        let mut ctx = ContactorCtx::new();
        let mut hal = MockHal::new();
        let mut pack = PackState::new(0);
        pack.pack_voltage_mv = 1_131_900;

        ctx.request_close(1_131_900);
        run_for(&mut ctx, &mut hal, &mut pack, 200);
        assert_eq!(ctx.state(), ContactorState::Closed);

        // Open commanded but 50 A keeps flowing.
        pack.pack_current_ma = 50_000;
        ctx.request_open();
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::Opening);

        run_for(&mut ctx, &mut hal, &mut pack, 200);
        assert_eq!(ctx.state(), ContactorState::Welded);
        assert!(pack.faults.contactor_weld);
        assert!(pack.fault_latched);
        assert!(ctx.is_faulted());

        // Terminal: further requests change nothing.
        ctx.request_close(0);
        ctx.request_open();
        run_for(&mut ctx, &mut hal, &mut pack, 500);
        assert_eq!(ctx.state(), ContactorState::Welded);
    }

    #[test]
    fn normal_open_confirms_once_current_stops() {
        let mut ctx = ContactorCtx::new();
        let mut hal = MockHal::new();
        let mut pack = PackState::new(0);
        pack.pack_voltage_mv = 1_131_900;

        ctx.request_close(1_131_900);
        run_for(&mut ctx, &mut hal, &mut pack, 200);
        assert_eq!(ctx.state(), ContactorState::Closed);

        pack.pack_current_ma = 20_000;
        ctx.request_open();
        ctx.run(&mut hal, &mut pack, DT); // -> OPENING, still 20 A
        assert_eq!(ctx.state(), ContactorState::Opening);

        pack.pack_current_ma = 300; // arc quenched
        ctx.run(&mut hal, &mut pack, DT);
        assert_eq!(ctx.state(), ContactorState::Open);
        assert!(!pack.fault_latched);
    }
}
