//! Passive balancing decision.
//!
//! When the pack is resting or lightly loaded and the cell spread opens
//! past the balance threshold, every cell above `min + threshold/2`
//! gets its bleed resistor switched in through the monitor ASIC.
//! Balancing is suspended outside READY/CONNECTED and above 0.2 C so
//! bleed heat never stacks on top of charge heat.

use crate::config::{
    BALANCE_MAX_CURRENT_MA, BALANCE_THRESHOLD_MV, CELLS_PER_MODULE, N_MODULES,
};
use crate::hal::BmsHal;
use crate::types::{PackMode, PackState};

#[derive(Debug, Clone, Default)]
pub struct BalanceState {
    cell_mask: [u16; N_MODULES],
    active: bool,
}

impl BalanceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mask(&self, module: usize) -> u16 {
        self.cell_mask[module]
    }

    /// Recompute and push the balance masks for one cycle.
    pub fn run<H: BmsHal>(&mut self, hal: &mut H, pack: &PackState) {
        let gated = !matches!(pack.mode, PackMode::Ready | PackMode::Connected)
            || pack.pack_current_ma.unsigned_abs() > BALANCE_MAX_CURRENT_MA as u32
            || pack.imbalance_mv() <= BALANCE_THRESHOLD_MV;

        if gated {
            self.disable_all(hal);
            return;
        }

        let bleed_above_mv = pack.min_cell_mv + BALANCE_THRESHOLD_MV / 2;
        self.active = true;

        for module in 0..N_MODULES {
            let mut mask: u16 = 0;
            for cell in 0..CELLS_PER_MODULE {
                let v = pack.cell_mv[module * CELLS_PER_MODULE + cell];
                if v > bleed_above_mv {
                    mask |= 1 << cell;
                }
            }
            self.cell_mask[module] = mask;
            let _ = hal.set_balance_mask(module, mask);
        }
    }

    fn disable_all<H: BmsHal>(&mut self, hal: &mut H) {
        if !self.active {
            return;
        }
        for module in 0..N_MODULES {
            self.cell_mask[module] = 0;
            let _ = hal.set_balance_mask(module, 0);
        }
        self.active = false;
    }
}
