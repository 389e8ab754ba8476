//! Pack and array controller core for a marine lithium-ion energy
//! storage system.
//!
//! This crate is the hardware-independent half of the ESS firmware: it
//! owns the per-cell read model, the protection engine, current-limit
//! derating, contactor sequencing, the pack operating-mode state machine
//! and the multi-pack DC-bus coordinator. Everything that touches a
//! peripheral (the cell-monitor ASICs, contactor GPIO, fault log,
//! persistent store) is reached through the [`hal::BmsHal`] capability
//! trait, so the same core runs on the target and on the host.
//!
//! All arithmetic is fixed-width integer; intermediate products that can
//! exceed 32 bits are widened to 64. There is no heap allocation.
//!
//! Entry points are periodic and non-blocking. A preemptive deployment
//! drives [`array::Controller::monitor_tick`], `protection_tick`,
//! `contactor_tick` and `state_tick` from separate tasks; a cooperative
//! deployment (and the test suite) calls [`array::Controller::tick`] or
//! steps a whole [`array::PackArray`].

#![cfg_attr(not(test), no_std)]

// This must go first, so that the macros are visible to the rest of the
// modules.
pub(crate) mod fmt;

pub mod array;
pub mod balance;
pub mod config;
pub mod contactor;
pub mod hal;
pub mod limits;
pub mod monitor;
pub mod protection;
pub mod shared;
pub mod soc;
pub mod state;
pub mod types;

pub use array::{Controller, PackArray};
pub use hal::BmsHal;
pub use types::{
    ContactorState, EmsCommand, EmsMessage, FaultFlags, PackMode, PackState, StatusSnapshot,
};
