//! Cross-task sharing of the pack record.
//!
//! The pack record is read by the monitor, protection, contactor, state
//! and communications tasks. Multi-field updates must be atomic from a
//! reader's point of view, so the record lives behind a blocking
//! critical-section mutex; tasks take the lock only for the duration of
//! one closure. The protection, contactor and estimator records are
//! owned by their tasks and never shared this way.
//!
//! Host tests provide the critical-section implementation through
//! `critical-section/std`.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::types::{PackState, StatusSnapshot};

/// A pack record shared between tasks.
pub struct SharedPack {
    inner: Mutex<CriticalSectionRawMutex, RefCell<PackState>>,
}

impl SharedPack {
    pub fn new(pack: PackState) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(pack)),
        }
    }

    /// Run `f` with exclusive access to the pack record.
    pub fn with<R>(&self, f: impl FnOnce(&mut PackState) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Consistent decoded status for the communications task.
    pub fn status(&self) -> StatusSnapshot {
        self.inner
            .lock(|cell| StatusSnapshot::capture(&cell.borrow()))
    }

    /// Full copy of the record, taken under the lock.
    pub fn snapshot(&self) -> PackState {
        self.inner.lock(|cell| cell.borrow().clone())
    }
}
