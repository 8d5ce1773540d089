// MIT License - Copyright (c) 2021 TJForc
// Zones and areas mirrored from the panel

pub mod area;
pub mod zone;

pub use area::{Area, AreaStatusFlags};
pub use zone::{Zone, ZoneStatusFlags};

use std::sync::Mutex;

use crate::constants::Channel;
use crate::error::AtsError;

/// Commands accepted for a zone or area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Re-read status from the panel and republish
    Refresh,
    /// Drive a channel (only the area `set` channel acts on the panel)
    Switch { channel: Channel, on: bool },
}

/// Value to publish for a boolean channel derived from two snapshots.
///
/// Becoming true publishes ON, becoming or staying false publishes OFF,
/// staying true publishes nothing.
pub fn channel_update(was: bool, is: bool) -> Option<bool> {
    match (was, is) {
        (true, true) => None,
        (_, now) => Some(now),
    }
}

/// Whether a failed status fetch is the entity's own fault and should latch
/// it. Transport faults and an offline bridge are not.
pub(crate) fn latches_entity(err: &AtsError) -> bool {
    !err.is_transport() && !matches!(err, AtsError::Offline)
}

/// Mutable part of a zone or area.
#[derive(Debug, Clone)]
pub(crate) struct EntityState<F> {
    pub name: Option<String>,
    pub online: bool,
    /// Set when the panel refused a status fetch. Never cleared automatically.
    pub in_error: bool,
    pub previous: F,
    pub last: F,
}

/// Lock wrapper shared by [`Zone`] and [`Area`].
#[derive(Debug)]
pub(crate) struct EntityCell<F> {
    inner: Mutex<EntityState<F>>,
}

impl<F: Copy> EntityCell<F> {
    pub fn new(name: Option<String>, empty: F) -> Self {
        Self {
            inner: Mutex::new(EntityState {
                name,
                online: false,
                in_error: false,
                previous: empty,
                last: empty,
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut EntityState<F>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Shift `last` into `previous` and store `status`. Returns (previous, last).
    pub fn push_status(&self, status: F) -> (F, F) {
        self.with(|s| {
            s.previous = s.last;
            s.last = status;
            (s.previous, s.last)
        })
    }
}
