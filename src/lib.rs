//! LoRaWAN end-device core: secure element, Remote Multicast Setup package
//! and the software timer service that schedules multicast sessions.

pub mod config;
pub mod device;
pub mod lorawan;
pub mod multicast;
pub mod package;
pub mod pkcs11;
pub mod secure_element;
pub mod timer;
pub mod udp;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `m`, recovering the guard if a previous holder panicked
pub(crate) fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
