//! Core types shared by every ND layer: constants, configuration,
//! identifiers and errors.

pub mod constants;
mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
