use std::sync::{Mutex, MutexGuard};

use crate::error::EngineError;

/// Lock a mutex, recovering the guard if a panicking worker poisoned it.
///
/// Shared state here (the Buffer, the sink queue, the first-error slot) stays
/// consistent across a panic: every update is a single assignment or a
/// single stream call.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(lock = %what, "lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Error for a blocking task that panicked or was cancelled.
pub(crate) fn join_failure(what: &str, e: tokio::task::JoinError) -> EngineError {
    let message = if e.is_panic() {
        panic_message(e.into_panic().as_ref())
    } else {
        e.to_string()
    };
    EngineError::WorkerPanicked { worker: what.to_string(), message }
}
