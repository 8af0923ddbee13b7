//! Unwinding recovery utilities.

use alloc::boxed::Box;
use alloc::string::String;
use core::any::Any;
use core::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::thread::Result;

use tracing::error;

/// Executes `f` and captures any panic, translating that panic into a
/// `Err` result. Job bodies are opaque to the scheduler, so their state is
/// treated as exception safe: the scheduler's own bookkeeping never lives
/// inside the closure.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

/// Extracts the message from a panic payload, if it carries one.
pub fn payload_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// The panic handler used when none is configured.
#[cold]
pub fn log_panic(payload: Box<dyn Any + Send>) {
    match payload_message(payload.as_ref()) {
        Some(message) => error!("job panicked: {}", message),
        None => error!("job panicked with a non-string payload"),
    }
}

/// Aborts the program when dropped. Armed around code that must not unwind
/// into the scheduler, such as a user-supplied panic handler.
pub struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        std::eprintln!("jobsteal: panic handler panicked; aborting");
        std::process::abort();
    }
}
