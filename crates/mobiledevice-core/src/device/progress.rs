//! Progress reporting for long-running secure-service calls.
//!
//! The native layer invokes the progress callback on a thread of its choosing.
//! The trampoline converts the payload and posts it to an unbounded channel,
//! so the native thread never waits on the consumer.

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crossbeam_channel::{Receiver, Sender, unbounded};
use plist::{Dictionary, Value};
use tracing::{trace, warn};

use crate::cf;
use crate::ffi::{CFDictionaryRef, ProgressCallback};

/// One progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub payload: Dictionary,
}

impl Progress {
    /// `PercentComplete`, when the payload carries it.
    pub fn percent_complete(&self) -> Option<u64> {
        match self.payload.get("PercentComplete")? {
            Value::Integer(n) => n.as_unsigned(),
            Value::Real(r) if *r >= 0.0 => Some(*r as u64),
            _ => None,
        }
    }

    /// `Status`, e.g. `CopyingFile` or `Complete`.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("Status").and_then(Value::as_string)
    }
}

pub type ProgressReceiver = Receiver<Progress>;

/// Sending half of a progress channel, passed to the long-running calls.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: Sender<Progress>,
}

impl ProgressSink {
    pub fn emit(&self, payload: Dictionary) {
        if self.sender.try_send(Progress { payload }).is_err() {
            trace!("Progress receiver dropped; discarding report");
        }
    }
}

pub fn progress_channel() -> (ProgressSink, ProgressReceiver) {
    let (sender, receiver) = unbounded();
    (ProgressSink { sender }, receiver)
}

/// Callback/context pair to hand to the native call.
///
/// The context borrows `sink`; the native call is synchronous, so the borrow
/// outlives every invocation.
pub(crate) fn native_callback(sink: Option<&ProgressSink>) -> (Option<ProgressCallback>, *mut c_void) {
    match sink {
        Some(sink) => (
            Some(progress_trampoline as ProgressCallback),
            (sink as *const ProgressSink).cast_mut().cast(),
        ),
        None => (None, std::ptr::null_mut()),
    }
}

unsafe extern "C" fn progress_trampoline(progress: CFDictionaryRef, context: *mut c_void) {
    if context.is_null() {
        return;
    }
    // SAFETY: `native_callback` passed a pointer to a live `ProgressSink`.
    let sink = unsafe { &*(context as *const ProgressSink) };
    // SAFETY: the dictionary is owned by the native layer for the duration of the callback.
    let converted = catch_unwind(AssertUnwindSafe(|| unsafe { cf::borrow_value(progress) }));
    match converted {
        Ok(Ok(Some(Value::Dictionary(payload)))) => sink.emit(payload),
        Ok(Ok(_)) => trace!("Progress callback without a dictionary payload"),
        Ok(Err(e)) => warn!(error = %e, "Could not convert progress payload"),
        Err(_) => warn!("Panic while converting progress payload"),
    }
}
