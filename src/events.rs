//! Application event callbacks
//!
//! All callbacks run under one event mutex, so a message can never be
//! observed before open or after close. Close fires at most once; after
//! it, message and error emission is suppressed.
//!
//! Callback panics are trapped: a panicking error callback is swallowed,
//! panics elsewhere are reported to the caller so it can escalate.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

/// Kind of a complete data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text payload
    Text,
    /// Binary payload
    Binary,
}

/// A fully assembled inbound message, handed to the application by value
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Text or Binary
    pub kind: MessageKind,
    /// Assembled, decompressed payload
    pub data: Bytes,
}

/// Delivered once when the connection reaches its terminal state
#[derive(Debug, Clone)]
pub struct CloseEvent {
    /// True when the close handshake completed in both directions in time
    pub was_clean: bool,
    /// Close status code (1005 when the peer sent none)
    pub code: u16,
    /// Close reason text
    pub reason: String,
}

type OpenFn = Box<dyn Fn() + Send>;
type MessageFn = Box<dyn Fn(MessageEvent) + Send>;
type ErrorFn = Box<dyn Fn(&str) + Send>;
type CloseFn = Box<dyn Fn(CloseEvent) + Send>;

#[derive(Default)]
struct Callbacks {
    open: Option<OpenFn>,
    message: Option<MessageFn>,
    error: Option<ErrorFn>,
    close: Option<CloseFn>,
}

/// Callback registry and emission serializer.
///
/// The inner mutex is the event lock: held for the duration of every user
/// callback. Handlers must not call back into the owning connection
/// synchronously.
#[derive(Default)]
pub struct EventSink {
    callbacks: Mutex<Callbacks>,
    close_emitted: AtomicBool,
}

impl EventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the open callback
    pub fn set_on_open(&self, f: impl Fn() + Send + 'static) {
        self.callbacks.lock().open = Some(Box::new(f));
    }

    /// Register the message callback
    pub fn set_on_message(&self, f: impl Fn(MessageEvent) + Send + 'static) {
        self.callbacks.lock().message = Some(Box::new(f));
    }

    /// Register the error callback
    pub fn set_on_error(&self, f: impl Fn(&str) + Send + 'static) {
        self.callbacks.lock().error = Some(Box::new(f));
    }

    /// Register the close callback
    pub fn set_on_close(&self, f: impl Fn(CloseEvent) + Send + 'static) {
        self.callbacks.lock().close = Some(Box::new(f));
    }

    /// Check whether close has been delivered
    pub fn close_was_emitted(&self) -> bool {
        self.close_emitted.load(Ordering::Acquire)
    }

    /// Emit open. Returns false when the callback panicked.
    #[must_use]
    pub fn emit_open(&self) -> bool {
        let cbs = self.callbacks.lock();
        let Some(f) = cbs.open.as_ref() else {
            return true;
        };
        catch_unwind(AssertUnwindSafe(f)).is_ok()
    }

    /// Emit a message. Returns false when the callback panicked.
    /// Suppressed after close.
    #[must_use]
    pub fn emit_message(&self, event: MessageEvent) -> bool {
        let cbs = self.callbacks.lock();
        // Checked under the lock: emit_close sets the flag before taking
        // it, so a caller that lost the race observes the flag here.
        if self.close_was_emitted() {
            return true;
        }
        let Some(f) = cbs.message.as_ref() else {
            return true;
        };
        catch_unwind(AssertUnwindSafe(|| f(event))).is_ok()
    }

    /// Emit an error diagnostic. Callback panics are swallowed.
    /// Suppressed after close.
    pub fn emit_error(&self, message: &str) {
        let cbs = self.callbacks.lock();
        if self.close_was_emitted() {
            return;
        }
        if let Some(f) = cbs.error.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| f(message))).is_err() {
                warn!("error callback panicked");
            }
        }
    }

    /// Emit close exactly once. Returns false when the callback panicked;
    /// repeat calls are no-ops that return true.
    pub fn emit_close(&self, event: CloseEvent) -> bool {
        if self.close_emitted.swap(true, Ordering::AcqRel) {
            return true;
        }
        let cbs = self.callbacks.lock();
        let Some(f) = cbs.close.as_ref() else {
            return true;
        };
        catch_unwind(AssertUnwindSafe(|| f(event))).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn close_fires_once() {
        let sink = EventSink::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sink.set_on_close(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let event = CloseEvent {
            was_clean: true,
            code: 1000,
            reason: String::new(),
        };
        assert!(sink.emit_close(event.clone()));
        assert!(sink.emit_close(event));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nothing_after_close() {
        let sink = EventSink::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sink.set_on_message(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = count.clone();
        sink.set_on_error(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sink.emit_close(CloseEvent {
            was_clean: false,
            code: 1011,
            reason: String::new(),
        });

        assert!(sink.emit_message(MessageEvent {
            kind: MessageKind::Text,
            data: Bytes::from_static(b"late"),
        }));
        sink.emit_error("late");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn message_panic_is_reported() {
        let sink = EventSink::new();
        sink.set_on_message(|_| panic!("boom"));
        assert!(!sink.emit_message(MessageEvent {
            kind: MessageKind::Binary,
            data: Bytes::new(),
        }));
    }

    #[test]
    fn error_panic_is_swallowed() {
        let sink = EventSink::new();
        sink.set_on_error(|_| panic!("boom"));
        sink.emit_error("diagnostic");
    }

    #[test]
    fn missing_callbacks_are_fine() {
        let sink = EventSink::new();
        assert!(sink.emit_open());
        assert!(sink.emit_message(MessageEvent {
            kind: MessageKind::Text,
            data: Bytes::new(),
        }));
        sink.emit_error("x");
        assert!(sink.emit_close(CloseEvent {
            was_clean: true,
            code: 1000,
            reason: String::new(),
        }));
    }
}
