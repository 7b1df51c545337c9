//! The invocation log: everything the user sees for one action.
//!
//! Bytes written here land in an in-memory buffer that the progress flusher
//! periodically consumes into the build-event stream, and are mirrored to
//! this process's stderr on a best-effort basis so the executor's own logs
//! stay useful.

use std::io::Write as _;
use std::sync::Mutex;

use crate::process::OutputSink;

type WriteListener = Box<dyn Fn(usize) + Send + Sync>;

pub struct InvocationLog {
    buffer: Mutex<Vec<u8>>,
    listener: Mutex<Option<WriteListener>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        }
    }

    /// Install the single write listener. It is invoked after every write,
    /// outside the buffer lock, with the buffered size at the time of the
    /// write, so it may itself trigger a [`consume`](Self::consume).
    pub fn set_write_listener(&self, listener: impl Fn(usize) + Send + Sync + 'static) {
        *self.listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Append `bytes` to the buffer and mirror them to stderr. Stderr write
    /// failures are swallowed.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let buffered = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.extend_from_slice(bytes);
            buffer.len()
        };
        let _ = std::io::stderr().write_all(bytes);
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(buffered);
        }
        bytes.len()
    }

    /// Append a line.
    pub fn write_line(&self, line: impl AsRef<str>) {
        let mut bytes = line.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(&bytes);
    }

    /// Atomically take all bytes written since the last consume.
    pub fn consume(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

impl Default for InvocationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for InvocationLog {
    fn write_output(&self, bytes: &[u8]) {
        self.write(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn consume_drains_the_buffer_exactly_once() {
        let log = InvocationLog::new();
        log.write(b"alpha ");
        log.write_line("beta");
        assert_eq!(log.consume(), b"alpha beta\n");
        // Nothing is handed out twice.
        assert!(log.consume().is_empty());
        // Bytes written after a consume are not lost.
        log.write(b"gamma");
        assert_eq!(log.consume(), b"gamma");
    }

    #[test]
    fn listener_sees_the_buffered_size() {
        let log = Arc::new(InvocationLog::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_listener = seen.clone();
        log.set_write_listener(move |len| {
            seen_by_listener.store(len, Ordering::SeqCst);
        });
        log.write(b"12345");
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        log.write(b"678");
        assert_eq!(seen.load(Ordering::SeqCst), 8);
        log.consume();
        log.write(b"9");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_consume_without_deadlocking() {
        let log = Arc::new(InvocationLog::new());
        let inner = log.clone();
        log.set_write_listener(move |len| {
            if len >= 4 {
                inner.consume();
            }
        });
        log.write(b"abcd");
        assert_eq!(log.buffered_len(), 0);
    }
}
