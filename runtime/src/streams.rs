//! Standard stream abstractions.
//!
//! The driver plugs stdin/stdout/stderr in as trait objects; both sides may
//! be async. The helpers here cover the common cases: a preloaded stdin
//! buffer, a UTF-8 decoding stdout callback, and a line-splitting variant.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;

use crate::abi::Errno;

/// Byte source for fd 0.
#[async_trait(?Send)]
pub trait InputStream {
    /// Read up to `len` bytes. An empty result means end of input.
    async fn read(&self, len: usize) -> Result<Vec<u8>, Errno>;
}

/// Byte sink for fds 1 and 2.
#[async_trait(?Send)]
pub trait OutputStream {
    async fn write(&self, data: &[u8]) -> Result<(), Errno>;
}

/// Always-empty stdin.
pub struct NullIn;

#[async_trait(?Send)]
impl InputStream for NullIn {
    async fn read(&self, _len: usize) -> Result<Vec<u8>, Errno> {
        Ok(Vec::new())
    }
}

/// Discarding output.
pub struct SinkOut;

#[async_trait(?Send)]
impl OutputStream for SinkOut {
    async fn write(&self, _data: &[u8]) -> Result<(), Errno> {
        Ok(())
    }
}

struct BufferIn {
    remaining: RefCell<Vec<u8>>,
}

#[async_trait(?Send)]
impl InputStream for BufferIn {
    async fn read(&self, len: usize) -> Result<Vec<u8>, Errno> {
        let mut remaining = self.remaining.borrow_mut();
        let take = len.min(remaining.len());
        Ok(remaining.drain(..take).collect())
    }
}

/// Serve stdin from a preloaded buffer; reads past the end return EOF.
pub fn buffer_in(bytes: impl Into<Vec<u8>>) -> Rc<dyn InputStream> {
    Rc::new(BufferIn {
        remaining: RefCell::new(bytes.into()),
    })
}

struct StringOut {
    cb: RefCell<Box<dyn FnMut(&str)>>,
    pending: RefCell<Vec<u8>>,
}

#[async_trait(?Send)]
impl OutputStream for StringOut {
    async fn write(&self, data: &[u8]) -> Result<(), Errno> {
        let mut pending = self.pending.borrow_mut();
        pending.extend_from_slice(data);
        // Emit the longest valid prefix; an incomplete UTF-8 sequence at
        // the end waits for the next write.
        let valid = match core::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(err) => err.valid_up_to(),
        };
        if valid > 0 {
            let chunk: Vec<u8> = pending.drain(..valid).collect();
            let text = core::str::from_utf8(&chunk).map_err(|_| Errno::Inval)?;
            (self.cb.borrow_mut())(text);
        }
        Ok(())
    }
}

/// Decode output as UTF-8 and hand each decoded chunk to `cb`.
pub fn string_out(cb: impl FnMut(&str) + 'static) -> Rc<dyn OutputStream> {
    Rc::new(StringOut {
        cb: RefCell::new(Box::new(cb)),
        pending: RefCell::new(Vec::new()),
    })
}

/// Decode output as UTF-8 and hand `cb` one line at a time (without the
/// trailing newline).
pub fn line_out(mut cb: impl FnMut(&str) + 'static) -> Rc<dyn OutputStream> {
    let mut acc = String::new();
    string_out(move |chunk| {
        acc.push_str(chunk);
        while let Some(at) = acc.find('\n') {
            let rest = acc.split_off(at + 1);
            acc.pop();
            cb(&acc);
            acc = rest;
        }
    })
}

// ─── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn buffer_in_reads_then_eof() {
        let stdin = buffer_in("hello world");
        assert_eq!(block_on(stdin.read(5)).unwrap(), b"hello");
        assert_eq!(block_on(stdin.read(64)).unwrap(), b" world");
        assert_eq!(block_on(stdin.read(64)).unwrap(), b"");
    }

    #[test]
    fn string_out_handles_split_utf8() {
        let seen = Rc::new(RefCell::new(Vec::<String>::new()));
        let sink = seen.clone();
        let stdout = string_out(move |s| sink.borrow_mut().push(s.to_string()));

        // "é" is two bytes; split it across writes.
        block_on(stdout.write(&[b'a', 0xC3])).unwrap();
        block_on(stdout.write(&[0xA9, b'b'])).unwrap();
        assert_eq!(seen.borrow().join(""), "aéb");
        assert_eq!(seen.borrow()[0], "a");
    }

    #[test]
    fn line_out_splits_on_newlines() {
        let seen = Rc::new(RefCell::new(Vec::<String>::new()));
        let sink = seen.clone();
        let stdout = line_out(move |s| sink.borrow_mut().push(s.to_string()));

        block_on(stdout.write(b"one\ntw")).unwrap();
        block_on(stdout.write(b"o\nthree")).unwrap();
        assert_eq!(*seen.borrow(), ["one", "two"]);
    }
}
