// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel log buffer.
//!
//! A byte ring shared by every task: `WriteLog` appends, `ReadLog` drains.
//! When the ring overflows, the oldest bytes are dropped; a slow reader
//! loses history, never liveness. One task at a time may register as the
//! log listener; the syscall layer posts `NewData` to it when fresh bytes
//! arrive, so a console server can sleep instead of polling.

use crate::config::KLOG_LEN;

pub struct LogRing {
    buf: [u8; KLOG_LEN],
    /// Monotonic counters; the ring index is the counter modulo the
    /// buffer length.
    read_pos: u64,
    write_pos: u64,
    listener: Option<usize>,
}

impl LogRing {
    pub fn new() -> Self {
        Self {
            buf: [0; KLOG_LEN],
            read_pos: 0,
            write_pos: 0,
            listener: None,
        }
    }

    /// Unread bytes currently buffered.
    pub fn len(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Appends `bytes`, discarding the oldest buffered bytes on overflow.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[(self.write_pos % KLOG_LEN as u64) as usize] = b;
            self.write_pos += 1;
            if self.len() > KLOG_LEN {
                self.read_pos = self.write_pos - KLOG_LEN as u64;
            }
        }
    }

    /// Drains up to `out.len()` bytes into `out`, returning the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        for slot in &mut out[..n] {
            *slot = self.buf[(self.read_pos % KLOG_LEN as u64) as usize];
            self.read_pos += 1;
        }
        n
    }

    /// Registers `task` as the one log listener (or clears it with
    /// `None`), replacing any previous listener.
    pub fn set_listener(&mut self, task: Option<usize>) {
        self.listener = task;
    }

    pub fn listener(&self) -> Option<usize> {
        self.listener
    }

    /// Drops the listener if it is `task`; called on task teardown.
    pub fn forget_listener(&mut self, task: usize) {
        if self.listener == Some(task) {
            self.listener = None;
        }
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Write for LogRing {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut ring = LogRing::new();
        ring.write(b"hello, log");
        let mut out = [0u8; 32];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"hello, log");
        assert!(ring.is_empty());
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn partial_reads_preserve_order() {
        let mut ring = LogRing::new();
        ring.write(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(&out[..2], b"ef");
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut ring = LogRing::new();
        ring.write(&[b'x'; KLOG_LEN]);
        ring.write(b"tail");
        assert_eq!(ring.len(), KLOG_LEN);
        let mut out = vec![0u8; KLOG_LEN];
        let n = ring.read(&mut out);
        assert_eq!(n, KLOG_LEN);
        assert_eq!(&out[n - 4..n], b"tail");
        // Everything before the tail is old filler.
        assert!(out[..n - 4].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn listener_bookkeeping() {
        let mut ring = LogRing::new();
        assert_eq!(ring.listener(), None);
        ring.set_listener(Some(3));
        assert_eq!(ring.listener(), Some(3));
        ring.forget_listener(2);
        assert_eq!(ring.listener(), Some(3));
        ring.forget_listener(3);
        assert_eq!(ring.listener(), None);
    }
}
