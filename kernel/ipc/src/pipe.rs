//! Byte-oriented pipe.
//!
//! A ring buffer shared by reader and writer handles with explicit
//! reader/writer counts. Readers sleeping on an empty pipe are woken by
//! writes; the last writer closing wakes readers into EOF, and the last
//! reader closing turns writes into `EPIPE`.

use alloc::boxed::Box;
use alloc::vec;

use bitflags::bitflags;

use cheviot_core::sync::{Rendez, SpinLock};
use cheviot_core::Errno;

/// Pipe capacity in bytes.
pub const PIPE_BUF_SZ: usize = 1024;

bitflags! {
    /// Readiness bits reported by [`Pipe::poll_events`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        /// Data (or EOF) available for reading.
        const POLLIN  = 1 << 0;
        /// Space (or broken pipe) available for writing.
        const POLLOUT = 1 << 1;
        /// All writers gone.
        const POLLHUP = 1 << 2;
    }
}

struct Ring {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    count: usize,
    reader_cnt: usize,
    writer_cnt: usize,
}

impl Ring {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let to_read = buf.len().min(self.count);
        let cap = self.data.len();
        for (i, byte) in buf.iter_mut().enumerate().take(to_read) {
            *byte = self.data[(self.read_pos + i) % cap];
        }
        self.read_pos = (self.read_pos + to_read) % cap;
        self.count -= to_read;
        to_read
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let cap = self.data.len();
        let available = cap - self.count;
        let to_write = buf.len().min(available);
        for (i, byte) in buf.iter().enumerate().take(to_write) {
            self.data[(self.write_pos + i) % cap] = *byte;
        }
        self.write_pos = (self.write_pos + to_write) % cap;
        self.count += to_write;
        to_write
    }
}

/// An anonymous pipe attached to a FIFO v-node.
pub struct Pipe {
    ring: SpinLock<Ring>,
    /// Woken when data arrives or the last writer leaves.
    pub read_rendez: Rendez,
    /// Woken when space frees up or the last reader leaves.
    pub write_rendez: Rendez,
}

impl Pipe {
    /// Creates a pipe with one reader and one writer reference.
    pub fn new() -> Self {
        Self {
            ring: SpinLock::new(Ring {
                data: vec![0u8; PIPE_BUF_SZ].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                count: 0,
                reader_cnt: 1,
                writer_cnt: 1,
            }),
            read_rendez: Rendez::new(),
            write_rendez: Rendez::new(),
        }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.ring.lock().count
    }

    /// Adds a reader reference (dup, fork).
    pub fn add_reader(&self) {
        self.ring.lock().reader_cnt += 1;
    }

    /// Adds a writer reference.
    pub fn add_writer(&self) {
        self.ring.lock().writer_cnt += 1;
    }

    /// Drops a reader reference; the last one breaks the pipe for writers.
    pub fn remove_reader(&self) {
        let last = {
            let mut ring = self.ring.lock();
            ring.reader_cnt -= 1;
            ring.reader_cnt == 0
        };
        if last {
            self.write_rendez.wakeup_all();
        }
    }

    /// Drops a writer reference; the last one turns reads into EOF.
    pub fn remove_writer(&self) {
        let last = {
            let mut ring = self.ring.lock();
            ring.writer_cnt -= 1;
            ring.writer_cnt == 0
        };
        if last {
            self.read_rendez.wakeup_all();
        }
    }

    /// Reads up to `buf.len()` bytes, sleeping while the pipe is empty and
    /// writers remain. Returns 0 at EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut ring = self.ring.lock();
                if ring.count > 0 {
                    let n = ring.read(buf);
                    drop(ring);
                    self.write_rendez.wakeup();
                    return Ok(n);
                }
                if ring.writer_cnt == 0 {
                    return Ok(0); // EOF
                }
            }
            self.read_rendez.wait().await;
        }
    }

    /// Writes up to `buf.len()` bytes, sleeping while the pipe is full and
    /// readers remain.
    ///
    /// # Errors
    ///
    /// `EPIPE` once every reader is gone.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut ring = self.ring.lock();
                if ring.reader_cnt == 0 {
                    return Err(Errno::EPIPE);
                }
                if ring.count < ring.data.len() {
                    let n = ring.write(buf);
                    drop(ring);
                    self.read_rendez.wakeup();
                    return Ok(n);
                }
            }
            self.write_rendez.wait().await;
        }
    }

    /// Current readiness, for poll/kevent filters.
    pub fn poll_events(&self) -> PollEvents {
        let ring = self.ring.lock();
        let mut events = PollEvents::empty();
        if ring.count > 0 || ring.writer_cnt == 0 {
            events |= PollEvents::POLLIN;
        }
        if ring.count < ring.data.len() || ring.reader_cnt == 0 {
            events |= PollEvents::POLLOUT;
        }
        if ring.writer_cnt == 0 {
            events |= PollEvents::POLLHUP;
        }
        events
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheviot_sched::try_poll_immediate;

    #[test]
    fn write_then_read_roundtrip() {
        let pipe = Pipe::new();
        let n = try_poll_immediate(pipe.write(b"HELLO\n")).unwrap().unwrap();
        assert_eq!(n, 6);

        let mut buf = [0u8; 16];
        let n = try_poll_immediate(pipe.read(&mut buf)).unwrap().unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], b"HELLO\n");
    }

    #[test]
    fn read_blocks_on_empty_pipe() {
        let pipe = Pipe::new();
        let mut buf = [0u8; 4];
        assert!(try_poll_immediate(pipe.read(&mut buf)).is_none());
    }

    #[test]
    fn eof_when_writers_gone() {
        let pipe = Pipe::new();
        pipe.remove_writer();
        let mut buf = [0u8; 4];
        let n = try_poll_immediate(pipe.read(&mut buf)).unwrap().unwrap();
        assert_eq!(n, 0, "EOF once the last writer closed");
    }

    #[test]
    fn buffered_data_survives_writer_close() {
        let pipe = Pipe::new();
        try_poll_immediate(pipe.write(b"tail")).unwrap().unwrap();
        pipe.remove_writer();

        let mut buf = [0u8; 16];
        let n = try_poll_immediate(pipe.read(&mut buf)).unwrap().unwrap();
        assert_eq!(&buf[..n], b"tail");
        let n = try_poll_immediate(pipe.read(&mut buf)).unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn epipe_when_readers_gone() {
        let pipe = Pipe::new();
        pipe.remove_reader();
        let result = try_poll_immediate(pipe.write(b"x")).unwrap();
        assert_eq!(result, Err(Errno::EPIPE));
    }

    #[test]
    fn write_blocks_when_full() {
        let pipe = Pipe::new();
        let big = vec![7u8; PIPE_BUF_SZ];
        let n = try_poll_immediate(pipe.write(&big)).unwrap().unwrap();
        assert_eq!(n, PIPE_BUF_SZ);
        assert!(try_poll_immediate(pipe.write(b"x")).is_none(), "full pipe blocks");

        // Draining makes space and a retry succeeds.
        let mut buf = [0u8; 8];
        try_poll_immediate(pipe.read(&mut buf)).unwrap().unwrap();
        let n = try_poll_immediate(pipe.write(b"x")).unwrap().unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn short_write_wraps_ring() {
        let pipe = Pipe::new();
        // Fill, drain half, then write across the wrap point.
        try_poll_immediate(pipe.write(&vec![1u8; PIPE_BUF_SZ])).unwrap().unwrap();
        let mut buf = vec![0u8; PIPE_BUF_SZ / 2];
        try_poll_immediate(pipe.read(&mut buf)).unwrap().unwrap();

        let n = try_poll_immediate(pipe.write(&vec![2u8; PIPE_BUF_SZ]))
            .unwrap()
            .unwrap();
        assert_eq!(n, PIPE_BUF_SZ / 2, "partial write up to capacity");

        let mut rest = vec![0u8; PIPE_BUF_SZ];
        let n = try_poll_immediate(pipe.read(&mut rest)).unwrap().unwrap();
        assert_eq!(n, PIPE_BUF_SZ);
        assert!(rest[..PIPE_BUF_SZ / 2].iter().all(|&b| b == 1));
        assert!(rest[PIPE_BUF_SZ / 2..].iter().all(|&b| b == 2));
    }

    #[test]
    fn poll_events_track_state() {
        let pipe = Pipe::new();
        assert_eq!(pipe.poll_events(), PollEvents::POLLOUT);

        try_poll_immediate(pipe.write(b"x")).unwrap().unwrap();
        assert!(pipe.poll_events().contains(PollEvents::POLLIN));

        pipe.remove_writer();
        assert!(pipe.poll_events().contains(PollEvents::POLLHUP));
    }
}
