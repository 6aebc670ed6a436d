//! Single-credit flow control between the decoder and the connection state machine.
//!
//! Decoded objects arrive in bursts, as many as one socket read happens to
//! contain. The state machine instead pulls them one at a time, and only asks
//! for another socket read when it has an outstanding pull and nothing is
//! queued. That keeps pipelined input from being read ahead without bound and
//! hands objects over strictly in arrival order.

use std::collections::VecDeque;

pub(crate) struct Gate<T> {
    queue: VecDeque<T>,
    /// Downstream has asked for one more object that hasn't been delivered.
    read_requested: bool,
    /// A read burst is in progress.
    in_burst: bool,
}

impl<T> Gate<T> {
    pub fn new() -> Self {
        Gate {
            queue: VecDeque::new(),
            read_requested: false,
            in_burst: false,
        }
    }

    /// Downstream pulls one object. Delivers the oldest queued one, or
    /// records the demand so the next burst is read.
    pub fn request(&mut self) -> Option<T> {
        if let Some(t) = self.queue.pop_front() {
            self.read_requested = false;
            return Some(t);
        }
        self.read_requested = true;
        None
    }

    /// Whether the transport should be asked for another burst of bytes.
    pub fn wants_read(&self) -> bool {
        self.read_requested && !self.in_burst && self.queue.is_empty()
    }

    pub fn begin_burst(&mut self) {
        self.in_burst = true;
    }

    /// Queue an object that arrived during the current burst.
    pub fn offer(&mut self, t: T) {
        self.queue.push_back(t);
    }

    /// The current burst is done. If a pull is outstanding it is answered
    /// with the oldest queued object.
    pub fn complete_burst(&mut self) -> Option<T> {
        self.in_burst = false;
        if self.read_requested {
            if let Some(t) = self.queue.pop_front() {
                self.read_requested = false;
                return Some(t);
            }
        }
        None
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
