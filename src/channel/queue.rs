//! Outbound command queue of a channel.
//!
//! The radio link is half-duplex, so a channel keeps at most one command in
//! flight. The head of the queue is always the command on the air; every
//! other entry waits until the head is resolved. A waiting entry is replaced
//! when a newer command with the same message id arrives.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

/// Receives the resolution of a queued command.
pub type Reply = oneshot::Sender<Result<()>>;

/// A command that has to be written to the device now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Sequence number identifying the queue entry.
    pub seq: u64,
    /// Frame to write.
    pub frame: Bytes,
    /// Time after which the command fails, if any.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    msg_id: u8,
    frame: Bytes,
    timeout: Option<Duration>,
    reply: Option<Reply>,
    timer: Option<AbortHandle>,
}

impl Pending {
    fn resolve(mut self, result: Result<()>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(reply) = self.reply.take() {
            // the caller may have given up waiting
            let _ = reply.send(result);
        }
    }

    fn outgoing(&self) -> Outgoing {
        Outgoing {
            seq: self.seq,
            frame: self.frame.clone(),
            timeout: self.timeout,
        }
    }
}

/// Per-channel command queue with a single in-flight entry.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<Pending>,
    next_seq: u64,
}

impl CommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a command is waiting for its response.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Returns the number of queued commands, including the one in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the message id of the command in flight.
    #[must_use]
    pub fn head_msg_id(&self) -> Option<u8> {
        self.entries.front().map(|p| p.msg_id)
    }

    /// Queues a command.
    ///
    /// Waiting commands with the same message id fail with
    /// [`Error::Superseded`]. Returns the command to write when the queue was
    /// idle.
    pub fn submit(
        &mut self,
        msg_id: u8,
        frame: Bytes,
        timeout: Option<Duration>,
        reply: Reply,
    ) -> Option<Outgoing> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let pending = Pending {
            seq,
            msg_id,
            frame,
            timeout,
            reply: Some(reply),
            timer: None,
        };

        if self.entries.is_empty() {
            let outgoing = pending.outgoing();
            self.entries.push_back(pending);
            return Some(outgoing);
        }

        // index 0 is on the air and cannot be replaced
        let mut index = 1;
        while index < self.entries.len() {
            if self.entries[index].msg_id == msg_id {
                if let Some(stale) = self.entries.remove(index) {
                    tracing::debug!("superseding queued command 0x{:02x}", msg_id);
                    stale.resolve(Err(Error::Superseded { msg_id }));
                }
            } else {
                index += 1;
            }
        }
        self.entries.push_back(pending);
        None
    }

    /// Stores the timer of the entry `seq`, aborting it if the entry is gone.
    pub fn set_timer(&mut self, seq: u64, timer: AbortHandle) {
        match self.entries.iter_mut().find(|p| p.seq == seq) {
            Some(pending) => pending.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Resolves the command in flight and returns the next one to write.
    pub fn resolve_head(&mut self, result: Result<()>) -> Option<Outgoing> {
        let head = self.entries.pop_front()?;
        head.resolve(result);
        self.entries.front().map(Pending::outgoing)
    }

    /// Fails the entry `seq` with a timeout if it is still in flight.
    ///
    /// Returns the next command to write.
    pub fn expire(&mut self, seq: u64) -> Option<Outgoing> {
        let head = self.entries.front_mut()?;
        if head.seq != seq {
            return None;
        }
        let timeout = head.timeout.unwrap_or_default();
        // the timer is the caller
        head.timer = None;
        tracing::debug!("command 0x{:02x} timed out", head.msg_id);
        self.resolve_head(Err(Error::timeout(timeout)))
    }

    /// Fails every queued command with [`Error::Flushed`].
    pub fn flush(&mut self) {
        for pending in self.entries.drain(..) {
            pending.resolve(Err(Error::Flushed));
        }
    }
}
