//! In-process stand-ins for the shared buffer and the control channel.
//!
//! Both halves of a transfer can run on two threads of one process against
//! these, and the channel keeps a log of every send and receive so tests can
//! check the ordering the handshake promises.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use snafu::ensure;

use crate::{
    control::ControlChannel,
    error::{ChunkTooLargeSnafu, Result},
    protocol_common::{ControlMessage, MessageKind},
    shared_buffer::ChunkBuffer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Sent {
        by: &'static str,
        msg: ControlMessage,
    },
    Received {
        by: &'static str,
        msg: ControlMessage,
    },
}

#[derive(Default)]
struct Inner {
    queue: Mutex<State>,
    arrived: Condvar,
}

#[derive(Default)]
struct State {
    pending: VecDeque<ControlMessage>,
    log: Vec<Event>,
}

/// One endpoint of an in-memory control channel. Clones made with
/// [`LoopbackChannel::endpoint`] share the queue and the log.
#[derive(Clone)]
pub struct LoopbackChannel {
    inner: Arc<Inner>,
    label: &'static str,
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            label: "anonymous",
        }
    }

    /// Another handle on the same queue whose actions are logged as `label`.
    pub fn endpoint(&self, label: &'static str) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            label,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log(&self) -> Vec<Event> {
        self.state().log.clone()
    }

    /// Messages sent by `label`, in order.
    pub fn sent_by(&self, label: &str) -> Vec<ControlMessage> {
        self.state()
            .log
            .iter()
            .filter_map(|ev| match ev {
                Event::Sent { by, msg } if *by == label => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }
}

impl ControlChannel for LoopbackChannel {
    fn send(&self, msg: &ControlMessage) -> Result<()> {
        let mut state = self.state();
        state.pending.push_back(msg.clone());
        state.log.push(Event::Sent {
            by: self.label,
            msg: msg.clone(),
        });
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    fn receive(&self, kind: MessageKind) -> Result<ControlMessage> {
        let mut state = self.state();
        loop {
            let found = state.pending.iter().position(|m| m.kind() == kind);
            if let Some(msg) = found.and_then(|pos| state.pending.remove(pos)) {
                state.log.push(Event::Received {
                    by: self.label,
                    msg: msg.clone(),
                });
                return Ok(msg);
            }
            state = self
                .inner
                .arrived
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Heap-backed [`ChunkBuffer`]; clones alias the same bytes.
#[derive(Clone)]
pub struct MemoryBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; capacity])),
        }
    }

    fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChunkBuffer for MemoryBuffer {
    fn capacity(&self) -> usize {
        self.bytes().len()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut region = self.bytes();
        let capacity = region.len();
        ensure!(
            bytes.len() <= capacity,
            ChunkTooLargeSnafu {
                len: bytes.len(),
                capacity,
            }
        );
        region[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, len: usize, staging: &mut Vec<u8>) -> Result<()> {
        let region = self.bytes();
        let capacity = region.len();
        ensure!(len <= capacity, ChunkTooLargeSnafu { len, capacity });
        staging.clear();
        staging.extend_from_slice(&region[..len]);
        Ok(())
    }
}
