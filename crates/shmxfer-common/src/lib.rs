// System V message queues and POSIX shared memory are the only transport, so
// the whole crate is unix-only
#![cfg(unix)]

pub mod error;
pub mod key;
pub mod protocol_common;

pub mod control;
pub mod shared_buffer;

pub mod lifecycle;
pub mod transfer;

// in-process doubles for exercising the handshake without kernel objects
pub mod loopback;
