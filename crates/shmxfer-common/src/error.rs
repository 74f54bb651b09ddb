use std::{backtrace::Backtrace, path::PathBuf};

use nix::errno::Errno;
use snafu::Snafu;

use crate::{protocol_common::MessageKind, transfer::SessionState};

pub type Result<T, E = XferError> = std::result::Result<T, E>;

/// Every failure is terminal to the process that observes it; nothing here
/// is retried.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum XferError {
    #[snafu(display("unable to prepare key file {}: {source}", path.display()))]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("ftok on {} failed: {source}", path.display()))]
    KeyDerivation {
        path: PathBuf,
        source: Errno,
        backtrace: Backtrace,
    },
    #[snafu(display("shared memory {op} on {name} failed: {source}"))]
    SharedMemory {
        op: &'static str,
        name: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("message queue {op} failed: {source}"))]
    MessageQueue {
        op: &'static str,
        source: Errno,
        backtrace: Backtrace,
    },
    #[snafu(display("CBOR error: {source}"))]
    Codec {
        source: serde_cbor::Error,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "control payload of {len} bytes exceeds the {max} byte message size"
    ))]
    PayloadTooLarge {
        len: usize,
        max: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("expected a {expected:?} message, got {got:?}"))]
    UnexpectedMessage {
        expected: MessageKind,
        got: MessageKind,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "chunk of {len} bytes does not fit the {capacity} byte shared buffer"
    ))]
    ChunkTooLarge {
        len: usize,
        capacity: usize,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "file name is {len} bytes, must be shorter than {max} bytes"
    ))]
    FileNameTooLong {
        len: usize,
        max: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("{name:?} does not name a file"))]
    InvalidFileName { name: String, backtrace: Backtrace },
    #[snafu(display("unable to open {}: {source}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("reading the source file failed: {source}"))]
    SourceIo {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("writing the destination file failed: {source}"))]
    DestinationIo {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("cannot {op} while the session is {state:?}"))]
    InvalidState {
        op: &'static str,
        state: SessionState,
        backtrace: Backtrace,
    },
    #[snafu(display("unable to install the interrupt handler: {source}"))]
    InterruptHandler {
        source: ctrlc::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("channels were released before {op} finished"))]
    Released {
        op: &'static str,
        backtrace: Backtrace,
    },
}
