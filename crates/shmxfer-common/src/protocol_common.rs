use std::fmt;

use rustix::fs::Mode;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{FileNameTooLongSnafu, Result, XferError};

/// Capacity of the shared buffer, and therefore the largest chunk.
pub const CHUNK_CAPACITY: usize = 1000;

/// File names must be strictly shorter than this many bytes.
pub const MAX_FILE_NAME_LEN: usize = 100;

/// Project id handed to ftok alongside the marker path.
pub const KEY_DISCRIMINANT: u8 = b'a';

/// Well-known marker both roles derive the channel key from.
pub const DEFAULT_KEY_FILE: &str = "keyfile.txt";
pub const KEY_FILE_CONTENTS: &[u8] = b"Hello world";

/// Largest encoded control message. A maximal file name plus CBOR framing
/// stays well below this.
pub const MAX_CONTROL_PAYLOAD: usize = 256;

pub const RW_MODE: Mode = Mode::from_bits_retain(0o600);

/// Discriminant used for selective receipt on the control channel.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DataReady = 1,
    DataAck = 2,
    FileNameTransfer = 3,
}

impl MessageKind {
    /// Value placed in the System V `mtype` field.
    #[inline]
    pub const fn mtype(self) -> libc::c_long {
        self as libc::c_long
    }
}

/// A name short enough to travel in a single control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(
            name.len() < MAX_FILE_NAME_LEN,
            FileNameTooLongSnafu {
                len: name.len(),
                max: MAX_FILE_NAME_LEN,
            }
        );
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FileName {
    type Error = XferError;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<FileName> for String {
    fn from(name: FileName) -> Self {
        name.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything that travels over the control channel. There is no version
/// field: both ends have to be built from the same source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    FileNameTransfer { name: FileName },
    /// `size` bytes of the shared buffer are valid. Zero ends the stream.
    DataReady { size: usize },
    DataAck,
}

impl ControlMessage {
    pub const END_OF_STREAM: Self = Self::DataReady { size: 0 };

    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::FileNameTransfer { .. } => MessageKind::FileNameTransfer,
            Self::DataReady { .. } => MessageKind::DataReady,
            Self::DataAck => MessageKind::DataAck,
        }
    }

    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::DataReady { size: 0 })
    }
}
