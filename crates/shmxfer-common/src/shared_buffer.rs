use std::io;

use memmap2::{MmapMut, MmapOptions};
use rustix::{
    fs::{fstat, ftruncate},
    io::Errno,
    shm,
};
use snafu::{ResultExt, ensure};
use tracing::{debug, info};

use crate::{
    error::{ChunkTooLargeSnafu, Result, SharedMemorySnafu},
    key::ChannelKey,
    protocol_common::RW_MODE,
};

/// A bounded byte region both roles can see.
///
/// Holds exactly one chunk. There is no length prefix inside the region: the
/// number of valid bytes travels in the `DataReady` message that hands the
/// region to the reader.
pub trait ChunkBuffer {
    fn capacity(&self) -> usize;

    /// Replaces the head of the region with `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Copies the first `len` bytes of the region into `staging`, replacing
    /// whatever it held.
    fn read(&self, len: usize, staging: &mut Vec<u8>) -> Result<()>;
}

pub struct SharedBuffer {
    name: String,
    map: MmapMut,
    capacity: usize,
}

impl SharedBuffer {
    /// Opens the object for `key`, creating and sizing it if this process is
    /// first. A second caller attaches to the same object.
    pub fn create_or_attach(key: ChannelKey, capacity: usize) -> Result<Self> {
        let name = key.shm_name();

        let fd = shm::open(
            name.as_str(),
            shm::OFlags::CREATE | shm::OFlags::RDWR,
            RW_MODE,
        )
        .map_err(io::Error::from)
        .context(SharedMemorySnafu { op: "open", name: &name })?;

        let st = fstat(&fd)
            .map_err(io::Error::from)
            .context(SharedMemorySnafu { op: "fstat", name: &name })?;
        // whoever arrives first sizes it; growing to the same length twice
        // is harmless
        if st.st_size < capacity as i64 {
            ftruncate(&fd, capacity as u64)
                .map_err(io::Error::from)
                .context(SharedMemorySnafu {
                    op: "ftruncate",
                    name: &name,
                })?;
        }

        let map = unsafe { MmapOptions::new().len(capacity).map_mut(&fd) }
            .context(SharedMemorySnafu { op: "mmap", name: &name })?;

        info!("attached shared buffer {name} ({capacity} bytes)");
        Ok(Self {
            name,
            map,
            capacity,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unmaps and removes the object. Other processes keep their mapping
    /// until they exit, but nobody can attach to it any more.
    pub fn release(self) -> Result<()> {
        let Self { name, map, .. } = self;
        drop(map);
        unlink(&name)
    }
}

/// Removes the named object. Already gone counts as success so that both
/// the interrupt path and the normal path can call this.
pub fn unlink(name: &str) -> Result<()> {
    match shm::unlink(name) {
        Ok(()) => {
            info!("removed shared buffer {name}");
            Ok(())
        }
        Err(Errno::NOENT) => {
            debug!("shared buffer {name} already removed");
            Ok(())
        }
        Err(e) => Err(io::Error::from(e))
            .context(SharedMemorySnafu { op: "unlink", name }),
    }
}

impl ChunkBuffer for SharedBuffer {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        ensure!(
            bytes.len() <= self.capacity,
            ChunkTooLargeSnafu {
                len: bytes.len(),
                capacity: self.capacity,
            }
        );
        self.map[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, len: usize, staging: &mut Vec<u8>) -> Result<()> {
        ensure!(
            len <= self.capacity,
            ChunkTooLargeSnafu {
                len,
                capacity: self.capacity,
            }
        );
        staging.clear();
        staging.extend_from_slice(&self.map[..len]);
        Ok(())
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
