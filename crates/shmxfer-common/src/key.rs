use std::{
    ffi::CString,
    fs::OpenOptions,
    io::{ErrorKind, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use snafu::ResultExt;
use tracing::{debug, info};

use crate::{
    error::{KeyDerivationSnafu, KeyFileSnafu, Result},
    protocol_common::{KEY_DISCRIMINANT, KEY_FILE_CONTENTS},
};

/// Rendezvous identifier for one sender/receiver pair.
///
/// Derived with `ftok` from the identity of a marker file, so both roles end
/// up with the same value as long as they point at the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey(libc::key_t);

impl ChannelKey {
    pub fn derive(marker: &Path, discriminant: u8) -> Result<Self> {
        // an interior NUL can never name a file
        let c_path = CString::new(marker.as_os_str().as_bytes())
            .map_err(|_| Errno::EINVAL)
            .context(KeyDerivationSnafu { path: marker })?;

        let key = unsafe {
            libc::ftok(c_path.as_ptr(), libc::c_int::from(discriminant))
        };
        if key == -1 {
            return Err(Errno::last())
                .context(KeyDerivationSnafu { path: marker });
        }
        debug!("derived key {key:#x} from {}", marker.display());
        Ok(Self(key))
    }

    /// Creates the marker if nobody has yet, then derives the key from it.
    pub fn from_marker(marker: &Path) -> Result<Self> {
        ensure_marker(marker)?;
        Self::derive(marker, KEY_DISCRIMINANT)
    }

    #[inline]
    pub const fn raw(self) -> libc::key_t {
        self.0
    }

    /// POSIX shared memory object name for this key.
    pub fn shm_name(self) -> String {
        let bits = u32::from_ne_bytes(self.0.to_ne_bytes());
        format!("/shmxfer-{bits:08x}")
    }
}

/// An existing marker is left untouched; rewriting it is harmless for ftok
/// but racing a peer on truncation is not.
pub fn ensure_marker(marker: &Path) -> Result<PathBuf> {
    match OpenOptions::new().write(true).create_new(true).open(marker) {
        Ok(mut file) => {
            file.write_all(KEY_FILE_CONTENTS)
                .context(KeyFileSnafu { path: marker })?;
            info!("created key file {}", marker.display());
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).context(KeyFileSnafu { path: marker }),
    }
    Ok(marker.to_path_buf())
}
