use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use snafu::{ResultExt, ensure};
use tracing::{error, info, warn};

use crate::{
    control::{self, MessageQueue},
    error::{InterruptHandlerSnafu, ReleasedSnafu, Result},
    key::ChannelKey,
    shared_buffer::{self, SharedBuffer},
};

/// Exit status after an interrupt abandoned the transfer.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The receiver is the last to touch the resources on a clean run, so it
    /// removes them.
    pub const fn owns_cleanup(self) -> bool {
        matches!(self, Self::Receiver)
    }
}

/// Removes the shared buffer and the message queue.
///
/// Holds only names and ids, so the interrupt handler can carry a clone
/// without touching the mapping the main path is using. Every acquisition
/// step runs under the same lock as [`Teardown::release`], so a release
/// sees either nothing of a step or all of it.
#[derive(Clone, Debug)]
pub struct Teardown {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    shm_name: String,
    held: Mutex<Held>,
    released: AtomicBool,
}

/// What has been created so far.
#[derive(Debug, Default)]
struct Held {
    shm: bool,
    queue: Option<libc::c_int>,
}

impl Teardown {
    fn new(shm_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shm_name: shm_name.into(),
                held: Mutex::new(Held::default()),
                released: AtomicBool::new(false),
            }),
        }
    }

    fn held(&self) -> MutexGuard<'_, Held> {
        // a panicking holder cannot leave `Held` half written
        self.inner.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Runs `create` and records what it produced, with release locked out
    /// for the duration. Refuses to create anything once released.
    fn acquire<T>(
        &self,
        op: &'static str,
        create: impl FnOnce() -> Result<T>,
        record: impl FnOnce(&T, &mut Held),
    ) -> Result<T> {
        let mut held = self.held();
        ensure!(!self.is_released(), ReleasedSnafu { op });
        let resource = create()?;
        record(&resource, &mut held);
        Ok(resource)
    }

    /// Release exactly once. Subsequent calls are no-ops and return `false`.
    pub fn release(&self) -> Result<bool> {
        let held = self.held();
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        // attempt both even if the first fails
        let shm = if held.shm {
            shared_buffer::unlink(&self.inner.shm_name)
        } else {
            Ok(())
        };
        let queue = held.queue.map_or(Ok(()), control::remove);
        shm.and(queue)?;
        Ok(true)
    }
}

/// What the interrupt handler tears down. Set before the first resource is
/// created, so there is no window where an interrupt finds a resource it
/// cannot see.
static ACTIVE: OnceLock<Teardown> = OnceLock::new();

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Removing the queue wakes a blocked main thread with an error. Parks that
/// thread for good while an interrupt is being handled so the handler's exit
/// status is the one the process reports.
pub fn yield_to_interrupt() {
    if is_interrupted() {
        loop {
            std::thread::park();
        }
    }
}

/// Installs the SIGINT handler. Call before opening the channels.
///
/// On interrupt the transfer is abandoned mid-step: whatever has been
/// created is removed and the process exits with [`INTERRUPT_EXIT_CODE`].
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
        warn!("interrupted, abandoning transfer");
        if let Some(Err(e)) = ACTIVE.get().map(Teardown::release) {
            error!("cleanup after interrupt failed: {e}");
        }
        std::process::exit(INTERRUPT_EXIT_CODE);
    })
    .context(InterruptHandlerSnafu)
}

/// Both channels, acquired in order and released by the owning role on every
/// exit path.
#[derive(Debug)]
pub struct Channels {
    buffer: SharedBuffer,
    control: MessageQueue,
    teardown: Teardown,
    role: Role,
}

impl Channels {
    /// Shared buffer first, then the queue, both from the same key.
    ///
    /// The first set of channels opened in a process is the one the
    /// interrupt handler releases. It is registered before anything is
    /// created.
    pub fn open(key: ChannelKey, capacity: usize, role: Role) -> Result<Self> {
        let teardown = Teardown::new(key.shm_name());
        // later opens in the same process (tests) keep their own teardown
        let _ = ACTIVE.set(teardown.clone());

        let buffer = teardown.acquire(
            "creating the shared buffer",
            || SharedBuffer::create_or_attach(key, capacity),
            |_, held| held.shm = true,
        )?;
        let control = teardown
            .acquire(
                "creating the message queue",
                || MessageQueue::create_or_attach(key),
                |queue, held| held.queue = Some(queue.id()),
            )
            .inspect_err(|_| {
                if role.owns_cleanup() {
                    if let Err(cleanup) = teardown.release() {
                        error!("unable to remove shared buffer: {cleanup}");
                    }
                }
            })?;

        info!(?role, "channels ready");
        Ok(Self {
            buffer,
            control,
            teardown,
            role,
        })
    }

    #[cfg(test)]
    fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn control(&self) -> &MessageQueue {
        &self.control
    }

    /// Mutable buffer next to a shared control channel, the shape the sender
    /// session needs.
    pub fn split_mut(&mut self) -> (&mut SharedBuffer, &MessageQueue) {
        (&mut self.buffer, &self.control)
    }

    /// Normal completion. The owner removes both resources, the other role
    /// only detaches.
    pub fn finish(self) -> Result<()> {
        if self.role.owns_cleanup() {
            self.teardown.release()?;
        }
        Ok(())
    }
}

impl Drop for Channels {
    fn drop(&mut self) {
        if !self.role.owns_cleanup() {
            return;
        }
        if let Err(e) = self.teardown.release() {
            error!("releasing channels failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::{error::XferError, protocol_common::CHUNK_CAPACITY};

    fn scratch_key(dir: &tempfile::TempDir) -> ChannelKey {
        ChannelKey::from_marker(&dir.path().join("keyfile.txt")).unwrap()
    }

    fn queue_exists(key: ChannelKey) -> bool {
        unsafe { libc::msgget(key.raw(), 0) != -1 }
    }

    fn shm_exists(key: ChannelKey) -> bool {
        rustix::shm::open(
            key.shm_name().as_str(),
            rustix::shm::OFlags::RDONLY,
            rustix::fs::Mode::empty(),
        )
        .is_ok()
    }

    #[test]
    fn release_happens_once() {
        let dir = tempfile::tempdir().unwrap();
        let chans =
            Channels::open(scratch_key(&dir), CHUNK_CAPACITY, Role::Sender)
                .unwrap();
        let teardown = chans.teardown().clone();

        assert!(teardown.release().unwrap());
        assert!(teardown.is_released());
        assert!(!teardown.release().unwrap());
    }

    #[test]
    fn receiver_drop_removes_both_resources() {
        let dir = tempfile::tempdir().unwrap();
        let key = scratch_key(&dir);
        let chans =
            Channels::open(key, CHUNK_CAPACITY, Role::Receiver).unwrap();
        assert!(queue_exists(key));
        assert!(shm_exists(key));

        drop(chans);
        assert!(!queue_exists(key));
        assert!(!shm_exists(key));
    }

    #[test]
    fn sender_finish_leaves_resources_for_the_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let key = scratch_key(&dir);
        let sender = Channels::open(key, CHUNK_CAPACITY, Role::Sender).unwrap();
        sender.finish().unwrap();
        assert!(queue_exists(key));
        assert!(shm_exists(key));

        let receiver =
            Channels::open(key, CHUNK_CAPACITY, Role::Receiver).unwrap();
        receiver.finish().unwrap();
        assert!(!queue_exists(key));
        assert!(!shm_exists(key));
    }

    #[test]
    fn key_can_be_reused_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let key = scratch_key(&dir);
        let first = Channels::open(key, CHUNK_CAPACITY, Role::Receiver).unwrap();
        first.finish().unwrap();

        let second =
            Channels::open(key, CHUNK_CAPACITY, Role::Receiver).unwrap();
        assert!(!second.teardown().is_released());
        second.finish().unwrap();
    }

    #[test]
    fn release_waits_for_a_creation_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let key = scratch_key(&dir);
        let teardown = Teardown::new(key.shm_name());

        let (started_tx, started_rx) = mpsc::channel();
        let creating = teardown.clone();
        let creator = thread::spawn(move || {
            creating.acquire(
                "creating the shared buffer",
                || {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(100));
                    SharedBuffer::create_or_attach(key, CHUNK_CAPACITY)
                },
                |_, held| held.shm = true,
            )
        });

        // lands while the object is being created
        started_rx.recv().unwrap();
        assert!(teardown.release().unwrap());

        let buffer = creator.join().unwrap().unwrap();
        assert!(!shm_exists(key));
        drop(buffer);
    }

    #[test]
    fn nothing_is_created_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let key = scratch_key(&dir);
        let teardown = Teardown::new(key.shm_name());
        assert!(teardown.release().unwrap());

        let err = teardown
            .acquire(
                "creating the shared buffer",
                || SharedBuffer::create_or_attach(key, CHUNK_CAPACITY),
                |_, held| held.shm = true,
            )
            .unwrap_err();
        assert!(matches!(err, XferError::Released { .. }));
        assert!(!shm_exists(key));
    }

    #[test]
    fn release_only_touches_what_was_created() {
        let dir = tempfile::tempdir().unwrap();
        let key = scratch_key(&dir);
        // a peer's buffer under the same name
        let peer = SharedBuffer::create_or_attach(key, CHUNK_CAPACITY).unwrap();

        let teardown = Teardown::new(key.shm_name());
        assert!(teardown.release().unwrap());
        assert!(shm_exists(key));

        peer.release().unwrap();
    }
}
