use std::ffi::c_void;

use nix::errno::Errno;
use snafu::{ResultExt, ensure};
use tracing::{debug, info, trace};

use crate::{
    error::{
        CodecSnafu, MessageQueueSnafu, PayloadTooLargeSnafu, Result,
        UnexpectedMessageSnafu,
    },
    key::ChannelKey,
    protocol_common::{ControlMessage, MAX_CONTROL_PAYLOAD, MessageKind, RW_MODE},
};

/// Typed message transport between the two roles.
pub trait ControlChannel {
    fn send(&self, msg: &ControlMessage) -> Result<()>;

    /// Blocks until a message of `kind` is queued and takes it. Messages of
    /// other kinds stay queued for whoever asks for them.
    fn receive(&self, kind: MessageKind) -> Result<ControlMessage>;
}

/// Serialize a control message into its queue payload.
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>> {
    let payload = serde_cbor::to_vec(msg).context(CodecSnafu)?;
    ensure!(
        payload.len() <= MAX_CONTROL_PAYLOAD,
        PayloadTooLargeSnafu {
            len: payload.len(),
            max: MAX_CONTROL_PAYLOAD,
        }
    );
    Ok(payload)
}

/// Decode a payload that arrived tagged as `expected`.
pub fn decode_message(
    expected: MessageKind,
    payload: &[u8],
) -> Result<ControlMessage> {
    let msg: ControlMessage =
        serde_cbor::from_slice(payload).context(CodecSnafu)?;
    ensure!(
        msg.kind() == expected,
        UnexpectedMessageSnafu {
            expected,
            got: msg.kind(),
        }
    );
    Ok(msg)
}

/// Layout expected by msgsnd/msgrcv.
#[repr(C)]
struct MsgBuf {
    mtype: libc::c_long,
    mtext: [u8; MAX_CONTROL_PAYLOAD],
}

impl MsgBuf {
    const fn empty() -> Self {
        Self {
            mtype: 0,
            mtext: [0; MAX_CONTROL_PAYLOAD],
        }
    }
}

/// System V message queue keyed by the channel key. The `mtype` of every
/// message is its [`MessageKind`], which is what makes selective receipt a
/// kernel-side filter.
#[derive(Debug)]
pub struct MessageQueue {
    id: libc::c_int,
}

impl MessageQueue {
    pub fn create_or_attach(key: ChannelKey) -> Result<Self> {
        let flags = libc::IPC_CREAT | RW_MODE.bits() as libc::c_int;
        let id = Errno::result(unsafe { libc::msgget(key.raw(), flags) })
            .context(MessageQueueSnafu { op: "msgget" })?;
        info!("attached message queue {id} for key {:#x}", key.raw());
        Ok(Self { id })
    }

    /// Kernel identifier, needed by the interrupt path to remove the queue.
    pub const fn id(&self) -> libc::c_int {
        self.id
    }

    pub fn release(self) -> Result<()> {
        remove(self.id)
    }
}

/// Removes the queue. Any process blocked on it wakes with `EIDRM`. An
/// already removed queue counts as success.
pub fn remove(id: libc::c_int) -> Result<()> {
    let res = Errno::result(unsafe {
        libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut())
    });
    match res {
        Ok(_) => {
            info!("removed message queue {id}");
            Ok(())
        }
        Err(Errno::EINVAL | Errno::EIDRM) => {
            debug!("message queue {id} already removed");
            Ok(())
        }
        Err(e) => Err(e).context(MessageQueueSnafu { op: "msgctl" }),
    }
}

impl ControlChannel for MessageQueue {
    fn send(&self, msg: &ControlMessage) -> Result<()> {
        let payload = encode_message(msg)?;
        let mut buf = MsgBuf::empty();
        buf.mtype = msg.kind().mtype();
        buf.mtext[..payload.len()].copy_from_slice(&payload);

        loop {
            let res = Errno::result(unsafe {
                libc::msgsnd(
                    self.id,
                    std::ptr::from_ref(&buf).cast::<c_void>(),
                    payload.len(),
                    0,
                )
            });
            match res {
                Ok(_) => break,
                Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(e).context(MessageQueueSnafu { op: "msgsnd" });
                }
            }
        }
        trace!(?msg, "sent");
        Ok(())
    }

    fn receive(&self, kind: MessageKind) -> Result<ControlMessage> {
        let mut buf = MsgBuf::empty();
        let len = loop {
            let res = Errno::result(unsafe {
                libc::msgrcv(
                    self.id,
                    std::ptr::from_mut(&mut buf).cast::<c_void>(),
                    MAX_CONTROL_PAYLOAD,
                    kind.mtype(),
                    0,
                )
            });
            match res {
                Ok(n) => break n.unsigned_abs(),
                // a signal landed on this thread; the interrupt handler
                // decides whether we go on
                Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(e).context(MessageQueueSnafu { op: "msgrcv" });
                }
            }
        };
        let msg = decode_message(kind, &buf.mtext[..len])?;
        trace!(?msg, "received");
        Ok(msg)
    }
}
