use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info, trace};

use crate::{
    control::ControlChannel,
    error::{
        ChunkTooLargeSnafu, DestinationIoSnafu, InvalidFileNameSnafu,
        InvalidStateSnafu, OpenFileSnafu, Result, SourceIoSnafu,
        UnexpectedMessageSnafu,
    },
    protocol_common::{ControlMessage, FileName, MessageKind},
    shared_buffer::ChunkBuffer,
};

/// Suffix the receiver appends so a transfer within one directory never
/// clobbers its own source.
pub const RECEIVED_SUFFIX: &str = "__recv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingName,
    Streaming,
    Done,
}

/// Producer half of the handshake.
///
/// Owns the buffer for writing between a `DataAck` and the next
/// `DataReady`; never writes while a chunk is outstanding.
pub struct SenderSession<'a, B, C> {
    buffer: &'a mut B,
    control: &'a C,
    state: SessionState,
    chunks: u64,
}

impl<'a, B: ChunkBuffer, C: ControlChannel> SenderSession<'a, B, C> {
    pub fn new(buffer: &'a mut B, control: &'a C) -> Self {
        Self {
            buffer,
            control,
            state: SessionState::AwaitingName,
            chunks: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Non-sentinel chunks handed over so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn send_name(&mut self, name: &FileName) -> Result<()> {
        ensure!(
            self.state == SessionState::AwaitingName,
            InvalidStateSnafu {
                op: "send the file name",
                state: self.state,
            }
        );
        self.control.send(&ControlMessage::FileNameTransfer {
            name: name.clone(),
        })?;
        info!("sent file name {name}");
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Pushes `source` through the buffer one chunk at a time and ends the
    /// stream with the zero-size sentinel.
    ///
    /// Returns the bytes placed into the buffer. That is what was offered to
    /// the receiver, not what it confirmed writing.
    pub fn stream<R: Read>(&mut self, mut source: R) -> Result<u64> {
        ensure!(
            self.state == SessionState::Streaming,
            InvalidStateSnafu {
                op: "stream data",
                state: self.state,
            }
        );

        let mut staging = vec![0u8; self.buffer.capacity()];
        let mut total = 0u64;
        loop {
            let n = fill_chunk(&mut source, &mut staging)
                .context(SourceIoSnafu)?;
            if n == 0 {
                self.control.send(&ControlMessage::END_OF_STREAM)?;
                debug!("sent end of stream after {} chunks", self.chunks);
                break;
            }

            self.buffer.write(&staging[..n])?;
            total += n as u64;
            self.chunks += 1;
            self.control.send(&ControlMessage::DataReady { size: n })?;
            trace!(chunk = self.chunks, size = n, "chunk ready");

            // the only thing keeping us from overwriting unread data
            self.control.receive(MessageKind::DataAck)?;
        }

        self.state = SessionState::Done;
        Ok(total)
    }
}

/// Consumer half of the handshake.
pub struct ReceiverSession<'a, B, C> {
    buffer: &'a B,
    control: &'a C,
    state: SessionState,
}

impl<'a, B: ChunkBuffer, C: ControlChannel> ReceiverSession<'a, B, C> {
    pub fn new(buffer: &'a B, control: &'a C) -> Self {
        Self {
            buffer,
            control,
            state: SessionState::AwaitingName,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn receive_name(&mut self) -> Result<FileName> {
        ensure!(
            self.state == SessionState::AwaitingName,
            InvalidStateSnafu {
                op: "receive the file name",
                state: self.state,
            }
        );
        let name = match self.control.receive(MessageKind::FileNameTransfer)? {
            ControlMessage::FileNameTransfer { name } => name,
            other => {
                return UnexpectedMessageSnafu {
                    expected: MessageKind::FileNameTransfer,
                    got: other.kind(),
                }
                .fail();
            }
        };
        info!("receiving {name}");
        self.state = SessionState::Streaming;
        Ok(name)
    }

    /// Copies chunks into `dest` until the sentinel arrives. The sentinel is
    /// never acknowledged.
    ///
    /// Returns the length of `dest` once it has been synced.
    pub fn stream(&mut self, mut dest: File) -> Result<u64> {
        ensure!(
            self.state == SessionState::Streaming,
            InvalidStateSnafu {
                op: "stream data",
                state: self.state,
            }
        );

        let capacity = self.buffer.capacity();
        let mut staging = Vec::with_capacity(capacity);
        let mut chunks = 0u64;
        loop {
            let size = match self.control.receive(MessageKind::DataReady)? {
                ControlMessage::DataReady { size } => size,
                other => {
                    return UnexpectedMessageSnafu {
                        expected: MessageKind::DataReady,
                        got: other.kind(),
                    }
                    .fail();
                }
            };
            if size == 0 {
                break;
            }
            ensure!(size <= capacity, ChunkTooLargeSnafu { len: size, capacity });

            self.buffer.read(size, &mut staging)?;
            dest.write_all(&staging).context(DestinationIoSnafu)?;
            chunks += 1;
            trace!(chunk = chunks, size, "chunk stored");
            self.control.send(&ControlMessage::DataAck)?;
        }

        dest.flush().context(DestinationIoSnafu)?;
        dest.sync_all().context(DestinationIoSnafu)?;
        let written = dest.metadata().context(DestinationIoSnafu)?.len();
        debug!("end of stream after {chunks} chunks");

        self.state = SessionState::Done;
        Ok(written)
    }
}

/// Reads until `chunk` is full or the source is exhausted, so only the last
/// chunk of a file comes up short.
pub fn fill_chunk<R: Read>(source: &mut R, chunk: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        match source.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The name the sender announces: the path exactly as given.
pub fn announced_name(path: &Path) -> Result<FileName> {
    let name = path.to_str().context(InvalidFileNameSnafu {
        name: path.to_string_lossy(),
    })?;
    FileName::new(name)
}

pub fn open_source(path: &Path) -> Result<File> {
    File::open(path).context(OpenFileSnafu { path })
}

/// Where the receiver stores `name`: its final component, suffixed, inside
/// `out_dir`.
pub fn destination_path(out_dir: &Path, name: &FileName) -> Result<PathBuf> {
    let base = Path::new(name.as_str())
        .file_name()
        .context(InvalidFileNameSnafu {
            name: name.as_str(),
        })?;
    let mut file_name = base.to_os_string();
    file_name.push(RECEIVED_SUFFIX);
    Ok(out_dir.join(file_name))
}

/// Creates or truncates the destination.
pub fn open_destination(path: &Path) -> Result<File> {
    File::create(path).context(OpenFileSnafu { path })
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{
        error::XferError,
        loopback::{Event, LoopbackChannel, MemoryBuffer},
        protocol_common::{CHUNK_CAPACITY, MAX_FILE_NAME_LEN},
    };

    struct Outcome {
        sent: u64,
        received: u64,
        name: FileName,
        dest: Vec<u8>,
        chan: LoopbackChannel,
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn transfer<R: Read>(source: R, name: &str) -> Outcome {
        let chan = LoopbackChannel::new();
        let buf = MemoryBuffer::new(CHUNK_CAPACITY);
        let dir = tempfile::tempdir().unwrap();
        let dest_path = dir.path().join("out");

        let rx_chan = chan.endpoint("receiver");
        let rx_buf = buf.clone();
        let rx_path = dest_path.clone();
        let receiver = thread::spawn(move || {
            let mut session = ReceiverSession::new(&rx_buf, &rx_chan);
            let name = session.receive_name().unwrap();
            let dest = open_destination(&rx_path).unwrap();
            let n = session.stream(dest).unwrap();
            assert_eq!(session.state(), SessionState::Done);
            (name, n)
        });

        let tx_chan = chan.endpoint("sender");
        let mut tx_buf = buf.clone();
        let mut session = SenderSession::new(&mut tx_buf, &tx_chan);
        session.send_name(&FileName::new(name).unwrap()).unwrap();
        let sent = session.stream(source).unwrap();
        assert_eq!(session.state(), SessionState::Done);

        let (got, received) = receiver.join().unwrap();
        Outcome {
            sent,
            received,
            name: got,
            dest: std::fs::read(&dest_path).unwrap(),
            chan,
        }
    }

    fn data_ready_sizes(chan: &LoopbackChannel) -> Vec<usize> {
        chan.sent_by("sender")
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::DataReady { size } => Some(size),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn twenty_five_hundred_bytes_take_three_chunks() {
        let data = pattern(2500);
        let out = transfer(data.as_slice(), "report.bin");

        assert_eq!(out.name.as_str(), "report.bin");
        assert_eq!(data_ready_sizes(&out.chan), vec![1000, 1000, 500, 0]);
        assert_eq!(
            out.chan.sent_by("receiver"),
            vec![ControlMessage::DataAck; 3]
        );
        assert_eq!(out.sent, 2500);
        assert_eq!(out.received, 2500);
        assert_eq!(out.dest, data);
        assert_eq!(out.chan.pending(), 0);
    }

    #[test]
    fn chunk_count_is_ceiling_of_length() {
        for len in [0, 1, 999, 1000, 1001, 2000, 4321] {
            let data = pattern(len);
            let out = transfer(data.as_slice(), "f");
            let sizes = data_ready_sizes(&out.chan);

            assert_eq!(sizes.len() - 1, len.div_ceil(CHUNK_CAPACITY), "{len}");
            assert_eq!(sizes.last(), Some(&0));
            assert_eq!(out.dest, data);
            assert_eq!(out.received, len as u64);
        }
    }

    #[test]
    fn empty_file_sends_only_the_sentinel() {
        let out = transfer(&b""[..], "empty");
        assert_eq!(data_ready_sizes(&out.chan), vec![0]);
        assert!(out.chan.sent_by("receiver").is_empty());
        assert_eq!(out.received, 0);
    }

    #[test]
    fn exactly_one_capacity_is_one_full_chunk() {
        let out = transfer(pattern(CHUNK_CAPACITY).as_slice(), "full");
        assert_eq!(data_ready_sizes(&out.chan), vec![CHUNK_CAPACITY, 0]);
    }

    #[test]
    fn sender_waits_for_ack_before_the_next_chunk() {
        let out = transfer(pattern(10 * CHUNK_CAPACITY + 7).as_slice(), "f");

        let mut outstanding = false;
        for ev in out.chan.log() {
            match ev {
                Event::Sent {
                    by: "sender",
                    msg: ControlMessage::DataReady { size },
                } if size > 0 => {
                    assert!(!outstanding, "second chunk before ack");
                    outstanding = true;
                }
                Event::Received {
                    by: "sender",
                    msg: ControlMessage::DataAck,
                } => {
                    assert!(outstanding, "ack without a chunk");
                    outstanding = false;
                }
                _ => {}
            }
        }
        assert!(!outstanding);
    }

    /// Hands out one byte per read call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some((first, rest)) = self.0.split_first() else {
                return Ok(0);
            };
            if buf.is_empty() {
                return Ok(0);
            }
            buf[0] = *first;
            self.0 = rest;
            Ok(1)
        }
    }

    #[test]
    fn short_reads_still_fill_chunks() {
        let data = pattern(2100);
        let out = transfer(Trickle(&data), "slow");
        assert_eq!(data_ready_sizes(&out.chan), vec![1000, 1000, 100, 0]);
        assert_eq!(out.dest, data);
    }

    #[test]
    fn streaming_before_the_name_is_refused() {
        let chan = LoopbackChannel::new();
        let mut buf = MemoryBuffer::new(8);
        let mut session = SenderSession::new(&mut buf, &chan);
        let err = session.stream(&b"abc"[..]).unwrap_err();
        assert!(matches!(
            err,
            XferError::InvalidState {
                state: SessionState::AwaitingName,
                ..
            }
        ));
        assert!(chan.log().is_empty());
    }

    #[test]
    fn oversized_data_ready_is_fatal_for_the_receiver() {
        let chan = LoopbackChannel::new();
        let buf = MemoryBuffer::new(CHUNK_CAPACITY);
        chan.send(&ControlMessage::FileNameTransfer {
            name: FileName::new("x").unwrap(),
        })
        .unwrap();
        chan.send(&ControlMessage::DataReady {
            size: CHUNK_CAPACITY + 1,
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = open_destination(&dir.path().join("x")).unwrap();
        let rx = chan.endpoint("receiver");
        let mut session = ReceiverSession::new(&buf, &rx);
        session.receive_name().unwrap();
        let err = session.stream(dest).unwrap_err();
        assert!(matches!(err, XferError::ChunkTooLarge { .. }));
        assert!(chan.sent_by("receiver").is_empty());
    }

    // Receives have no timeout. A receiver whose sender never finishes
    // waits forever; this pins that behaviour down.
    #[test]
    fn receiver_blocks_until_the_sentinel_arrives() {
        let chan = LoopbackChannel::new();
        let buf = MemoryBuffer::new(CHUNK_CAPACITY);
        chan.send(&ControlMessage::FileNameTransfer {
            name: FileName::new("late").unwrap(),
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest_path = dir.path().join("late");
        let rx = chan.endpoint("receiver");
        let rx_path = dest_path.clone();
        let waiter = thread::spawn(move || {
            let mut session = ReceiverSession::new(&buf, &rx);
            session.receive_name().unwrap();
            session.stream(open_destination(&rx_path).unwrap()).unwrap()
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        chan.send(&ControlMessage::END_OF_STREAM).unwrap();
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn announced_name_enforces_the_bound() {
        let ok = "d".repeat(MAX_FILE_NAME_LEN - 1);
        assert_eq!(announced_name(Path::new(&ok)).unwrap().as_str(), ok);

        let too_long = "d".repeat(MAX_FILE_NAME_LEN);
        assert!(matches!(
            announced_name(Path::new(&too_long)),
            Err(XferError::FileNameTooLong { .. })
        ));
    }

    #[test]
    fn destination_keeps_only_the_final_component() {
        let out = Path::new("/srv/inbox");
        let name = FileName::new("../data/notes.txt").unwrap();
        assert_eq!(
            destination_path(out, &name).unwrap(),
            Path::new("/srv/inbox/notes.txt__recv")
        );

        let bad = FileName::new("..").unwrap();
        assert!(matches!(
            destination_path(out, &bad),
            Err(XferError::InvalidFileName { .. })
        ));
    }

    #[test]
    fn missing_source_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let err = open_source(&path).unwrap_err();
        assert!(err.to_string().contains("absent"));
    }
}
