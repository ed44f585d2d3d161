//! Reader and writer tasks for one connection.
//!
//! A [`Link`] splits a stream and drives each half from its own task. The
//! tasks never touch protocol state: they report typed completions to the
//! owning event loop, which stays the only place state is mutated.
//!
//! - The reader fills a fixed scratch buffer and copies each read out into an
//!   owned chunk before issuing the next one.
//! - The writer drains its command channel one write at a time, so writes to
//!   a given peer complete in the order they were issued.
//! - Closing lets queued writes flush for at most [`CLOSE_LINGER`]. Writes
//!   still stuck after that, typically behind a peer that stopped reading,
//!   complete with an error and the stream is dropped.

use std::{io, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, warn};

use crate::{frame::READ_BUFFER_CAPACITY, message::MessageBuffer, write_queue::WriteHandle};

/// Completion reported by a connection's I/O tasks.
#[derive(Debug)]
pub enum TransportEvent {
    Read(Bytes),
    Eof,
    ReadFailed(io::Error),
    WriteDone {
        handle: WriteHandle,
        result: io::Result<()>,
    },
    /// Every write issued before the close has finished and the stream is shut.
    Closed,
}

/// How long a closing link keeps trying to flush queued writes.
pub const CLOSE_LINGER: Duration = Duration::from_secs(1);

enum WriteCommand {
    Write {
        handle: WriteHandle,
        message: MessageBuffer,
    },
    Close,
}

pub struct Link {
    commands: UnboundedSender<WriteCommand>,
    closing: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Starts reading and writing `stream`, tagging every completion with `wrap`.
    pub fn spawn<S, E, F>(stream: S, events: UnboundedSender<E>, wrap: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        E: Send + 'static,
        F: Fn(TransportEvent) -> E + Clone + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (closing, closing_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(read_half, events.clone(), wrap.clone()));
        tokio::spawn(write_loop(
            write_half,
            command_rx,
            lingered(closing_rx, CLOSE_LINGER),
            events,
            wrap,
        ));

        Self {
            commands,
            closing,
            reader,
        }
    }

    /// Hands a write to the writer task. `false` means the writer is gone and
    /// no completion will arrive for `handle`.
    pub fn write(&self, handle: WriteHandle, message: MessageBuffer) -> bool {
        self.commands
            .send(WriteCommand::Write { handle, message })
            .is_ok()
    }

    pub fn stop_reading(&self) {
        self.reader.abort();
    }

    /// Shuts the stream down once the writes already handed over are done,
    /// or drops it once [`CLOSE_LINGER`] has passed, whichever comes first.
    pub fn close(&self) {
        let _ = self.commands.send(WriteCommand::Close);
        self.closing.send_replace(true);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R, E, F>(mut reader: R, events: UnboundedSender<E>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(TransportEvent) -> E,
{
    let mut scratch = vec![0u8; READ_BUFFER_CAPACITY];
    loop {
        let event = match reader.read(&mut scratch).await {
            Ok(0) => TransportEvent::Eof,
            Ok(read) => TransportEvent::Read(Bytes::copy_from_slice(&scratch[..read])),
            Err(error) => TransportEvent::ReadFailed(error),
        };

        let last = !matches!(event, TransportEvent::Read(_));
        if events.send(wrap(event)).is_err() || last {
            break;
        }
    }
}

/// Resolves `linger` after the link starts closing or is dropped.
async fn lingered(mut closing: watch::Receiver<bool>, linger: Duration) {
    let _ = closing.wait_for(|closing| *closing).await;
    sleep(linger).await;
}

async fn write_loop<W, E, F, L>(
    mut writer: W,
    mut commands: UnboundedReceiver<WriteCommand>,
    linger: L,
    events: UnboundedSender<E>,
    wrap: F,
) where
    W: AsyncWrite + Unpin,
    F: Fn(TransportEvent) -> E,
    L: std::future::Future<Output = ()>,
{
    tokio::pin!(linger);

    let flushed = loop {
        let command = select! {
            command = commands.recv() => command,
            _ = &mut linger => break false,
        };
        match command {
            Some(WriteCommand::Write { handle, message }) => {
                let result = select! {
                    result = write_frame(&mut writer, &message) => result,
                    _ = &mut linger => {
                        let _ = events.send(wrap(cancelled(handle)));
                        break false;
                    }
                };
                let _ = events.send(wrap(TransportEvent::WriteDone { handle, result }));
            }
            Some(WriteCommand::Close) | None => break true,
        }
    };

    if flushed {
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "stream shutdown failed");
        }
    } else {
        let mut dropped = 0usize;
        while let Ok(command) = commands.try_recv() {
            if let WriteCommand::Write { handle, .. } = command {
                let _ = events.send(wrap(cancelled(handle)));
                dropped += 1;
            }
        }
        warn!(dropped, "peer stopped reading, dropping the stream");
    }

    drop(writer);
    let _ = events.send(wrap(TransportEvent::Closed));
}

fn cancelled(handle: WriteHandle) -> TransportEvent {
    TransportEvent::WriteDone {
        handle,
        result: Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "stream closed before the write completed",
        )),
    }
}

async fn write_frame<W>(writer: &mut W, message: &MessageBuffer) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message.as_wire()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::io::duplex;

    use super::*;
    use crate::{frame::split_frames, write_queue::WriteQueue};

    #[tokio::test]
    async fn writes_complete_in_issue_order_then_close() {
        let (local, mut remote) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = Link::spawn(local, tx, |event| event);

        let mut queue = WriteQueue::new();
        let handles: Vec<_> = ["one", "two", "three"]
            .into_iter()
            .map(|text| {
                let message = MessageBuffer::new(text);
                let handle = queue.push(message.clone());
                assert!(link.write(handle, message));
                handle
            })
            .collect();
        link.close();

        let mut wire = Vec::new();
        remote.read_to_end(&mut wire).await.expect("read remote");
        assert_eq!(wire, b"one\0two\0three\0");

        let mut completed = Vec::new();
        loop {
            match rx.recv().await.expect("event") {
                TransportEvent::WriteDone { handle, result } => {
                    result.expect("write succeeds");
                    completed.push(handle);
                }
                TransportEvent::Closed => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(completed, handles);
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_on_a_peer_that_stopped_reading() {
        let (local, _stalled) = duplex(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = Link::spawn(local, tx, |event| event);

        let mut queue = WriteQueue::new();
        for text in ["far more than sixteen bytes of chat", "queued behind it"] {
            let message = MessageBuffer::new(text);
            let handle = queue.push(message.clone());
            assert!(link.write(handle, message));
        }
        link.close();

        let mut failed = 0;
        loop {
            match rx.recv().await.expect("event") {
                TransportEvent::WriteDone { handle, result } => {
                    assert!(result.is_err());
                    assert!(queue.complete(handle).is_some());
                    failed += 1;
                }
                TransportEvent::Closed => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(failed, 2);
        assert!(queue.is_empty());
        assert_eq!(queue.pool().in_use(), 0);
    }

    #[tokio::test]
    async fn reads_arrive_as_owned_chunks_then_eof() {
        let (local, mut remote) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = Link::spawn(local, tx, |event| event);

        remote.write_all(b"bob\0hel").await.expect("write");
        remote.write_all(b"lo\0").await.expect("write");
        drop(remote);

        let mut pending = BytesMut::new();
        let mut frames = Vec::new();
        loop {
            match rx.recv().await.expect("event") {
                TransportEvent::Read(chunk) => frames.extend(split_frames(&mut pending, &chunk)),
                TransportEvent::Eof => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(frames, vec![Bytes::from_static(b"bob"), Bytes::from_static(b"hello")]);
    }
}
