//! Client side: a reconnecting connection to the relay.
//!
//! [`ConnectionManager`] owns all client state and is driven by one event
//! loop, the same way the server drives its registry. Connect attempts,
//! timers, transport tasks and the input reader all report back over one
//! channel.
//!
//! The identity frame is the first write on every connection, and local
//! input is only forwarded after that write has completed.

use std::{future::Future, io, net::SocketAddr};

use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
    select,
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ClientConfig,
    error::Result,
    frame,
    message::MessageBuffer,
    timer::Timer,
    transport::{Link, TransportEvent},
    write_queue::{WriteHandle, WriteQueue},
};

/// Opens the byte stream a client talks over.
pub trait Connector: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Self::Stream>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something for the user to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// A frame relayed by the server.
    Frame(String),
    /// Connection status from the client itself.
    Status(String),
}

enum ClientEvent<S> {
    Connected { attempt: u64, result: io::Result<S> },
    ConnectTimeout { generation: u64 },
    ReconnectDue { generation: u64 },
    Transport { attempt: u64, event: TransportEvent },
    /// One line of local input, `None` once input is exhausted.
    Input(Option<String>),
}

pub struct ConnectionManager<C: Connector, R> {
    config: ClientConfig,
    connector: C,
    state: ConnectionState,
    attempt: u64,
    identity_pending: bool,
    identity: Option<WriteHandle>,
    link: Option<Link>,
    queue: WriteQueue,
    pending: BytesMut,
    connect_task: Option<JoinHandle<()>>,
    connect_timer: Timer,
    reconnect_timer: Timer,
    events: UnboundedSender<ClientEvent<C::Stream>>,
    display: UnboundedSender<Output>,
    input: Option<R>,
    input_task: Option<JoinHandle<()>>,
    quitting: bool,
}

impl<C, R> ConnectionManager<C, R>
where
    C: Connector,
    R: AsyncRead + Unpin + Send + 'static,
{
    fn new(
        config: ClientConfig,
        connector: C,
        input: R,
        events: UnboundedSender<ClientEvent<C::Stream>>,
        display: UnboundedSender<Output>,
    ) -> Self {
        Self {
            config,
            connector,
            state: ConnectionState::Disconnected,
            attempt: 0,
            identity_pending: true,
            identity: None,
            link: None,
            queue: WriteQueue::new(),
            pending: BytesMut::new(),
            connect_task: None,
            connect_timer: Timer::new(),
            reconnect_timer: Timer::new(),
            events,
            display,
            input: Some(input),
            input_task: None,
            quitting: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether local input would be forwarded right now.
    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Connected && !self.identity_pending && !self.quitting
    }

    fn connect(&mut self) {
        self.attempt += 1;
        self.state = ConnectionState::Connecting;

        let attempt = self.attempt;
        let addr = self.config.server;
        debug!(attempt, %addr, "connecting");

        let connecting = self.connector.connect(addr);
        let events = self.events.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = connecting.await;
            let _ = events.send(ClientEvent::Connected { attempt, result });
        }));
        self.connect_timer
            .arm(self.config.connect_timeout, &self.events, |generation| {
                ClientEvent::ConnectTimeout { generation }
            });
    }

    /// Returns `false` once the client is done.
    fn handle(&mut self, event: ClientEvent<C::Stream>) -> bool {
        match event {
            ClientEvent::Connected { attempt, result } => self.on_connected(attempt, result),
            ClientEvent::ConnectTimeout { generation } => self.on_connect_timeout(generation),
            ClientEvent::ReconnectDue { generation } => {
                if self.reconnect_timer.fire(generation) {
                    self.connect();
                }
                true
            }
            ClientEvent::Transport { attempt, event } => self.on_transport(attempt, event),
            ClientEvent::Input(Some(line)) => {
                self.on_input(line);
                true
            }
            ClientEvent::Input(None) => self.on_input_closed(),
        }
    }

    fn on_connected(&mut self, attempt: u64, result: io::Result<C::Stream>) -> bool {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            trace!(attempt, "late connect result ignored");
            return true;
        }
        self.connect_timer.stop();
        self.connect_task = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(error) => {
                warn!(attempt, ?error, "connect failed");
                return self.connection_lost(&format!("connect failed: {error}"));
            }
        };

        info!(attempt, server = %self.config.server, "connected");
        self.status(format!("connected to {}", self.config.server));
        self.state = ConnectionState::Connected;
        self.identity_pending = true;
        self.pending.clear();
        self.queue.clear();

        let link = Link::spawn(stream, self.events.clone(), move |event| {
            ClientEvent::Transport { attempt, event }
        });
        let identity = MessageBuffer::new(&self.config.name);
        let handle = self.queue.push(identity.clone());
        link.write(handle, identity);
        self.identity = Some(handle);
        self.link = Some(link);
        true
    }

    fn on_connect_timeout(&mut self, generation: u64) -> bool {
        if !self.connect_timer.fire(generation) || self.state != ConnectionState::Connecting {
            return true;
        }
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        warn!(attempt = self.attempt, "connect timed out");
        self.connection_lost("connect timed out")
    }

    fn on_transport(&mut self, attempt: u64, event: TransportEvent) -> bool {
        if attempt != self.attempt || self.state != ConnectionState::Connected {
            trace!(attempt, "event from a previous connection ignored");
            return true;
        }

        match event {
            TransportEvent::Read(chunk) => {
                for frame in frame::split_frames(&mut self.pending, &chunk) {
                    let text = String::from_utf8_lossy(&frame).into_owned();
                    let _ = self.display.send(Output::Frame(text));
                }
                true
            }
            TransportEvent::Eof | TransportEvent::ReadFailed(_) if self.quitting => true,
            TransportEvent::Eof => {
                info!("server closed the connection");
                self.connection_lost("server closed the connection")
            }
            TransportEvent::ReadFailed(error) => {
                warn!(?error, "read failed");
                self.connection_lost(&format!("read failed: {error}"))
            }
            TransportEvent::WriteDone { handle, result } => self.on_write_done(handle, result),
            TransportEvent::Closed => {
                debug!("connection closed");
                !self.quitting
            }
        }
    }

    fn on_write_done(&mut self, handle: WriteHandle, result: io::Result<()>) -> bool {
        self.queue.complete(handle);
        let identity = self.identity == Some(handle);
        if identity {
            self.identity = None;
        }

        match result {
            Ok(()) if identity => {
                debug!(name = %self.config.name, "identity sent");
                self.identity_pending = false;
                self.start_input();
                true
            }
            Ok(()) => true,
            // Already closing; the transport reports `Closed` next.
            Err(error) if self.quitting => {
                warn!(?error, "write failed while closing, message dropped");
                true
            }
            Err(error) => {
                warn!(?error, identity, "write failed");
                self.connection_lost(&format!("write failed: {error}"))
            }
        }
    }

    fn on_input(&mut self, line: String) {
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if line.is_empty() {
            return;
        }

        if !self.can_send() {
            self.status(format!("not connected, dropped: {line}"));
            return;
        }
        if let Some(link) = &self.link {
            let message = MessageBuffer::new(line);
            let handle = self.queue.push(message.clone());
            if !link.write(handle, message) {
                self.queue.complete(handle);
            }
        }
    }

    fn on_input_closed(&mut self) -> bool {
        debug!(queued = self.queue.len(), "input closed");
        self.quitting = true;

        match (&self.link, self.state) {
            (Some(link), ConnectionState::Connected) => {
                link.close();
                true
            }
            _ => false,
        }
    }

    /// Drops the current connection and schedules the next attempt.
    fn connection_lost(&mut self, why: &str) -> bool {
        self.state = ConnectionState::Disconnected;
        self.identity_pending = true;
        self.identity = None;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.queue.clear();
        self.pending.clear();

        if self.quitting {
            return false;
        }

        let backoff = self.config.reconnect_backoff;
        self.status(format!("{why}, reconnecting in {backoff:?}"));
        self.reconnect_timer.arm(backoff, &self.events, |generation| {
            ClientEvent::ReconnectDue { generation }
        });
        true
    }

    fn start_input(&mut self) {
        let Some(input) = self.input.take() else {
            return;
        };
        let events = self.events.clone();
        self.input_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(input).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if events.send(ClientEvent::Input(Some(line))).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(?error, "failed to read input");
                        break;
                    }
                }
            }
            let _ = events.send(ClientEvent::Input(None));
        }));
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    fn status(&self, text: String) {
        let _ = self.display.send(Output::Status(text));
    }
}

impl<C: Connector, R> Drop for ConnectionManager<C, R> {
    fn drop(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.input_task.take() {
            task.abort();
        }
    }
}

/// Runs a client until `input` is exhausted or `shutdown` resolves.
///
/// Everything the user should see goes to `display`.
pub async fn run<C, R, F>(
    config: ClientConfig,
    connector: C,
    input: R,
    display: UnboundedSender<Output>,
    shutdown: F,
) -> Result<()>
where
    C: Connector,
    R: AsyncRead + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut manager = ConnectionManager::new(config, connector, input, events_tx, display);
    manager.connect();
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = &mut shutdown => {
                info!("client shutting down");
                manager.close();
                break;
            }
            Some(event) = events.recv() => {
                if !manager.handle(event) {
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        net::{Ipv4Addr, SocketAddrV4},
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::{
        io::{duplex, AsyncReadExt, DuplexStream, ReadBuf},
        time::timeout,
    };

    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2000), "carol")
            .expect("valid config")
    }

    /// Hands out prepared streams, then never connects again.
    #[derive(Clone, Default)]
    struct Scripted {
        streams: Arc<Mutex<VecDeque<DuplexStream>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn with_streams(count: usize) -> (Self, Vec<DuplexStream>) {
            let connector = Self::default();
            let mut remotes = Vec::new();
            for _ in 0..count {
                let (local, remote) = duplex(4096);
                connector
                    .streams
                    .lock()
                    .expect("lock")
                    .push_back(local);
                remotes.push(remote);
            }
            (connector, remotes)
        }
    }

    impl Connector for Scripted {
        type Stream = DuplexStream;

        fn connect(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<DuplexStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().expect("lock").pop_front() {
                Some(stream) => futures::future::ready(Ok(stream)).boxed(),
                None => futures::future::pending().boxed(),
            }
        }
    }

    /// Connects fine, then every write fails and reads never complete.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Default)]
    struct BrokenConnector {
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for BrokenConnector {
        type Stream = BrokenPipe;

        fn connect(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BrokenPipe>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(BrokenPipe)).boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_identity_write_drops_the_connection_and_retries() {
        let connector = BrokenConnector::default();
        let attempts = connector.attempts.clone();
        let (display, mut shown) = mpsc::unbounded_channel();
        let (input, _typing) = duplex(64);

        run(
            config(),
            connector,
            input,
            display,
            tokio::time::sleep(Duration::from_secs(12)),
        )
        .await
        .expect("client run");

        // Attempts at 0s, 5s and 10s, each lost on the identity write.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let statuses: Vec<Output> = std::iter::from_fn(|| shown.try_recv().ok()).collect();
        assert!(statuses.iter().any(|output| matches!(
            output,
            Output::Status(text) if text.starts_with("write failed") && text.contains("reconnecting")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_a_server_that_never_answers() {
        let connector = Scripted::default();
        let attempts = connector.attempts.clone();
        let (display, mut shown) = mpsc::unbounded_channel();

        run(
            config(),
            connector,
            tokio::io::empty(),
            display,
            tokio::time::sleep(Duration::from_secs(41)),
        )
        .await
        .expect("client run");

        // Attempts start at 0s, 8s, 16s, 24s, 32s and 40s.
        assert!(attempts.load(Ordering::SeqCst) >= 5);

        let mut timeouts = 0;
        while let Ok(output) = shown.try_recv() {
            if matches!(&output, Output::Status(text) if text.starts_with("connect timed out")) {
                timeouts += 1;
            }
        }
        assert!(timeouts >= 5);
    }

    #[tokio::test]
    async fn identity_goes_out_before_any_input() {
        let (connector, mut remotes) = Scripted::with_streams(1);
        let mut server = remotes.remove(0);
        let (display, _shown) = mpsc::unbounded_channel();

        let client = tokio::spawn(run(
            config(),
            connector,
            &b"early\n\nlater\r\n"[..],
            display,
            std::future::pending(),
        ));

        let mut wire = Vec::new();
        timeout(Duration::from_secs(5), server.read_to_end(&mut wire))
            .await
            .expect("client closes after input ends")
            .expect("read");
        assert_eq!(wire, b"carol\0early\0later\0");

        timeout(Duration::from_secs(5), client)
            .await
            .expect("client exits")
            .expect("join")
            .expect("client run");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects_and_reintroduces_itself() {
        let (connector, mut remotes) = Scripted::with_streams(2);
        let attempts = connector.attempts.clone();
        let mut second = remotes.pop().expect("second stream");
        let mut first = remotes.pop().expect("first stream");
        let (display, mut shown) = mpsc::unbounded_channel();
        let (input, _typing) = duplex(64);

        let client = tokio::spawn(run(
            config(),
            connector,
            input,
            display,
            tokio::time::sleep(Duration::from_secs(30)),
        ));

        let mut identity = [0u8; 6];
        first.read_exact(&mut identity).await.expect("first identity");
        assert_eq!(&identity, b"carol\0");
        drop(first);

        second.read_exact(&mut identity).await.expect("second identity");
        assert_eq!(&identity, b"carol\0");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        client.abort();
        let statuses: Vec<Output> = std::iter::from_fn(|| shown.try_recv().ok()).collect();
        assert!(statuses
            .iter()
            .any(|output| matches!(output, Output::Status(text) if text.contains("reconnecting"))));
    }

    #[tokio::test]
    async fn relayed_frames_are_displayed_one_per_line() {
        let (connector, mut remotes) = Scripted::with_streams(1);
        let mut server = remotes.remove(0);
        let (display, mut shown) = mpsc::unbounded_channel();
        let (input, _typing) = duplex(64);

        let client = tokio::spawn(run(
            config(),
            connector,
            input,
            display,
            std::future::pending(),
        ));

        let mut identity = [0u8; 6];
        server.read_exact(&mut identity).await.expect("identity");
        tokio::io::AsyncWriteExt::write_all(&mut server, b"bob has joined!\0bob:h")
            .await
            .expect("write");
        tokio::io::AsyncWriteExt::write_all(&mut server, b"i\0")
            .await
            .expect("write");

        let mut frames = Vec::new();
        while frames.len() < 2 {
            match timeout(Duration::from_secs(5), shown.recv()).await {
                Ok(Some(Output::Frame(text))) => frames.push(text),
                Ok(Some(Output::Status(_))) => {}
                other => panic!("display closed early: {other:?}"),
            }
        }
        assert_eq!(frames, vec!["bob has joined!", "bob:hi"]);
        client.abort();
    }
}
