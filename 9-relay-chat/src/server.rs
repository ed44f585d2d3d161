use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::mpsc::{self, UnboundedReceiver},
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    registry::{Registry, ServerEvent},
};

/// How long shutdown waits for every transport to report its close. Longer
/// than the close linger, so stalled peers are dropped before it expires.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    /// Binds `0.0.0.0:<port>` with the configured backlog.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let listener =
            listen(addr, config.backlog).map_err(|source| Error::Bind { addr, source })?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, config } = self;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut registry = Registry::new(&config, events_tx);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &mut registry);
                }
                Some(event) = events.recv() => registry.handle(event),
            }
        }

        drop(listener);
        info!("server shutting down");
        registry.shutdown();
        drain(&mut registry, &mut events).await;

        Ok(())
    }

    /// Serves until Ctrl-C or, on Unix, SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &mut Registry,
) {
    match result {
        Ok((stream, peer)) => {
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%peer, ?error, "failed to disable nagle");
            }
            registry.accept(stream, Some(peer));
        }
        Err(error) => warn!(?error, "failed to accept connection"),
    }
}

async fn drain(registry: &mut Registry, events: &mut UnboundedReceiver<ServerEvent>) {
    let drained = timeout(SHUTDOWN_GRACE, async {
        while !registry.is_empty() {
            match events.recv().await {
                Some(event) => registry.handle(event),
                None => break,
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = registry.len(),
            "sessions still closing at shutdown"
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(error) => warn!(?error, "failed to install SIGTERM handler"),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "failed to install ctrl-c handler");
    }
}
