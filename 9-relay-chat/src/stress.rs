//! Load generator: many scripted clients against one server.

use std::{net::SocketAddrV4, time::Duration};

use futures::future::join_all;
use rand::Rng;
use tokio::{
    io::{duplex, AsyncWriteExt, DuplexStream},
    sync::mpsc,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    client::{self, Output, TcpConnector},
    config::ClientConfig,
    error::Result,
};

/// Extra time a client gets to register and flush before it is cut off.
const SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StressPlan {
    pub server: SocketAddrV4,
    pub clients: usize,
    pub interval: Duration,
    pub duration: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StressReport {
    pub clients: usize,
    pub lines_sent: usize,
    pub frames_received: usize,
}

#[derive(Debug, Default)]
struct ClientTally {
    lines_sent: usize,
    frames_received: usize,
}

/// Names look like `test<number>`; collisions are possible and get rejected
/// by the server like any other duplicate.
pub fn random_name() -> String {
    format!("test{}", rand::thread_rng().gen_range(0..=1_000_000))
}

pub async fn run(plan: StressPlan) -> Result<StressReport> {
    info!(
        clients = plan.clients,
        interval = ?plan.interval,
        duration = ?plan.duration,
        "starting stress run"
    );

    let mut runs = Vec::with_capacity(plan.clients);
    for _ in 0..plan.clients {
        let config = ClientConfig::new(plan.server, random_name())?;
        runs.push(tokio::spawn(run_one(config, plan.interval, plan.duration)));
    }

    let mut report = StressReport {
        clients: plan.clients,
        ..StressReport::default()
    };
    for outcome in join_all(runs).await {
        match outcome {
            Ok(tally) => {
                report.lines_sent += tally.lines_sent;
                report.frames_received += tally.frames_received;
            }
            Err(error) => warn!(?error, "stress client panicked"),
        }
    }

    info!(?report, "stress run finished");
    Ok(report)
}

async fn run_one(config: ClientConfig, every: Duration, duration: Duration) -> ClientTally {
    let name = config.name.clone();
    let (typing, input) = duplex(1024);
    let (display, mut shown) = mpsc::unbounded_channel();

    let feeder = tokio::spawn(feed(typing, name.clone(), every, duration));
    let session = tokio::spawn(client::run(
        config,
        TcpConnector,
        input,
        display,
        sleep(duration + SETTLE),
    ));

    let mut tally = ClientTally::default();
    while let Some(output) = shown.recv().await {
        match output {
            Output::Frame(_) => tally.frames_received += 1,
            Output::Status(text) => debug!(name, text, "status"),
        }
    }

    match session.await {
        Ok(Err(error)) => warn!(name, ?error, "stress client failed"),
        Err(error) => warn!(name, ?error, "stress client panicked"),
        Ok(Ok(())) => {}
    }
    // The feeder ends at its deadline or as soon as the client drops its input.
    tally.lines_sent = feeder.await.unwrap_or_default();
    tally
}

/// Types one line per tick, then closes the input. Returns the line count.
async fn feed(
    mut typing: DuplexStream,
    name: String,
    every: Duration,
    duration: Duration,
) -> usize {
    let deadline = Instant::now() + duration;
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sent = 0;
    loop {
        ticks.tick().await;
        if Instant::now() >= deadline {
            break;
        }
        let line = format!("{name} says {sent}\n");
        if typing.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        sent += 1;
    }
    sent
}
