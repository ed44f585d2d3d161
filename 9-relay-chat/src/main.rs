use anyhow::{Context, Result};
use clap::Parser;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tracing::{info, warn};

use relay_chat::{
    cli::{Cli, Command},
    client::{self, Output, TcpConnector},
    server::Server,
    stress,
};

fn init_tracing(to_stderr: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if to_stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(!matches!(cli.command, Command::Server(_)));

    match cli.command {
        Command::Server(args) => {
            let server = Server::bind(args.config())
                .await
                .context("failed to start server")?;
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_signal().await {
                warn!("server exited with error: {err:?}");
                return Err(err.into());
            }
        }
        Command::Client(args) => {
            let config = args.config()?;
            let (display, shown) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_outputs(shown));

            client::run(config, TcpConnector, tokio::io::stdin(), display, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = ?err, "failed to install ctrl-c handler");
                }
            })
            .await?;

            printer.await??;
        }
        Command::Stress(args) => {
            let report = stress::run(args.plan()).await?;
            println!(
                "{} clients sent {} lines and received {} frames",
                report.clients, report.lines_sent, report.frames_received
            );
        }
    }

    Ok(())
}

/// Relayed frames go to stdout, client status lines to stderr.
async fn print_outputs(mut shown: mpsc::UnboundedReceiver<Output>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(output) = shown.recv().await {
        match output {
            Output::Frame(text) => write_line(&mut stdout, &text).await?,
            Output::Status(text) => write_line(&mut stderr, &format!("*** {text}")).await?,
        }
    }
    Ok(())
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
