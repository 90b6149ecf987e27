// Hive Linux: LAN chat daemon with a stdin console.

mod config;
mod console;
mod identity_store;

use std::sync::Arc;

use anyhow::Context;
use hive_core::TransportSelector;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut name_arg: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("hive-linux {}", VERSION);
                return Ok(());
            }
            "--name" => name_arg = Some(args.next().context("--name needs a value")?),
            other => anyhow::bail!("unknown argument {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let id_path = identity_store::default_path().context("HOME is not set")?;
    let name = name_arg.or_else(|| cfg.display_name.clone());
    let identity = identity_store::load_or_create(&id_path, name.as_deref())?;
    info!(peer = %identity.peer_id, name = %identity.display_name, "starting hive-linux {}", VERSION);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // No direct-link capability on this platform; /mode direct reports it unavailable.
        let selector = Arc::new(TransportSelector::new(cfg.net_config(), None));
        selector
            .initialize(&identity.display_name, identity.peer_id.clone())
            .await;
        let watcher = console::spawn_watcher(&selector);

        let signal = shutdown_signal();
        tokio::pin!(signal);
        let console_exit = tokio::select! {
            res = console::run(selector.clone()) => Some(res),
            res = &mut signal => {
                res?;
                None
            }
        };
        match console_exit {
            None | Some(Ok(console::Exit::Quit)) => {}
            Some(Ok(console::Exit::Eof)) => {
                info!("stdin closed; running until Ctrl+C or SIGTERM");
                signal.await?;
            }
            Some(Err(e)) => {
                warn!("console error: {e}; running until Ctrl+C or SIGTERM");
                signal.await?;
            }
        }

        selector.shutdown().await;
        watcher.abort();
        info!("bye");
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
