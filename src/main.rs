//! Price feeder entrypoint.
//!
//! `price-feeder <config.toml> [--skip-password] [--log-level=<level>]
//! [--log-format=json|text]`

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use price_feeder::chain::{keyring, ChainClient};
use price_feeder::config;
use price_feeder::oracle::Oracle;
use price_feeder::server;
use price_feeder::telemetry::Telemetry;

struct Args {
    config_path: String,
    skip_password: bool,
    log_level: String,
    log_format: String,
}

fn parse_args() -> Result<Args> {
    let mut config_path = None;
    let mut skip_password = false;
    let mut log_level = "info".to_string();
    let mut log_format = "json".to_string();

    for arg in std::env::args().skip(1) {
        if arg == "--skip-password" {
            skip_password = true;
        } else if let Some(level) = arg.strip_prefix("--log-level=") {
            log_level = level.to_string();
        } else if let Some(format) = arg.strip_prefix("--log-format=") {
            log_format = format.to_string();
        } else if arg.starts_with("--") {
            bail!("unknown flag {arg}");
        } else if config_path.is_none() {
            config_path = Some(arg);
        } else {
            bail!("unexpected argument {arg}");
        }
    }

    Ok(Args {
        config_path: config_path.context("usage: price-feeder <config.toml>")?,
        skip_password,
        log_level,
        log_format,
    })
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    match format {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        "text" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        other => bail!("invalid logging format: {other}"),
    }
    Ok(())
}

/// Cancel the root token on SIGINT/SIGTERM so every task winds down.
fn trap_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("caught signal, shutting down");
        cancel.cancel();
    });
}

async fn run() -> Result<()> {
    let args = parse_args()?;
    init_logging(&args.log_level, &args.log_format)?;

    let cfg = config::parse_config(&args.config_path)?;

    let cancel = CancellationToken::new();
    trap_signals(cancel.clone());

    let passphrase = keyring::keyring_password(args.skip_password)?;
    let signer = keyring::load_signer(
        &cfg.keyring.backend,
        &cfg.keyring.dir,
        &cfg.account.address,
        &passphrase,
    )?;

    let (chain, height_rx) = ChainClient::connect(&cfg, signer, cancel.clone())
        .await
        .context("error creating chain client")?;

    let telemetry = Arc::new(Telemetry::new(
        cfg.telemetry.enabled,
        cfg.telemetry.service_name.clone(),
    ));

    let oracle = Arc::new(Oracle::new(
        chain,
        &cfg.currency_pairs,
        cfg.provider_timeout_duration(),
        cfg.provider_ping_interval_duration(),
        cfg.deviations()?,
        cfg.provider_endpoints_by_name(),
        cfg.healthchecks.clone(),
        telemetry.clone(),
    ));

    let mut tasks = JoinSet::new();
    if cfg.main.enable_server {
        let server_cfg = cfg.server.clone();
        let oracle = oracle.clone();
        let telemetry = telemetry.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { server::serve(server_cfg, oracle, telemetry, cancel).await });
    }
    if cfg.main.enable_voter {
        let oracle = oracle.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { oracle.start(height_rx, cancel).await });
    }
    if tasks.is_empty() {
        bail!("both the server and the voter are disabled");
    }

    // first task error wins; cancellation drains the rest
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "task failed");
                if result.is_ok() {
                    result = Err(e);
                }
                cancel.cancel();
            }
            Err(e) => {
                if result.is_ok() {
                    result = Err(anyhow::anyhow!("task panicked: {e}"));
                }
                cancel.cancel();
            }
        }
    }
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("price-feeder: {e:#}");
            ExitCode::FAILURE
        }
    }
}
