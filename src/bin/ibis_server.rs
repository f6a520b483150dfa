//! `ibis-server` — the broker daemon: starts the refresh task and the
//! request dispatcher concurrently, binds their lifetimes, and flushes a
//! final persistence snapshot on shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::info;

use ibis_broker::controller::{run_refresh_loop, Controller, DEFAULT_REFRESH_TIMEOUT};
use ibis_broker::gpio::{parse_pinmap, NoGpio};
use ibis_broker::serial::open_or_null;

#[cfg(feature = "gpio")]
use ibis_broker::gpio::CdevGpio;

/// Broker daemon for a VDV-300/IBIS display fleet.
#[derive(Parser, Debug)]
#[command(name = "ibis-server", about = "VDV-300/IBIS display broker daemon")]
struct Args {
    /// Serial device the displays are wired to.
    #[arg(short = 's', long = "serial-port", default_value = "/dev/ttyUSB0")]
    serial_port: String,

    /// TCP port the request dispatcher listens on.
    #[arg(short = 'p', long = "tcp-port", default_value_t = 4242)]
    tcp_port: u16,

    /// Seconds after which unchanged content is repainted anyway.
    #[arg(short = 't', long = "refresh-timeout", default_value_t = DEFAULT_REFRESH_TIMEOUT)]
    refresh_timeout: f64,

    /// Path to the persisted state snapshot.
    #[arg(long = "state-file", default_value = "ibis.json")]
    state_file: PathBuf,

    /// Verbose logging of controller state transitions.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Debug logging: also logs raw outgoing telegram bytes.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Run the diagnostic self-test sequence once at startup.
    #[arg(long)]
    selftest: bool,

    /// GPIO pin map entries for the stop indicators, `ADDRESS=PIN`.
    /// Repeatable. Only takes effect when built with the `gpio` feature.
    #[arg(long = "gpio-pin")]
    gpio_pin: Vec<String>,

    /// Linux gpio-cdev chip path (only used with the `gpio` feature).
    #[arg(long = "gpio-chip", default_value = "/dev/gpiochip0")]
    gpio_chip: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    info!("IBIS display broker starting");

    let serial = open_or_null(&args.serial_port);

    let pinmap = parse_pinmap(&args.gpio_pin);
    #[cfg(feature = "gpio")]
    let gpio: Box<dyn ibis_broker::gpio::StopIndicator> = if pinmap.is_empty() {
        Box::new(NoGpio)
    } else {
        match CdevGpio::open(&args.gpio_chip, &pinmap) {
            Ok(g) => Box::new(g),
            Err(e) => {
                tracing::warn!(error = %e, "gpio chip unavailable, stop indicators will be logical-only");
                Box::new(NoGpio)
            }
        }
    };
    #[cfg(not(feature = "gpio"))]
    let gpio: Box<dyn ibis_broker::gpio::StopIndicator> = Box::new(NoGpio);

    let controller = Controller::new(
        serial,
        gpio,
        args.state_file.clone(),
        args.refresh_timeout,
        args.verbose,
        args.debug,
    );
    let controller = Arc::new(Mutex::new(controller));

    {
        let mut guard = controller.lock().await;
        guard.restore().await;
        if args.selftest {
            guard.selftest().await;
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    let refresh_handle = tokio::spawn(run_refresh_loop(controller.clone(), shutdown.clone()));
    let dispatcher_handle = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        let port = args.tcp_port;
        tokio::spawn(async move {
            ibis_broker::dispatcher::run_listener(port, controller, shutdown)
                .await
                .context("dispatcher listener failed")
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    refresh_handle.await.ok();
    dispatcher_handle.await.ok();

    info!("IBIS display broker stopped");
    Ok(())
}
