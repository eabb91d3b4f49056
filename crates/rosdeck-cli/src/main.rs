//! `rosdeck` – robot dashboard bridge.
//!
//! 1. Loads `~/.rosdeck/config.toml`, writing the defaults on first run.
//! 2. Connects to the rosbridge server and wires every relay.
//! 3. Serves the dashboard API and viewer socket until Ctrl-C.

mod config;
mod telemetry;

use std::process::ExitCode;

use colored::Colorize;
use rosdeck_cockpit::{BridgeContext, CockpitServer};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    // The OTLP exporter must be built before the Tokio runtime exists.
    let _telemetry = telemetry::init_tracing("rosdeck");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} {}",
                    "✓ Wrote default config to".green(),
                    config::config_path().display()
                ),
                Err(e) => warn!(error = %e, "could not write default config"),
            }
            cfg
        }
        Err(e) => {
            warn!(error = %e, "config unreadable, using defaults");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if let Err(e) = cfg.validate() {
        eprintln!("{} {}", "✗".red().bold(), e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(cfg));
    drop(runtime);
    code
}

async fn run(cfg: config::Config) -> ExitCode {
    println!("  Broker   {}", cfg.broker_url.bold());
    println!("  HTTP     {}", format!("0.0.0.0:{}", cfg.http_port).bold());
    println!();

    let ctx = BridgeContext::new(cfg.bridge_settings());
    ctx.start();

    let result = CockpitServer::new(ctx.clone())
        .with_port(cfg.http_port)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                return;
            }
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        })
        .await;

    ctx.shutdown();

    match result {
        Ok(()) => {
            info!("rosdeck stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "cockpit server failed");
            ExitCode::FAILURE
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   ________  _________/ /__  _____/ /__"#.bold().cyan());
    println!("{}", r#"  / ___/ __ \/ ___/ __  / _ \/ ___/ //_/"#.bold().cyan());
    println!("{}", r#" / /  / /_/ (__  ) /_/ /  __/ /__/ ,<   "#.bold().cyan());
    println!("{}", r#"/_/   \____/____/\__,_/\___/\___/_/|_|  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "rosdeck".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  rosbridge dashboard bridge");
    println!();
}
