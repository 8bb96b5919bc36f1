/// VeilNet daemon entry point
///
/// Loads the config, wires the router through the embedding context and
/// runs until interrupted.

use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use veilnet_common::RouterConfig;
use veilnet_daemon::api::ApiServer;
use veilnet_daemon::{detect_free_range, Context};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("starting veilnetd v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "help" | "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "version" | "--version" | "-v" => {
                println!("veilnetd v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "detect-range" => {
                println!("{}", detect_free_range());
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = iter.next().map(PathBuf::from);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    let config = match &config_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            serde_json::from_str::<RouterConfig>(&json)?
        }
        None => {
            info!("no config given, using defaults");
            RouterConfig::default()
        }
    };

    let context = Context::obtain();
    if !context.configure(config.clone()).await {
        anyhow::bail!("configuration failed");
    }

    // status API comes up alongside the mainloop
    if let Some(api_addr) = config.api_addr {
        match context.router().await {
            Some(router) => {
                tokio::spawn(async move {
                    if let Err(e) = ApiServer::new(api_addr, router).start().await {
                        warn!("status API failed: {:#}", e);
                    }
                });
            }
            None => warn!("status API configured but router missing"),
        }
    }

    let ctx = context.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            ctx.stop().await;
        }
    });

    let code = context.mainloop().await;
    std::process::exit(code);
}

fn print_help() {
    println!("veilnetd - VeilNet overlay daemon");
    println!();
    println!("USAGE:");
    println!("  veilnetd [--config <path>]");
    println!();
    println!("COMMANDS:");
    println!("  detect-range     print a free private IPv4 range and exit");
    println!("  version          print the version and exit");
    println!("  help             print this message");
}
