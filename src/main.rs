use std::env;

use gatehouse_config::Logging;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const USAGE: &str = "Usage: gatehouse serve --config <path>\n       gatehouse verify-audit <path>";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => run_serve(args).await,
        "verify-audit" => run_verify(args),
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn run_serve(mut args: impl Iterator<Item = String>) {
    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match gatehouse_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.logging);
    info!(config = %config_path, "starting gatehouse");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };

    if let Err(e) = gatehouse_server::serve_with_shutdown(cfg, shutdown).await {
        error!(error = %e, "server exited with error");
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}

fn run_verify(mut args: impl Iterator<Item = String>) {
    let Some(path) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    match gatehouse_server::verify_audit_chain(&path) {
        Ok(count) => println!("audit chain ok: {count} records"),
        Err(e) => {
            eprintln!("audit chain broken: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(cfg: &Logging) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let registry = tracing_subscriber::registry().with(filter);
    if cfg.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
