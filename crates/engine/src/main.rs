mod cli;
mod clock_skew;
mod engine;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConfigCommand};
use engine::Engine;
use uds_domain::config::{ConfigSeverity, EngineConfig};
use uds_scheduler::runner::StopFlag;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = Cli::parse();

    match parsed.command {
        None | Some(Command::Run) => {
            let (config, _config_path) = cli::load_config()?;
            init_tracing(&config);
            run_engine(config).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            let passed = cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("uds-engine {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.observability.log_filter.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.observability.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn run_engine(config: EngineConfig) -> anyhow::Result<()> {
    tracing::info!(service = %config.observability.service_name, "uds-engine starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let hostname = hostname();
    let engine = Engine::bootstrap(&config, hostname.clone()).await?;
    tracing::info!(hostname = %hostname, "engine ready, entering scheduler run loop");

    let stop = StopFlag::new();
    let shutdown_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, stopping after the in-flight tick");
            shutdown_stop.stop();
        }
    });

    engine.run(stop).await
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "uds-engine".to_string())
}
