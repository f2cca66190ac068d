use std::fs::File;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use fanctld::{
    application::Application,
    cli::Cli,
    config::{Config, ConfigManager},
};

const DAEMON_OUTPUT: &str = "/var/tmp/fanctld.log";

fn init_log(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "fanctld".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_OUTPUT)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn print_summary(config: &Config) {
    println!(
        "configuration OK: {} sensor(s), {} fan group(s), tick {}s",
        config.sensors.len(),
        config.fan_groups.len(),
        config.tick_seconds
    );
    for sensor in &config.sensors {
        println!("  sensor {}", sensor.id());
    }
    for group in &config.fan_groups {
        println!(
            "  group {} ({:?}): {} fan(s), {} profile(s)",
            group.id,
            group.kind,
            group.fans.len(),
            group.profiles.len()
        );
        for fan in &group.fans {
            println!("    fan {} \"{}\"", fan.id(), fan.name());
        }
    }
}

fn check(runtime: &tokio::runtime::Runtime, cli: &Cli) -> Result<()> {
    let manager = runtime.block_on(ConfigManager::load(cli.config.clone()))?;
    println!("{}", manager.path().display());
    print_summary(&runtime.block_on(manager.clone_config()));
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.check {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start runtime")?;
        return check(&runtime, &cli);
    }

    if let Err(e) = init_log(cli.log_level) {
        eprintln!("syslog unavailable, logging disabled: {e:#}");
    }

    // Forking is only safe before the runtime spawns its threads.
    if cli.daemonize {
        into_daemon().context("Failed to daemonize")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    info!("fanctld {} starting", env!("CARGO_PKG_VERSION"));
    let config_manager = ConfigManager::load(cli.config).await?;
    Application::builder()
        .with_config_manager(config_manager)
        .build()
        .await?
        .run()
        .await
}
