use clap::Parser;
use governor::Governor;
use governor::config::Config;
use governor::telemetry;
use shared::tasks::spawn_failure_logger;
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Replay ingest governance")]
enum CliCommand {
    /// Parse and validate a config file, then exit.
    CheckConfig { path: PathBuf },
    /// List every metric the service emits.
    Metrics,
    /// Run the periodic funnel job until interrupted.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    match CliCommand::parse() {
        CliCommand::CheckConfig { path } => {
            let config = Config::from_file(&path)?;
            println!("{} is valid", path.display());
            println!("{config:#?}");
        }
        CliCommand::Metrics => {
            for def in telemetry::all_metrics() {
                println!(
                    "{:<40} {:<10} {}",
                    def.name,
                    def.metric_type.as_str(),
                    def.description
                );
            }
        }
        CliCommand::Run { config } => {
            let config = Config::from_file(&config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(config))?;
        }
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    let _telemetry = telemetry::init(
        config.common.logging.as_ref(),
        config.common.metrics.as_ref(),
    )?;

    let (governor, failures) = Governor::standalone(&config);
    let failure_logger = spawn_failure_logger(failures);
    tracing::info!(
        interval_secs = config.funnel.job_interval_secs,
        "starting governor"
    );

    tokio::select! {
        _ = governor.run_funnel_job() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupt received, shutting down");
        }
    }

    governor.close().await;
    drop(governor);
    failure_logger.await?;
    Ok(())
}
