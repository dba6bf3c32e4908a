mod api;
mod commandline;
mod crypto;
mod db;
mod materialize;
mod models;
mod mq;
mod notifications;
mod resources;
mod server;
mod settings;
mod tasks;
mod utils;

pub use utils::user_error::UserError;

pub type Result<T> = anyhow::Result<T>;

use crate::server::web::Server;
use anyhow::Context;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing::{error, Subscriber};
use tracing_appender::rolling;
use tracing_subscriber::{self, filter::EnvFilter};
use tracing_subscriber::{prelude::*, Registry};

/// Environment variable overriding the tracing filter.
const ENV_VAR_LOG_LEVEL: &str = "DWH_QUERY_EXECUTOR_LOG";

#[tokio::main]
async fn main() {
    let args = commandline::get_args();
    match run(args).await {
        Ok(_) => {}
        Err(error) => {
            error!("{}", error);
            std::process::exit(1);
        }
    }
}

fn get_tracing_filter(args: Option<&commandline::CommandArgs>) -> EnvFilter {
    let default_level: LevelFilter = match args {
        Some(args) => {
            if args.verbose {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            }
        }
        None => LevelFilter::INFO,
    };
    EnvFilter::builder().with_default_directive(default_level.into()).with_env_var(ENV_VAR_LOG_LEVEL).from_env_lossy()
}

/// Initialize the tracing system.
///
/// All logs are written to the standard output and to daily log files when
/// the logging collector is enabled.
fn get_tracing_subscriber(args: Option<&commandline::CommandArgs>) -> Result<Box<dyn Subscriber + Send + Sync>> {
    // logs are always written to the standard output.
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_line_number(false)
        .with_ansi(true)
        .with_file(false)
        .with_target(true)
        .with_filter(get_tracing_filter(args));

    let file_log = if settings::get_log_collector() {
        // the logging collector is enabled, we must initiate the creation of log files.
        let log_dir = PathBuf::from(settings::get_log_dir());
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir.as_path())
                .with_context(|| format!("Unable to create the log directory: {}", log_dir.display()))?;
        }
        let file_appender = rolling::daily(log_dir, "executor.log");
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(file_appender)
                .with_filter(get_tracing_filter(args)),
        )
    } else {
        None
    };

    Ok(Box::new(Registry::default().with(file_log).with(stdout_log)))
}

/// Initialize and start the service.
async fn run(args: &commandline::CommandArgs) -> Result<()> {
    if args.show_config {
        settings::show_config();
        return Ok(());
    }
    tracing::subscriber::set_global_default(get_tracing_subscriber(Some(args))?)?;
    Server::start().await
}
