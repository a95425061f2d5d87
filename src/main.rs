mod cli;
mod config;
mod connector;
mod database;
mod error;
mod fsobj;
mod intake;
mod inventory;
mod jobs;
mod recall;
mod requests;
mod scheduler;
mod schema;
mod server;
mod utils;
mod workqueue;

use std::time::Instant;

use chrono::Local;
use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming};
use log::{error, info};

fn main() {
    let project_dirs =
        ProjectDirs::from("", "", "tapeflow").expect("Could not determine project directories");

    let config = match Config::load(&project_dirs) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    CONFIG.set(config).expect("Config already set!");

    setup_logging(&project_dirs);

    // Mark the start time and log a timestamped message
    let start = Instant::now();
    let now = Local::now();
    info!("tapeflow starting at {}", now.format("%Y-%m-%d %H:%M:%S"));

    let result = Cli::handle_command_line();

    let duration = start.elapsed();

    match result {
        Ok(()) => {
            info!("tapeflow completed successfully in {:.2?}", duration);
        }
        Err(err) => {
            error!("tapeflow exited with error in {:.2?}", duration);
            error!("{:?}", err);
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}

pub fn setup_logging(project_dirs: &ProjectDirs) {
    let config = Config::get();
    let log_levels = format!("tapeflow={}", config.logging.level);

    let log_dir = project_dirs.data_local_dir().join("logs");

    Logger::try_with_str(log_levels)
        .unwrap()
        .log_to_file(FileSpec::default().directory(log_dir))
        .rotate(
            Criterion::Size(u64::MAX),  // effectively disables size-based rotation
            Naming::TimestampsDirect,   // logs directly to a timestamped file
            Cleanup::KeepLogFiles(100), // keep the 100 most recent log files
        )
        .start()
        .unwrap();
}
