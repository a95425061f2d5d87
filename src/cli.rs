use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;

use crate::config::Config;
use crate::connector::{ChannelConnector, Connector};
use crate::database::Database;
use crate::error::TapeFlowError;
use crate::fsobj::{Filesystem, LocalFs};
use crate::inventory::Inventory;
use crate::jobs::Job;
use crate::requests::Request;
use crate::server::Server;
use crate::utils::Utils;

/// CLI for tapeflow: the recall queue and scheduler core of a hierarchical
/// storage manager.
#[derive(Parser)]
#[command(
    name = "tapeflow",
    version,
    about = "Hierarchical storage manager: tape recall queue and scheduler"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the recall server until standard input is closed
    Run {
        /// Directory where the queue database is stored.
        /// Defaults to the configured database directory.
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Keep the queue database in memory
        #[arg(long)]
        in_memory: bool,

        /// Root of the managed filesystem
        #[arg(long)]
        data_dir: PathBuf,

        /// Root under which tape cartridges are mounted
        #[arg(long)]
        tape_dir: PathBuf,
    },

    /// Show the contents of the request and job queues
    Status {
        /// Directory where the queue database is stored
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), TapeFlowError> {
        let cli = Cli::parse();

        match cli.command {
            Command::Run {
                db_path,
                in_memory,
                data_dir,
                tape_dir,
            } => Cli::run_server(db_path, in_memory, &data_dir, &tape_dir),
            Command::Status { db_path } => Cli::show_status(db_path),
        }
    }

    fn run_server(
        db_path: Option<PathBuf>,
        in_memory: bool,
        data_dir: &PathBuf,
        tape_dir: &PathBuf,
    ) -> Result<(), TapeFlowError> {
        let config = Config::get();

        let db_dir = db_path.or_else(|| config.database.db_dir.clone());
        let in_memory = in_memory || config.database.in_memory;

        // a fresh queue per server run; stale state is answered at shutdown
        if !in_memory {
            if let Some(dir) = &db_dir {
                Database::cleanup(dir);
            }
        }

        let db = Arc::new(Database::open(db_dir.as_deref(), in_memory)?);
        db.create_tables()?;

        let fs = Arc::new(LocalFs::new(data_dir, tape_dir)?);
        let connector = Arc::new(ChannelConnector::new());
        let inventory = Arc::new(Inventory::new(
            &config.inventory.drives,
            &config.inventory.cartridges,
        ));

        let server = Server::new(
            db,
            fs as Arc<dyn Filesystem>,
            Arc::clone(&connector) as Arc<dyn Connector>,
            inventory,
        );
        let handles = server.start();

        info!("Server running; close standard input to stop");
        println!("tapeflow server running, press Ctrl-D to stop");

        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() {
                break;
            }
        }

        server.shutdown(false);
        handles.join();
        Ok(())
    }

    fn show_status(db_path: Option<PathBuf>) -> Result<(), TapeFlowError> {
        let config = Config::get();
        let db_dir = db_path.or_else(|| config.database.db_dir.clone());

        let db = Database::open(db_dir.as_deref(), false)?;
        db.create_tables()?;
        let conn = db.conn();

        let requests = Request::all(&conn)?;
        println!("Requests ({}):", requests.len());
        for request in &requests {
            println!(
                "  {:>6}  {:<18}  {:<10}  {:<12}  added {}",
                request.req_num,
                request.operation.to_string(),
                request.tape_id,
                request.state.to_string(),
                Utils::format_db_time(request.time_added)
            );
        }

        let jobs = Job::all(&conn)?;
        println!("Jobs ({}):", jobs.len());
        for job in &jobs {
            let name = match &job.file_name {
                Some(name) => name.clone(),
                None => format!("inode {}", job.fuid.i_num),
            };
            println!(
                "  {:>6}  {:<10}  {:<24}  block {:>8}  {}",
                job.req_num,
                job.tape_id,
                job.file_state.to_string(),
                job.start_block,
                name
            );
        }

        Ok(())
    }
}
