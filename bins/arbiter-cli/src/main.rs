mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(about = "Arbiter CLI - Load tests, submit solutions and load-test the judge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the ordered test list for a problem
    LoadTests {
        /// Problem identifier
        #[arg(short, long)]
        problem: String,

        /// JSON array of tests
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Submit a C++ solution
    Submit {
        /// Problem identifier
        #[arg(short, long)]
        problem: String,

        /// Source file (main.cpp)
        #[arg(short, long)]
        file: PathBuf,

        /// Poll until the job finishes and print its verdict
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },

    /// Show the status of a job
    Status {
        /// Job id returned by submit
        #[arg(short, long)]
        job: String,
    },

    /// Simulate many users submitting at once
    Stress {
        /// Problem identifier
        #[arg(short, long)]
        problem: String,

        /// Source file submitted by every user
        #[arg(short, long)]
        file: PathBuf,

        /// Number of concurrent users
        #[arg(short, long, default_value = "100")]
        users: usize,

        /// Stagger between user launches in milliseconds
        #[arg(short, long, default_value = "50")]
        delay_ms: u64,

        /// Per-submission wait limit in seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::LoadTests { problem, file } => {
            commands::load_tests(&problem, &file).await?;
        }
        Commands::Submit {
            problem,
            file,
            wait,
            timeout_secs,
        } => {
            commands::submit(&problem, &file, wait, timeout_secs).await?;
        }
        Commands::Status { job } => {
            commands::status(&job).await?;
        }
        Commands::Stress {
            problem,
            file,
            users,
            delay_ms,
            timeout_secs,
        } => {
            commands::stress(&problem, &file, users, delay_ms, timeout_secs).await?;
        }
    }

    Ok(())
}
