use crate::demo::{run_demo, run_report, run_sweep, DemoArgs, ReportCommand, SweepArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use consent_tracker::error::AppError;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "Consent Tracker",
    about = "Issue, collect, expire, and report on parental consent forms",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service with scheduled sweeps (default command)
    Serve(ServeArgs),
    /// Run one deadline sweep against a seeded school and print its summary
    Sweep(SweepArgs),
    /// Print consent reports for a seeded school
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    /// Walk a seeded school through issue, answers, reminders, expiry, and reporting
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Roster CSV to load into the store before serving
    #[arg(long)]
    pub(crate) roster: Option<PathBuf>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sweep(args) => run_sweep(args),
        Command::Report { command } => run_report(command),
        Command::Demo(args) => run_demo(args),
    }
}
