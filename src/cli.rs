use crate::commands::{self, Session};
use crate::logging;
use crate::store::JobStatus;
use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hookq", version)]
#[command(
    about = "Durable event-to-action job queue for GitHub and Jira events",
    long_about = "hookq matches normalized events against configured mappings, queues one job per matched action in SQLite, and runs them with bounded concurrency and per-repository locking."
)]
#[command(arg_required_else_help = true)]
#[command(after_long_help = "Examples:
  hookq serve
  hookq serve --stdin < events.ndjson
  hookq ingest event.json
  hookq match event.json
  hookq jobs --status failed
  hookq show --job 42
  hookq completion zsh > ~/.zsh/completions/_hookq
  hookq man > hookq.1")]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to config file (default: .hookq/config.toml)"
    )]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to state DB (overrides [storage].state_db)"
    )]
    state_db: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides"
    )]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run the dispatcher",
        long_about = "Recover jobs left running by a previous process, then dispatch pending jobs every poll interval. With --stdin, also route newline-delimited events read from standard input and exit once input ends and running jobs finish."
    )]
    #[command(after_long_help = "Examples:
  hookq serve
  hookq serve --stdin < events.ndjson")]
    Serve {
        #[arg(long, help = "Route newline-delimited JSON events from stdin")]
        stdin: bool,
    },
    #[command(about = "Queue jobs for one event")]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Examples:
  hookq ingest event.json
  cat event.json | hookq ingest -")]
    Ingest {
        #[arg(value_name = "EVENT_JSON", help = "Event JSON file, or - for stdin")]
        event: PathBuf,
    },
    #[command(about = "Show which mappings and actions an event would trigger")]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Example:
  hookq match event.json")]
    Match {
        #[arg(value_name = "EVENT_JSON", help = "Event JSON file, or - for stdin")]
        event: PathBuf,
    },
    #[command(about = "Print job counts per status")]
    Stats,
    #[command(about = "List jobs, newest first")]
    #[command(after_long_help = "Examples:
  hookq jobs
  hookq jobs --status pending --limit 50")]
    Jobs {
        #[arg(long, value_name = "STATUS", value_parser = ["pending", "running", "completed", "failed"], help = "Only jobs in this status")]
        status: Option<String>,
        #[arg(long, default_value_t = 20, value_name = "N", help = "Maximum rows")]
        limit: usize,
    },
    #[command(about = "Show one job with its event snapshot")]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Example:
  hookq show --job 42")]
    Show {
        #[arg(long, value_name = "JOB_ID", help = "Job ID to inspect")]
        job: i64,
    },
    #[command(about = "Delete finished jobs older than N days")]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Example:
  hookq purge --older-than-days 30")]
    Purge {
        #[arg(long, value_name = "DAYS", help = "Age threshold in days")]
        older_than_days: u32,
    },
    #[command(
        about = "Generate shell completion script",
        long_about = "Generate shell completion script for your shell. Redirect output to your shell completion directory."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Examples:
  hookq completion bash > ~/.local/share/bash-completion/completions/hookq
  hookq completion zsh > ~/.zsh/completions/_hookq
  hookq completion fish > ~/.config/fish/completions/hookq.fish")]
    Completion {
        #[arg(value_enum, value_name = "SHELL", help = "Target shell")]
        shell: Shell,
    },
    #[command(
        about = "Generate a man page",
        long_about = "Generate a roff man page for hookq."
    )]
    #[command(after_long_help = "Examples:
  hookq man > hookq.1
  hookq man --output docs/hookq.1")]
    Man {
        #[arg(
            long,
            value_name = "PATH",
            help = "Write man page to file (stdout when omitted)"
        )]
        output: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let session = || Session::load(cli.config.as_deref(), cli.state_db.clone());
    match cli.command {
        Commands::Serve { stdin } => commands::serve(&session()?, stdin),
        Commands::Ingest { event } => commands::ingest(&session()?, &event),
        Commands::Match { event } => commands::match_event(&session()?, &event),
        Commands::Stats => commands::stats(&session()?),
        Commands::Jobs { status, limit } => {
            let status = status.as_deref().map(str::parse::<JobStatus>).transpose()?;
            commands::jobs(&session()?, status, limit)
        }
        Commands::Show { job } => commands::show(&session()?, job),
        Commands::Purge { older_than_days } => commands::purge(&session()?, older_than_days),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        Commands::Man { output } => {
            let man = clap_mangen::Man::new(Cli::command());
            match output {
                Some(path) => {
                    let mut bytes = Vec::new();
                    man.render(&mut bytes)?;
                    fs::write(path, bytes)?;
                }
                None => {
                    man.render(&mut io::stdout())?;
                }
            }
            Ok(())
        }
    }
}
