use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod collaborators;
mod commands;

#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "Plan, execute, observe and adapt infrastructure changes")]
struct Cli {
    /// Configuration file.
    #[arg(long, short, global = true, env = "STEWARD_CONFIG", default_value = "steward.yaml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a repository, then plan, gate, execute, observe and adapt.
    Run {
        /// Repository reference handed to the analyzer.
        repository: String,

        #[arg(long, value_enum, default_value_t = Mode::Apply)]
        mode: Mode,

        /// Read findings from this YAML/JSON file instead of the configured analyzer.
        #[arg(long)]
        findings: Option<PathBuf>,

        /// Print the report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Recover interrupted steps and finish every open plan in the ledger.
    Resume {
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show what the ledger knows about past plans.
    Status {
        /// Only this plan.
        #[arg(long)]
        plan: Option<Uuid>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Inspect the action catalog (list/describe/validate)
    Actions {
        #[command(subcommand)]
        cmd: ActionsCommand,
    },

    /// Validate the configuration, catalog and policy table.
    Check,
}

#[derive(Subcommand, Debug)]
enum ActionsCommand {
    /// List registered actions
    List,

    /// Describe one action by name
    Describe { action_name: String },

    /// Build the registry and report catalog errors
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Execute the plan.
    Apply,
    /// Stop after the risk gate; record nothing.
    Plan,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let code = match cli.cmd {
        Command::Run {
            repository,
            mode,
            findings,
            json,
        } => {
            let mode = match mode {
                Mode::Apply => steward_runtime::RunMode::Apply,
                Mode::Plan => steward_runtime::RunMode::Plan,
            };
            commands::run::run(&cli.config, &repository, mode, findings, json).await?
        }
        Command::Resume { json } => commands::run::resume(&cli.config, json).await?,
        Command::Status { plan, json } => commands::status::run(&cli.config, plan, json).await?,
        Command::Actions { cmd } => match cmd {
            ActionsCommand::List => commands::actions::list(&cli.config)?,
            ActionsCommand::Describe { action_name } => {
                commands::actions::describe(&cli.config, &action_name)?
            }
            ActionsCommand::Validate => commands::actions::validate(&cli.config)?,
        },
        Command::Check => commands::check::run(&cli.config)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
