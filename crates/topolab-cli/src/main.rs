mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "topolab",
    about = "Stand up a multi-region lab topology, push configs and data to it, and drive it with named actions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Topology file (default: nearest topolab.yaml from the cwd upward)
    #[arg(long, global = true, env = "TOPOLAB_MODEL")]
    model: Option<PathBuf>,

    /// Lab directory for build output and instance state (default: ~/.topolab/<model-id>)
    #[arg(long, global = true, env = "TOPOLAB_LAB_DIR")]
    lab_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap, preflight, then run infrastructure, configuration and distribution
    Up,

    /// Run a single phase (infrastructure, configuration, distribution, disposal)
    Run { phase: String },

    /// Tear the lab down; every disposal stage runs even if one fails
    Dispose,

    /// Run named actions in order (default: the model's activation list)
    Activate { names: Vec<String> },

    /// Run one or more named actions
    Action {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Show regions, hosts and components
    Show,

    /// List the components a selector matches ('*', '#tag' or an id)
    Select { selector: String },

    /// Validate the topology file
    Validate,
}

impl Commands {
    fn touches_hosts(&self) -> bool {
        matches!(
            self,
            Commands::Up
                | Commands::Run { .. }
                | Commands::Dispose
                | Commands::Activate { .. }
                | Commands::Action { .. }
        )
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.command.touches_hosts() {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = root::resolve_model(cli.model.as_deref()).and_then(|model| {
        let lab_dir = cli.lab_dir.as_deref();
        match &cli.command {
            Commands::Up => cmd::lab::up(&model, lab_dir, cli.json),
            Commands::Run { phase } => cmd::lab::run_phase(&model, lab_dir, phase, cli.json),
            Commands::Dispose => cmd::lab::dispose(&model, lab_dir, cli.json),
            Commands::Activate { names } | Commands::Action { names } => {
                cmd::lab::activate(&model, lab_dir, names, cli.json)
            }
            Commands::Show => cmd::show::run(&model, lab_dir, cli.json),
            Commands::Select { selector } => cmd::select::run(&model, lab_dir, selector, cli.json),
            Commands::Validate => cmd::validate::run(&model, cli.json),
        }
    });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
