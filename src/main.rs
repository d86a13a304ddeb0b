use clap::{Parser, Subcommand};
use clap_verbosity_flag::{LogLevel, Verbosity};
use macros_rs::string;

use portman::{cli, globals};

#[derive(Copy, Clone, Debug, Default)]
struct NoneLevel;
impl LogLevel for NoneLevel {
    fn default() -> Option<log::Level> {
        None
    }
}

#[derive(Parser)]
#[command(name = "portman", version, about = "Name your local dev servers and reach them on one port")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[clap(flatten)]
    verbose: Verbosity<NoneLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a command under a name and start it
    Add {
        /// Command line to run, quoted
        command: String,
        /// App name (default: current directory name)
        #[arg(short, long)]
        name: Option<String>,
        /// Log file path, relative to the current directory
        #[arg(short, long)]
        out: Option<String>,
        /// Environment entry, KEY=VALUE or bare KEY to forward your own
        #[arg(short, long)]
        env: Vec<String>,
    },
    /// Stop an app and remove it
    #[command(visible_alias = "remove", visible_alias = "del")]
    Rm {
        /// App name
        name: String,
    },
    /// List registered apps
    #[command(visible_alias = "list")]
    Ls {
        /// Format output
        #[arg(long, default_value_t = string!("default"))]
        format: String,
    },
    /// Start the daemon
    Start,
    /// Stop the daemon and every app it supervises
    Stop,
}

fn main() {
    globals::init();

    let cli = Cli::parse();
    let mut env = env_logger::Builder::new();

    env.filter_level(cli.verbose.log_level_filter()).init();

    match &cli.command {
        Commands::Add { command, name, out, env } => cli::add(name, command, env, out),
        Commands::Rm { name } => cli::remove(name),
        Commands::Ls { format } => cli::list(format),
        Commands::Start => cli::start_daemon(),
        Commands::Stop => cli::stop_daemon(),
    }
}
