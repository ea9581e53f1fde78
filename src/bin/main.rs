mod cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "guestcall", about = "Run an executable inside a KVM sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an executable into a sandbox and call it once.
    Run(cmd::run::Cmd),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(cmd) => cmd.execute(),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
