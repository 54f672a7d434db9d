use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build {
        /// Leave out the espflash loader backend
        #[arg(long)]
        no_backend: bool,
    },
    /// Run the workspace tests
    Test {
        /// Leave out the espflash loader backend
        #[arg(long)]
        no_backend: bool,
    },
    /// Run the CLI
    Run {
        /// Arguments passed through to `stationflash`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the terminal UI
    Tui,
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { no_backend } => {
            println!("Building project...");
            if *no_backend {
                cargo(&["build", "--workspace", "--no-default-features"], "Build")?;
            } else {
                cargo(&["build", "--workspace"], "Build")?;
            }
        }
        Commands::Test { no_backend } => {
            println!("Running tests...");
            if *no_backend {
                cargo(&["test", "--workspace", "--no-default-features"], "Tests")?;
            } else {
                cargo(&["test", "--workspace"], "Tests")?;
            }
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut cmd = vec!["run", "-p", "stationflash-cli", "--"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Run")?;
        }
        Commands::Tui => {
            cargo(&["run", "-p", "stationflash-tui"], "Run")?;
        }
    }

    Ok(())
}
