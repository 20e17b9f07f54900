// File: src/main.rs
//
// CLI entry point: runs a script file or drops into the interactive REPL.
// Exit codes follow the common sysexits convention spec.md §6 calls for:
// 0 on success, 65 on a compile error, 70 on a runtime error.

use clap::{Parser as ClapParser, Subcommand};
use ember::vm::Engine;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "ember",
    about = "Ember: an embeddable bytecode scripting engine",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Path to the source file
        file: PathBuf,
    },
    /// Launch the interactive REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run { file }) => run_file(&file),
        Some(Commands::Repl) | None => {
            ember::repl::Repl::new().run();
            ExitCode::SUCCESS
        }
    }
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file '{}': {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let mut engine = Engine::new();
    let result = engine.interpret(&source);
    ExitCode::from(result.exit_code() as u8)
}
