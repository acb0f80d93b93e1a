// File: src/main.rs
//
// Entry point for the `panda` CLI: run a script file, or with no
// arguments drop into the REPL. Exit codes follow the convention the
// compiler and VM diagnostics are built around: 0 success, 65 a compile
// error, 70 a runtime error, 74 an I/O error, 64 CLI misuse.

mod chunk;
mod compiler;
mod debug;
mod errors;
mod gc;
mod lexer;
mod object;
mod repl;
mod table;
mod value;
mod vm;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use errors::PandaError;
use vm::Vm;

#[derive(Parser)]
#[command(
    name = "panda",
    about = "Panda: a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a .panda script. Omit to start the REPL. More than one is
    /// a usage error: this CLI runs exactly one script or none.
    files: Vec<PathBuf>,

    /// Collect garbage before every allocation (exercises the GC hard).
    #[arg(long)]
    stress_gc: bool,

    /// Print each chunk's disassembly before executing it.
    #[arg(long)]
    disassemble: bool,

    /// Log every allocation and collection cycle to stderr.
    #[arg(long)]
    log_gc: bool,
}

const USAGE: &str = "Usage: panda [script]";

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    print!("{err}");
                    return ExitCode::SUCCESS;
                }
                _ => {
                    eprint!("{err}");
                    return ExitCode::from(64);
                }
            }
        }
    };

    let mut files = cli.files.into_iter();
    let file = files.next();
    if files.next().is_some() {
        eprintln!("{}", USAGE.bright_red());
        return ExitCode::from(64);
    }

    match file {
        None => run_repl(cli.stress_gc, cli.log_gc),
        Some(path) => run_file(&path, cli.stress_gc, cli.disassemble, cli.log_gc),
    }
}

fn run_repl(stress_gc: bool, log_gc: bool) -> ExitCode {
    match repl::Repl::new(stress_gc, log_gc) {
        Ok(mut repl) => {
            if let Err(err) = repl.run() {
                eprintln!("{} {}", "Error:".bright_red(), err);
                return ExitCode::from(74);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{} {}", "Error:".bright_red(), err);
            ExitCode::from(74)
        }
    }
}

fn run_file(path: &PathBuf, stress_gc: bool, disassemble: bool, log_gc: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{} could not read '{}': {}", "Error:".bright_red(), path.display(), e);
            return ExitCode::from(74);
        }
    };

    if disassemble {
        debug::disassemble_source(&source, &path.to_string_lossy());
    }

    let mut vm = Vm::new(stress_gc, log_gc);
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(PandaError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            ExitCode::from(65)
        }
        Err(err @ PandaError::Runtime { .. }) => {
            eprintln!("{err}");
            ExitCode::from(70)
        }
    }
}
