//! Assembly to instruction-stream compiler CLI.
//!
//! Reads one or more assembly source files and writes the assembled
//! wire-format program. Units are assembled in argument order with a shared
//! symbol table, so labels in a later file can target code in an earlier
//! one.
//!
//! # Usage
//! ```text
//! wvasm <output> <input.asm>... [OPTIONS]
//! ```
//!
//! # Options
//! - `-d, --dump`: print the symbol and variable tables to standard error

use std::env;
use std::process;
use wordvm::assembler::Assembler;
use wordvm::program;
use wordvm::{error, info, warn};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h") {
        print_usage(&args[0]);
        process::exit(0);
    }

    let mut dump = false;
    let mut paths: Vec<&String> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "--dump" | "-d" => dump = true,
            other if other.starts_with('-') => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
            _ => paths.push(arg),
        }
    }

    if paths.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }
    let output_path = paths[0];
    let inputs = &paths[1..];

    let mut assembler = Assembler::new();
    for input in inputs {
        if let Err(e) = assembler.add_file(input) {
            error!("{}: {}", input, e);
            process::exit(1);
        }
    }

    let assembled = match assembler.assemble() {
        Ok(a) => a,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    for warning in &assembled.warnings {
        warn!("{}", warning);
    }

    if dump {
        eprintln!("labels:");
        for (label, pc) in &assembled.symbols {
            eprintln!("  {pc:>8}  @{label}");
        }
        eprintln!("variables:");
        for (index, name) in assembled.variables.iter().enumerate() {
            eprintln!("  {index:>8}  #{name}");
        }
    }

    if let Err(e) = program::write_file(&assembled.words, output_path) {
        error!("{}", e);
        process::exit(1);
    }

    info!(
        "Assembled {} unit(s) -> {} ({} words)",
        inputs.len(),
        output_path,
        assembled.words.len()
    );
}

const USAGE: &str = "\
Assembler

USAGE:
    {program} <output> <input.asm>... [OPTIONS]

ARGS:
    <output>       Wire-format program file to write
    <input.asm>    Assembly source files, assembled in order

OPTIONS:
    -d, --dump     Print the symbol and variable tables to stderr
    -h, --help     Print this help message

EXAMPLES:
    # Assemble one file
    {program} program.hex program.asm

    # Assemble two units into one program
    {program} program.hex lib.asm main.asm
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
