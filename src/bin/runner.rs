//! Program runner CLI.
//!
//! Loads a wire-format program, installs the reference host bindings, and
//! executes it. The process exit code is the program's halt result.
//!
//! # Usage
//! ```text
//! wvrun <program>     run a program
//! wvrun -<program>    run with per-instruction tracing on stdout
//! ```

use std::env;
use std::process;
use wordvm::bindings;
use wordvm::error;
use wordvm::machine::Machine;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        error!("Invalid command line arguments ({} program.path.here)", args[0]);
        process::exit(1);
    }

    let (trace, path) = match args[1].strip_prefix('-') {
        Some(rest) if !rest.is_empty() => (true, rest),
        _ => (false, args[1].as_str()),
    };

    let mut machine = Machine::default();
    match machine.load_file(path) {
        Ok(true) => {}
        Ok(false) => {
            error!("Could not load {}: machine is busy", path);
            process::exit(1);
        }
        Err(e) => {
            error!("Could not read {}: {}", path, e);
            process::exit(1);
        }
    }

    bindings::install(&mut machine);
    machine.set_trace(trace);

    match machine.run() {
        Ok(result) => process::exit(result as i32),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
