/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------
*/

//! MartyPC lockstep validator front-end.
//!
//! The emulator under test is supplied by the embedding program through [`Bootstrap`]; a minimal
//! `main` looks like:
//!
//! ```ignore
//! fn main() {
//!     martypc_lockstep::run::<_, marty_lockstep::unicorn::UnicornEngine>(MyLoader::new());
//! }
//! ```

#![forbid(unsafe_code)]

mod debugger;

use colored::*;

use marty_lockstep::{
    dump::dump_memory,
    session::DivergenceReport,
    LockstepSession,
    PrimaryEngine,
    ReferenceEngine,
    X86UndefinedFlags,
};
use marty_lockstep_config::{ConfigFileParams, DEFAULT_CONFIG_FILE};

pub use crate::debugger::ConsoleDebugger;

/// Exit status after the first divergence.
pub const EXIT_DIVERGED: i32 = -1;
/// Exit status for configuration errors and fatal reference engine failures.
pub const EXIT_FATAL: i32 = 1;

/// Builds the emulator under test with `program` loaded and ready to run its first instruction.
pub trait Bootstrap {
    type Engine: PrimaryEngine;

    /// On failure, returns the loader's error number.
    fn boot(&mut self, program: &[String]) -> Result<Self::Engine, i32>;
}

impl<F, P> Bootstrap for F
where
    F: FnMut(&[String]) -> Result<P, i32>,
    P: PrimaryEngine,
{
    type Engine = P;

    fn boot(&mut self, program: &[String]) -> Result<P, i32> {
        self(program)
    }
}

/// Read the configuration, run the validator and exit the process.
pub fn run<B, R>(boot: B) -> !
where
    B: Bootstrap,
    R: ReferenceEngine,
{
    env_logger::init();

    let config = match marty_lockstep_config::read_config_file(DEFAULT_CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => match e.downcast_ref::<std::io::Error>() {
            Some(e) => {
                eprintln!("Error reading configuration file: {}", e);
                std::process::exit(EXIT_FATAL);
            }
            None => {
                eprintln!(
                    "Failed to parse configuration file. There may be a typo or otherwise invalid toml:\n{}",
                    e
                );
                std::process::exit(EXIT_FATAL);
            }
        },
    };

    std::process::exit(run_with_config::<B, R>(boot, &config))
}

/// Run the validator with an already resolved configuration and return the process exit status.
pub fn run_with_config<B, R>(mut boot: B, config: &ConfigFileParams) -> i32
where
    B: Bootstrap,
    R: ReferenceEngine,
{
    if config.program.is_empty() {
        log::warn!("No program given; starting the emulator with an empty command line.");
    }

    let primary = match boot.boot(&config.program) {
        Ok(primary) => primary,
        Err(errno) => {
            eprintln!("Failed to load {:?}: error {}", config.program, errno);
            return bootstrap_exit_code(errno);
        }
    };

    let debugger = ConsoleDebugger::new(config.debugger.pause_on_divergence);
    let mut session = match LockstepSession::<_, R, _, _>::start(
        primary,
        X86UndefinedFlags,
        debugger,
        config.session_options(),
    ) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{} {}", "Failed to initialize reference engine:".red(), e);
            return EXIT_FATAL;
        }
    };

    log::info!(
        "Validating {:?} (undefined flag mask {})",
        config.program,
        if config.validator.mask_flags { "on" } else { "off" }
    );

    match session.run() {
        Ok(report) => {
            print_report(&report, &session.primary().registers());
            if let Some(dump_file) = &config.dump.file {
                match dump_memory(session.reference_mut(), dump_file, config.dump.start, config.dump.size) {
                    Ok(()) => println!("Reference memory written to {}", dump_file.display()),
                    Err(e) => log::error!("{}", e),
                }
            }
            EXIT_DIVERGED
        }
        Err(e) => {
            eprintln!(
                "{} {} after {} instructions",
                "Reference engine failure:".red(),
                e,
                session.instruction_count()
            );
            EXIT_FATAL
        }
    }
}

/// Loader errors are reported as negative numbers, whatever sign the loader used.
fn bootstrap_exit_code(errno: i32) -> i32 {
    match errno {
        0 => EXIT_FATAL,
        e if e < 0 => e,
        e => -e,
    }
}

fn print_report(report: &DivergenceReport, restored: &marty_lockstep::Registers) {
    println!(
        "{} after {} instructions",
        "DIVERGENCE".red().bold(),
        report.instruction_count
    );
    println!("  {}", report.divergence);
    println!(
        "  Emulator restored to the state before the instruction at {}:",
        format!("{:08X}", report.last_good_eip).yellow()
    );
    println!("  {}", restored);
}
