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

//! The `marty_lockstep_config` crate reads the lockstep validator's configuration file and
//! overlays command line arguments on top of it. Command line arguments always take priority
//! over the configuration file.
//!
//! Features:
//! - `use_bpaf`: Enable BPAF support for command line argument parsing.

mod bpaf_config;

use std::path::{Path, PathBuf};

pub use bpaf_config::{parse_number, CmdLineArgs};

#[cfg(feature = "use_bpaf")]
use bpaf_config::cli_args;

use cfg_if::cfg_if;
use marty_lockstep::{
    memory::{ProtMapping, PAGE_SIZE},
    tracelogger::TraceLogger,
    SessionOptions,
};
use serde_derive::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "lockstep.toml";

const fn _default_true() -> bool {
    true
}
const fn _default_dump_size() -> usize {
    PAGE_SIZE
}

#[derive(Debug, Deserialize)]
pub struct Validator {
    #[serde(default = "_default_true")]
    pub mask_flags: bool,
    #[serde(default)]
    pub ignore_flags: u32,
    #[serde(default)]
    pub prot_mapping: ProtMapping,
    pub trace_file: Option<PathBuf>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            mask_flags:   true,
            ignore_flags: 0,
            prot_mapping: ProtMapping::default(),
            trace_file:   None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Debugger {
    #[serde(default)]
    pub pause_on_divergence: bool,
}

#[derive(Debug, Deserialize)]
pub struct Dump {
    pub file:  Option<PathBuf>,
    #[serde(default)]
    pub start: u32,
    #[serde(default = "_default_dump_size")]
    pub size:  usize,
}

impl Default for Dump {
    fn default() -> Self {
        Self {
            file:  None,
            start: 0,
            size:  PAGE_SIZE,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFileParams {
    #[serde(default)]
    pub validator: Validator,
    #[serde(default)]
    pub debugger:  Debugger,
    #[serde(default)]
    pub dump:      Dump,
    /// Program and arguments handed to the emulator's loader. Only set from the command line.
    #[serde(skip)]
    pub program:   Vec<String>,
}

impl ConfigFileParams {
    pub fn overlay(&mut self, shell_args: CmdLineArgs) {
        if let Some(trace_file) = shell_args.trace_file {
            self.validator.trace_file = Some(trace_file);
        }
        if shell_args.no_flag_mask {
            self.validator.mask_flags = false;
        }
        if shell_args.strict_exec {
            self.validator.prot_mapping = ProtMapping::Strict;
        }
        if let Some(ignore_flags) = shell_args.ignore_flags {
            self.validator.ignore_flags = ignore_flags;
        }

        self.debugger.pause_on_divergence |= shell_args.pause;

        if let Some(dump_file) = shell_args.dump_file {
            self.dump.file = Some(dump_file);
        }
        if let Some(dump_start) = shell_args.dump_start {
            self.dump.start = dump_start;
        }
        if let Some(dump_size) = shell_args.dump_size {
            self.dump.size = dump_size as usize;
        }

        self.program = shell_args.program;
    }

    /// Build session options. Opens the trace file, if one is configured.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mask_flags:   self.validator.mask_flags,
            ignore_flags: self.validator.ignore_flags,
            prot_mapping: self.validator.prot_mapping,
            trace:        match &self.validator.trace_file {
                Some(path) => TraceLogger::from_filename(path),
                None => TraceLogger::None,
            },
        }
    }
}

pub fn read_config(toml_string: impl AsRef<str>, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error> {
    let mut toml_args: ConfigFileParams = toml::from_str(toml_string.as_ref())?;

    // Command line arguments override config file arguments
    toml_args.overlay(shell_args);
    Ok(toml_args)
}

/// Read the configuration file and overlay `shell_args`. A configuration file named on the command
/// line must exist; a missing default file means every setting keeps its default.
pub fn read_config_args<P>(default_path: P, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    let toml_string = if let Some(configfile_path) = shell_args.config_file.as_ref() {
        std::fs::read_to_string(configfile_path)?
    }
    else if default_path.as_ref().exists() {
        std::fs::read_to_string(default_path.as_ref())?
    }
    else {
        log::debug!(
            "No configuration file at {}, using defaults",
            default_path.as_ref().display()
        );
        String::new()
    };

    read_config(toml_string, shell_args)
}

/// Read the TOML configuration from a file path, parse and overlay command line arguments.
pub fn read_config_file<P>(default_path: P) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    let shell_args: CmdLineArgs;

    cfg_if! {
        if #[cfg(feature = "use_bpaf")] {
            log::debug!("Reading command line arguments...");
            shell_args = cli_args().run();
        } else {
            log::debug!("Argument reading disabled...");
            shell_args = CmdLineArgs::default();
        }
    }

    read_config_args(default_path, shell_args)
}
