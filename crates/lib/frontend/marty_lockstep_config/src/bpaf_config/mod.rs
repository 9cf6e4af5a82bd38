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

    bpaf_config/mod.rs

    Command line argument parsing.

*/

use std::{num::ParseIntError, path::PathBuf};

#[cfg(feature = "use_bpaf")]
use bpaf::{Bpaf, Parser};

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(s: &str) -> Result<u32, ParseIntError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(&hex.replace('_', ""), 16)
    }
    else {
        s.replace('_', "").parse::<u32>()
    }
}

#[cfg(feature = "use_bpaf")]
fn number_arg(name: &'static str, help: &'static str) -> impl Parser<Option<u32>> {
    bpaf::long(name)
        .help(help)
        .argument::<String>("NUMBER")
        .parse(|s| parse_number(&s))
        .optional()
}

#[cfg(feature = "use_bpaf")]
fn ignore_flags_arg() -> impl Parser<Option<u32>> {
    number_arg("ignore_flags", "EFLAGS bits never compared, e.g. 0x10 for AF")
}

#[cfg(feature = "use_bpaf")]
fn dump_start_arg() -> impl Parser<Option<u32>> {
    number_arg("dump_start", "Address of the memory dumped on divergence")
}

#[cfg(feature = "use_bpaf")]
fn dump_size_arg() -> impl Parser<Option<u32>> {
    number_arg("dump_size", "Number of bytes dumped on divergence")
}

#[cfg(feature = "use_bpaf")]
fn program_arg() -> impl Parser<Vec<String>> {
    bpaf::positional::<String>("PROGRAM")
        .help("Program to run under the validator, followed by its arguments")
        .many()
}

#[cfg_attr(feature = "use_bpaf", derive(Bpaf))]
#[cfg_attr(feature = "use_bpaf", bpaf(options, version, generate(cli_args)))]
#[derive(Debug, Default)]
pub struct CmdLineArgs {
    #[cfg_attr(feature = "use_bpaf", bpaf(long("config_file"), long("configfile")))]
    pub config_file: Option<PathBuf>,

    #[cfg_attr(feature = "use_bpaf", bpaf(long("trace_file"), long("tracefile")))]
    pub trace_file: Option<PathBuf>,

    /// Compare every flag bit, including those the instruction leaves undefined
    #[cfg_attr(feature = "use_bpaf", bpaf(long("no_flag_mask"), switch))]
    pub no_flag_mask: bool,

    /// Only map pages executable in the reference engine if they are executable in the emulator
    #[cfg_attr(feature = "use_bpaf", bpaf(long("strict_exec"), switch))]
    pub strict_exec: bool,

    #[cfg_attr(feature = "use_bpaf", bpaf(external(ignore_flags_arg)))]
    pub ignore_flags: Option<u32>,

    /// Wait for Enter before exiting on divergence
    #[cfg_attr(feature = "use_bpaf", bpaf(long, switch))]
    pub pause: bool,

    #[cfg_attr(feature = "use_bpaf", bpaf(long("dump_file")))]
    pub dump_file: Option<PathBuf>,

    #[cfg_attr(feature = "use_bpaf", bpaf(external(dump_start_arg)))]
    pub dump_start: Option<u32>,

    #[cfg_attr(feature = "use_bpaf", bpaf(external(dump_size_arg)))]
    pub dump_size: Option<u32>,

    #[cfg_attr(feature = "use_bpaf", bpaf(external(program_arg)))]
    pub program: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_parse_in_both_radixes() {
        assert_eq!(parse_number("4096"), Ok(4096));
        assert_eq!(parse_number("0x08048000"), Ok(0x0804_8000));
        assert_eq!(parse_number("0X10"), Ok(0x10));
        assert_eq!(parse_number("0x0804_8000"), Ok(0x0804_8000));
        assert!(parse_number("0xZZ").is_err());
        assert!(parse_number("").is_err());
    }

    #[cfg(feature = "use_bpaf")]
    #[test]
    fn command_line_is_parsed() {
        let args = cli_args()
            .run_inner(bpaf::Args::from(&[
                "--trace_file",
                "trace.log",
                "--no_flag_mask",
                "--ignore_flags",
                "0x10",
                "--dump_start",
                "0x8048000",
                "/bin/true",
                "arg1",
            ]))
            .unwrap();

        assert_eq!(args.trace_file, Some(PathBuf::from("trace.log")));
        assert!(args.no_flag_mask);
        assert!(!args.strict_exec);
        assert_eq!(args.ignore_flags, Some(0x10));
        assert_eq!(args.dump_start, Some(0x0804_8000));
        assert_eq!(args.dump_size, None);
        assert_eq!(args.program, vec!["/bin/true".to_string(), "arg1".to_string()]);
    }
}
