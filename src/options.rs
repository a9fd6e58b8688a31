// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command-line options for the runtime.
//!
//! The parser consumes the options it recognizes from the argument
//! vector in place and leaves everything else for the host program, so a
//! host can hand its own `argv` through and keep parsing afterwards.

use std::fmt;

use crate::stack::DEFAULT_STACK_SIZE_BYTES;

/// Runtime configuration knobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Options {
    /// Number of cores (kernel threads) to drive.
    pub num_cores: usize,
    /// Per-thread stack size in bytes.
    pub stack_size: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            num_cores: 2,
            stack_size: DEFAULT_STACK_SIZE_BYTES,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// An option was given without its value.
    MissingValue(String),
    /// An option value was not a number.
    InvalidValue(String, String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::MissingValue(opt) => write!(f, "option {} needs a value", opt),
            ParseError::InvalidValue(opt, value) => {
                write!(f, "invalid value '{}' for option {}", value, opt)
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl Options {
    /// Parses runtime options out of `args`, mutating it in place.
    ///
    /// Recognized options (and their values) are removed from `args`:
    /// `-c N`/`--numCores N` and `-s N`/`--stackSize N`. Parsing stops
    /// at `--` (which is removed as well) or at the first unrecognized
    /// argument (which is left in place, along with everything after
    /// it). `args[0]` is assumed to be the program name and skipped.
    pub fn parse(args: &mut Vec<String>) -> Result<Options, ParseError> {
        let mut options = Options::default();
        let index = 1;
        while index < args.len() {
            match args[index].as_str() {
                "-c" | "--numCores" => options.num_cores = take_value(args, index)?,
                "-s" | "--stackSize" => options.stack_size = take_value(args, index)?,
                "--" => {
                    args.remove(index);
                    break;
                }
                _ => break,
            }
        }
        Ok(options)
    }
}

/// Removes the option at `index` and its value from `args`, returning
/// the parsed value.
fn take_value(args: &mut Vec<String>, index: usize) -> Result<usize, ParseError> {
    if index + 1 >= args.len() {
        return Err(ParseError::MissingValue(args[index].clone()));
    }
    let option = args.remove(index);
    let value = args.remove(index);
    value
        .parse()
        .map_err(|_| ParseError::InvalidValue(option, value))
}
