//! Command grammar of the `controller` client, after the address and port:
//!
//! ```text
//! mem [pid]
//! memkill <percent>
//! [-o out_file] [-log log_file] [-t seconds] <file> [arg...]
//! ```
use thiserror::Error;

use crate::request::{self, JobSpec, Request};

pub const USAGE: &str = "Usage: controller <address> <port> \
{[-o out_file] [-log log_file] [-t seconds] <file> [arg...] | mem [pid] | memkill <percent>}";

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("Please specify file to run")]
    MissingFile,
    #[error("Wrong command syntax")]
    WrongSyntax,
    #[error("Missing value for {0}")]
    MissingValue(&'static str),
    #[error("Too many arguments for '{0}' cmd")]
    TooManyArguments(&'static str),
    #[error("Please specify percentage for memkill")]
    MissingPercent,
    #[error(transparent)]
    Invalid(#[from] request::Error),
}

// Options accepted before the file, in the only order allowed.
const OPTIONS: [&str; 3] = ["-o", "-log", "-t"];

pub fn parse_request(args: &[String]) -> Result<Request, Error> {
    match args.first().map(String::as_str) {
        Some("mem") => match &args[1..] {
            [] => Ok(Request::Query(None)),
            [pid] => Ok(Request::Query(Some(request::parse_pid(pid)?))),
            _ => Err(Error::TooManyArguments("mem")),
        },
        Some("memkill") => match &args[1..] {
            [] => Err(Error::MissingPercent),
            [percent] => Ok(Request::EnforceMemory(request::parse_percent(percent)?)),
            _ => Err(Error::TooManyArguments("memkill")),
        },
        _ => parse_execute(args).map(Request::Execute),
    }
}

fn parse_execute(args: &[String]) -> Result<JobSpec, Error> {
    let mut output = None;
    let mut log = None;
    let mut timeout = None;
    let mut next_option = 0;
    let mut rest = args;

    while let Some(position) = rest.first().and_then(|arg| OPTIONS.iter().position(|o| o == arg)) {
        // each option at most once, in declaration order
        if position < next_option {
            return Err(Error::WrongSyntax);
        }
        next_option = position + 1;

        let value = rest.get(1).ok_or(Error::MissingValue(OPTIONS[position]))?;
        match position {
            0 => output = Some(value.into()),
            1 => log = Some(value.into()),
            _ => timeout = Some(request::parse_timeout(value)?),
        }
        rest = &rest[2..];
    }

    if rest.is_empty() {
        return Err(Error::MissingFile);
    }

    Ok(JobSpec { output, log, timeout, argv: rest.to_vec() })
}
