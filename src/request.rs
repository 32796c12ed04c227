use std::{ffi::OsString, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{Command, CommandKind, Flag, FlagKind};

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("Execute request needs a file to run")]
    MissingFile,
    #[error("{0:?} request carries file arguments")]
    UnexpectedFiles(CommandKind),
    #[error("{0:?} request needs exactly one flag, got {1}")]
    FlagCount(CommandKind, usize),
    #[error("Flag {0:?} is not valid for a {1:?} request")]
    UnexpectedFlag(FlagKind, CommandKind),
    #[error("Flag {0:?} given more than once")]
    DuplicateFlag(FlagKind),
    #[error("Flag {0:?} requires a value")]
    MissingValue(FlagKind),
    #[error("Invalid timeout '{0}'")]
    InvalidTimeout(String),
    #[error("Invalid pid '{0}'")]
    InvalidPid(String),
    #[error("Invalid percentage '{0}'")]
    InvalidPercent(String),
}

/// What a client asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub output: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Executable followed by its own arguments; never empty.
    pub argv: Vec<String>,
}

impl JobSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self { output: None, log: None, timeout: None, argv }
    }

    pub fn executable(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Positional arguments for the supervisor:
    /// grace, force, output-or-empty, log-or-empty, executable, args...
    pub fn supervisor_args(&self, grace: Duration, force: Duration) -> Vec<OsString> {
        let grace = self.timeout.unwrap_or(grace);
        let path_or_empty = |path: &Option<PathBuf>| {
            path.as_ref().map(|p| p.as_os_str().to_owned()).unwrap_or_default()
        };

        let mut args = Vec::with_capacity(self.argv.len() + 4);
        args.push(grace.as_secs().to_string().into());
        args.push(force.as_secs().to_string().into());
        args.push(path_or_empty(&self.output));
        args.push(path_or_empty(&self.log));
        args.extend(self.argv.iter().map(OsString::from));
        args
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Execute(JobSpec),
    /// `None` lists every job sampled in the last window.
    Query(Option<i32>),
    EnforceMemory(f64),
}

impl TryFrom<Command> for Request {
    type Error = Error;

    fn try_from(command: Command) -> Result<Self, Self::Error> {
        let Command { kind, flags, files } = command;
        match kind {
            CommandKind::Execute => execute(flags, files),
            CommandKind::Query => {
                let value = single_flag(kind, FlagKind::Mem, flags, files)?;
                let pid = value.map(|v| parse_pid(&v)).transpose()?;
                Ok(Request::Query(pid))
            }
            CommandKind::EnforceMemory => {
                let value = single_flag(kind, FlagKind::MemKill, flags, files)?
                    .ok_or(Error::MissingValue(FlagKind::MemKill))?;
                Ok(Request::EnforceMemory(parse_percent(&value)?))
            }
        }
    }
}

impl From<&Request> for Command {
    fn from(request: &Request) -> Self {
        match request {
            Request::Execute(spec) => {
                let mut flags = Vec::new();
                if let Some(output) = &spec.output {
                    flags.push(Flag::new(FlagKind::Output, Some(output.display().to_string())));
                }
                if let Some(log) = &spec.log {
                    flags.push(Flag::new(FlagKind::Log, Some(log.display().to_string())));
                }
                if let Some(timeout) = &spec.timeout {
                    flags.push(Flag::new(FlagKind::Timeout, Some(timeout.as_secs().to_string())));
                }
                Command { kind: CommandKind::Execute, flags, files: spec.argv.clone() }
            }
            Request::Query(pid) => Command {
                kind: CommandKind::Query,
                flags: vec![Flag::new(FlagKind::Mem, pid.map(|p| p.to_string()))],
                files: vec![],
            },
            Request::EnforceMemory(percent) => Command {
                kind: CommandKind::EnforceMemory,
                flags: vec![Flag::new(FlagKind::MemKill, Some(percent.to_string()))],
                files: vec![],
            },
        }
    }
}

fn execute(flags: Vec<Flag>, files: Vec<String>) -> Result<Request, Error> {
    if files.is_empty() {
        return Err(Error::MissingFile);
    }

    let mut spec = JobSpec::new(files);
    let mut seen = Vec::with_capacity(flags.len());
    for Flag { kind, value } in flags {
        if seen.contains(&kind) {
            return Err(Error::DuplicateFlag(kind));
        }
        seen.push(kind);

        let value = value.ok_or(Error::MissingValue(kind))?;
        match kind {
            FlagKind::Output => spec.output = Some(value.into()),
            FlagKind::Log => spec.log = Some(value.into()),
            FlagKind::Timeout => spec.timeout = Some(parse_timeout(&value)?),
            other => return Err(Error::UnexpectedFlag(other, CommandKind::Execute)),
        }
    }

    Ok(Request::Execute(spec))
}

fn single_flag(
    kind: CommandKind,
    expected: FlagKind,
    mut flags: Vec<Flag>,
    files: Vec<String>,
) -> Result<Option<String>, Error> {
    if !files.is_empty() {
        return Err(Error::UnexpectedFiles(kind));
    }
    if flags.len() != 1 {
        return Err(Error::FlagCount(kind, flags.len()));
    }

    let flag = flags.remove(0);
    if flag.kind != expected {
        return Err(Error::UnexpectedFlag(flag.kind, kind));
    }
    Ok(flag.value)
}

pub fn parse_timeout(value: &str) -> Result<Duration, Error> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(Error::InvalidTimeout(value.to_owned())),
    }
}

pub fn parse_pid(value: &str) -> Result<i32, Error> {
    match value.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(Error::InvalidPid(value.to_owned())),
    }
}

pub fn parse_percent(value: &str) -> Result<f64, Error> {
    match value.trim().parse::<f64>() {
        Ok(percent) if percent.is_finite() && percent >= 0.0 => Ok(percent),
        _ => Err(Error::InvalidPercent(value.to_owned())),
    }
}

/// An accepted `Execute` request waiting for a worker.
#[derive(Debug)]
pub struct PendingRequest {
    id: Uuid,
    received: DateTime<Local>,
    spec: JobSpec,
    argv: Arc<[String]>,
}

impl PendingRequest {
    pub fn new(spec: JobSpec) -> Self {
        let argv = spec.argv.clone().into();
        Self { id: Uuid::new_v4(), received: Local::now(), spec, argv }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn received(&self) -> DateTime<Local> {
        self.received
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// The argument vector shared by every sample this job produces.
    pub fn argv(&self) -> Arc<[String]> {
        self.argv.clone()
    }
}
