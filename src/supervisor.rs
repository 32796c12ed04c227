//! The supervisor process: runs one job under the two-stage timeout and
//! tells the server which pid to watch.
use std::{
    fs::{File, OpenOptions},
    future::Future,
    io::Write,
    os::{
        fd::{FromRawFd, RawFd},
        unix::{fs::OpenOptionsExt, net::UnixStream},
    },
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use log::{info, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use thiserror::Error;

use crate::job::{self, Job, Report, Timeouts};

/// Environment variable naming the descriptor the job pid is written to.
pub const REPORT_FD_ENV: &str = "OVERSEER_REPORT_FD";
/// Descriptor the server maps its end of the report channel onto.
pub const REPORT_FD: RawFd = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    JobError(#[from] job::Error),
}

/// `supervise <grace> <force> <output|""> <log|""> <executable> [args...]`
#[derive(Debug, Parser)]
#[command(
    name = "supervise",
    about = "Run a job with a graceful then forceful timeout",
    disable_help_flag = true
)]
pub struct SupervisorArgs {
    /// Seconds before SIGTERM
    pub grace: u64,
    /// Seconds between SIGTERM and SIGKILL
    pub force: u64,
    /// File receiving the job's stdout and stderr, empty for none
    pub output: String,
    /// File receiving supervisor log lines, empty for stdout
    pub log: String,
    pub executable: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl SupervisorArgs {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            grace: Duration::from_secs(self.grace),
            force: Duration::from_secs(self.force),
        }
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        non_empty(&self.output)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        non_empty(&self.log)
    }

    /// Opens the log target, created or truncated with mode 0644.
    pub fn open_log(&self) -> Option<File> {
        let path = self.log_path()?;
        let opened = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o644)
            .open(&path);

        match opened {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("could not open log file {}: {}", path.display(), err);
                None
            }
        }
    }
}

fn non_empty(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// Write side of the channel the server reads the job pid from.
#[derive(Debug)]
pub struct ReportChannel {
    stream: UnixStream,
}

impl ReportChannel {
    /// Adopts the descriptor announced in [`REPORT_FD_ENV`], if any, and
    /// marks it close-on-exec so the job does not inherit it.
    pub fn from_env() -> Option<Self> {
        let fd: RawFd = std::env::var(REPORT_FD_ENV).ok()?.parse().ok()?;
        if let Err(err) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            warn!("ignoring report descriptor {}: {}", fd, err);
            return None;
        }

        // Safety: the descriptor was handed over by our parent and nothing
        // else in this process owns it.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Some(Self { stream })
    }

    pub fn report_pid(mut self, pid: i32) -> std::io::Result<()> {
        writeln!(self.stream, "{}", pid)?;
        self.stream.flush()
    }
}

/// Runs the job described by `args` to completion.
///
/// Returns `Ok(None)` when the executable could not be started.
pub async fn run<F>(
    args: &SupervisorArgs,
    report: Option<ReportChannel>,
    interrupt: F,
) -> Result<Option<Report>, Error>
where
    F: Future<Output = ()>,
{
    let job = Job::default().add_command(&args.executable, &args.args);
    info!("attempting to execute {}", job.cmdline());

    let output = args.output_path();
    let job = match job.isolate().redirect_output(output.as_deref()).spawn() {
        Ok(job) => job,
        Err(err) => {
            info!("could not execute {} - Error: {}", args.executable, err);
            // Dropping the channel unsent tells the server there is no job.
            drop(report);
            return Ok(None);
        }
    };

    info!("{} has been executed with pid {}", job.cmdline(), job.pid());
    if let Some(report) = report {
        if let Err(err) = report.report_pid(job.pid()) {
            warn!("could not report pid {} to server: {}", job.pid(), err);
        }
    }

    let report = job.supervise(args.timeouts(), interrupt).await?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader},
        os::unix::net::UnixStream,
        path::PathBuf,
        time::Duration,
    };

    use clap::Parser;

    use super::{run, ReportChannel, SupervisorArgs};
    use crate::job::JobStatus;

    fn parse(args: &[&str]) -> SupervisorArgs {
        let argv = std::iter::once("supervise").chain(args.iter().copied());
        SupervisorArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn given_positional_contract_then_args_are_parsed() {
        let args = parse(&["2", "1", "", "/tmp/job.log", "/bin/ls", "-l", "--all"]);
        assert_eq!(args.timeouts().grace, Duration::from_secs(2));
        assert_eq!(args.timeouts().force, Duration::from_secs(1));
        assert_eq!(args.output_path(), None);
        assert_eq!(args.log_path(), Some(PathBuf::from("/tmp/job.log")));
        assert_eq!(args.executable, "/bin/ls");
        assert_eq!(args.args, vec!["-l", "--all"]);
    }

    #[test]
    fn given_missing_executable_argument_then_parse_fails() {
        let outcome = SupervisorArgs::try_parse_from(["supervise", "1", "1", "", ""]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn given_report_channel_then_job_pid_is_sent() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let report = ReportChannel { stream: theirs };
        let args = parse(&["5", "5", "", "", "/bin/sh", "-c", "exit 0"]);

        let outcome = run(&args, Some(report), std::future::pending()).await.unwrap().unwrap();

        let mut line = String::new();
        BufReader::new(ours).read_line(&mut line).unwrap();
        assert_eq!(line.trim().parse::<i32>().unwrap(), outcome.pid);
        assert_eq!(outcome.status, JobStatus::Exit(0));
    }

    #[tokio::test]
    async fn given_unstartable_executable_then_channel_closes_without_pid() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let report = ReportChannel { stream: theirs };
        let args = parse(&["5", "5", "", "", "/nonexistent/job"]);

        let outcome = run(&args, Some(report), std::future::pending()).await.unwrap();
        assert!(outcome.is_none());

        let mut line = String::new();
        let read = BufReader::new(ours).read_line(&mut line).unwrap();
        assert_eq!(read, 0);
    }
}
