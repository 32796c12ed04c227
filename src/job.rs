use std::{
    fmt,
    fs::{File, OpenOptions},
    future::Future,
    os::unix::{fs::OpenOptionsExt, process::ExitStatusExt},
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use log::{info, warn};
use nix::{
    errno::Errno,
    sys::signal::{self, kill, SigHandler, Signal},
    unistd::{setpgid, Pid},
};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::Empty;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error("Failed to send {1} to {0}: {2}")]
    Signal(i32, Signal, Errno),
    #[error("Spawned child has no pid")]
    MissingPid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Exit(i32),
    Signal(i32),
}

impl From<ExitStatus> for JobStatus {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => JobStatus::Exit(code),
            (None, Some(signal)) => JobStatus::Signal(signal),
            // Neither is only possible for stopped/continued children,
            // which `wait` never reports.
            (None, None) => JobStatus::Exit(-1),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Exit(code) => write!(f, "has terminated with status code {}", code),
            JobStatus::Signal(signal) => write!(f, "was terminated by signal {}", signal),
        }
    }
}

/// Supervision states of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    GraceWait,
    ForceWait,
    Reaped,
}

impl Phase {
    /// How long this phase may last before escalating. `None` waits forever.
    pub fn deadline(self, timeouts: &Timeouts) -> Option<Duration> {
        match self {
            Phase::Running => Some(timeouts.grace),
            Phase::GraceWait => Some(timeouts.force),
            Phase::Starting | Phase::ForceWait | Phase::Reaped => None,
        }
    }

    /// The phase entered when this one times out, with the signal sent on entry.
    pub fn escalate(self) -> Option<(Phase, Signal)> {
        match self {
            Phase::Running => Some((Phase::GraceWait, Signal::SIGTERM)),
            Phase::GraceWait => Some((Phase::ForceWait, Signal::SIGKILL)),
            Phase::Starting | Phase::ForceWait | Phase::Reaped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub grace: Duration,
    pub force: Duration,
}

/// Outcome of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub pid: i32,
    pub status: JobStatus,
    /// Phase the job was in when it was reaped.
    pub reaped_from: Phase,
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct Job<H> {
    cmdline: String,
    handle: H,
}

pub struct Initialized;

#[derive(Debug)]
pub struct Started {
    child: Child,
    pid: i32,
}

impl Default for Job<Empty> {
    fn default() -> Self {
        Self { cmdline: String::new(), handle: Empty }
    }
}

impl<H> Job<H> {
    /// Executable and arguments joined by spaces, for log lines.
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }
}

impl Job<Empty> {
    pub fn add_command(self, executable: &str, args: &[String]) -> Job<(Command, Empty, Empty)> {
        let mut cmdline = executable.to_owned();
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }

        let mut cmd = Command::new(executable);
        cmd.args(args).stdin(Stdio::inherit());

        Job { cmdline, handle: (cmd, Empty, Empty) }
    }
}

impl<O> Job<(Command, Empty, O)> {
    /// Moves the child into its own process group and makes it ignore
    /// SIGINT, so an interrupt aimed at the supervisor never reaches it
    /// directly.
    pub fn isolate(self) -> Job<(Command, Initialized, O)> {
        let Self { cmdline, handle } = self;
        let (mut cmd, _, output) = handle;

        // Safety: setpgid and sigaction are async-signal-safe
        unsafe {
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                signal::signal(Signal::SIGINT, SigHandler::SigIgn)?;
                Ok(())
            });
        }

        Job { cmdline, handle: (cmd, Initialized, output) }
    }
}

impl<I> Job<(Command, I, Empty)> {
    /// Sends stdout and stderr to `path`, created or truncated with mode 0644.
    ///
    /// A file that cannot be opened is logged and the child keeps the
    /// supervisor's streams.
    pub fn redirect_output(self, path: Option<&Path>) -> Job<(Command, I, Initialized)> {
        let Self { cmdline, handle } = self;
        let (mut cmd, isolation, _) = handle;

        if let Some(path) = path {
            match open_output(path) {
                Ok((out, err)) => {
                    cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
                }
                Err(err) => warn!("could not open output file {}: {}", path.display(), err),
            }
        }

        Job { cmdline, handle: (cmd, isolation, Initialized) }
    }
}

impl Job<(Command, Initialized, Initialized)> {
    /// Forks and execs the target.
    ///
    /// An exec failure comes back as `Err` here: the child writes its errno
    /// to a close-on-exec pipe, so reading zero bytes means the exec went
    /// through.
    pub fn spawn(self) -> Result<Job<Started>, Error> {
        let Self { cmdline, handle } = self;
        let (mut cmd, ..) = handle;

        let child = cmd.spawn()?;
        let pid = child.id().ok_or(Error::MissingPid)? as i32;

        Ok(Job { cmdline, handle: Started { child, pid } })
    }
}

impl Job<Started> {
    pub fn pid(&self) -> i32 {
        self.handle.pid
    }

    /// Waits for the job, escalating SIGTERM then SIGKILL as the timeouts
    /// expire. `interrupt` resolving before the job is reaped kills it at once.
    pub async fn supervise<F>(self, timeouts: Timeouts, interrupt: F) -> Result<Report, Error>
    where
        F: Future<Output = ()>,
    {
        let Self { handle, .. } = self;
        let Started { mut child, pid } = handle;
        tokio::pin!(interrupt);

        let mut phase = Phase::Running;
        loop {
            let Some(limit) = phase.deadline(&timeouts) else {
                let status = child.wait().await?;
                return Ok(reaped(pid, status, phase, false));
            };

            tokio::select! {
                biased;
                _ = &mut interrupt => {
                    info!("interrupted, sending SIGKILL to {}", pid);
                    send_signal(pid, Signal::SIGKILL)?;
                    let status = child.wait().await?;
                    return Ok(reaped(pid, status, phase, true));
                }
                status = child.wait() => {
                    return Ok(reaped(pid, status?, phase, false));
                }
                _ = tokio::time::sleep(limit) => {
                    if let Some((next, signal)) = phase.escalate() {
                        info!("sent {} to {}", signal, pid);
                        send_signal(pid, signal)?;
                        phase = next;
                    }
                }
            }
        }
    }
}

fn reaped(pid: i32, status: ExitStatus, from: Phase, interrupted: bool) -> Report {
    let status = JobStatus::from(status);
    info!("{} {}", pid, status);
    Report { pid, status, reaped_from: from, interrupted }
}

/// Sends `signal` to `pid`. Returns `false` when the process is already
/// gone, which is not an error.
pub fn send_signal(pid: i32, signal: Signal) -> Result<bool, Error> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(Error::Signal(pid, signal, errno)),
    }
}

fn open_output(path: &Path) -> std::io::Result<(File, File)> {
    let out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    let err = out.try_clone()?;
    Ok((out, err))
}
