//! Server side of one job: launches the supervisor, learns the job's pid and
//! samples its memory until the supervisor exits.
use std::{
    future::Future,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream as StdUnixStream,
    },
    process::Stdio,
    sync::Arc,
};

use log::{debug, info, warn};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::dup2,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UnixStream,
    process::{Child, Command},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RunnerConfig,
    entry::{EntryStore, MemorySample},
    job::JobStatus,
    memory, proctree,
    request::PendingRequest,
    supervisor::{REPORT_FD, REPORT_FD_ENV},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error("Supervisor for job {0} has no pid")]
    MissingPid(uuid::Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The supervisor closed the report channel without a pid.
    ExecFailed,
    /// No report and no child of the supervisor could be found.
    NoChild,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { supervisor: JobStatus, job_pid: i32, samples: usize },
    Skipped { supervisor: JobStatus, reason: SkipReason },
    Cancelled { job_pid: Option<i32>, samples: usize },
}

impl RunOutcome {
    /// Cancelled before the job pid was known.
    fn abandoned() -> Self {
        RunOutcome::Cancelled { job_pid: None, samples: 0 }
    }
}

/// Runs dequeued requests. The dispatcher only sees this trait.
pub trait JobExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: PendingRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<RunOutcome, Error>> + Send;
}

#[derive(Debug)]
pub struct JobRunner {
    config: RunnerConfig,
    store: Arc<EntryStore>,
}

enum Discovery {
    Reported(i32),
    Discovered(i32),
    Missing(SkipReason),
}

impl JobRunner {
    pub fn new(config: RunnerConfig, store: Arc<EntryStore>) -> Self {
        Self { config, store }
    }

    pub async fn run(
        &self,
        request: PendingRequest,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, Error> {
        let (ours, theirs) = StdUnixStream::pair()?;
        let mut supervisor = self.spawn_supervisor(&request, theirs.as_raw_fd())?;
        drop(theirs);

        let supervisor_pid = supervisor.id().ok_or(Error::MissingPid(*request.id()))? as i32;
        info!(
            "job {} launched: supervisor {} running {}",
            request.id(),
            supervisor_pid,
            request.spec().argv.join(" ")
        );

        let discovery = tokio::select! {
            _ = cancel.cancelled() => return Ok(RunOutcome::abandoned()),
            discovery = self.discover(ours, supervisor_pid) => discovery?,
        };

        let job_pid = match discovery {
            Discovery::Reported(pid) => pid,
            Discovery::Discovered(pid) => {
                debug!("job {} pid {} found through process tree", request.id(), pid);
                pid
            }
            Discovery::Missing(reason) => {
                let status = tokio::select! {
                    _ = cancel.cancelled() => return Ok(RunOutcome::abandoned()),
                    status = supervisor.wait() => JobStatus::from(status?),
                };
                info!("job {} skipped ({:?}), supervisor {}", request.id(), reason, status);
                return Ok(RunOutcome::Skipped { supervisor: status, reason });
            }
        };

        self.sample(&request, job_pid, &mut supervisor, cancel).await
    }

    fn spawn_supervisor(&self, request: &PendingRequest, report_fd: RawFd) -> Result<Child, Error> {
        let args = request
            .spec()
            .supervisor_args(self.config.grace_timeout, self.config.force_timeout);

        let mut cmd = Command::new(&self.config.supervisor);
        cmd.args(args)
            .env(REPORT_FD_ENV, REPORT_FD.to_string())
            .stdin(Stdio::null());

        // Safety: dup2 and fcntl are async-signal-safe
        unsafe {
            cmd.pre_exec(move || {
                if report_fd == REPORT_FD {
                    fcntl(REPORT_FD, FcntlArg::F_SETFD(FdFlag::empty()))?;
                } else {
                    // the duplicate does not carry close-on-exec
                    dup2(report_fd, REPORT_FD)?;
                }
                Ok(())
            });
        }

        Ok(cmd.spawn()?)
    }

    /// Waits for the supervisor to report the job pid, falling back to the
    /// process tree when it stays silent past the settle timeout.
    async fn discover(
        &self,
        report: StdUnixStream,
        supervisor_pid: i32,
    ) -> Result<Discovery, Error> {
        report.set_nonblocking(true)?;
        let mut reader = BufReader::new(UnixStream::from_std(report)?);
        let mut line = String::new();

        match tokio::time::timeout(self.config.settle_timeout, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => Ok(Discovery::Missing(SkipReason::ExecFailed)),
            Ok(Ok(_)) => match line.trim().parse::<i32>() {
                Ok(pid) if pid > 0 => Ok(Discovery::Reported(pid)),
                _ => {
                    warn!("supervisor {} sent garbled pid '{}'", supervisor_pid, line.trim());
                    Ok(self.discover_child(supervisor_pid))
                }
            },
            Ok(Err(err)) => {
                warn!("report channel of supervisor {} failed: {}", supervisor_pid, err);
                Ok(self.discover_child(supervisor_pid))
            }
            Err(_) => Ok(self.discover_child(supervisor_pid)),
        }
    }

    fn discover_child(&self, supervisor_pid: i32) -> Discovery {
        match proctree::children_of(supervisor_pid) {
            Ok(children) => match children.first() {
                Some(&pid) => Discovery::Discovered(pid),
                None => Discovery::Missing(SkipReason::NoChild),
            },
            Err(err) => {
                warn!("cannot list children of {}: {}", supervisor_pid, err);
                Discovery::Missing(SkipReason::NoChild)
            }
        }
    }

    async fn sample(
        &self,
        request: &PendingRequest,
        job_pid: i32,
        supervisor: &mut Child,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, Error> {
        let argv = request.argv();
        let mut samples = 0;
        let mut ticker = tokio::time::interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(RunOutcome::Cancelled { job_pid: Some(job_pid), samples });
                }
                status = supervisor.wait() => {
                    let supervisor = JobStatus::from(status?);
                    info!(
                        "job {} finished: pid {} sampled {} times, supervisor {}",
                        request.id(), job_pid, samples, supervisor
                    );
                    return Ok(RunOutcome::Completed { supervisor, job_pid, samples });
                }
                _ = ticker.tick() => {
                    // zero once the job has exited or mid-teardown
                    let bytes = memory::resident_bytes(job_pid);
                    if bytes > 0 {
                        self.store.append(MemorySample::new(job_pid, bytes, argv.clone()));
                        samples += 1;
                    }
                }
            }
        }
    }
}

impl JobExecutor for JobRunner {
    fn execute(
        &self,
        request: PendingRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<RunOutcome, Error>> + Send {
        self.run(request, cancel)
    }
}
