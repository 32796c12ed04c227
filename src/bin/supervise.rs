use std::process::ExitCode;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use overseer::{
    logging,
    supervisor::{self, ReportChannel, SupervisorArgs},
};

fn main() -> Result<ExitCode, overseer::OverseerError> {
    let args = SupervisorArgs::parse();
    let target = match args.open_log() {
        Some(file) => logging::Target::File(file),
        None => logging::Target::Stdout,
    };
    logging::init(target);

    // adopted before the runtime starts so no other descriptor lands on it
    let report = ReportChannel::from_env();
    // the job must not mistake fd 3 for a report channel
    std::env::remove_var(supervisor::REPORT_FD_ENV);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(async {
        // Registered before the job exists: a SIGINT delivered at any later
        // point is queued for the supervise loop instead of killing us.
        let mut sigint = signal(SignalKind::interrupt())?;
        let interrupt = async move {
            sigint.recv().await;
        };
        supervisor::run(&args, report, interrupt).await
    })?;

    match outcome {
        Some(_) => Ok(ExitCode::SUCCESS),
        None => Ok(ExitCode::FAILURE),
    }
}
