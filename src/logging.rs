use std::{fs::File, io::Write};

use chrono::Local;
use env_logger::{Builder, Env};

use crate::TIME_FORMAT;

pub enum Target {
    Stdout,
    File(File),
}

/// Installs the process-wide logger: `<time> - <message>` lines, filtered
/// by `RUST_LOG` (default `info`).
///
/// Calling it twice is harmless; the second logger is discarded.
pub fn init(target: Target) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(buf, "{} - {}", Local::now().format(TIME_FORMAT), record.args())
    });

    match target {
        Target::Stdout => builder.target(env_logger::Target::Stdout),
        Target::File(file) => builder.target(env_logger::Target::Pipe(Box::new(file))),
    };

    let _ = builder.try_init();
}
