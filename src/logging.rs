// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logging setup: stderr plus an append-only startup log.
//!
//! Service deployments have no console, so the startup log file is the only
//! record of which mode was chosen and why.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE: &str = "runner_startup.log";

/// Directory holding the runner's log files.
pub fn log_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        let base = std::env::var_os("ProgramData")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"));
        Some(base.join("BackupDatabase").join("logs"))
    }
    #[cfg(not(windows))]
    {
        directories::ProjectDirs::from("com", "BackupDatabase", "BackupDatabase")
            .map(|d| d.data_local_dir().join("logs"))
    }
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = log_dir()?;
    fs::create_dir_all(&dir).ok()?;
    let path = dir.join(LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
    Some((path, file))
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Returns the log file path when file logging is active.
pub fn init(log_to_file: bool) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("backup_runner=debug"));

    let (path, file_layer) = match log_to_file.then(open_log_file).flatten() {
        Some((path, file)) => (
            Some(path),
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_writer(Mutex::new(file)),
            ),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    path
}
