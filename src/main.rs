// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Backup Database runner - native entry point.
//!
//! Decides between headless service and interactive startup, and makes
//! sure only one interactive instance runs per machine.

mod config;
mod host;
mod identity;
mod logging;
mod mode;
mod single_instance;

use backup_runner_ipc::LOCK_NAME;
use config::{ConfigManager, RunnerConfig, SINGLE_INSTANCE_ENV};
use host::{ConsoleHost, HostEvent, InstanceHost, PlatformWarning};
use mode::{ExecutionMode, ModeSignals};
use single_instance::{
    ExclusiveLock, InstanceRole, LaunchLock, LoopbackChannel, NotificationClient,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn main() -> ExitCode {
    // Loaded before logging so the file layer can honour `log_to_file`.
    let (config_path, loaded) = match ConfigManager::new() {
        Ok(manager) => (Some(manager.config_path()), manager.load()),
        Err(e) => (None, Err(e)),
    };
    let (mut config, config_err) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (RunnerConfig::default(), Some(e)),
    };
    let env_override =
        config.apply_env_override(std::env::var(SINGLE_INSTANCE_ENV).ok().as_deref());

    let log_path = logging::init(config.log_to_file);
    info!("Backup Database runner starting");
    if let Some(path) = log_path {
        debug!("Startup log: {:?}", path);
    }
    if let Some(path) = config_path {
        debug!("Runner config: {:?} (present: {})", path, path.exists());
    }
    if let Some(e) = config_err {
        warn!("Failed to load runner config, using defaults: {}", e);
    }
    if env_override {
        info!(
            "{} overrides config file: single_instance_enabled={}",
            SINGLE_INSTANCE_ENV, config.single_instance_enabled
        );
    }

    let signals = ModeSignals::capture();
    info!("args=[{}]", signals.args.join(", "));

    let (mode, layer) = mode::detect(&signals);
    info!("Execution mode: {} ({:?})", mode, layer);

    match mode {
        ExecutionMode::Service => run_service(),
        ExecutionMode::InteractiveUi => run_interactive(&config),
    }
}

fn build_runtime() -> Option<tokio::runtime::Runtime> {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => Some(rt),
        Err(e) => {
            error!("Failed to create runtime: {}", e);
            None
        }
    }
}

/// Headless branch: no window, no launch lock. Runs until interrupted.
fn run_service() -> ExitCode {
    let Some(rt) = build_runtime() else {
        return ExitCode::FAILURE;
    };
    info!("Entering headless service branch");
    rt.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for shutdown signal: {}", e);
        }
    });
    info!("Headless service stopped");
    ExitCode::SUCCESS
}

fn run_interactive(config: &RunnerConfig) -> ExitCode {
    let role = match single_instance::claim(
        LaunchLock::new(LOCK_NAME),
        config.single_instance_enabled,
    ) {
        Ok(role) => role,
        Err(e) => {
            error!("{}; refusing to start without instance exclusion", e);
            return ExitCode::FAILURE;
        }
    };

    let lock = match role {
        InstanceRole::Duplicate => {
            let channel = LoopbackChannel::new(
                NotificationClient::new(config.port),
                config.notify_retry,
                config.query_retry,
            );
            let report = single_instance::handle_duplicate_launch(
                identity::current_os_user,
                &channel,
                &PlatformWarning,
            );
            info!(
                "Duplicate launch by {:?}: owner={:?} warned={} notify={:?}",
                report.local_user, report.owner, report.warned, report.notify
            );
            // A duplicate launch is routine, not an error.
            return ExitCode::SUCCESS;
        }
        InstanceRole::Primary(lock) => {
            debug!("{} state: {:?}", lock.name(), lock.state());
            Some(lock)
        }
        InstanceRole::Unguarded => None,
    };

    let Some(rt) = build_runtime() else {
        return ExitCode::FAILURE;
    };

    let (host, events) = ConsoleHost::new();
    let host = Arc::new(host);
    info!("Entering UI branch");
    if let Some(user) = host.current_os_user() {
        debug!("Running as {}", user);
    }
    let server = single_instance::start_server(config.port, host.clone());

    rt.block_on(event_loop(events));

    if let Some(server) = server {
        debug!("Stopping notification server on {}", server.local_addr());
        server.shutdown();
    }
    info!("Served {} raise requests", host.raise_count());
    if let Some(mut lock) = lock {
        lock.release();
    }
    info!("Backup Database runner stopped");
    ExitCode::SUCCESS
}

/// Stand-in for the shell's message loop: handles host events until Ctrl+C.
async fn event_loop(mut events: mpsc::UnboundedReceiver<HostEvent>) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                HostEvent::RaiseRequested => info!("Main window brought to front"),
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to wait for shutdown signal: {}", e);
                }
                info!("Received interrupt, shutting down...");
                break;
            }
        }
    }
}
