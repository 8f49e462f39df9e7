// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Headless-service vs interactive startup decision.
//!
//! Three signals are checked in a fixed order and the first match wins:
//!
//! 1. the process runs in session 0 (services always do, and have no desktop),
//! 2. the `--run-as-service` argument is present (set by the service wrapper),
//! 3. `SERVICE_MODE` is `server`, `1` or `true`, in any case.
//!
//! Anything else starts the interactive UI.

use tracing::{debug, info};

/// Command-line flag that forces service mode.
pub const SERVICE_FLAG: &str = "--run-as-service";

/// Environment variable consulted by the last layer.
pub const SERVICE_MODE_ENV: &str = "SERVICE_MODE";

const SERVICE_ENV_VALUES: &[&str] = &["server", "1", "true"];

/// Non-interactive session reserved for services.
const SERVICE_SESSION_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Headless background service: no window, no single-instance lock.
    Service,
    /// Windowed application.
    InteractiveUi,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Service => f.write_str("service"),
            ExecutionMode::InteractiveUi => f.write_str("ui"),
        }
    }
}

/// Snapshot of everything the decision looks at.
#[derive(Debug, Clone, Default)]
pub struct ModeSignals {
    /// Session of this process; `None` where the platform has no such notion
    /// or the lookup failed.
    pub session_id: Option<u32>,
    pub args: Vec<String>,
    /// Raw value of `SERVICE_MODE`, if set.
    pub service_env: Option<String>,
}

impl ModeSignals {
    /// Capture the signals of the current process.
    pub fn capture() -> Self {
        Self {
            session_id: current_session_id(),
            args: std::env::args().skip(1).collect(),
            service_env: std::env::var(SERVICE_MODE_ENV).ok(),
        }
    }
}

/// The layer that decided service mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Session,
    Argument,
    Environment,
}

type Probe = fn(&ModeSignals) -> Result<(), String>;

const LAYERS: [(Layer, Probe); 3] = [
    (Layer::Session, session_layer),
    (Layer::Argument, argument_layer),
    (Layer::Environment, environment_layer),
];

fn session_layer(signals: &ModeSignals) -> Result<(), String> {
    match signals.session_id {
        Some(SERVICE_SESSION_ID) => Ok(()),
        Some(id) => Err(format!("session_id={}", id)),
        None => Err("session id unavailable".to_string()),
    }
}

fn argument_layer(signals: &ModeSignals) -> Result<(), String> {
    if signals.args.iter().any(|a| a == SERVICE_FLAG) {
        Ok(())
    } else {
        Err(format!("{} not in args", SERVICE_FLAG))
    }
}

fn environment_layer(signals: &ModeSignals) -> Result<(), String> {
    match signals.service_env.as_deref() {
        Some(value) if SERVICE_ENV_VALUES.contains(&value.to_ascii_lowercase().as_str()) => Ok(()),
        Some(value) => Err(format!("{}={:?} not a service value", SERVICE_MODE_ENV, value)),
        None => Err(format!("{} not set", SERVICE_MODE_ENV)),
    }
}

/// Decide the execution mode, returning the matching layer for service mode.
pub fn detect(signals: &ModeSignals) -> (ExecutionMode, Option<Layer>) {
    for (layer, probe) in LAYERS {
        match probe(signals) {
            Ok(()) => {
                info!("Service mode: matched {:?} layer", layer);
                return (ExecutionMode::Service, Some(layer));
            }
            Err(reason) => debug!("Service mode: {:?} layer no match ({})", layer, reason),
        }
    }
    info!("Service mode: no layer matched, starting UI");
    (ExecutionMode::InteractiveUi, None)
}

#[cfg(windows)]
fn current_session_id() -> Option<u32> {
    use tracing::warn;
    use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
    use windows::Win32::System::Threading::GetCurrentProcessId;

    let mut session_id = 0u32;
    match unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) } {
        Ok(()) => Some(session_id),
        Err(e) => {
            warn!("ProcessIdToSessionId failed: {}", e);
            None
        }
    }
}

#[cfg(not(windows))]
fn current_session_id() -> Option<u32> {
    None
}
