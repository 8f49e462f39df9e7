// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single-instance mechanism.
//!
//! A machine-global launch lock decides which process is the first
//! instance. The winner serves a small loopback protocol; later launches
//! use it to ask the winner to show its window and to learn which OS user
//! owns it, then exit.

mod client;
mod duplicate;
mod lock;
mod server;

pub use client::{NotificationClient, NotifyOutcome, OwnerUser};
pub use duplicate::{handle_duplicate_launch, DuplicateReport, LoopbackChannel, OwnerChannel};
pub use lock::{AcquireOutcome, ExclusiveLock, LaunchLock, LockError, OwnershipState};
pub use server::{start as start_server, NotificationServer, ServerError, ServerHandle};

use tracing::{info, warn};

/// What this process is, as far as instance uniqueness goes.
pub enum InstanceRole<L: ExclusiveLock> {
    /// First instance; holds the lock until shutdown.
    Primary(L),
    /// Another instance already runs.
    Duplicate,
    /// Enforcement disabled by configuration.
    Unguarded,
}

/// Claim the launch lock, unless enforcement is disabled.
///
/// An error here is fatal: uniqueness cannot be established.
pub fn claim<L: ExclusiveLock>(mut lock: L, enabled: bool) -> Result<InstanceRole<L>, LockError> {
    if !enabled {
        warn!("Single-instance enforcement disabled, skipping launch lock");
        return Ok(InstanceRole::Unguarded);
    }
    match lock.try_acquire()? {
        AcquireOutcome::Acquired => Ok(InstanceRole::Primary(lock)),
        AcquireOutcome::AlreadyHeld => {
            info!("Another instance is already running");
            Ok(InstanceRole::Duplicate)
        }
    }
}
