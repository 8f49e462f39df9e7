// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! What a duplicate launch does before exiting.

use super::client::{NotificationClient, NotifyOutcome, OwnerUser};
use crate::config::RetryPolicy;
use crate::host::DuplicateWarning;
use tracing::{debug, info};

/// The running instance, as reachable from a duplicate launch.
pub trait OwnerChannel {
    fn query_owner_user(&self) -> OwnerUser;
    fn notify_show_window(&self) -> NotifyOutcome;
}

/// [`OwnerChannel`] over the loopback notification port.
pub struct LoopbackChannel {
    client: NotificationClient,
    notify_policy: RetryPolicy,
    query_policy: RetryPolicy,
}

impl LoopbackChannel {
    pub fn new(
        client: NotificationClient,
        notify_policy: RetryPolicy,
        query_policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            notify_policy,
            query_policy,
        }
    }
}

impl OwnerChannel for LoopbackChannel {
    fn query_owner_user(&self) -> OwnerUser {
        self.client.query_owner_user(&self.query_policy)
    }

    fn notify_show_window(&self) -> NotifyOutcome {
        self.client.notify_show_window(&self.notify_policy)
    }
}

/// What happened during a duplicate launch, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateReport {
    pub local_user: Option<String>,
    pub owner: OwnerUser,
    pub warned: bool,
    pub notify: NotifyOutcome,
}

/// Whether the user should be told another instance is running.
///
/// Same-user duplicates (double-clicking the icon twice) stay silent. An
/// owner that differs, or that cannot be confirmed, is worth a warning.
pub fn should_warn(owner: &OwnerUser, local_user: Option<&str>) -> bool {
    match (owner, local_user) {
        (OwnerUser::Known(owner), Some(local)) => owner != local,
        _ => true,
    }
}

/// Handle a launch that lost the launch lock.
///
/// The running instance is always asked to show itself, whether or not a
/// warning was shown. The caller exits with success afterwards.
pub fn handle_duplicate_launch(
    resolve_local_user: impl FnOnce() -> Option<String>,
    channel: &impl OwnerChannel,
    warning: &impl DuplicateWarning,
) -> DuplicateReport {
    let local_user = resolve_local_user();
    debug!("Local user: {:?}", local_user);

    let owner = channel.query_owner_user();
    let warned = should_warn(&owner, local_user.as_deref());
    if warned {
        warning.warn_other_instance(&owner, local_user.as_deref());
    } else {
        debug!("Running instance belongs to the same user, no warning");
    }

    let notify = channel.notify_show_window();
    if !notify.is_delivered() {
        info!("Running instance did not answer; its window stays as it is");
    }

    DuplicateReport {
        local_user,
        owner,
        warned,
        notify,
    }
}
