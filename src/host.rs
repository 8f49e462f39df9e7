// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Capabilities the single-instance core borrows from the application shell.
//!
//! The real window, engine and message loop live outside this crate. The
//! core only needs to raise the main window, learn which OS user it runs
//! as, and (on a duplicate launch) tell the user that another instance is
//! already running. [`ConsoleHost`] and [`PlatformWarning`] are the
//! implementations the runner binary ships with.

use crate::single_instance::OwnerUser;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The application shell as seen by the notification server.
pub trait InstanceHost: Send + Sync + 'static {
    /// Bring the main window to the foreground.
    fn raise_main_window(&self);

    /// OS account owning this process, if it can be resolved.
    fn current_os_user(&self) -> Option<String>;
}

/// Surface shown when a duplicate launch finds an instance owned by someone else.
pub trait DuplicateWarning {
    fn warn_other_instance(&self, owner: &OwnerUser, local_user: Option<&str>);
}

/// Events the host forwards to the shell's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Another launch asked us to show the main window.
    RaiseRequested,
}

/// Host for the runner binary: counts raise requests and forwards them to
/// the main loop over a channel.
pub struct ConsoleHost {
    raise_count: Mutex<u64>,
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl ConsoleHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            raise_count: Mutex::new(0),
            tx,
        };
        (host, rx)
    }

    pub fn raise_count(&self) -> u64 {
        *self.raise_count.lock()
    }
}

impl InstanceHost for ConsoleHost {
    fn raise_main_window(&self) {
        let count = {
            let mut count = self.raise_count.lock();
            *count += 1;
            *count
        };
        info!("Raising main window (request #{})", count);
        if self.tx.send(HostEvent::RaiseRequested).is_err() {
            warn!("Main loop is gone, raise request dropped");
        }
    }

    fn current_os_user(&self) -> Option<String> {
        crate::identity::current_os_user()
    }
}

/// Warning surface for duplicate launches: a message box on Windows, a log
/// line elsewhere.
pub struct PlatformWarning;

impl PlatformWarning {
    fn message(owner: &OwnerUser, local_user: Option<&str>) -> String {
        match owner {
            OwnerUser::Known(owner) => format!(
                "Backup Database is already running under the user \"{}\" (you are \"{}\").\n\
                 Only one instance can run on this computer at a time.",
                owner,
                local_user.unwrap_or("unknown")
            ),
            OwnerUser::Unknown => "Backup Database is already running on this computer, \
                 possibly under another user account.\n\
                 Only one instance can run on this computer at a time."
                .to_string(),
        }
    }
}

impl DuplicateWarning for PlatformWarning {
    fn warn_other_instance(&self, owner: &OwnerUser, local_user: Option<&str>) {
        let message = Self::message(owner, local_user);
        warn!("{}", message.replace('\n', " "));
        show_dialog(&message);
    }
}

#[cfg(windows)]
fn show_dialog(message: &str) {
    use windows::core::HSTRING;
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging::{MessageBoxW, MB_ICONWARNING, MB_OK};

    let text = HSTRING::from(message);
    let caption = HSTRING::from("Backup Database");
    unsafe {
        let _ = MessageBoxW(HWND::default(), &text, &caption, MB_OK | MB_ICONWARNING);
    }
}

#[cfg(not(windows))]
fn show_dialog(_message: &str) {}
