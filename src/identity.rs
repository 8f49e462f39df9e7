// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! OS identity of the running process.

use tracing::debug;

/// Name of the OS account this process runs as, or `None` if it cannot be resolved.
pub fn current_os_user() -> Option<String> {
    match platform_user() {
        Some(name) if !name.is_empty() => Some(name),
        _ => {
            debug!("Platform user lookup failed, falling back to environment");
            env_user()
        }
    }
}

fn env_user() -> Option<String> {
    ["USERNAME", "USER", "LOGNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(unix)]
fn platform_user() -> Option<String> {
    use nix::unistd::{Uid, User};

    match User::from_uid(Uid::current()) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(e) => {
            debug!("getpwuid failed: {}", e);
            None
        }
    }
}

#[cfg(windows)]
fn platform_user() -> Option<String> {
    use windows::core::PWSTR;
    use windows::Win32::System::WindowsProgramming::GetUserNameW;

    // UNLEN + 1
    let mut buf = [0u16; 257];
    let mut len = buf.len() as u32;
    match unsafe { GetUserNameW(PWSTR(buf.as_mut_ptr()), &mut len) } {
        Ok(()) => {
            // `len` includes the terminating NUL.
            let end = (len as usize).saturating_sub(1).min(buf.len());
            Some(String::from_utf16_lossy(&buf[..end]))
        }
        Err(e) => {
            debug!("GetUserNameW failed: {}", e);
            None
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn platform_user() -> Option<String> {
    None
}
