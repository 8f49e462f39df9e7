// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client side of the loopback channel, used by duplicate launches.
//!
//! Both operations share one connect loop: up to `max_attempts` connects,
//! each bounded by `per_attempt_timeout`, with `inter_attempt_delay`
//! between them. The running instance may still be starting up when we
//! connect, and the short retry budget covers that window. Neither
//! operation ever fails loudly; running out of attempts is an expected
//! outcome.

use crate::config::RetryPolicy;
use backup_runner_ipc::{Request, Response, MAX_MESSAGE_LEN};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner of the running instance as reported over the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerUser {
    Known(String),
    Unknown,
}

/// Result of asking the running instance to show itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered { attempt: u32 },
    Unreachable { attempts: u32 },
}

impl NotifyOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, NotifyOutcome::Delivered { .. })
    }
}

/// Client for the notification server of the running instance.
#[derive(Debug, Clone, Copy)]
pub struct NotificationClient {
    addr: SocketAddr,
}

impl NotificationClient {
    /// Client for the loopback server on `port`.
    pub fn new(port: u16) -> Self {
        Self::with_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Ask the running instance to raise its main window. Fire-and-forget.
    pub fn notify_show_window(&self, policy: &RetryPolicy) -> NotifyOutcome {
        let result = self.with_connection(policy, Request::ShowWindow, |mut stream| {
            stream.write_all(Request::ShowWindow.as_wire().as_bytes())?;
            stream.flush()
        });
        match result {
            Ok(((), attempt)) => {
                info!("Asked running instance to show its window (attempt {})", attempt);
                NotifyOutcome::Delivered { attempt }
            }
            Err(attempts) => {
                info!(
                    "Could not reach running instance after {} attempts, giving up",
                    attempts
                );
                NotifyOutcome::Unreachable { attempts }
            }
        }
    }

    /// Ask the running instance which OS user owns it.
    ///
    /// Only the connect is retried; once connected, a missing, malformed or
    /// late reply yields [`OwnerUser::Unknown`] straight away.
    pub fn query_owner_user(&self, policy: &RetryPolicy) -> OwnerUser {
        let timeout = clamp_timeout(policy.per_attempt_timeout);
        let result = self.with_connection_once(policy, Request::GetOwnerUser, |stream| {
            exchange_user_info(stream, timeout)
        });
        let owner = match result {
            Ok((Response::OwnerUser(name), _)) => OwnerUser::Known(name),
            Ok((Response::Empty, _)) => {
                debug!("Running instance sent no user info");
                OwnerUser::Unknown
            }
            Err(_) => OwnerUser::Unknown,
        };
        debug!("Owner of running instance: {:?}", owner);
        owner
    }

    /// Connect with retries and run `op` on the stream. A failing `op`
    /// counts as a failed attempt.
    fn with_connection<T>(
        &self,
        policy: &RetryPolicy,
        request: Request,
        mut op: impl FnMut(TcpStream) -> io::Result<T>,
    ) -> Result<(T, u32), u32> {
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.connect(policy) {
                Ok(stream) => match op(stream) {
                    Ok(value) => return Ok((value, attempt)),
                    Err(e) => debug!("{} attempt {}/{} failed: {}", request, attempt, attempts, e),
                },
                Err(e) => debug!(
                    "{} connect attempt {}/{} to {} failed: {}",
                    request, attempt, attempts, self.addr, e
                ),
            }
            if attempt < attempts {
                thread::sleep(policy.inter_attempt_delay);
            }
        }
        Err(attempts)
    }

    /// Connect with retries, then run `op` exactly once.
    fn with_connection_once<T>(
        &self,
        policy: &RetryPolicy,
        request: Request,
        op: impl FnOnce(TcpStream) -> io::Result<T>,
    ) -> Result<(T, u32), u32> {
        let (stream, attempt) = self.with_connection(policy, request, Ok)?;
        match op(stream) {
            Ok(value) => Ok((value, attempt)),
            Err(e) => {
                warn!("{} exchange failed: {}", request, e);
                Err(attempt)
            }
        }
    }

    fn connect(&self, policy: &RetryPolicy) -> io::Result<TcpStream> {
        TcpStream::connect_timeout(&self.addr, clamp_timeout(policy.per_attempt_timeout))
    }
}

fn exchange_user_info(mut stream: TcpStream, timeout: Duration) -> io::Result<Response> {
    stream.set_read_timeout(Some(timeout))?;
    stream.write_all(Request::GetOwnerUser.as_wire().as_bytes())?;
    stream.flush()?;
    // The server only needs the command; tell it nothing else is coming.
    let _ = stream.shutdown(Shutdown::Write);

    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let len = read_reply(&mut stream, &mut buf)?;
    Response::decode(&buf[..len]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read into `buf` until it is full, the peer closes, or the read times
/// out. A timeout after some bytes arrived ends the reply; a timeout with
/// nothing received is an error.
fn read_reply(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut len = 0;
    while len < buf.len() {
        match stream.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if len > 0
                    && matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }
    Ok(len)
}

/// `connect_timeout` and `set_read_timeout` reject a zero duration.
fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    /// Address nothing listens on: bind an ephemeral port, then free it.
    fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    /// One-shot server that reads the request and answers with `reply`.
    fn reply_once(reply: &'static [u8]) -> (SocketAddr, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; MAX_MESSAGE_LEN];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(reply).unwrap();
            buf[..n].to_vec()
        });
        (addr, handle)
    }

    #[test]
    fn test_notify_unreachable_uses_every_attempt() {
        let client = NotificationClient::with_addr(dead_addr());
        let policy = RetryPolicy::new(3, 200, 150);

        let start = Instant::now();
        let outcome = client.notify_show_window(&policy);
        let elapsed = start.elapsed();

        assert_eq!(outcome, NotifyOutcome::Unreachable { attempts: 3 });
        assert!(!outcome.is_delivered());
        // Two delays between three attempts, none after the last.
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(450), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_notify_sends_command_once() {
        let (addr, server) = reply_once(b"");
        let client = NotificationClient::with_addr(addr);

        let outcome = client.notify_show_window(&RetryPolicy::new(5, 500, 10));
        assert_eq!(outcome, NotifyOutcome::Delivered { attempt: 1 });
        assert_eq!(server.join().unwrap(), b"SHOW_WINDOW");
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let client = NotificationClient::with_addr(dead_addr());
        let outcome = client.notify_show_window(&RetryPolicy::new(0, 100, 0));
        assert_eq!(outcome, NotifyOutcome::Unreachable { attempts: 1 });
    }

    #[test]
    fn test_query_reads_owner() {
        let (addr, server) = reply_once(b"USER_INFO:alice");
        let client = NotificationClient::with_addr(addr);

        let owner = client.query_owner_user(&RetryPolicy::new(3, 1000, 10));
        assert_eq!(owner, OwnerUser::Known("alice".to_string()));
        assert_eq!(server.join().unwrap(), b"GET_USER_INFO");
    }

    #[test]
    fn test_query_unrecognized_reply_is_unknown() {
        let (addr, server) = reply_once(b"HELLO alice");
        let client = NotificationClient::with_addr(addr);

        let owner = client.query_owner_user(&RetryPolicy::new(3, 1000, 10));
        assert_eq!(owner, OwnerUser::Unknown);
        server.join().unwrap();
    }

    #[test]
    fn test_query_empty_reply_is_unknown() {
        let (addr, server) = reply_once(b"");
        let client = NotificationClient::with_addr(addr);

        let owner = client.query_owner_user(&RetryPolicy::new(3, 1000, 10));
        assert_eq!(owner, OwnerUser::Unknown);
        server.join().unwrap();
    }

    #[test]
    fn test_query_unreachable_is_unknown() {
        let client = NotificationClient::with_addr(dead_addr());
        let owner = client.query_owner_user(&RetryPolicy::new(2, 100, 10));
        assert_eq!(owner, OwnerUser::Unknown);
    }

    #[test]
    fn test_query_keeps_reply_when_peer_stays_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Answer, then hold the connection well past the client's timeout.
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"USER_INFO:alice").unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let client = NotificationClient::with_addr(addr);
        let owner = client.query_owner_user(&RetryPolicy::new(1, 300, 0));
        assert_eq!(owner, OwnerUser::Known("alice".to_string()));
        server.join().unwrap();
    }

    #[test]
    fn test_read_reply_stops_at_buffer_size() {
        let long = vec![b'a'; MAX_MESSAGE_LEN + 10];
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        assert_eq!(read_reply(&mut &long[..], &mut buf).unwrap(), MAX_MESSAGE_LEN);
        assert_eq!(read_reply(&mut &b""[..], &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_query_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection open without answering.
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(600));
            drop(stream);
        });

        let client = NotificationClient::with_addr(addr);
        let start = Instant::now();
        let owner = client.query_owner_user(&RetryPolicy::new(1, 150, 0));
        assert_eq!(owner, OwnerUser::Unknown);
        assert!(start.elapsed() < Duration::from_millis(600));
        server.join().unwrap();
    }
}
