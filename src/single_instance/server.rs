// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Notification server run by the instance that owns the launch lock.
//!
//! Listens on a loopback port in a background thread with its own tokio
//! runtime, so it never competes with the shell's event loop. Each
//! connection carries one request and is handled on its own task; a bad
//! connection is dropped without affecting the others.

use crate::host::InstanceHost;
use backup_runner_ipc::{ProtocolError, Request, Response, MAX_MESSAGE_LEN};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How long a connection may stay silent before it is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind notification port {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to start notification server thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A bound, not yet running, notification server.
pub struct NotificationServer {
    listener: std::net::TcpListener,
    addr: SocketAddr,
}

impl NotificationServer {
    /// Bind `127.0.0.1:port`.
    pub fn bind(port: u16) -> Result<Self, ServerError> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn bind_addr(addr: SocketAddr) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind { addr, source };
        let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start serving in a background thread.
    pub fn spawn(self, host: Arc<dyn InstanceHost>) -> Result<ServerHandle, ServerError> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let addr = self.local_addr();
        let listener = self.listener;

        let thread = thread::Builder::new()
            .name("notify-server".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create runtime for notification server: {}", e);
                        return;
                    }
                };
                rt.block_on(serve(listener, host, shutdown_rx));
            })
            .map_err(ServerError::Spawn)?;

        info!("Notification server listening on {}", addr);
        Ok(ServerHandle {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

/// Bind and start the server, or log why the channel is unavailable.
///
/// The launch lock alone guarantees uniqueness; without the channel,
/// duplicate launches just cannot raise our window.
pub fn start(port: u16, host: Arc<dyn InstanceHost>) -> Option<ServerHandle> {
    match NotificationServer::bind(port).and_then(|server| server.spawn(host)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("{}; notification channel unavailable", e);
            None
        }
    }
}

/// A running notification server.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Notification server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: std::net::TcpListener,
    host: Arc<dyn InstanceHost>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to register notification listener: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let host = host.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, host.as_ref()).await {
                            debug!("Connection from {} dropped: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = &mut shutdown => {
                debug!("Notification server shutting down");
                break;
            }
        }
    }
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("no request within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

async fn handle_connection(
    mut stream: TcpStream,
    host: &dyn InstanceHost,
) -> Result<(), ConnectionError> {
    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| ConnectionError::Timeout(READ_TIMEOUT))??;

    let request = Request::parse(&buf[..n])?;
    debug!("Received {}", request);

    match request {
        Request::ShowWindow => host.raise_main_window(),
        Request::GetOwnerUser => match host.current_os_user() {
            Some(user) => {
                stream
                    .write_all(&Response::OwnerUser(user).encode())
                    .await?;
            }
            None => warn!("Could not resolve OS user, closing without reply"),
        },
    }

    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::single_instance::{NotificationClient, NotifyOutcome, OwnerUser};
    use std::io::{Read, Write};
    use std::sync::mpsc;

    struct RecordingHost {
        user: Option<String>,
        raises: parking_lot::Mutex<mpsc::Sender<()>>,
    }

    impl RecordingHost {
        fn new(user: Option<&str>) -> (Arc<Self>, mpsc::Receiver<()>) {
            let (tx, rx) = mpsc::channel();
            let host = Arc::new(Self {
                user: user.map(str::to_string),
                raises: parking_lot::Mutex::new(tx),
            });
            (host, rx)
        }
    }

    impl InstanceHost for RecordingHost {
        fn raise_main_window(&self) {
            let _ = self.raises.lock().send(());
        }

        fn current_os_user(&self) -> Option<String> {
            self.user.clone()
        }
    }

    fn start_local(host: Arc<dyn InstanceHost>) -> ServerHandle {
        let server = NotificationServer::bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        server.spawn(host).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, 1000, 50)
    }

    fn raw_exchange(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream.write_all(payload).unwrap();
        let _ = stream.shutdown(std::net::Shutdown::Write);
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
        reply
    }

    #[test]
    fn test_show_window_raises_exactly_once() {
        let (host, raises) = RecordingHost::new(Some("alice"));
        let server = start_local(host);
        let client = NotificationClient::with_addr(server.local_addr());

        assert_eq!(
            client.notify_show_window(&policy()),
            NotifyOutcome::Delivered { attempt: 1 }
        );
        raises.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(raises.recv_timeout(Duration::from_millis(200)).is_err());
        server.shutdown();
    }

    #[test]
    fn test_user_query_reports_owner() {
        let (host, _raises) = RecordingHost::new(Some("alice"));
        let server = start_local(host);
        let client = NotificationClient::with_addr(server.local_addr());

        assert_eq!(
            client.query_owner_user(&policy()),
            OwnerUser::Known("alice".to_string())
        );
    }

    #[test]
    fn test_unresolvable_user_closes_without_reply() {
        let (host, _raises) = RecordingHost::new(None);
        let server = start_local(host);

        assert!(raw_exchange(server.local_addr(), b"GET_USER_INFO").is_empty());
        let client = NotificationClient::with_addr(server.local_addr());
        assert_eq!(client.query_owner_user(&policy()), OwnerUser::Unknown);
    }

    #[test]
    fn test_garbage_is_ignored_and_server_keeps_serving() {
        let (host, raises) = RecordingHost::new(Some("alice"));
        let server = start_local(host);
        let addr = server.local_addr();

        assert!(raw_exchange(addr, b"HELLO").is_empty());
        assert!(raw_exchange(addr, &[0xde, 0xad, 0xbe, 0xef]).is_empty());
        assert!(raw_exchange(addr, b"").is_empty());
        assert!(raises.try_recv().is_err());

        assert_eq!(raw_exchange(addr, b"GET_USER_INFO"), b"USER_INFO:alice");
        assert!(raw_exchange(addr, b"SHOW_WINDOW").is_empty());
        raises.recv_timeout(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_concurrent_requests() {
        let (host, raises) = RecordingHost::new(Some("alice"));
        let server = start_local(host);
        let addr = server.local_addr();

        let clients: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(move || {
                    NotificationClient::with_addr(addr).notify_show_window(&policy())
                })
            })
            .collect();
        for c in clients {
            assert!(c.join().unwrap().is_delivered());
        }
        for _ in 0..8 {
            raises.recv_timeout(Duration::from_secs(3)).unwrap();
        }
    }

    #[test]
    fn test_port_in_use_degrades() {
        let (host, _raises) = RecordingHost::new(Some("alice"));
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = squatter.local_addr().unwrap().port();

        assert!(matches!(
            NotificationServer::bind(port),
            Err(ServerError::Bind { .. })
        ));
        assert!(start(port, host).is_none());
    }
}
