//! TCP tunnels between the controller and the worker
//!
//! One parameterized manager serves both directions: for local→remote the
//! listener lives on the controller and connections are dialled from the
//! worker; for remote→local the roles are swapped. `open` returns as soon
//! as the listeners are bound; every accepted connection is bridged on its
//! own thread until either side closes or the tunnel is torn down.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use distfork_protocol::PortSpec;

use crate::cancel::CancelToken;
use crate::channel::Channel;

/// Which way a set of tunnels forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Listener on the controller, target reached from the worker
    LocalToRemote,
    /// Listener on the worker, target reached from the controller
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "local->remote"),
            Direction::RemoteToLocal => write!(f, "remote->local"),
        }
    }
}

/// Errors for tunnel operations
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("{direction} forwarding: failed to bind port {port} on {node}: {source}")]
    Bind {
        direction: Direction,
        node: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{direction} forwarding: failed to configure listener on port {port}: {source}")]
    Listener {
        direction: Direction,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("tunnel {spec} did not shut down cleanly: {reason}")]
    Close { spec: PortSpec, reason: String },
}

/// Result of opening one direction's tunnels.
///
/// A bind failure stops that direction; the handles opened before it stay
/// valid and must still be closed.
#[derive(Debug, Default)]
pub struct OpenedTunnels {
    pub handles: Vec<TunnelHandle>,
    pub failure: Option<TunnelError>,
}

/// Opens tunnels in either direction
#[derive(Debug, Clone)]
pub struct TunnelManager {
    poll_interval: Duration,
}

impl TunnelManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Bind a listener on `listen_on` for every spec, forwarding accepted
    /// connections to its target host and port dialled from `forward_via`.
    pub fn open(
        &self,
        direction: Direction,
        specs: &[PortSpec],
        listen_on: &Arc<dyn Channel>,
        forward_via: &Arc<dyn Channel>,
        cancel: &CancelToken,
    ) -> OpenedTunnels {
        let mut opened = OpenedTunnels::default();

        for spec in specs {
            match self.open_one(direction, spec, listen_on.as_ref(), forward_via, cancel) {
                Ok(handle) => {
                    tracing::info!(
                        %direction,
                        listen_port = handle.local_port(),
                        target = %format!("{}:{}", spec.target_host, spec.target_port),
                        "tunnel open"
                    );
                    opened.handles.push(handle);
                }
                Err(e) => {
                    tracing::warn!(%direction, error = %e, "tunnel setup failed");
                    opened.failure = Some(e);
                    break;
                }
            }
        }

        opened
    }

    fn open_one(
        &self,
        direction: Direction,
        spec: &PortSpec,
        listen_on: &dyn Channel,
        forward_via: &Arc<dyn Channel>,
        cancel: &CancelToken,
    ) -> Result<TunnelHandle, TunnelError> {
        let listener = listen_on.bind(spec.listen_port).map_err(|source| TunnelError::Bind {
            direction,
            node: listen_on.node_name().to_string(),
            port: spec.listen_port,
            source,
        })?;
        let listener_err = |source| TunnelError::Listener {
            direction,
            port: spec.listen_port,
            source,
        };
        let local_port = listener.local_addr().map_err(listener_err)?.port();
        listener.set_nonblocking(true).map_err(listener_err)?;

        let stop = Arc::new(AtomicBool::new(false));
        let bridges = Arc::new(BridgeRegistry::default());

        let acceptor = {
            let ctx = AcceptLoop {
                listener,
                target_host: spec.target_host.clone(),
                target_port: spec.target_port,
                forward_via: Arc::clone(forward_via),
                stop: Arc::clone(&stop),
                cancel: cancel.clone(),
                bridges: Arc::clone(&bridges),
                poll_interval: self.poll_interval,
            };
            thread::Builder::new()
                .name(format!("tunnel-{}", local_port))
                .spawn(move || ctx.run())
                .map_err(listener_err)?
        };

        Ok(TunnelHandle {
            spec: spec.clone(),
            direction,
            local_port,
            stop,
            bridges,
            acceptor: Some(acceptor),
        })
    }

    /// Close every handle, continuing past individual failures.
    pub fn close_all(handles: Vec<TunnelHandle>) -> Vec<TunnelError> {
        handles
            .into_iter()
            .filter_map(|h| h.close().err())
            .collect()
    }
}

/// An open listener plus the connections it has accepted.
///
/// `close` consumes the handle, so it can only be closed once.
#[derive(Debug)]
pub struct TunnelHandle {
    spec: PortSpec,
    direction: Direction,
    local_port: u16,
    stop: Arc<AtomicBool>,
    bridges: Arc<BridgeRegistry>,
    acceptor: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Port actually bound (differs from the requested port when that was 0).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Connections currently being bridged.
    pub fn active_connections(&self) -> usize {
        self.bridges.active()
    }

    /// Stop accepting, release the listening port and cut active bridges.
    pub fn close(mut self) -> Result<(), TunnelError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), TunnelError> {
        let Some(acceptor) = self.acceptor.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::SeqCst);
        let joined = acceptor.join();
        self.bridges.terminate_all();
        tracing::debug!(listen_port = self.local_port, direction = %self.direction, "tunnel closed");

        joined.map_err(|_| TunnelError::Close {
            spec: self.spec.clone(),
            reason: "accept loop panicked".to_string(),
        })
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "tunnel shutdown on drop failed");
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    target_host: String,
    target_port: u16,
    forward_via: Arc<dyn Channel>,
    stop: Arc<AtomicBool>,
    cancel: CancelToken,
    bridges: Arc<BridgeRegistry>,
    poll_interval: Duration,
}

impl AcceptLoop {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            match self.listener.accept() {
                Ok((inbound, peer)) => {
                    tracing::debug!(%peer, target_port = self.target_port, "accepted tunnel connection");
                    if let Err(e) = inbound.set_nonblocking(false) {
                        tracing::warn!(error = %e, "dropping connection");
                        continue;
                    }
                    self.bridges.spawn(
                        inbound,
                        self.target_host.clone(),
                        self.target_port,
                        Arc::clone(&self.forward_via),
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(self.poll_interval),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(self.poll_interval);
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.bridges.terminate_all();
        }
    }
}

/// Tracks live bridges so they can be cut when the tunnel closes.
#[derive(Debug, Default)]
struct BridgeRegistry {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    closed: bool,
    streams: HashMap<u64, [TcpStream; 2]>,
}

impl BridgeRegistry {
    fn spawn(
        self: &Arc<Self>,
        inbound: TcpStream,
        target_host: String,
        target_port: u16,
        forward_via: Arc<dyn Channel>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::clone(self);

        // bridges are detached; close() cuts their sockets instead of joining
        let spawned = thread::Builder::new()
            .name(format!("bridge-{}", id))
            .spawn(move || {
                let outbound = match forward_via.connect(&target_host, target_port) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(target = %format!("{}:{}", target_host, target_port), error = %e, "forward connect failed");
                        let _ = inbound.shutdown(Shutdown::Both);
                        return;
                    }
                };
                if registry.register(id, &inbound, &outbound) {
                    if let Err(e) = bridge(inbound, outbound) {
                        tracing::debug!(error = %e, "bridge ended with error");
                    }
                }
                registry.unregister(id);
            });

        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn bridge thread");
        }
    }

    /// Returns false (and cuts the streams) if the tunnel is already closed.
    fn register(&self, id: u64, inbound: &TcpStream, outbound: &TcpStream) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.closed {
            let _ = inbound.shutdown(Shutdown::Both);
            let _ = outbound.shutdown(Shutdown::Both);
            return false;
        }
        match (inbound.try_clone(), outbound.try_clone()) {
            (Ok(a), Ok(b)) => {
                state.streams.insert(id, [a, b]);
                true
            }
            _ => false,
        }
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.streams.remove(&id);
        }
    }

    fn active(&self) -> usize {
        self.state.lock().map(|s| s.streams.len()).unwrap_or(0)
    }

    fn terminate_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            for (_, streams) in state.streams.drain() {
                for s in streams {
                    let _ = s.shutdown(Shutdown::Both);
                }
            }
        }
    }
}

/// Copy bytes both ways until each side has closed its half.
fn bridge(a: TcpStream, b: TcpStream) -> io::Result<()> {
    let mut a_read = a.try_clone()?;
    let mut b_write = b.try_clone()?;
    let upstream = thread::spawn(move || {
        let copied = io::copy(&mut a_read, &mut b_write);
        let _ = b_write.shutdown(Shutdown::Write);
        copied
    });

    let mut b_read = b;
    let mut a_write = a;
    let downstream = io::copy(&mut b_read, &mut a_write);
    let _ = a_write.shutdown(Shutdown::Write);

    let upstream = upstream
        .join()
        .map_err(|_| io::Error::new(ErrorKind::Other, "upstream copy panicked"))?;
    upstream?;
    downstream?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use std::io::{Read, Write};

    fn local() -> Arc<dyn Channel> {
        Arc::new(LocalChannel::new("local", std::env::temp_dir()))
    }

    /// Echo server that serves connections until the test ends
    fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                thread::spawn(move || {
                    let mut reader = conn.try_clone().unwrap();
                    let _ = io::copy(&mut reader, &mut conn);
                });
            }
        });
        port
    }

    fn manager() -> TunnelManager {
        TunnelManager::new(Duration::from_millis(10))
    }

    #[test]
    fn test_bytes_round_trip_unmodified() {
        let target = echo_server();
        let ch = local();
        let opened = manager().open(
            Direction::LocalToRemote,
            &[PortSpec::new(0, "127.0.0.1", target)],
            &ch,
            &ch,
            &CancelToken::new(),
        );
        assert!(opened.failure.is_none());
        let handle = opened.handles.into_iter().next().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", handle.local_port())).unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        client.write_all(&payload).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, payload);

        handle.close().unwrap();
    }

    #[test]
    fn test_bind_failure_keeps_earlier_tunnels() {
        let target = echo_server();
        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let ch = local();

        let opened = manager().open(
            Direction::RemoteToLocal,
            &[
                PortSpec::new(0, "127.0.0.1", target),
                PortSpec::new(taken, "127.0.0.1", target),
                PortSpec::new(0, "127.0.0.1", target),
            ],
            &ch,
            &ch,
            &CancelToken::new(),
        );

        assert_eq!(opened.handles.len(), 1, "direction stops at the first bind failure");
        assert!(matches!(opened.failure, Some(TunnelError::Bind { port, .. }) if port == taken));
        assert!(TunnelManager::close_all(opened.handles).is_empty());
    }

    #[test]
    fn test_close_releases_port_and_cuts_bridges() {
        let target = echo_server();
        let ch = local();
        let opened = manager().open(
            Direction::LocalToRemote,
            &[PortSpec::new(0, "127.0.0.1", target)],
            &ch,
            &ch,
            &CancelToken::new(),
        );
        let handle = opened.handles.into_iter().next().unwrap();
        let port = handle.local_port();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(handle.active_connections(), 1);

        handle.close().unwrap();

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).unwrap_or(0);
        assert_eq!(n, 0, "bridge must be cut on close");

        // port is free again
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_cancel_stops_accept_loop() {
        let target = echo_server();
        let ch = local();
        let cancel = CancelToken::new();
        let opened = manager().open(
            Direction::LocalToRemote,
            &[PortSpec::new(0, "127.0.0.1", target)],
            &ch,
            &ch,
            &cancel,
        );
        let handle = opened.handles.into_iter().next().unwrap();

        cancel.cancel();
        thread::sleep(Duration::from_millis(100));
        assert!(
            TcpStream::connect(("127.0.0.1", handle.local_port())).is_err(),
            "listener must be released once cancelled"
        );
        handle.close().unwrap();
    }
}
