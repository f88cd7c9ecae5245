//! The four message channels between clients and the engine worker.
//!
//! - Input (client → engine): many producers, one consumer.
//! - Output (engine → client): streamed request outputs and errors.
//! - Health (engine → client): health replies and fatal-error broadcasts.
//! - Data (bidirectional, identity-routed): startup handshake only.
//!
//! Frames are JSON Lines. The engine side always works on `crossbeam_channel`
//! endpoints; the socket transport (`super::socket`) only bridges those
//! endpoints to Unix domain sockets with helper threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, warn};
use thiserror::Error;

use mq_engine_types::{WireRequest, WireResponse};

/// Identity of one caller on the data channel.
pub type Identity = String;

pub(crate) type Routes = Arc<Mutex<HashMap<Identity, Sender<String>>>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} channel is closed")]
    Closed(&'static str),
    #[error("invalid frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    #[cfg_attr(not(unix), allow(dead_code))]
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TransportError::Io {
            context: context.into(),
            source,
        }
    }
}

pub(crate) fn lock_routes(routes: &Routes) -> MutexGuard<'_, HashMap<Identity, Sender<String>>> {
    match routes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn encode<T: serde::Serialize>(message: &T) -> Result<String, TransportError> {
    Ok(serde_json::to_string(message)?)
}

fn decode_response(line: &str) -> Result<WireResponse, TransportError> {
    Ok(serde_json::from_str(line)?)
}

// ─── Engine side ──────────────────────────────────────────────────────

/// Engine-side endpoints. Owned by the loop thread only.
pub struct ChannelSet {
    input_rx: Receiver<String>,
    /// Frame taken off the input queue by `poll_input` but not yet handed out.
    peeked: Option<String>,
    output_tx: Sender<String>,
    health_tx: Sender<String>,
    data_rx: Receiver<(Identity, String)>,
    routes: Routes,
    closed: Arc<AtomicBool>,
    /// Set once the handshake is over; no new data callers are taken.
    data_closed: Arc<AtomicBool>,
    /// Socket files to unlink on close.
    bound_paths: Vec<std::path::PathBuf>,
}

impl ChannelSet {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        input_rx: Receiver<String>,
        output_tx: Sender<String>,
        health_tx: Sender<String>,
        data_rx: Receiver<(Identity, String)>,
        routes: Routes,
        closed: Arc<AtomicBool>,
        data_closed: Arc<AtomicBool>,
        bound_paths: Vec<std::path::PathBuf>,
    ) -> Self {
        Self {
            input_rx,
            peeked: None,
            output_tx,
            health_tx,
            data_rx,
            routes,
            closed,
            data_closed,
            bound_paths,
        }
    }

    /// In-process channel set and the matching client endpoints.
    pub fn pair() -> (ChannelSet, ClientChannels) {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let (health_tx, health_rx) = crossbeam_channel::unbounded();
        let (data_tx, data_rx) = crossbeam_channel::unbounded();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let engine_side = ChannelSet::from_parts(
            input_rx,
            output_tx,
            health_tx,
            data_rx,
            routes.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            Vec::new(),
        );
        let client_side = ClientChannels {
            input_tx,
            output_rx,
            health_rx,
            data: DataConnector::Memory {
                tx: data_tx,
                routes,
            },
        };
        (engine_side, client_side)
    }

    /// Bind the four channels as Unix domain sockets under `base`.
    #[cfg(unix)]
    pub fn bind(base: &str) -> Result<ChannelSet, TransportError> {
        super::socket::bind(base)
    }

    /// Wait up to `timeout` for an input frame without consuming it.
    ///
    /// Returns `Closed` once every producer is gone and the queue is empty.
    pub fn poll_input(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        match self.input_rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.peeked = Some(frame);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed("input")),
        }
    }

    /// Number of input frames that have already arrived.
    pub fn pending_input(&self) -> usize {
        usize::from(self.peeked.is_some()) + self.input_rx.len()
    }

    /// Next already-arrived input frame, if any. Never blocks.
    pub fn try_recv_input(&mut self) -> Option<String> {
        if let Some(frame) = self.peeked.take() {
            return Some(frame);
        }
        match self.input_rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn send_output(&self, response: &WireResponse) -> Result<(), TransportError> {
        let frame = encode(response)?;
        self.output_tx
            .send(frame)
            .map_err(|_| TransportError::Closed("output"))
    }

    pub fn send_health(&self, response: &WireResponse) -> Result<(), TransportError> {
        let frame = encode(response)?;
        self.health_tx
            .send(frame)
            .map_err(|_| TransportError::Closed("health"))
    }

    /// Next handshake frame together with the identity of its sender.
    pub fn recv_data(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Identity, String)>, TransportError> {
        match self.data_rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed("data")),
        }
    }

    /// Send `response` back to the caller that sent the frame tagged `identity`.
    pub fn reply_data(&self, identity: &str, response: &WireResponse) -> Result<(), TransportError> {
        let frame = encode(response)?;
        let mut routes = lock_routes(&self.routes);
        let delivered = routes
            .get(identity)
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false);
        if !delivered {
            routes.remove(identity);
            return Err(TransportError::Closed("data"));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Data-channel callers that can still be replied to.
    pub fn data_route_count(&self) -> usize {
        lock_routes(&self.routes).len()
    }

    /// Stop taking data-channel callers and drop the existing ones. The data
    /// channel only serves the startup handshake.
    pub fn close_data(&self) {
        self.data_closed.store(true, Ordering::SeqCst);
        lock_routes(&self.routes).clear();
        while self.data_rx.try_recv().is_ok() {}
    }

    /// Close all four channels without waiting for undelivered frames.
    pub fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.data_closed.store(true, Ordering::SeqCst);
        lock_routes(&self.routes).clear();
        for path in &self.bound_paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove socket file {}: {e}", path.display());
                }
            }
        }
        debug!("Channels closed");
    }
}

// ─── Client side ──────────────────────────────────────────────────────

pub(crate) enum DataConnector {
    Memory {
        tx: Sender<(Identity, String)>,
        routes: Routes,
    },
    #[cfg(unix)]
    Socket {
        path: std::path::PathBuf,
        timeout: Duration,
    },
}

/// Client-side endpoints matching a [`ChannelSet`].
pub struct ClientChannels {
    pub(crate) input_tx: Sender<String>,
    pub(crate) output_rx: Receiver<String>,
    pub(crate) health_rx: Receiver<String>,
    pub(crate) data: DataConnector,
}

impl ClientChannels {
    /// Connect to a worker bound with [`ChannelSet::bind`], retrying until
    /// `timeout` while the worker is still starting.
    #[cfg(unix)]
    pub fn connect(base: &str, timeout: Duration) -> Result<ClientChannels, TransportError> {
        super::socket::connect(base, timeout)
    }

    pub fn send(&self, request: &WireRequest) -> Result<(), TransportError> {
        self.send_raw(encode(request)?)
    }

    /// Send an already-encoded frame as is.
    pub fn send_raw(&self, frame: String) -> Result<(), TransportError> {
        self.input_tx
            .send(frame)
            .map_err(|_| TransportError::Closed("input"))
    }

    pub fn recv_output(&self, timeout: Duration) -> Result<Option<WireResponse>, TransportError> {
        recv_frame(&self.output_rx, timeout, "output")
    }

    pub fn recv_health(&self, timeout: Duration) -> Result<Option<WireResponse>, TransportError> {
        recv_frame(&self.health_rx, timeout, "health")
    }

    /// Output frames that have already arrived, without waiting.
    pub fn drain_output(&self) -> Result<Vec<WireResponse>, TransportError> {
        self.output_rx
            .try_iter()
            .map(|line| decode_response(&line))
            .collect()
    }

    pub fn drain_health(&self) -> Result<Vec<WireResponse>, TransportError> {
        self.health_rx
            .try_iter()
            .map(|line| decode_response(&line))
            .collect()
    }

    /// Open a new identity-routed connection on the data channel.
    pub fn open_data(&self) -> Result<DataConnection, TransportError> {
        match &self.data {
            DataConnector::Memory { tx, routes } => {
                let identity = uuid::Uuid::new_v4().to_string();
                let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
                lock_routes(routes).insert(identity.clone(), reply_tx);
                Ok(DataConnection {
                    identity,
                    outbound: DataOutbound::Routed(tx.clone()),
                    inbound: reply_rx,
                })
            }
            #[cfg(unix)]
            DataConnector::Socket { path, timeout } => super::socket::open_data(path, *timeout),
        }
    }
}

fn recv_frame(
    rx: &Receiver<String>,
    timeout: Duration,
    name: &'static str,
) -> Result<Option<WireResponse>, TransportError> {
    match rx.recv_timeout(timeout) {
        Ok(line) => Ok(Some(decode_response(&line)?)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed(name)),
    }
}

pub(crate) enum DataOutbound {
    Routed(Sender<(Identity, String)>),
    #[cfg_attr(not(unix), allow(dead_code))]
    Direct(Sender<String>),
}

/// One caller's connection to the data channel.
pub struct DataConnection {
    pub(crate) identity: Identity,
    pub(crate) outbound: DataOutbound,
    pub(crate) inbound: Receiver<String>,
}

impl DataConnection {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn send(&self, request: &WireRequest) -> Result<(), TransportError> {
        self.send_raw(encode(request)?)
    }

    pub fn send_raw(&self, frame: String) -> Result<(), TransportError> {
        let sent = match &self.outbound {
            DataOutbound::Routed(tx) => tx.send((self.identity.clone(), frame)).is_ok(),
            DataOutbound::Direct(tx) => tx.send(frame).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(TransportError::Closed("data"))
        }
    }

    pub fn recv(&self, timeout: Duration) -> Result<Option<WireResponse>, TransportError> {
        recv_frame(&self.inbound, timeout, "data")
    }

    /// Send one request and wait for its reply.
    pub fn request(
        &self,
        request: &WireRequest,
        timeout: Duration,
    ) -> Result<Option<WireResponse>, TransportError> {
        self.send(request)?;
        self.recv(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_engine_types::StartupQueryKind;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_poll_does_not_consume_frame() {
        let (mut engine, client) = ChannelSet::pair();
        client.send(&WireRequest::HealthCheck).unwrap();

        assert!(engine.poll_input(SHORT).unwrap());
        assert!(engine.poll_input(SHORT).unwrap());
        assert_eq!(engine.pending_input(), 1);
        let frame = engine.try_recv_input().unwrap();
        assert!(frame.contains("HealthCheck"));
        assert_eq!(engine.pending_input(), 0);
        assert!(engine.try_recv_input().is_none());
    }

    #[test]
    fn test_poll_times_out_without_input() {
        let (mut engine, _client) = ChannelSet::pair();
        assert!(!engine.poll_input(SHORT).unwrap());
    }

    #[test]
    fn test_poll_reports_closed_when_clients_are_gone() {
        let (mut engine, client) = ChannelSet::pair();
        drop(client);
        assert!(matches!(
            engine.poll_input(SHORT),
            Err(TransportError::Closed("input"))
        ));
    }

    #[test]
    fn test_data_replies_are_routed_by_identity() {
        let (engine, client) = ChannelSet::pair();
        let first = client.open_data().unwrap();
        let second = client.open_data().unwrap();
        assert_ne!(first.identity(), second.identity());

        let query = WireRequest::StartupQuery {
            kind: StartupQueryKind::IsServerReady,
        };
        second.send(&query).unwrap();
        first.send(&query).unwrap();

        let (identity_a, _) = engine.recv_data(SHORT).unwrap().unwrap();
        let (identity_b, _) = engine.recv_data(SHORT).unwrap().unwrap();
        assert_eq!(identity_a, second.identity());
        assert_eq!(identity_b, first.identity());

        engine
            .reply_data(&identity_a, &WireResponse::startup_ack())
            .unwrap();
        assert_eq!(
            second.recv(SHORT).unwrap(),
            Some(WireResponse::startup_ack())
        );
        assert_eq!(first.recv(SHORT).unwrap(), None);
    }

    #[test]
    fn test_reply_to_unknown_identity_fails() {
        let (engine, _client) = ChannelSet::pair();
        assert!(matches!(
            engine.reply_data("nobody", &WireResponse::startup_ack()),
            Err(TransportError::Closed("data"))
        ));
    }

    #[test]
    fn test_output_and_health_are_separate_streams() {
        let (engine, client) = ChannelSet::pair();
        engine.send_health(&WireResponse::healthy()).unwrap();
        engine
            .send_output(&WireResponse::Outputs { outputs: vec![] })
            .unwrap();

        assert_eq!(client.drain_health().unwrap(), vec![WireResponse::healthy()]);
        assert_eq!(
            client.drain_output().unwrap(),
            vec![WireResponse::Outputs { outputs: vec![] }]
        );
    }

    #[test]
    fn test_send_output_fails_once_client_is_gone() {
        let (engine, client) = ChannelSet::pair();
        drop(client);
        assert!(matches!(
            engine.send_output(&WireResponse::healthy()),
            Err(TransportError::Closed("output"))
        ));
    }

    #[test]
    fn test_close_marks_set_closed_and_drops_routes() {
        let (engine, client) = ChannelSet::pair();
        let connection = client.open_data().unwrap();
        let closed = engine.closed.clone();
        engine.close();
        assert!(closed.load(Ordering::SeqCst));
        if let DataConnector::Memory { routes, .. } = &client.data {
            assert!(lock_routes(routes).is_empty());
        }
        assert!(matches!(
            connection.recv(SHORT),
            Err(TransportError::Closed("data"))
        ));
    }
}
