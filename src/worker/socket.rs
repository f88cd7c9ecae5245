//! Unix domain socket transport for the channel set.
//!
//! Each channel is bound at `<base><suffix>`. Helper threads move JSON lines
//! between the sockets and the crossbeam endpoints the engine loop works on:
//!
//! - input: one reader thread per connected client, all feeding one queue
//! - output / health: one writer thread; frames queue until a peer connects
//! - data: one reader and one writer thread per connection, routed by a
//!   per-connection identity

use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use mq_engine_types::{IPC_DATA_EXT, IPC_HEALTH_EXT, IPC_INPUT_EXT, IPC_OUTPUT_EXT};

use super::channels::{
    lock_routes, ChannelSet, ClientChannels, DataConnection, DataConnector, DataOutbound,
    Identity, Routes, TransportError,
};

/// How often blocked helper threads re-check the closed flag.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn channel_path(base: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{base}{suffix}"))
}

fn bind_listener(path: &Path) -> Result<UnixListener, TransportError> {
    // A stale socket file from a crashed worker would make bind fail.
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| TransportError::io(format!("remove stale {}", path.display()), e))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TransportError::io(format!("create {}", parent.display()), e))?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| TransportError::io(format!("bind {}", path.display()), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| TransportError::io(format!("configure {}", path.display()), e))?;
    Ok(listener)
}

/// Accept one connection, giving up once `closed` is set.
fn accept(listener: &UnixListener, closed: &AtomicBool, name: &str) -> Option<UnixStream> {
    while !closed.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Dropping {name} connection: {e}");
                    continue;
                }
                debug!("Accepted {name} connection");
                return Some(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("Accept on {name} channel failed: {e}");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    None
}

fn write_line(stream: &mut UnixStream, frame: &str) -> std::io::Result<()> {
    stream.write_all(frame.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Read non-empty lines until EOF, handing each to `on_line`. Stops early when
/// `on_line` returns false.
fn read_lines<F>(stream: UnixStream, name: &str, mut on_line: F)
where
    F: FnMut(String) -> bool,
{
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        match line {
            Ok(l) if !l.trim().is_empty() => {
                if !on_line(l) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{name} reader stopped: {e}");
                break;
            }
        }
    }
    debug!("{name} reader thread exiting");
}

fn spawn_line_reader<F>(stream: UnixStream, name: &'static str, on_line: F)
where
    F: FnMut(String) -> bool + Send + 'static,
{
    thread::spawn(move || read_lines(stream, name, on_line));
}

/// Write every frame from `frames` to `stream` until the queue disconnects,
/// the peer goes away or `closed` is set. Queued frames are dropped on close.
fn spawn_line_writer(
    mut stream: UnixStream,
    frames: Receiver<String>,
    closed: Arc<AtomicBool>,
    name: &'static str,
) {
    thread::spawn(move || {
        loop {
            let frame = match frames.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = write_line(&mut stream, &frame) {
                debug!("{name} peer went away: {e}");
                break;
            }
        }
        // The reader half may still hold the socket open; the peer only sees
        // EOF once this side stops writing.
        let _ = stream.shutdown(Shutdown::Write);
        debug!("{name} writer thread exiting");
    });
}

/// Push endpoint: frames queue until a peer connects; a frame that fails to
/// write is retried on the next peer.
fn spawn_push_endpoint(
    listener: UnixListener,
    frames: Receiver<String>,
    closed: Arc<AtomicBool>,
    name: &'static str,
) {
    thread::spawn(move || {
        let mut pending: Option<String> = None;
        'accept: while let Some(mut stream) = accept(&listener, &closed, name) {
            loop {
                let frame = match pending.take() {
                    Some(frame) => frame,
                    None => match frames.recv_timeout(POLL_INTERVAL) {
                        Ok(frame) => frame,
                        Err(RecvTimeoutError::Timeout) => {
                            if closed.load(Ordering::SeqCst) {
                                break 'accept;
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break 'accept,
                    },
                };
                if closed.load(Ordering::SeqCst) {
                    break 'accept;
                }
                if let Err(e) = write_line(&mut stream, &frame) {
                    debug!("{name} peer went away: {e}");
                    pending = Some(frame);
                    continue 'accept;
                }
            }
        }
        debug!("{name} push endpoint exiting");
    });
}

fn spawn_input_acceptor(listener: UnixListener, input_tx: Sender<String>, closed: Arc<AtomicBool>) {
    thread::spawn(move || {
        while let Some(stream) = accept(&listener, &closed, "input") {
            let tx = input_tx.clone();
            spawn_line_reader(stream, "input", move |line| tx.send(line).is_ok());
        }
        debug!("input acceptor exiting");
    });
}

fn spawn_data_acceptor(
    listener: UnixListener,
    data_tx: Sender<(Identity, String)>,
    routes: Routes,
    closed: Arc<AtomicBool>,
    data_closed: Arc<AtomicBool>,
) {
    thread::spawn(move || {
        while let Some(stream) = accept(&listener, &data_closed, "data") {
            let writer = match stream.try_clone() {
                Ok(writer) => writer,
                Err(e) => {
                    warn!("Dropping data connection: {e}");
                    continue;
                }
            };
            let identity = uuid::Uuid::new_v4().to_string();
            let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
            lock_routes(&routes).insert(identity.clone(), reply_tx);
            spawn_line_writer(writer, reply_rx, closed.clone(), "data");

            let tx = data_tx.clone();
            let routes = routes.clone();
            let data_closed = data_closed.clone();
            thread::spawn(move || {
                read_lines(stream, "data", |line| {
                    !data_closed.load(Ordering::SeqCst) && tx.send((identity.clone(), line)).is_ok()
                });
                // Dropping the route disconnects the writer thread.
                lock_routes(&routes).remove(&identity);
            });
        }
        debug!("data acceptor exiting");
    });
}

/// Bind all four channels under `base`.
pub fn bind(base: &str) -> Result<ChannelSet, TransportError> {
    let input_path = channel_path(base, IPC_INPUT_EXT);
    let output_path = channel_path(base, IPC_OUTPUT_EXT);
    let health_path = channel_path(base, IPC_HEALTH_EXT);
    let data_path = channel_path(base, IPC_DATA_EXT);

    let input_listener = bind_listener(&input_path)?;
    let output_listener = bind_listener(&output_path)?;
    let health_listener = bind_listener(&health_path)?;
    let data_listener = bind_listener(&data_path)?;

    let closed = Arc::new(AtomicBool::new(false));
    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    let (output_tx, output_rx) = crossbeam_channel::unbounded();
    let (health_tx, health_rx) = crossbeam_channel::unbounded();
    let (data_tx, data_rx) = crossbeam_channel::unbounded();
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    let data_closed = Arc::new(AtomicBool::new(false));

    spawn_input_acceptor(input_listener, input_tx, closed.clone());
    spawn_push_endpoint(output_listener, output_rx, closed.clone(), "output");
    spawn_push_endpoint(health_listener, health_rx, closed.clone(), "health");
    spawn_data_acceptor(
        data_listener,
        data_tx,
        routes.clone(),
        closed.clone(),
        data_closed.clone(),
    );

    info!("Channels bound under {base}");

    Ok(ChannelSet::from_parts(
        input_rx,
        output_tx,
        health_tx,
        data_rx,
        routes,
        closed,
        data_closed,
        vec![input_path, output_path, health_path, data_path],
    ))
}

fn connect_with_retry(path: &Path, timeout: Duration) -> Result<UnixStream, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(TransportError::io(
                    format!("connect {}", path.display()),
                    e,
                ))
            }
            Err(_) => thread::sleep(POLL_INTERVAL),
        }
    }
}

fn spawn_pull(stream: UnixStream, name: &'static str) -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    spawn_line_reader(stream, name, move |line| tx.send(line).is_ok());
    rx
}

/// Client side of [`bind`].
pub fn connect(base: &str, timeout: Duration) -> Result<ClientChannels, TransportError> {
    let input = connect_with_retry(&channel_path(base, IPC_INPUT_EXT), timeout)?;
    let output = connect_with_retry(&channel_path(base, IPC_OUTPUT_EXT), timeout)?;
    let health = connect_with_retry(&channel_path(base, IPC_HEALTH_EXT), timeout)?;

    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    spawn_line_writer(input, input_rx, Arc::new(AtomicBool::new(false)), "client input");

    Ok(ClientChannels {
        input_tx,
        output_rx: spawn_pull(output, "client output"),
        health_rx: spawn_pull(health, "client health"),
        data: DataConnector::Socket {
            path: channel_path(base, IPC_DATA_EXT),
            timeout,
        },
    })
}

pub(crate) fn open_data(path: &Path, timeout: Duration) -> Result<DataConnection, TransportError> {
    let stream = connect_with_retry(path, timeout)?;
    let writer = stream
        .try_clone()
        .map_err(|e| TransportError::io("clone data stream", e))?;

    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
    spawn_line_writer(writer, outbound_rx, Arc::new(AtomicBool::new(false)), "client data");

    Ok(DataConnection {
        identity: uuid::Uuid::new_v4().to_string(),
        outbound: DataOutbound::Direct(outbound_tx),
        inbound: spawn_pull(stream, "client data"),
    })
}
