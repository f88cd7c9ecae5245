//! Client-side handle to an engine worker.
//!
//! Runs the startup handshake over the data channel, then submits requests on
//! the input channel and reads outputs and health replies from their own
//! channels.

use std::time::Duration;

use log::debug;
use thiserror::Error;

use mq_engine_types::{
    ErrorCause, GenerateRequest, StartupQueryKind, WireRequest, WireResponse, RPC_SUCCESS_STR,
};

use super::channels::{ClientChannels, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("worker replied with an error: {0}")]
    Rpc(ErrorCause),
    #[error("engine is unhealthy: {0}")]
    Unhealthy(ErrorCause),
    #[error("no reply on the {0} channel in time")]
    Timeout(&'static str),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub struct EngineClient {
    channels: ClientChannels,
    tracing_enabled: bool,
}

impl EngineClient {
    pub fn new(channels: ClientChannels) -> Self {
        Self {
            channels,
            tracing_enabled: false,
        }
    }

    /// Connect to a worker's sockets and complete the handshake.
    #[cfg(unix)]
    pub fn connect(base: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut client = Self::new(ClientChannels::connect(base, timeout)?);
        client.handshake(timeout)?;
        Ok(client)
    }

    /// Ask for the worker's capabilities, then report this client ready.
    pub fn handshake(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let data = self.channels.open_data()?;

        let query = WireRequest::StartupQuery {
            kind: StartupQueryKind::IsServerReady,
        };
        match data.request(&query, timeout)? {
            Some(WireResponse::StartupCapabilities { tracing_enabled }) => {
                self.tracing_enabled = tracing_enabled;
            }
            reply => return Err(unexpected(reply, "data")),
        }

        let ready = WireRequest::StartupQuery {
            kind: StartupQueryKind::ClientIsReady,
        };
        match data.request(&ready, timeout)? {
            Some(WireResponse::StartupAck { status }) if status == RPC_SUCCESS_STR => {}
            reply => return Err(unexpected(reply, "data")),
        }
        debug!("Handshake complete (tracing_enabled={})", self.tracing_enabled);
        Ok(())
    }

    pub fn tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    /// Submit a request. Outputs arrive on [`EngineClient::recv_output`].
    pub fn generate(&self, request: GenerateRequest) -> Result<(), ClientError> {
        Ok(self.channels.send(&WireRequest::Generate(request))?)
    }

    /// Fire-and-forget: the worker never answers an abort.
    pub fn abort(&self, request_id: impl Into<String>) -> Result<(), ClientError> {
        Ok(self.channels.send(&WireRequest::Abort {
            request_id: request_id.into(),
        })?)
    }

    /// Send a health check and wait for the next health reply.
    pub fn check_health(&self, timeout: Duration) -> Result<(), ClientError> {
        self.channels.send(&WireRequest::HealthCheck)?;
        match self.channels.recv_health(timeout)? {
            Some(WireResponse::HealthOk { .. }) => Ok(()),
            Some(WireResponse::HealthError { cause }) => Err(ClientError::Unhealthy(cause)),
            reply => Err(unexpected(reply, "health")),
        }
    }

    pub fn recv_output(&self, timeout: Duration) -> Result<Option<WireResponse>, ClientError> {
        Ok(self.channels.recv_output(timeout)?)
    }

    pub fn recv_health(&self, timeout: Duration) -> Result<Option<WireResponse>, ClientError> {
        Ok(self.channels.recv_health(timeout)?)
    }
}

fn unexpected(reply: Option<WireResponse>, channel: &'static str) -> ClientError {
    match reply {
        None => ClientError::Timeout(channel),
        Some(WireResponse::Error(err)) => ClientError::Rpc(err.cause),
        Some(other) => ClientError::UnexpectedReply(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EchoEngine;
    use crate::worker::channels::ChannelSet;
    use crate::worker::handshake::{run_startup_loop, HandshakeOutcome};
    use crate::worker::worker_main::ShutdownSignal;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_handshake_reads_capabilities() {
        let (channels, client_channels) = ChannelSet::pair();
        let server = thread::spawn(move || {
            let engine = EchoEngine::new().with_tracing(true);
            run_startup_loop(&channels, &engine, &ShutdownSignal::new()).unwrap()
        });

        let mut client = EngineClient::new(client_channels);
        client.handshake(WAIT).unwrap();
        assert!(client.tracing_enabled());
        assert_eq!(server.join().unwrap(), HandshakeOutcome::Ready);
    }

    #[test]
    fn test_health_error_surfaces_cause() {
        let (channels, client_channels) = ChannelSet::pair();
        let client = EngineClient::new(client_channels);
        channels
            .send_health(&WireResponse::unhealthy(ErrorCause::engine("E")))
            .unwrap();

        match client.check_health(WAIT) {
            Err(ClientError::Unhealthy(cause)) => assert_eq!(cause.message, "E"),
            other => panic!("expected unhealthy, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_health_reply_times_out() {
        let (_channels, client_channels) = ChannelSet::pair();
        let client = EngineClient::new(client_channels);
        assert!(matches!(
            client.check_health(Duration::from_millis(20)),
            Err(ClientError::Timeout("health"))
        ));
    }
}
