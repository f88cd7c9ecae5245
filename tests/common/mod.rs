//! Shared helpers for the worker integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use mq_engine::config::WorkerConfig;
use mq_engine::engine::{Engine, EngineError, EngineRequest, ProcessorRegistry, StepOutputSink};
use mq_engine::types::{
    RequestOutput, StartupQueryKind, WireRequest, WireResponse, RPC_SUCCESS_STR,
};
use mq_engine::worker::{ChannelSet, ClientChannels, EngineLoop, ShutdownSignal};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String),
    Abort(String),
    Step(u32),
    CheckHealth,
    LogStats,
}

/// Every engine call, in order. Shared with the test after the engine moves.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn steps(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Step(_)))
            .count()
    }
}

/// Engine whose behaviour is fixed up front by the test.
pub struct ScriptedEngine {
    log: CallLog,
    running: Vec<(String, usize)>,
    steps: u32,
    /// Steps a request stays unfinished for.
    lifetime: usize,
    /// Every step from this one (1-based) fails with a distinct cause.
    fail_steps_from: Option<u32>,
    refuse: HashSet<String>,
    health_fails: bool,
    /// Sub-batch sizes pushed by every step; empty means one push per step.
    sub_batches: Vec<usize>,
    tracing: bool,
}

impl ScriptedEngine {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            running: Vec::new(),
            steps: 0,
            lifetime: 1,
            fail_steps_from: None,
            refuse: HashSet::new(),
            health_fails: false,
            sub_batches: Vec::new(),
            tracing: false,
        }
    }

    pub fn lifetime(mut self, steps: usize) -> Self {
        self.lifetime = steps.max(1);
        self
    }

    pub fn fail_steps_from(mut self, step: u32) -> Self {
        self.fail_steps_from = Some(step);
        self
    }

    pub fn refuse(mut self, request_id: &str) -> Self {
        self.refuse.insert(request_id.to_string());
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.health_fails = true;
        self
    }

    pub fn sub_batches(mut self, sizes: &[usize]) -> Self {
        self.sub_batches = sizes.to_vec();
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    fn output(&self, request_id: &str, seq: usize) -> RequestOutput {
        RequestOutput {
            request_id: request_id.to_string(),
            finished: false,
            data: json!({ "step": self.steps, "seq": seq }),
        }
    }
}

impl Engine for ScriptedEngine {
    fn add_request(&mut self, request: EngineRequest) -> Result<(), EngineError> {
        self.log.push(Call::Add(request.request_id.clone()));
        if self.refuse.contains(&request.request_id) {
            return Err(EngineError::new(format!(
                "cannot schedule {}",
                request.request_id
            )));
        }
        self.running.push((request.request_id, self.lifetime));
        Ok(())
    }

    fn abort_request(&mut self, request_id: &str) {
        self.log.push(Call::Abort(request_id.to_string()));
        self.running.retain(|(id, _)| id != request_id);
    }

    fn step(&mut self, sink: &mut dyn StepOutputSink) -> Result<(), EngineError> {
        self.steps += 1;
        self.log.push(Call::Step(self.steps));
        if self.fail_steps_from.is_some_and(|from| self.steps >= from) {
            return Err(EngineError::new(format!("step {} failed", self.steps)));
        }

        let owner = self
            .running
            .first()
            .map(|(id, _)| id.clone())
            .unwrap_or_default();
        let batches: Vec<Vec<RequestOutput>> = if self.sub_batches.is_empty() {
            vec![self
                .running
                .iter()
                .enumerate()
                .map(|(seq, (id, _))| self.output(id, seq))
                .collect()]
        } else {
            let mut seq = 0;
            self.sub_batches
                .iter()
                .map(|&size| {
                    (0..size)
                        .map(|_| {
                            seq += 1;
                            self.output(&owner, seq)
                        })
                        .collect()
                })
                .collect()
        };

        for (_, remaining) in &mut self.running {
            *remaining -= 1;
        }
        self.running.retain(|(_, remaining)| *remaining > 0);

        for batch in batches {
            sink.push(&mut *self, batch)?;
        }
        Ok(())
    }

    fn has_unfinished_requests(&self) -> bool {
        !self.running.is_empty()
    }

    fn do_log_stats(&mut self) {
        self.log.push(Call::LogStats);
    }

    fn check_health(&self) -> Result<(), EngineError> {
        self.log.push(Call::CheckHealth);
        if self.health_fails {
            Err(EngineError::new("health probe failed"))
        } else {
            Ok(())
        }
    }

    fn is_tracing_enabled(&self) -> bool {
        self.tracing
    }
}

pub fn config(overlap: bool) -> WorkerConfig {
    WorkerConfig {
        overlap,
        polling_timeout_ms: 100,
        log_stats: true,
        ..WorkerConfig::default()
    }
}

/// Loop over in-memory channels, driven step by step from the test thread.
pub fn engine_loop<E: Engine>(engine: E, overlap: bool) -> (EngineLoop<E>, ClientChannels) {
    let (channels, client) = ChannelSet::pair();
    let engine_loop = EngineLoop::new(
        engine,
        channels,
        &config(overlap),
        Arc::new(ProcessorRegistry::with_builtins()),
        ShutdownSignal::new(),
    );
    (engine_loop, client)
}

/// Run both handshake queries from the client side.
pub fn handshake(client: &ClientChannels) -> bool {
    let data = client.open_data().unwrap();
    let capabilities = data
        .request(
            &WireRequest::StartupQuery {
                kind: StartupQueryKind::IsServerReady,
            },
            WAIT,
        )
        .unwrap();
    let tracing_enabled = match capabilities {
        Some(WireResponse::StartupCapabilities { tracing_enabled }) => tracing_enabled,
        other => panic!("expected capabilities, got {other:?}"),
    };
    let ack = data
        .request(
            &WireRequest::StartupQuery {
                kind: StartupQueryKind::ClientIsReady,
            },
            WAIT,
        )
        .unwrap();
    assert_eq!(
        ack,
        Some(WireResponse::StartupAck {
            status: RPC_SUCCESS_STR.to_string()
        })
    );
    tracing_enabled
}

/// Sizes of the `Outputs` frames among `responses`.
pub fn output_sizes(responses: &[WireResponse]) -> Vec<usize> {
    responses
        .iter()
        .filter_map(|r| match r {
            WireResponse::Outputs { outputs } => Some(outputs.len()),
            _ => None,
        })
        .collect()
}
