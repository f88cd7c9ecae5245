//! The compute engine as seen by the worker.
//!
//! The worker never looks inside the engine: it adds and aborts requests,
//! advances it one step at a time and forwards whatever outputs it produces.

pub mod echo;
pub mod processors;

use std::collections::BTreeMap;
use std::sync::Arc;

use mq_engine_types::{
    ErrorCause, ErrorKind, GenerateRequest, LoraRequest, PromptAdapterRequest, PromptInputs,
    RequestOutput, SamplingParams,
};
use thiserror::Error;

pub use echo::EchoEngine;
pub use processors::{LogitsProcessor, ProcessorRegistry};

/// Error raised by an [`Engine`] operation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Engine,
            message: message.into(),
        }
    }

    /// The request itself is unacceptable; the engine is fine.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> ErrorCause {
        ErrorCause::new(self.kind, self.message.clone())
    }
}

impl From<ErrorCause> for EngineError {
    fn from(cause: ErrorCause) -> Self {
        Self {
            kind: cause.kind,
            message: cause.message,
        }
    }
}

/// A decoded `Generate` request with its logits processors resolved.
#[derive(Clone)]
pub struct EngineRequest {
    pub request_id: String,
    pub prompt_inputs: PromptInputs,
    pub sampling_params: SamplingParams,
    pub lora_request: Option<LoraRequest>,
    pub prompt_adapter_request: Option<PromptAdapterRequest>,
    pub trace_headers: Option<BTreeMap<String, String>>,
    pub logits_processors: Vec<Arc<dyn LogitsProcessor>>,
}

impl EngineRequest {
    pub fn new(request: GenerateRequest, logits_processors: Vec<Arc<dyn LogitsProcessor>>) -> Self {
        Self {
            request_id: request.request_id,
            prompt_inputs: request.prompt_inputs,
            sampling_params: request.sampling_params,
            lora_request: request.lora_request,
            prompt_adapter_request: request.prompt_adapter_request,
            trace_headers: request.trace_headers,
            logits_processors,
        }
    }
}

impl std::fmt::Debug for EngineRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRequest")
            .field("request_id", &self.request_id)
            .field("prompt_inputs", &self.prompt_inputs)
            .field("sampling_params", &self.sampling_params)
            .field("lora_request", &self.lora_request)
            .field("prompt_adapter_request", &self.prompt_adapter_request)
            .field("trace_headers", &self.trace_headers)
            .field(
                "logits_processors",
                &self
                    .logits_processors
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Receives outputs from inside [`Engine::step`].
///
/// The engine calls [`push`](StepOutputSink::push) once per sub-batch, before
/// `step` returns, handing itself back so the sink may add or abort requests
/// while the rest of the batch is still being computed.
pub trait StepOutputSink {
    fn push(&mut self, engine: &mut dyn Engine, outputs: Vec<RequestOutput>)
        -> Result<(), EngineError>;
}

/// Narrow interface the worker drives.
pub trait Engine: Send {
    fn add_request(&mut self, request: EngineRequest) -> Result<(), EngineError>;

    /// No-op for unknown ids.
    fn abort_request(&mut self, request_id: &str);

    /// Run one unit of work, pushing every produced sub-batch into `sink`.
    /// An error returned by the sink should be returned from `step` unchanged;
    /// the worker treats it as fatal even when it is not.
    fn step(&mut self, sink: &mut dyn StepOutputSink) -> Result<(), EngineError>;

    fn has_unfinished_requests(&self) -> bool;

    fn do_log_stats(&mut self);

    fn check_health(&self) -> Result<(), EngineError>;

    fn is_tracing_enabled(&self) -> bool;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn add_request(&mut self, request: EngineRequest) -> Result<(), EngineError> {
        (**self).add_request(request)
    }

    fn abort_request(&mut self, request_id: &str) {
        (**self).abort_request(request_id)
    }

    fn step(&mut self, sink: &mut dyn StepOutputSink) -> Result<(), EngineError> {
        (**self).step(sink)
    }

    fn has_unfinished_requests(&self) -> bool {
        (**self).has_unfinished_requests()
    }

    fn do_log_stats(&mut self) {
        (**self).do_log_stats()
    }

    fn check_health(&self) -> Result<(), EngineError> {
        (**self).check_health()
    }

    fn is_tracing_enabled(&self) -> bool {
        (**self).is_tracing_enabled()
    }
}
