//! Wire protocol types for client ↔ engine worker communication.
//!
//! Every frame is a single JSON object on its own line (JSON Lines). Requests
//! and responses are internally tagged by their `"type"` field, so a frame with
//! an unknown tag fails to decode instead of being silently ignored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed success token sent as the handshake ack and as the health-ok payload.
pub const RPC_SUCCESS_STR: &str = "SUCCESS";

/// How long the idle engine loop blocks on the input channel before a stats tick.
pub const POLLING_TIMEOUT_MS: u64 = 10_000;

/// Address suffixes appended to the base IPC path, one per channel.
pub const IPC_INPUT_EXT: &str = "_input_socket";
pub const IPC_OUTPUT_EXT: &str = "_output_socket";
pub const IPC_HEALTH_EXT: &str = "_health_socket";
pub const IPC_DATA_EXT: &str = "_data_socket";

/// Free-form multimodal payload keyed by modality (`"image"`, ...).
pub type MultiModalData = Map<String, Value>;

// ─── Requests ─────────────────────────────────────────────────────────

/// Request sent from a client to the engine worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WireRequest {
    /// Add a new request to the engine.
    Generate(GenerateRequest),
    /// Abort an in-flight request. Fire-and-forget.
    Abort { request_id: String },
    /// Ask the worker to report its health on the health channel.
    HealthCheck,
    /// Startup query. Only valid on the data (handshake) channel.
    StartupQuery { kind: StartupQueryKind },
}

impl WireRequest {
    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            WireRequest::Generate(_) => "Generate",
            WireRequest::Abort { .. } => "Abort",
            WireRequest::HealthCheck => "HealthCheck",
            WireRequest::StartupQuery { .. } => "StartupQuery",
        }
    }
}

/// Queries a client may issue during the startup handshake.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartupQueryKind {
    IsServerReady,
    ClientIsReady,
}

/// Everything the engine needs to start generating for one request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Unique among in-flight requests.
    pub request_id: String,
    pub prompt_inputs: PromptInputs,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_request: Option<LoraRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_adapter_request: Option<PromptAdapterRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_headers: Option<BTreeMap<String, String>>,
    /// Extra keyword arguments for the multimodal input mapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mm_processor_kwargs: Option<Map<String, Value>>,
}

impl GenerateRequest {
    /// Text prompt with default sampling parameters.
    pub fn text(request_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt_inputs: PromptInputs::Text {
                prompt: prompt.into(),
                multi_modal_data: None,
            },
            sampling_params: SamplingParams::default(),
            lora_request: None,
            prompt_adapter_request: None,
            trace_headers: None,
            mm_processor_kwargs: None,
        }
    }
}

/// Prompt given either as raw text or as pre-tokenized ids.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptInputs {
    Text {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_modal_data: Option<MultiModalData>,
    },
    Tokens {
        prompt_token_ids: Vec<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_modal_data: Option<MultiModalData>,
    },
}

impl PromptInputs {
    pub fn multi_modal_data(&self) -> Option<&MultiModalData> {
        match self {
            PromptInputs::Text {
                multi_modal_data, ..
            }
            | PromptInputs::Tokens {
                multi_modal_data, ..
            } => multi_modal_data.as_ref(),
        }
    }
}

/// Sampling configuration for one request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SamplingParams {
    pub n: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    pub stop: Vec<String>,
    /// Names of worker-side logits processors. Resolved against the worker's
    /// registry; executable code never travels over the wire.
    pub logits_processors: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            max_tokens: Some(16),
            seed: None,
            stop: Vec::new(),
            logits_processors: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoraRequest {
    pub lora_name: String,
    pub lora_int_id: u32,
    pub lora_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PromptAdapterRequest {
    pub prompt_adapter_name: String,
    pub prompt_adapter_id: u32,
    pub prompt_adapter_local_path: String,
    pub prompt_adapter_num_virtual_tokens: u32,
}

// ─── Responses ────────────────────────────────────────────────────────

/// Per-request result produced by the engine. The worker core never looks
/// inside `data`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestOutput {
    pub request_id: String,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub data: Value,
}

/// Response sent from the engine worker to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WireResponse {
    /// One batch of streamed request outputs (output channel).
    Outputs { outputs: Vec<RequestOutput> },
    /// A request-scoped or engine-wide error (output channel).
    Error(RpcError),
    /// Health probe succeeded (health channel).
    HealthOk { status: String },
    /// Engine is unhealthy (health channel).
    HealthError { cause: ErrorCause },
    /// Reply to `CLIENT_IS_READY` (data channel).
    StartupAck { status: String },
    /// Reply to `IS_SERVER_READY` (data channel).
    StartupCapabilities { tracing_enabled: bool },
}

impl WireResponse {
    pub fn healthy() -> Self {
        WireResponse::HealthOk {
            status: RPC_SUCCESS_STR.to_string(),
        }
    }

    pub fn unhealthy(cause: ErrorCause) -> Self {
        WireResponse::HealthError { cause }
    }

    pub fn startup_ack() -> Self {
        WireResponse::StartupAck {
            status: RPC_SUCCESS_STR.to_string(),
        }
    }

    pub fn error(request_id: Option<String>, is_engine_errored: bool, cause: ErrorCause) -> Self {
        WireResponse::Error(RpcError {
            request_id,
            is_engine_errored,
            cause,
        })
    }
}

/// Error reported on the output channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// `None` when the error concerns the whole engine rather than one request.
    pub request_id: Option<String>,
    pub is_engine_errored: bool,
    pub cause: ErrorCause,
}

// ─── Error causes ─────────────────────────────────────────────────────

/// Broad category of an [`ErrorCause`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raised by the engine itself.
    Engine,
    /// The engine loop is no longer running; `source` holds the original error.
    EngineDead,
    /// The request could not be accepted (bad parameters, unknown processor, ...).
    InvalidRequest,
    /// Undecodable frame or a message on the wrong channel.
    Protocol,
    /// A channel failed or was closed under the worker.
    Transport,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Engine => "engine",
            ErrorKind::EngineDead => "engine_dead",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error value carried in `Error` and `HealthError` frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Box<ErrorCause>>,
}

impl ErrorCause {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Engine, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Dead-engine error, wrapping the error that killed the loop when known.
    pub fn dead_engine(original: Option<&ErrorCause>) -> Self {
        match original {
            Some(cause) => Self {
                kind: ErrorKind::EngineDead,
                message: format!(
                    "Engine loop is not running. Original error: {cause}"
                ),
                source: Some(Box::new(cause.clone())),
            },
            None => Self::new(
                ErrorKind::EngineDead,
                "Engine loop is not running. Inspect the worker logs to find the original error.",
            ),
        }
    }

    /// Innermost cause in the `source` chain.
    pub fn root_cause(&self) -> &ErrorCause {
        let mut current = self;
        while let Some(next) = current.source.as_deref() {
            current = next;
        }
        current
    }

    pub fn is_engine_dead(&self) -> bool {
        self.kind == ErrorKind::EngineDead
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}
