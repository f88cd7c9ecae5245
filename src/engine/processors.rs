//! Named logits processors.
//!
//! Clients pick processors by name; the worker resolves the names against a
//! registry of processors compiled into the worker. No executable payload is
//! ever accepted from the wire.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use super::EngineError;

/// End-of-sequence id used by the built-in `ban_eos` processor (llama family).
pub const DEFAULT_EOS_TOKEN_ID: u32 = 2;

/// Adjusts next-token logits given the tokens generated so far.
pub trait LogitsProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, generated_token_ids: &[u32], logits: &mut [f32]);
}

/// Leaves logits untouched.
pub struct NoOpProcessor;

impl LogitsProcessor for NoOpProcessor {
    fn name(&self) -> &str {
        "no_op"
    }

    fn process(&self, _generated_token_ids: &[u32], _logits: &mut [f32]) {}
}

/// Makes the listed token ids impossible to sample.
pub struct TokenBanProcessor {
    name: String,
    banned: Vec<u32>,
}

impl TokenBanProcessor {
    pub fn new(name: impl Into<String>, banned: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            banned,
        }
    }
}

impl LogitsProcessor for TokenBanProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, _generated_token_ids: &[u32], logits: &mut [f32]) {
        for &id in &self.banned {
            if let Some(logit) = logits.get_mut(id as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

lazy_static! {
    static ref BUILTIN_PROCESSORS: Vec<Arc<dyn LogitsProcessor>> = vec![
        Arc::new(NoOpProcessor),
        Arc::new(TokenBanProcessor::new("ban_eos", vec![DEFAULT_EOS_TOKEN_ID])),
    ];
}

/// Pre-approved processors, selectable by name.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn LogitsProcessor>>,
}

impl ProcessorRegistry {
    /// Registry with no processors at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in processors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for processor in BUILTIN_PROCESSORS.iter() {
            registry.register(processor.clone());
        }
        registry
    }

    /// Adds a processor, replacing any previous one with the same name.
    pub fn register(&mut self, processor: Arc<dyn LogitsProcessor>) {
        self.processors
            .insert(processor.name().to_string(), processor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    /// Resolve names in order. Fails on the first unknown name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn LogitsProcessor>>, EngineError> {
        names
            .iter()
            .map(|name| {
                self.processors.get(name).cloned().ok_or_else(|| {
                    EngineError::invalid_request(format!("unknown logits processor '{name}'"))
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.processors.keys().collect();
        names.sort();
        f.debug_struct("ProcessorRegistry")
            .field("processors", &names)
            .finish()
    }
}
