//! Reference engine that streams each prompt back, one token per step.
//!
//! Used by the worker binary when no real model backend is configured and by
//! the tests. Every running request advances by exactly one token per step.

use log::info;
use serde_json::json;

use mq_engine_types::{PromptInputs, RequestOutput};

use super::{Engine, EngineError, EngineRequest, StepOutputSink};

struct EchoRequest {
    request_id: String,
    tokens: Vec<String>,
    emitted: usize,
    limit: usize,
    processors: Vec<String>,
}

pub struct EchoEngine {
    running: Vec<EchoRequest>,
    /// Outputs per sub-batch pushed to the sink. 0 = one push per step.
    sub_batch_size: usize,
    tracing_enabled: bool,
    steps: u64,
    finished: u64,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self {
            running: Vec::new(),
            sub_batch_size: 0,
            tracing_enabled: false,
            steps: 0,
            finished: 0,
        }
    }

    pub fn with_sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn next_outputs(&mut self) -> Vec<RequestOutput> {
        let mut outputs = Vec::with_capacity(self.running.len());
        for request in &mut self.running {
            let mut token = String::new();
            if request.emitted < request.limit {
                token = request.tokens[request.emitted].clone();
                request.emitted += 1;
            }
            let finished = request.emitted >= request.limit;
            outputs.push(RequestOutput {
                request_id: request.request_id.clone(),
                finished,
                data: json!({
                    "token": token,
                    "text": request.tokens[..request.emitted].join(" "),
                    "num_generated": request.emitted,
                    "logits_processors": request.processors,
                }),
            });
        }
        let before = self.running.len();
        self.running.retain(|r| r.emitted < r.limit);
        self.finished += (before - self.running.len()) as u64;
        outputs
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for EchoEngine {
    fn add_request(&mut self, request: EngineRequest) -> Result<(), EngineError> {
        if self
            .running
            .iter()
            .any(|r| r.request_id == request.request_id)
        {
            return Err(EngineError::invalid_request(format!(
                "request {} is already running",
                request.request_id
            )));
        }
        if request.sampling_params.n == 0 {
            return Err(EngineError::invalid_request("n must be at least 1"));
        }

        let tokens: Vec<String> = match &request.prompt_inputs {
            PromptInputs::Text { prompt, .. } => {
                prompt.split_whitespace().map(str::to_string).collect()
            }
            PromptInputs::Tokens {
                prompt_token_ids, ..
            } => prompt_token_ids.iter().map(u32::to_string).collect(),
        };
        let limit = match request.sampling_params.max_tokens {
            Some(max) => tokens.len().min(max as usize),
            None => tokens.len(),
        };

        self.running.push(EchoRequest {
            request_id: request.request_id,
            tokens,
            emitted: 0,
            limit,
            processors: request
                .logits_processors
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
        });
        Ok(())
    }

    fn abort_request(&mut self, request_id: &str) {
        self.running.retain(|r| r.request_id != request_id);
    }

    fn step(&mut self, sink: &mut dyn StepOutputSink) -> Result<(), EngineError> {
        self.steps += 1;
        let mut outputs = self.next_outputs();
        if outputs.is_empty() {
            return Ok(());
        }

        let chunk = if self.sub_batch_size == 0 {
            outputs.len()
        } else {
            self.sub_batch_size
        };
        while !outputs.is_empty() {
            let rest = outputs.split_off(chunk.min(outputs.len()));
            let batch = std::mem::replace(&mut outputs, rest);
            sink.push(&mut *self, batch)?;
        }
        Ok(())
    }

    fn has_unfinished_requests(&self) -> bool {
        !self.running.is_empty()
    }

    fn do_log_stats(&mut self) {
        info!(
            "Echo engine: {} running, {} finished, {} steps",
            self.running.len(),
            self.finished,
            self.steps
        );
    }

    fn check_health(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn is_tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_engine_types::GenerateRequest;

    #[derive(Default)]
    struct Collect {
        batches: Vec<Vec<RequestOutput>>,
    }

    impl StepOutputSink for Collect {
        fn push(
            &mut self,
            _engine: &mut dyn Engine,
            outputs: Vec<RequestOutput>,
        ) -> Result<(), EngineError> {
            self.batches.push(outputs);
            Ok(())
        }
    }

    fn request(id: &str, prompt: &str) -> EngineRequest {
        EngineRequest::new(GenerateRequest::text(id, prompt), Vec::new())
    }

    #[test]
    fn test_streams_one_token_per_step_until_finished() {
        let mut engine = EchoEngine::new();
        engine.add_request(request("a", "hello big world")).unwrap();

        let mut texts = Vec::new();
        while engine.has_unfinished_requests() {
            let mut sink = Collect::default();
            engine.step(&mut sink).unwrap();
            let output = &sink.batches[0][0];
            texts.push((output.data["token"].clone(), output.finished));
        }
        assert_eq!(
            texts,
            vec![
                (json!("hello"), false),
                (json!("big"), false),
                (json!("world"), true),
            ]
        );
    }

    #[test]
    fn test_max_tokens_caps_output() {
        let mut engine = EchoEngine::new();
        let mut generate = GenerateRequest::text("a", "one two three four");
        generate.sampling_params.max_tokens = Some(2);
        engine
            .add_request(EngineRequest::new(generate, Vec::new()))
            .unwrap();

        let mut sink = Collect::default();
        engine.step(&mut sink).unwrap();
        engine.step(&mut sink).unwrap();
        assert!(!engine.has_unfinished_requests());
        assert_eq!(sink.batches[1][0].data["text"], "one two");
        assert!(sink.batches[1][0].finished);
    }

    #[test]
    fn test_empty_prompt_finishes_on_first_step() {
        let mut engine = EchoEngine::new();
        engine.add_request(request("a", "")).unwrap();
        let mut sink = Collect::default();
        engine.step(&mut sink).unwrap();
        assert!(sink.batches[0][0].finished);
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn test_sub_batches_split_outputs_in_order() {
        let mut engine = EchoEngine::new().with_sub_batch_size(2);
        for id in ["r1", "r2", "r3", "r4", "r5"] {
            engine.add_request(request(id, "x y")).unwrap();
        }
        let mut sink = Collect::default();
        engine.step(&mut sink).unwrap();

        let sizes: Vec<usize> = sink.batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let ids: Vec<&str> = sink
            .batches
            .iter()
            .flatten()
            .map(|o| o.request_id.as_str())
            .collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "r4", "r5"]);
    }

    #[test]
    fn test_duplicate_request_id_is_rejected() {
        let mut engine = EchoEngine::new();
        engine.add_request(request("dup", "a")).unwrap();
        let err = engine.add_request(request("dup", "b")).unwrap_err();
        assert!(err.message().contains("already running"));
        assert_eq!(engine.running_count(), 1);
    }

    #[test]
    fn test_abort_unknown_id_is_silent() {
        let mut engine = EchoEngine::new();
        engine.add_request(request("a", "x")).unwrap();
        engine.abort_request("missing");
        assert_eq!(engine.running_count(), 1);
        engine.abort_request("a");
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn test_step_without_requests_pushes_nothing() {
        let mut engine = EchoEngine::new();
        let mut sink = Collect::default();
        engine.step(&mut sink).unwrap();
        assert!(sink.batches.is_empty());
    }
}
