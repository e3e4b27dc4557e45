//! Worker service
//!
//! Owns the engine, the tokenizer and the concurrency gate for one worker
//! process. `generate_stream` validates a request, waits for a slot and then
//! runs the session on the blocking pool, forwarding frames through a bounded
//! channel. The slot and the session both live inside that blocking task, so
//! whichever way the task ends, both are released. A client that hangs up
//! closes the channel; the session notices before its next engine step.

use crate::engine::{EngineError, InferenceEngine};
use crate::gate::{ConcurrencyGate, ConcurrencySlot, WorkerLoadSnapshot};
use crate::session::{GenerationRequest, GenerationSession, RequestLimits, SessionState};
use crate::tokenizer::Tokenizer;
use crate::transcript::{unix_timestamp, Transcript, TracingTranscriptSink, TranscriptSink};
use chatserve_common::config::WorkerConfig;
use chatserve_common::{Result, METRICS};
use chatserve_proto::{ErrorCode, GenerateStreamParams, StreamFrame, WorkerStatus};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Frames buffered between the decode loop and the transport
const FRAME_CHANNEL_CAPACITY: usize = 2;

/// Stream of frames for one request
pub type FrameStream = ReceiverStream<StreamFrame>;

/// Who this worker is; fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    /// Address the controller and clients reach this worker at
    pub worker_address: String,
    pub model_name: String,
}

impl WorkerIdentity {
    /// Build an identity with a fresh short worker id
    pub fn generate(worker_address: impl Into<String>, model_name: impl Into<String>) -> Self {
        let mut worker_id = uuid::Uuid::new_v4().simple().to_string();
        worker_id.truncate(6);
        Self {
            worker_id,
            worker_address: worker_address.into(),
            model_name: model_name.into(),
        }
    }

    /// Status body for a given load
    pub fn status(&self, load: WorkerLoadSnapshot) -> WorkerStatus {
        WorkerStatus {
            model_names: vec![self.model_name.clone()],
            speed: load.speed,
            queue_length: load.queue_length,
        }
    }
}

/// Network-facing generation service
pub struct WorkerService {
    identity: Arc<WorkerIdentity>,
    engine: Arc<dyn InferenceEngine>,
    tokenizer: Arc<dyn Tokenizer>,
    gate: ConcurrencyGate,
    transcripts: Arc<dyn TranscriptSink>,
    stream_interval: usize,
    max_new_tokens_cap: usize,
    /// Seeds requests without their own seed when the worker is seeded
    seed_source: Option<Mutex<StdRng>>,
}

impl WorkerService {
    pub fn new(
        identity: WorkerIdentity,
        engine: Arc<dyn InferenceEngine>,
        tokenizer: Arc<dyn Tokenizer>,
        config: &WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Worker {} serving {} with {} slots (stream interval {})",
            identity.worker_id, identity.model_name, config.limit_model_concurrency, config.stream_interval
        );

        Ok(Self {
            identity: Arc::new(identity),
            engine,
            tokenizer,
            gate: ConcurrencyGate::new(config.limit_model_concurrency),
            transcripts: Arc::new(TracingTranscriptSink),
            stream_interval: config.stream_interval,
            max_new_tokens_cap: config.max_new_tokens_cap,
            seed_source: config.seed.map(|seed| Mutex::new(StdRng::seed_from_u64(seed))),
        })
    }

    /// Replace the default tracing transcript sink
    pub fn with_transcript_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.transcripts = sink;
        self
    }

    pub fn identity(&self) -> &Arc<WorkerIdentity> {
        &self.identity
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    /// Current load; never blocks
    pub fn load_snapshot(&self) -> WorkerLoadSnapshot {
        self.gate.load_snapshot()
    }

    /// Body for `/worker_get_status`
    pub fn get_status(&self) -> WorkerStatus {
        self.identity.status(self.load_snapshot())
    }

    fn limits(&self) -> RequestLimits {
        RequestLimits {
            model_name: self.identity.model_name.clone(),
            context_len: self.engine.context_len(),
            max_new_tokens_cap: self.max_new_tokens_cap,
        }
    }

    /// Validate and tokenize a request. Consumes no slot and no engine state.
    pub fn prepare(&self, params: GenerateStreamParams) -> Result<GenerationSession> {
        let prepared = GenerationRequest::from_params(params, &self.limits()).and_then(|mut request| {
            if request.seed.is_none() {
                request.seed = self.seed_source.as_ref().map(|rng| rng.lock().gen());
            }
            GenerationSession::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.tokenizer),
                request,
                self.stream_interval,
            )
        });

        if let Err(e) = &prepared {
            METRICS.generation.requests_rejected.inc();
            warn!("Rejected generation request: {}", e);
        }
        prepared
    }

    /// Admit a request and stream its frames.
    ///
    /// Suspends until a slot is free. Invalid requests fail before queueing.
    pub async fn generate_stream(self: &Arc<Self>, params: GenerateStreamParams) -> Result<FrameStream> {
        let session = self.prepare(params)?;

        let queued_at = Instant::now();
        let slot = self.gate.acquire().await?;
        METRICS.generation.queue_time.observe(queued_at.elapsed().as_secs_f64());
        METRICS.generation.requests_total.inc();

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let closed = tx.clone();
        let session = session.with_cancel_check(move || closed.is_closed());

        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || service.drive(session, slot, tx));

        Ok(ReceiverStream::new(rx))
    }

    /// Run a session to completion on the current (blocking) thread
    fn drive(&self, mut session: GenerationSession, slot: ConcurrencySlot, tx: mpsc::Sender<StreamFrame>) {
        let started_at = SystemTime::now();
        let prompt = session.request().prompt.clone();
        let mut output = String::new();
        let mut frames = 0u64;

        while let Some(partial) = session.next() {
            if partial.error_code == ErrorCode::Ok {
                output.clone_from(&partial.text);
            }
            if tx.blocking_send(partial.to_frame()).is_err() {
                debug!("Client went away at step {}", partial.step);
                session.cancel();
                break;
            }
            frames += 1;
        }

        let state = session.state();
        let generated_tokens = session.generated_tokens();
        let exhausted = session.failure().is_some_and(EngineError::is_resource_exhausted);
        drop(session);

        let held = slot.held_for();
        slot.release();

        METRICS.generation.frames_emitted_total.inc_by(frames);
        METRICS.generation.tokens_generated_total.inc_by(generated_tokens as u64);
        METRICS.generation.request_duration.observe(held.as_secs_f64());
        METRICS.worker.live_engine_caches.set(self.engine.live_caches() as i64);
        match state {
            SessionState::Failed => {
                METRICS.generation.requests_failed.inc();
                if exhausted {
                    METRICS.generation.resource_exhausted.inc();
                }
            }
            SessionState::Cancelled => METRICS.generation.requests_cancelled.inc(),
            _ => METRICS.generation.requests_success.inc(),
        }

        debug!(
            "Request finished: {} tokens, {} frames, {:?} ({})",
            generated_tokens,
            frames,
            held,
            state.as_str()
        );

        self.transcripts.record(Transcript {
            worker_id: self.identity.worker_id.clone(),
            model: self.identity.model_name.clone(),
            prompt,
            output,
            outcome: state.as_str().to_string(),
            generated_tokens,
            started_at: unix_timestamp(started_at),
            finished_at: unix_timestamp(SystemTime::now()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::tokenizer::ByteTokenizer;
    use crate::transcript::MemoryTranscriptSink;
    use tokio_stream::StreamExt;

    fn service(engine: Arc<dyn InferenceEngine>, sink: Arc<MemoryTranscriptSink>) -> Arc<WorkerService> {
        let config = WorkerConfig {
            limit_model_concurrency: 2,
            stream_interval: 1,
            ..WorkerConfig::default()
        };
        let identity = WorkerIdentity::generate("http://127.0.0.1:21002", "opt-1.3b");
        Arc::new(
            WorkerService::new(identity, engine, Arc::new(ByteTokenizer), &config)
                .unwrap()
                .with_transcript_sink(sink),
        )
    }

    fn params(prompt: &str, max_new_tokens: i64) -> GenerateStreamParams {
        GenerateStreamParams {
            temperature: 0.0,
            max_new_tokens,
            ..GenerateStreamParams::new(prompt)
        }
    }

    #[test]
    fn test_identity_short_id() {
        let identity = WorkerIdentity::generate("http://w:1", "m");
        assert_eq!(identity.worker_id.len(), 6);
        assert_ne!(identity.worker_id, WorkerIdentity::generate("http://w:1", "m").worker_id);
    }

    #[tokio::test]
    async fn test_stream_and_transcript() {
        let sink = Arc::new(MemoryTranscriptSink::new());
        let svc = service(Arc::new(ScriptedEngine::from_text("abc")), sink.clone());

        let frames: Vec<_> = svc.generate_stream(params("Q:", 3)).await.unwrap().collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].text, "Q:abc");
        assert!(frames.iter().all(|f| f.error_code == 0));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output, "Q:abc");
        assert_eq!(records[0].outcome, "stopped_max_len");
        assert_eq!(records[0].generated_tokens, 3);
        assert!(records[0].finished_at >= records[0].started_at);
        assert_eq!(svc.gate().queue_length(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_takes_no_slot() {
        let sink = Arc::new(MemoryTranscriptSink::new());
        let svc = service(Arc::new(ScriptedEngine::from_text("abc")), sink.clone());

        assert!(svc.generate_stream(params("x", 0)).await.is_err());
        assert_eq!(svc.gate().acquired_total(), 0);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_status_reflects_model() {
        let svc = service(Arc::new(ScriptedEngine::from_text("")), Arc::new(MemoryTranscriptSink::new()));
        let status = svc.get_status();
        assert_eq!(status.model_names, vec!["opt-1.3b".to_string()]);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.speed, 1.0);
    }
}
