//! Hand-off point for finished conversations
//!
//! The worker does not persist transcripts itself. Every request that got a
//! slot produces exactly one [`Transcript`], passed to a [`TranscriptSink`].

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Record of one served request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub worker_id: String,
    pub model: String,
    pub prompt: String,
    /// Text of the last successful frame, prompt included
    pub output: String,
    /// Final session state, e.g. `stopped_eos` or `cancelled`
    pub outcome: String,
    pub generated_tokens: usize,
    /// Unix timestamps in seconds
    pub started_at: f64,
    pub finished_at: f64,
}

/// Seconds since the Unix epoch
pub fn unix_timestamp(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Receives one transcript per request
pub trait TranscriptSink: Send + Sync {
    fn record(&self, transcript: Transcript);
}

/// Emits transcripts as structured log events on the `transcript` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTranscriptSink;

impl TranscriptSink for TracingTranscriptSink {
    fn record(&self, transcript: Transcript) {
        info!(
            target: "transcript",
            worker_id = %transcript.worker_id,
            model = %transcript.model,
            outcome = %transcript.outcome,
            generated_tokens = transcript.generated_tokens,
            started_at = transcript.started_at,
            finished_at = transcript.finished_at,
            prompt = %transcript.prompt,
            output = %transcript.output,
            "request finished"
        );
    }
}

/// Keeps every transcript in memory; used to inspect what a worker served
#[derive(Debug, Default)]
pub struct MemoryTranscriptSink {
    records: parking_lot::Mutex<Vec<Transcript>>,
}

impl MemoryTranscriptSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Transcript> {
        self.records.lock().clone()
    }
}

impl TranscriptSink for MemoryTranscriptSink {
    fn record(&self, transcript: Transcript) {
        self.records.lock().push(transcript);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unix_timestamp() {
        let t = UNIX_EPOCH + Duration::from_millis(1500);
        assert_eq!(unix_timestamp(t), 1.5);
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryTranscriptSink::new();
        for i in 0..3 {
            sink.record(Transcript {
                worker_id: "abc123".to_string(),
                model: "opt-1.3b".to_string(),
                prompt: format!("prompt {}", i),
                output: String::new(),
                outcome: "stopped_eos".to_string(),
                generated_tokens: i,
                started_at: 0.0,
                finished_at: 1.0,
            });
        }
        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].prompt, "prompt 2");
    }

    #[test]
    fn test_serializes_flat() {
        let transcript = Transcript {
            worker_id: "abc123".to_string(),
            model: "opt-1.3b".to_string(),
            prompt: "Hi".to_string(),
            output: "Hi there".to_string(),
            outcome: "stopped_eos".to_string(),
            generated_tokens: 6,
            started_at: 10.0,
            finished_at: 10.5,
        };
        let value = serde_json::to_value(&transcript).unwrap();
        assert_eq!(value["output"], "Hi there");
        assert_eq!(value["generated_tokens"], 6);
        assert_eq!(value["finished_at"], 10.5);
    }
}
