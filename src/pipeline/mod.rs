//! Audio/insight pipeline trigger.
//!
//! Accumulates short audio segments per actively-speaking participant and, on
//! a size or age threshold, ships the buffer to the external inference
//! collaborator. The HTTP call runs on a detached task so a slow or hung
//! service can never stall the room's command loop; its result re-enters the
//! room as a command and is discarded if the room is already gone. Failures
//! are swallowed — no event, no error to the room.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::UserId;
use crate::registry::room::RoomCommand;

/// Pipeline tuning knobs, derived from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Inference endpoint; `None` disables the pipeline.
    pub inference_url: Option<String>,
    pub timeout: Duration,
    /// Flush a speaker's buffer at this many bytes...
    pub flush_bytes: usize,
    /// ...or when its oldest byte reaches this age.
    pub flush_after: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            inference_url: config.inference_url.clone(),
            timeout: Duration::from_secs(config.inference_timeout_secs),
            flush_bytes: config.pipeline_flush_bytes,
            flush_after: Duration::from_secs(config.pipeline_flush_secs),
        }
    }
}

/// A buffered chunk of one speaker's audio, ready for inference.
#[derive(Debug)]
pub struct Segment {
    pub speaker_id: UserId,
    pub speaker_name: String,
    pub format: String,
    pub data: Vec<u8>,
}

struct SpeakerBuffer {
    speaker_name: String,
    format: String,
    data: Vec<u8>,
    first_byte_at: Instant,
}

/// Per-room audio accumulator. Owned by the room actor; only `dispatch`
/// leaves the actor's critical path.
pub struct AudioPipeline {
    settings: PipelineSettings,
    http: reqwest::Client,
    buffers: HashMap<UserId, SpeakerBuffer>,
}

impl AudioPipeline {
    pub fn new(settings: PipelineSettings, http: reqwest::Client) -> Self {
        Self {
            settings,
            http,
            buffers: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.inference_url.is_some()
    }

    /// Append audio for `speaker`. Returns a segment when a threshold tripped.
    pub fn push(
        &mut self,
        speaker_id: &UserId,
        speaker_name: &str,
        data: &[u8],
        format: &str,
    ) -> Option<Segment> {
        if !self.enabled() || data.is_empty() {
            return None;
        }

        let buffer = self
            .buffers
            .entry(speaker_id.clone())
            .or_insert_with(|| SpeakerBuffer {
                speaker_name: speaker_name.to_string(),
                format: format.to_string(),
                data: Vec::new(),
                first_byte_at: Instant::now(),
            });

        // A format switch mid-buffer would corrupt the segment; start over.
        if buffer.format != format {
            buffer.format = format.to_string();
            buffer.data.clear();
            buffer.first_byte_at = Instant::now();
        }

        buffer.data.extend_from_slice(data);

        if buffer.data.len() >= self.settings.flush_bytes {
            return self.take(speaker_id);
        }
        None
    }

    /// Collect segments whose oldest byte exceeded the age threshold.
    /// Driven by the room actor's periodic tick.
    pub fn flush_stale(&mut self) -> Vec<Segment> {
        let stale: Vec<UserId> = self
            .buffers
            .iter()
            .filter(|(_, b)| !b.data.is_empty() && b.first_byte_at.elapsed() >= self.settings.flush_after)
            .map(|(id, _)| id.clone())
            .collect();

        stale.iter().filter_map(|id| self.take(id)).collect()
    }

    /// Drop a departing speaker's pending audio.
    pub fn clear(&mut self, speaker_id: &UserId) {
        self.buffers.remove(speaker_id);
    }

    /// Drop everything, e.g. when transcription is switched off mid-meeting.
    pub fn clear_all(&mut self) {
        self.buffers.clear();
    }

    fn take(&mut self, speaker_id: &UserId) -> Option<Segment> {
        let buffer = self.buffers.remove(speaker_id)?;
        if buffer.data.is_empty() {
            return None;
        }
        Some(Segment {
            speaker_id: speaker_id.clone(),
            speaker_name: buffer.speaker_name,
            format: buffer.format,
            data: buffer.data,
        })
    }

    /// Hand a segment to the inference collaborator off the room's critical
    /// path. The spawned task feeds results back through `feedback`; if the
    /// room is gone by then, the result is dropped with it.
    pub fn dispatch(&self, segment: Segment, feedback: mpsc::UnboundedSender<RoomCommand>) {
        let Some(url) = self.settings.inference_url.clone() else {
            return;
        };
        let http = self.http.clone();
        let timeout = self.settings.timeout;

        tokio::spawn(async move {
            match run_inference(&http, &url, timeout, &segment).await {
                Ok(response) => {
                    let sent = feedback.send(RoomCommand::Transcribed {
                        speaker_id: segment.speaker_id,
                        speaker_name: segment.speaker_name,
                        text: response.text,
                        confidence: response.confidence,
                        insights: response.insights,
                    });
                    if sent.is_err() {
                        tracing::debug!("discarding late inference result, room is gone");
                    }
                }
                Err(e) => {
                    // Swallowed per contract: no event, nothing surfaces to the room.
                    let e = crate::error::SessionError::ExternalService(format!("{:#}", e));
                    tracing::warn!("{}", e);
                }
            }
        });
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    speaker_id: &'a str,
    speaker_name: &'a str,
    format: &'a str,
    audio_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub insights: Vec<InsightResult>,
}

/// Sentiment/topic/etc. side-channel result from the same inference call.
#[derive(Debug, Clone, Deserialize)]
pub struct InsightResult {
    #[serde(rename = "type")]
    pub insight_type: String,
    pub data: Value,
}

async fn run_inference(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
    segment: &Segment,
) -> anyhow::Result<InferenceResponse> {
    use anyhow::Context;

    let request = InferenceRequest {
        speaker_id: &segment.speaker_id,
        speaker_name: &segment.speaker_name,
        format: &segment.format,
        audio_b64: BASE64.encode(&segment.data),
    };

    let response = http
        .post(url)
        .timeout(timeout)
        .json(&request)
        .send()
        .await
        .context("inference request failed")?
        .error_for_status()
        .context("inference service returned an error status")?;

    response
        .json::<InferenceResponse>()
        .await
        .context("malformed inference response")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(flush_bytes: usize, flush_after: Duration) -> PipelineSettings {
        PipelineSettings {
            inference_url: Some("http://127.0.0.1:1/infer".into()),
            timeout: Duration::from_secs(1),
            flush_bytes,
            flush_after,
        }
    }

    fn pipeline(flush_bytes: usize) -> AudioPipeline {
        AudioPipeline::new(
            settings(flush_bytes, Duration::from_secs(60)),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_below_threshold_accumulates() {
        let mut p = pipeline(16);
        let alice = "alice".to_string();
        assert!(p.push(&alice, "Alice", b"1234", "pcm16").is_none());
        assert!(p.push(&alice, "Alice", b"5678", "pcm16").is_none());
    }

    #[test]
    fn test_size_threshold_flushes_whole_buffer() {
        let mut p = pipeline(8);
        let alice = "alice".to_string();
        assert!(p.push(&alice, "Alice", b"1234", "pcm16").is_none());
        let segment = p.push(&alice, "Alice", b"5678", "pcm16").unwrap();
        assert_eq!(segment.data, b"12345678");
        assert_eq!(segment.speaker_id, "alice");
        // Buffer restarts from empty.
        assert!(p.push(&alice, "Alice", b"ab", "pcm16").is_none());
    }

    #[test]
    fn test_buffers_are_per_speaker() {
        let mut p = pipeline(8);
        let alice = "alice".to_string();
        let bob = "bob".to_string();
        assert!(p.push(&alice, "Alice", b"123456", "pcm16").is_none());
        assert!(p.push(&bob, "Bob", b"123456", "pcm16").is_none());
        let segment = p.push(&alice, "Alice", b"78", "pcm16").unwrap();
        assert_eq!(segment.speaker_id, "alice");
    }

    #[test]
    fn test_disabled_pipeline_ignores_audio() {
        let mut p = AudioPipeline::new(
            PipelineSettings {
                inference_url: None,
                timeout: Duration::from_secs(1),
                flush_bytes: 1,
                flush_after: Duration::from_secs(1),
            },
            reqwest::Client::new(),
        );
        assert!(p.push(&"alice".to_string(), "Alice", b"xxxx", "pcm16").is_none());
    }

    #[test]
    fn test_age_threshold_flushes() {
        let mut p = AudioPipeline::new(
            settings(1024, Duration::from_millis(0)),
            reqwest::Client::new(),
        );
        let alice = "alice".to_string();
        assert!(p.push(&alice, "Alice", b"abc", "pcm16").is_none());
        let segments = p.flush_stale();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data, b"abc");
        assert!(p.flush_stale().is_empty());
    }

    #[test]
    fn test_clear_cancels_pending_audio() {
        let mut p = AudioPipeline::new(
            settings(1024, Duration::from_millis(0)),
            reqwest::Client::new(),
        );
        let alice = "alice".to_string();
        assert!(p.push(&alice, "Alice", b"abc", "pcm16").is_none());
        p.clear(&alice);
        assert!(p.flush_stale().is_empty());
    }

    #[test]
    fn test_format_switch_restarts_buffer() {
        let mut p = pipeline(6);
        let alice = "alice".to_string();
        assert!(p.push(&alice, "Alice", b"1234", "pcm16").is_none());
        let segment = p.push(&alice, "Alice", b"123456", "opus").unwrap();
        assert_eq!(segment.format, "opus");
        assert_eq!(segment.data, b"123456");
    }
}
