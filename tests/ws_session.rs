//! End-to-end session scenarios driven through the session driver with a
//! scripted downstream transport, no sockets involved.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use voxflow::core::pipeline::{Orchestrator, PipelineConfig};
use voxflow::core::resilience::breaker::{BreakerConfig, BreakerRegistry};
use voxflow::core::resilience::client::{ResilientClient, RetryPolicy};
use voxflow::core::resilience::transport::{ServiceName, ServiceTransport, TransportFailure};
use voxflow::core::segmenter::SegmenterConfig;
use voxflow::core::session::SessionStore;
use voxflow::core::vad::{VadConfig, VadDetector};
use voxflow::handlers::ws::{InboundFrame, OutgoingMessage, SessionDriver};

const FRAME_BYTES: usize = 1024;
const SILENCE_FRAMES_TO_CLOSE: u32 = 3;

/// Scripted downstream services: fixed JSON replies, optional hard
/// failures, per-service attempt counters, configurable stream length.
struct ScriptedTransport {
    replies: Mutex<HashMap<ServiceName, Value>>,
    failing: Mutex<HashSet<ServiceName>>,
    attempts: Mutex<HashMap<ServiceName, usize>>,
    stream_chunks: usize,
}

impl ScriptedTransport {
    fn happy(stream_chunks: usize) -> Arc<Self> {
        let transport = Self {
            replies: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
            stream_chunks,
        };
        transport.replies.lock().extend([
            (
                ServiceName::Stt,
                serde_json::json!({"transcript": "how are you"}),
            ),
            (
                ServiceName::ContextLlm,
                serde_json::json!({"context": "You are Nova."}),
            ),
            (
                ServiceName::ResponseLlm,
                serde_json::json!({"response": "Doing great, thanks!"}),
            ),
        ]);
        Arc::new(transport)
    }

    fn fail(&self, service: ServiceName) {
        self.failing.lock().insert(service);
    }

    fn attempts(&self, service: ServiceName) -> usize {
        self.attempts.lock().get(&service).copied().unwrap_or(0)
    }

    fn bump(&self, service: ServiceName) {
        *self.attempts.lock().entry(service).or_insert(0) += 1;
    }
}

#[async_trait]
impl ServiceTransport for ScriptedTransport {
    async fn request(
        &self,
        service: ServiceName,
        _payload: Value,
    ) -> Result<Value, TransportFailure> {
        self.bump(service);
        if self.failing.lock().contains(&service) {
            return Err(TransportFailure::Network("connection refused".into()));
        }
        self.replies
            .lock()
            .get(&service)
            .cloned()
            .ok_or_else(|| TransportFailure::Network("unexpected service call".into()))
    }

    async fn request_streaming(
        &self,
        service: ServiceName,
        _payload: Value,
    ) -> Result<mpsc::Receiver<Bytes>, TransportFailure> {
        self.bump(service);
        if self.failing.lock().contains(&service) {
            return Err(TransportFailure::Network("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        let chunks = self.stream_chunks;
        tokio::spawn(async move {
            for _ in 0..chunks {
                if tx.send(Bytes::from_static(b"pcm-chunk")).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Ok(rx)
    }

    async fn probe(&self, service: ServiceName) -> Result<(), TransportFailure> {
        if self.failing.lock().contains(&service) {
            Err(TransportFailure::Timeout)
        } else {
            Ok(())
        }
    }
}

struct Harness {
    inbound: mpsc::Sender<InboundFrame>,
    outbound: mpsc::Receiver<OutgoingMessage>,
    driver_task: tokio::task::JoinHandle<()>,
}

fn start_session(transport: Arc<ScriptedTransport>, breaker_threshold: u32) -> Harness {
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: breaker_threshold,
        cooldown: Duration::from_secs(30),
    }));
    let retry = RetryPolicy {
        max_retries: 2,
        backoff_base: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    let client = ResilientClient::new(transport, breakers, retry);
    let orchestrator = Orchestrator::new(client, PipelineConfig::default());
    let sessions = SessionStore::in_memory(64, Duration::from_secs(60));
    let vad = VadDetector::new(VadConfig::default());
    let segmenter = SegmenterConfig::default().with_max_silence_frames(SILENCE_FRAMES_TO_CLOSE);

    let driver = SessionDriver::new(orchestrator, sessions, vad, segmenter);
    let (in_tx, in_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    let driver_task = tokio::spawn(driver.run(in_rx, out_tx));

    Harness {
        inbound: in_tx,
        outbound: out_rx,
        driver_task,
    }
}

fn speech_frame() -> Bytes {
    let mut frame = Vec::with_capacity(FRAME_BYTES);
    for _ in 0..FRAME_BYTES / 2 {
        frame.extend_from_slice(&8_000i16.to_le_bytes());
    }
    Bytes::from(frame)
}

fn silence_frame() -> Bytes {
    Bytes::from(vec![0u8; FRAME_BYTES])
}

async fn recv(outbound: &mut mpsc::Receiver<OutgoingMessage>) -> OutgoingMessage {
    timeout(Duration::from_secs(5), outbound.recv())
        .await
        .expect("timed out waiting for message")
        .expect("outbound channel closed")
}

async fn send_init(harness: &Harness) {
    harness
        .inbound
        .send(InboundFrame::Text(
            r#"{"type":"init","character_details":{"name":"Nova","personality":"friendly"}}"#
                .to_string(),
        ))
        .await
        .unwrap();
}

async fn send_utterance(harness: &Harness, speech_frames: usize) {
    for _ in 0..speech_frames {
        harness
            .inbound
            .send(InboundFrame::Audio(speech_frame()))
            .await
            .unwrap();
    }
    for _ in 0..SILENCE_FRAMES_TO_CLOSE {
        harness
            .inbound
            .send(InboundFrame::Audio(silence_frame()))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn full_turn_event_ordering() {
    let transport = ScriptedTransport::happy(2);
    let mut harness = start_session(transport, 3);

    send_init(&harness).await;
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::Greeting {
            text: "Hello, I am Nova! How can I help you today?".to_string()
        }
    );

    send_utterance(&harness, 3).await;
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::VadState { speaking: true }
    );
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::VadState { speaking: false }
    );
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::TranscriptFinal {
            text: "how are you".to_string()
        }
    );
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::AssistantFinal {
            text: "Doing great, thanks!".to_string()
        }
    );

    let mut chunks = 0;
    loop {
        match recv(&mut harness.outbound).await {
            OutgoingMessage::TtsChunk { audio } => {
                assert!(!audio.is_empty());
                chunks += 1;
            }
            OutgoingMessage::TtsEnd => break,
            other => panic!("unexpected message during playback: {other:?}"),
        }
    }
    assert_eq!(chunks, 2);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let transport = ScriptedTransport::happy(1);
    let mut harness = start_session(transport, 3);

    send_init(&harness).await;
    recv(&mut harness.outbound).await; // greeting

    harness
        .inbound
        .send(InboundFrame::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(recv(&mut harness.outbound).await, OutgoingMessage::Pong);
}

#[tokio::test]
async fn handshake_requires_init_first() {
    let transport = ScriptedTransport::happy(1);
    let mut harness = start_session(transport, 3);

    harness
        .inbound
        .send(InboundFrame::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();

    match recv(&mut harness.outbound).await {
        OutgoingMessage::Error { message, .. } => {
            assert!(message.contains("init"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    // Driver exits after a failed handshake.
    timeout(Duration::from_secs(5), harness.driver_task)
        .await
        .expect("driver did not exit")
        .unwrap();
}

#[tokio::test]
async fn stage_failure_keeps_session_usable() {
    let transport = ScriptedTransport::happy(2);
    transport.fail(ServiceName::Stt);
    let mut harness = start_session(transport.clone(), 10);

    send_init(&harness).await;
    recv(&mut harness.outbound).await; // greeting

    send_utterance(&harness, 2).await;
    recv(&mut harness.outbound).await; // vad true
    recv(&mut harness.outbound).await; // vad false

    match recv(&mut harness.outbound).await {
        OutgoingMessage::Error { message, detail } => {
            assert!(message.contains("hear"));
            assert!(detail.unwrap().contains("stt"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    // Full retry budget was spent without tripping the breaker.
    assert_eq!(transport.attempts(ServiceName::Stt), 2);

    // The session still answers pings after a failed turn.
    harness
        .inbound
        .send(InboundFrame::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(recv(&mut harness.outbound).await, OutgoingMessage::Pong);
}

#[tokio::test]
async fn open_breaker_blocks_turns_without_network_attempts() {
    let transport = ScriptedTransport::happy(2);
    transport.fail(ServiceName::Stt);
    // Threshold 2 with a 2-attempt budget: the first turn trips the breaker.
    let mut harness = start_session(transport.clone(), 2);

    send_init(&harness).await;
    recv(&mut harness.outbound).await; // greeting

    send_utterance(&harness, 2).await;
    recv(&mut harness.outbound).await; // vad true
    recv(&mut harness.outbound).await; // vad false
    match recv(&mut harness.outbound).await {
        OutgoingMessage::Error { detail, .. } => {
            assert!(detail.unwrap().contains("circuit opened"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    let attempts_after_trip = transport.attempts(ServiceName::Stt);
    assert_eq!(attempts_after_trip, 2);

    // Next utterance fast-fails with the breaker open and no new attempts.
    send_utterance(&harness, 2).await;
    recv(&mut harness.outbound).await; // vad true
    recv(&mut harness.outbound).await; // vad false
    match recv(&mut harness.outbound).await {
        OutgoingMessage::Error { detail, .. } => {
            assert!(detail.unwrap().contains("circuit open"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(transport.attempts(ServiceName::Stt), attempts_after_trip);
}

#[tokio::test]
async fn barge_in_cancels_playback_and_starts_next_utterance() {
    // Long synthesis stream so playback is still running when the user
    // interrupts.
    let transport = ScriptedTransport::happy(1_000);
    let mut harness = start_session(transport, 3);

    send_init(&harness).await;
    recv(&mut harness.outbound).await; // greeting

    send_utterance(&harness, 3).await;
    recv(&mut harness.outbound).await; // vad true
    recv(&mut harness.outbound).await; // vad false
    recv(&mut harness.outbound).await; // transcript_final
    recv(&mut harness.outbound).await; // assistant_final

    // Wait for playback to actually start.
    match recv(&mut harness.outbound).await {
        OutgoingMessage::TtsChunk { .. } => {}
        other => panic!("expected tts_chunk, got {other:?}"),
    }

    // Speak over the assistant.
    harness
        .inbound
        .send(InboundFrame::Audio(speech_frame()))
        .await
        .unwrap();

    // Chunks already in flight may arrive first, but barge_in must come
    // before any tts_end.
    let mut saw_barge_in = false;
    while !saw_barge_in {
        match recv(&mut harness.outbound).await {
            OutgoingMessage::TtsChunk { .. } => {}
            OutgoingMessage::BargeIn => saw_barge_in = true,
            OutgoingMessage::TtsEnd => panic!("playback finished despite barge-in"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    // The interrupting frame seeds the next utterance.
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::VadState { speaking: true }
    );

    // Finish the interrupted utterance and get a full second turn.
    send_utterance(&harness, 0).await;
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::VadState { speaking: false }
    );
    assert_eq!(
        recv(&mut harness.outbound).await,
        OutgoingMessage::TranscriptFinal {
            text: "how are you".to_string()
        }
    );
}

#[tokio::test]
async fn closing_inbound_shuts_the_driver_down() {
    let transport = ScriptedTransport::happy(1);
    let harness = start_session(transport, 3);

    send_init(&harness).await;

    let Harness {
        inbound,
        mut outbound,
        driver_task,
    } = harness;
    recv(&mut outbound).await; // greeting

    drop(inbound);
    timeout(Duration::from_secs(5), driver_task)
        .await
        .expect("driver did not exit")
        .unwrap();
}
