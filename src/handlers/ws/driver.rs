//! Transport-agnostic session loop.
//!
//! [`SessionDriver`] consumes inbound frames from a channel and emits
//! [`OutgoingMessage`]s to another, so the same loop runs under the axum
//! WebSocket handler and under integration tests without a socket.
//!
//! One driver instance drives exactly one conversation: handshake, greeting,
//! VAD framing, utterance segmentation, the pipeline turn, streamed playback
//! with barge-in, and cleanup.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::pipeline::{Orchestrator, StageError, VoiceTurn};
use crate::core::segmenter::{SegmenterConfig, SegmenterEvent, UtteranceSegmenter};
use crate::core::session::{Session, SessionStore, TurnState};
use crate::core::vad::VadDetector;

use super::messages::{IncomingMessage, OutgoingMessage};

/// One frame from the client, already stripped of transport framing.
#[derive(Debug)]
pub enum InboundFrame {
    /// Raw PCM16 audio.
    Audio(Bytes),
    /// JSON text payload.
    Text(String),
}

type PipelineHandle = JoinHandle<(Session, Result<VoiceTurn, StageError>)>;

pub struct SessionDriver {
    orchestrator: Orchestrator,
    sessions: SessionStore,
    vad: VadDetector,
    segmenter: UtteranceSegmenter,
}

impl SessionDriver {
    pub fn new(
        orchestrator: Orchestrator,
        sessions: SessionStore,
        vad: VadDetector,
        segmenter_config: SegmenterConfig,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            vad,
            segmenter: UtteranceSegmenter::new(segmenter_config),
        }
    }

    /// Runs the session to completion. Returns when the inbound channel
    /// closes, the outbound side is gone, or the handshake fails. Cleanup
    /// (cancelling synthesis, deleting the session) always happens.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundFrame>,
        outbound: mpsc::Sender<OutgoingMessage>,
    ) {
        let mut session = match self.handshake(&mut inbound, &outbound).await {
            Some(session) => session,
            None => return,
        };
        let session_id = session.id.clone();
        info!(session_id = %session_id, character = %session.character.name, "session started");

        // In-flight pipeline turn, playback stream and its cancel token.
        // A token is created per synthesis invocation and never reused.
        let mut pending: Option<PipelineHandle> = None;
        let mut playback: Option<mpsc::Receiver<Bytes>> = None;
        let mut cancel: Option<CancellationToken> = None;

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        debug!(session_id = %session_id, "inbound channel closed");
                        break;
                    };
                    let proceed = self
                        .handle_frame(
                            frame,
                            &mut session,
                            &outbound,
                            &mut pending,
                            &mut playback,
                            &mut cancel,
                        )
                        .await;
                    if !proceed {
                        break;
                    }
                }

                joined = async { pending.as_mut().unwrap().await }, if pending.is_some() => {
                    pending = None;
                    match joined {
                        Ok((updated, result)) => {
                            session = updated;
                            if !Self::handle_turn_result(
                                result,
                                &mut session,
                                &self.sessions,
                                &outbound,
                                &mut playback,
                                &mut cancel,
                            )
                            .await
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, "pipeline task failed: {e}");
                            session.turn_state = TurnState::Idle;
                            cancel = None;
                            if outbound
                                .send(OutgoingMessage::Error {
                                    message: "Something went wrong processing that. Please try again.".into(),
                                    detail: None,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }

                chunk = async { playback.as_mut().unwrap().recv().await }, if playback.is_some() => {
                    match chunk {
                        Some(audio) => {
                            let msg = OutgoingMessage::TtsChunk {
                                audio: BASE64.encode(&audio),
                            };
                            if outbound.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            playback = None;
                            cancel = None;
                            session.turn_state = TurnState::Idle;
                            if outbound.send(OutgoingMessage::TtsEnd).await.is_err() {
                                break;
                            }
                            if let Err(e) = self.sessions.save(&session).await {
                                warn!(session_id = %session_id, "failed to save session: {e}");
                            }
                        }
                    }
                }
            }
        }

        if let Some(token) = cancel {
            token.cancel();
        }
        if let Some(handle) = pending {
            handle.abort();
        }
        if let Err(e) = self.sessions.delete(&session_id).await {
            warn!(session_id = %session_id, "failed to delete session: {e}");
        }
        info!(session_id = %session_id, "session ended");
    }

    /// First message must be `init`. Anything else is fatal to the
    /// connection.
    async fn handshake(
        &self,
        inbound: &mut mpsc::Receiver<InboundFrame>,
        outbound: &mpsc::Sender<OutgoingMessage>,
    ) -> Option<Session> {
        let character = match inbound.recv().await? {
            InboundFrame::Text(text) => match serde_json::from_str::<IncomingMessage>(&text) {
                Ok(IncomingMessage::Init { character_details }) => character_details,
                Ok(_) | Err(_) => {
                    warn!("handshake failed: first message was not init");
                    let _ = outbound
                        .send(OutgoingMessage::Error {
                            message: "Expected an init message to start the session.".into(),
                            detail: None,
                        })
                        .await;
                    return None;
                }
            },
            InboundFrame::Audio(_) => {
                warn!("handshake failed: audio before init");
                let _ = outbound
                    .send(OutgoingMessage::Error {
                        message: "Expected an init message to start the session.".into(),
                        detail: None,
                    })
                    .await;
                return None;
            }
        };

        let session = Session::new(character);
        if let Err(e) = self.sessions.save(&session).await {
            warn!("failed to save new session: {e}");
            let _ = outbound
                .send(OutgoingMessage::Error {
                    message: "Could not start the session. Please reconnect.".into(),
                    detail: None,
                })
                .await;
            return None;
        }

        let greeting = session.greeting();
        if outbound
            .send(OutgoingMessage::Greeting { text: greeting })
            .await
            .is_err()
        {
            return None;
        }
        Some(session)
    }

    /// Returns false when the session should end.
    #[allow(clippy::too_many_arguments)]
    async fn handle_frame(
        &mut self,
        frame: InboundFrame,
        session: &mut Session,
        outbound: &mpsc::Sender<OutgoingMessage>,
        pending: &mut Option<PipelineHandle>,
        playback: &mut Option<mpsc::Receiver<Bytes>>,
        cancel: &mut Option<CancellationToken>,
    ) -> bool {
        match frame {
            InboundFrame::Audio(audio) => {
                let speech = match self.vad.classify(&audio) {
                    Ok(speech) => speech,
                    Err(e) => {
                        // Malformed frame: dropped, session continues.
                        warn!(session_id = %session.id, "dropping audio frame: {e}");
                        return true;
                    }
                };

                if speech && playback.is_some() {
                    // Barge-in: kill playback before the frame enters the
                    // segmenter so it seeds the next utterance.
                    info!(session_id = %session.id, "barge-in detected");
                    *playback = None;
                    if let Some(token) = cancel.take() {
                        token.cancel();
                    }
                    session.turn_state = TurnState::UserSpeaking;
                    if outbound.send(OutgoingMessage::BargeIn).await.is_err() {
                        return false;
                    }
                }

                match self.segmenter.push_frame(&audio, speech) {
                    Some(SegmenterEvent::SpeakingStarted) => {
                        session.turn_state = TurnState::UserSpeaking;
                        outbound
                            .send(OutgoingMessage::VadState { speaking: true })
                            .await
                            .is_ok()
                    }
                    Some(SegmenterEvent::SpeakingEnded { audio: utterance }) => {
                        if outbound
                            .send(OutgoingMessage::VadState { speaking: false })
                            .await
                            .is_err()
                        {
                            return false;
                        }
                        if pending.is_some() || playback.is_some() {
                            // One turn at a time; later utterances are
                            // dropped, not queued behind a stale reply.
                            debug!(
                                session_id = %session.id,
                                bytes = utterance.len(),
                                "dropping utterance, turn already in flight"
                            );
                            return true;
                        }
                        session.turn_state = TurnState::AwaitingPipeline;
                        let token = CancellationToken::new();
                        *cancel = Some(token.clone());
                        *pending = Some(self.spawn_turn(session.clone(), utterance, token));
                        true
                    }
                    None => true,
                }
            }
            InboundFrame::Text(text) => match serde_json::from_str::<IncomingMessage>(&text) {
                Ok(IncomingMessage::Ping) => {
                    outbound.send(OutgoingMessage::Pong).await.is_ok()
                }
                Ok(IncomingMessage::Init { .. }) => outbound
                    .send(OutgoingMessage::Error {
                        message: "Session is already initialized.".into(),
                        detail: None,
                    })
                    .await
                    .is_ok(),
                Err(e) => outbound
                    .send(OutgoingMessage::Error {
                        message: "Unrecognized message.".into(),
                        detail: Some(e.to_string()),
                    })
                    .await
                    .is_ok(),
            },
        }
    }

    fn spawn_turn(
        &self,
        mut session: Session,
        utterance: Bytes,
        cancel: CancellationToken,
    ) -> PipelineHandle {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let result = orchestrator.run_voice(&mut session, utterance, cancel).await;
            (session, result)
        })
    }

    /// Applies a completed pipeline turn. Returns false when the outbound
    /// side is gone.
    async fn handle_turn_result(
        result: Result<VoiceTurn, StageError>,
        session: &mut Session,
        sessions: &SessionStore,
        outbound: &mpsc::Sender<OutgoingMessage>,
        playback: &mut Option<mpsc::Receiver<Bytes>>,
        cancel: &mut Option<CancellationToken>,
    ) -> bool {
        match result {
            Ok(turn) => {
                session.push_turn_pair(&turn.transcript, &turn.reply);
                session.turn_state = TurnState::AssistantSpeaking;
                if let Err(e) = sessions.save(session).await {
                    warn!(session_id = %session.id, "failed to save session: {e}");
                }
                if outbound
                    .send(OutgoingMessage::TranscriptFinal {
                        text: turn.transcript,
                    })
                    .await
                    .is_err()
                {
                    return false;
                }
                if outbound
                    .send(OutgoingMessage::AssistantFinal { text: turn.reply })
                    .await
                    .is_err()
                {
                    return false;
                }
                *playback = Some(turn.audio);
                true
            }
            Err(err) => {
                warn!(session_id = %session.id, stage = %err.stage, "turn failed: {err}");
                session.turn_state = TurnState::Idle;
                *cancel = None;
                if let Err(e) = sessions.save(session).await {
                    warn!(session_id = %session.id, "failed to save session: {e}");
                }
                outbound
                    .send(OutgoingMessage::Error {
                        message: err.user_message().to_string(),
                        detail: Some(err.to_string()),
                    })
                    .await
                    .is_ok()
            }
        }
    }
}
