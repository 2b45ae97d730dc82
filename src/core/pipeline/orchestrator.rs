//! Stage composition for chat and voice turns.
//!
//! The orchestrator owns stage ordering and the failure policy: the first
//! failing stage aborts the turn, later stages never run on a bad earlier
//! result. It mutates the in-memory [`Session`] (persona context cache);
//! persisting the session afterwards is the caller's job.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::resilience::{CallOutcome, ResilientClient, ServiceName, StreamOutcome};
use crate::core::session::{PersonaContext, Session};

use super::types::{
    ChatTurn, ContextRequest, ContextResponse, FilteredCharacter, HistoryEntry, ResponseRequest,
    ResponseResponse, Stage, StageCause, StageError, SttRequest, SttResponse, TtsRequest,
    TtsResponse, VoiceRestTurn, VoiceTurn,
};

/// Pipeline behavior knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Reuse the persona context for the life of the session.
    pub cache_persona_context: bool,
    /// Trailing history turns sent to the response stage.
    pub history_window: usize,
    /// Model for short queries.
    pub light_model: String,
    /// Model for everything else.
    pub heavy_model: String,
    /// Queries shorter than this many characters use the light model.
    pub model_cutoff: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_persona_context: true,
            history_window: 5,
            light_model: "O4-mini".to_string(),
            heavy_model: "Llama-4".to_string(),
            model_cutoff: 50,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    client: ResilientClient,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(client: ResilientClient, config: PipelineConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    /// Text-only turn: context stage then response stage.
    pub async fn run_chat(
        &self,
        session: &mut Session,
        user_input: &str,
    ) -> Result<ChatTurn, StageError> {
        let persona = self.ensure_context(session, user_input).await?;
        let reply = self.generate_response(session, user_input, &persona).await?;
        Ok(ChatTurn { reply })
    }

    /// Voice turn with streamed synthesis: STT, context, response, TTS.
    /// The returned audio receiver honors `cancel` within one chunk.
    pub async fn run_voice(
        &self,
        session: &mut Session,
        audio: Bytes,
        cancel: CancellationToken,
    ) -> Result<VoiceTurn, StageError> {
        let transcript = self.transcribe(&audio).await?;
        let ChatTurn { reply } = self.run_chat(session, &transcript).await?;
        let voice = session.character.voice_type.clone();
        let stream = self.synthesize_streaming(&reply, &voice, cancel).await?;
        Ok(VoiceTurn {
            transcript,
            reply,
            audio: stream,
        })
    }

    /// Voice turn for the REST surface: synthesis returned whole as base64.
    pub async fn run_voice_rest(
        &self,
        session: &mut Session,
        audio: Bytes,
    ) -> Result<VoiceRestTurn, StageError> {
        let transcript = self.transcribe(&audio).await?;
        let ChatTurn { reply } = self.run_chat(session, &transcript).await?;
        let tts: TtsResponse = self
            .call_json(
                Stage::Tts,
                ServiceName::Tts,
                &TtsRequest {
                    text: reply.clone(),
                    voice_selector: session.character.voice_type.clone(),
                },
            )
            .await?;
        Ok(VoiceRestTurn {
            transcript,
            reply,
            audio_data: tts.audio_data,
        })
    }

    async fn transcribe(&self, audio: &Bytes) -> Result<String, StageError> {
        let request = SttRequest {
            audio_data: BASE64.encode(audio),
        };
        let response: SttResponse = self
            .call_json(Stage::Stt, ServiceName::Stt, &request)
            .await?;
        let transcript = response.transcript.trim().to_string();
        if transcript.is_empty() {
            debug!("empty transcript, aborting turn");
            return Err(StageError::empty(Stage::Stt));
        }
        info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }

    /// Returns the persona context, calling the context service at most once
    /// per session while caching is enabled.
    async fn ensure_context(
        &self,
        session: &mut Session,
        user_input: &str,
    ) -> Result<PersonaContext, StageError> {
        if self.config.cache_persona_context {
            if let Some(persona) = &session.persona_context {
                debug!(session_id = %session.id, "persona context cache hit");
                return Ok(persona.clone());
            }
        }

        let request = ContextRequest {
            user_input: user_input.to_string(),
            character_details: FilteredCharacter {
                name: session.character.name.clone(),
                persona: session.character.persona.clone(),
            },
        };
        let response: ContextResponse = self
            .call_json(Stage::Context, ServiceName::ContextLlm, &request)
            .await?;

        if response.context.trim().is_empty() {
            return Err(StageError::empty(Stage::Context));
        }
        let persona = PersonaContext {
            context: response.context,
            rules: response.rules,
        };

        if self.config.cache_persona_context {
            session.persona_context = Some(persona.clone());
        }
        Ok(persona)
    }

    async fn generate_response(
        &self,
        session: &Session,
        user_input: &str,
        persona: &PersonaContext,
    ) -> Result<String, StageError> {
        let history = session
            .recent_history(self.config.history_window)
            .iter()
            .map(|turn| HistoryEntry {
                sender: match turn.sender {
                    crate::core::session::Sender::User => "user".to_string(),
                    crate::core::session::Sender::Assistant => "assistant".to_string(),
                },
                content: turn.content.clone(),
            })
            .collect();

        let request = ResponseRequest {
            user_query: user_input.to_string(),
            persona_context: persona.context.clone(),
            rules: persona.rules.clone(),
            history,
            model: self.select_model(user_input).to_string(),
        };
        let response: ResponseResponse = self
            .call_json(Stage::Response, ServiceName::ResponseLlm, &request)
            .await?;

        let reply = response.response.trim().to_string();
        if reply.is_empty() {
            warn!("response service returned an empty reply");
            return Err(StageError::empty(Stage::Response));
        }
        Ok(reply)
    }

    async fn synthesize_streaming(
        &self,
        text: &str,
        voice_selector: &str,
        cancel: CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<Bytes>, StageError> {
        let payload = serde_json::to_value(TtsRequest {
            text: text.to_string(),
            voice_selector: voice_selector.to_string(),
        })
        .map_err(|e| {
            StageError::new(
                Stage::Tts,
                StageCause::Malformed {
                    details: e.to_string(),
                },
            )
        })?;

        match self
            .client
            .call_streaming(ServiceName::Tts, payload, cancel)
            .await
        {
            StreamOutcome::Stream(rx) => Ok(rx),
            StreamOutcome::CircuitOpen { retry_after } => Err(StageError::new(
                Stage::Tts,
                StageCause::CircuitOpen { retry_after },
            )),
            StreamOutcome::Fallback { error_details } => Err(StageError::new(
                Stage::Tts,
                StageCause::Exhausted {
                    details: error_details,
                },
            )),
        }
    }

    /// Short queries go to the light model, everything else to the heavy one.
    fn select_model(&self, query: &str) -> &str {
        if query.chars().count() < self.config.model_cutoff {
            &self.config.light_model
        } else {
            &self.config.heavy_model
        }
    }

    async fn call_json<Req, Resp>(
        &self,
        stage: Stage,
        service: ServiceName,
        request: &Req,
    ) -> Result<Resp, StageError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(|e| {
            StageError::new(
                stage,
                StageCause::Malformed {
                    details: e.to_string(),
                },
            )
        })?;

        match self.client.call(service, payload).await {
            CallOutcome::Success(value) => parse_body(stage, value),
            CallOutcome::CircuitOpen { retry_after } => Err(StageError::new(
                stage,
                StageCause::CircuitOpen { retry_after },
            )),
            CallOutcome::Fallback { error_details } => Err(StageError::new(
                stage,
                StageCause::Exhausted {
                    details: error_details,
                },
            )),
        }
    }
}

fn parse_body<Resp: DeserializeOwned>(stage: Stage, value: Value) -> Result<Resp, StageError> {
    serde_json::from_value(value).map_err(|e| {
        StageError::new(
            stage,
            StageCause::Malformed {
                details: e.to_string(),
            },
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resilience::breaker::{BreakerConfig, BreakerRegistry};
    use crate::core::resilience::client::RetryPolicy;
    use crate::core::resilience::transport::{ServiceTransport, TransportFailure};
    use crate::core::session::CharacterDetails;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Scripted transport: fixed JSON reply per service, attempt counting,
    /// and a record of the payloads it saw.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<HashMap<ServiceName, Value>>,
        calls: Mutex<Vec<(ServiceName, Value)>>,
    }

    impl ScriptedTransport {
        fn with_reply(self, service: ServiceName, reply: Value) -> Self {
            self.replies.lock().insert(service, reply);
            self
        }

        fn call_count(&self, service: ServiceName) -> usize {
            self.calls.lock().iter().filter(|(s, _)| *s == service).count()
        }

        fn last_payload(&self, service: ServiceName) -> Option<Value> {
            self.calls
                .lock()
                .iter()
                .rev()
                .find(|(s, _)| *s == service)
                .map(|(_, p)| p.clone())
        }
    }

    #[async_trait]
    impl ServiceTransport for ScriptedTransport {
        async fn request(
            &self,
            service: ServiceName,
            payload: Value,
        ) -> Result<Value, TransportFailure> {
            self.calls.lock().push((service, payload));
            self.replies
                .lock()
                .get(&service)
                .cloned()
                .ok_or_else(|| TransportFailure::Network("no script for service".into()))
        }

        async fn request_streaming(
            &self,
            service: ServiceName,
            payload: Value,
        ) -> Result<mpsc::Receiver<Bytes>, TransportFailure> {
            self.calls.lock().push((service, payload));
            let (tx, rx) = mpsc::channel(4);
            tx.try_send(Bytes::from_static(b"audio-chunk")).ok();
            Ok(rx)
        }

        async fn probe(&self, _service: ServiceName) -> Result<(), TransportFailure> {
            Ok(())
        }
    }

    fn orchestrator(transport: Arc<ScriptedTransport>, config: PipelineConfig) -> Orchestrator {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }));
        let retry = RetryPolicy {
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        Orchestrator::new(ResilientClient::new(transport, breakers, retry), config)
    }

    fn scripted_happy_path() -> Arc<ScriptedTransport> {
        Arc::new(
            ScriptedTransport::default()
                .with_reply(
                    ServiceName::Stt,
                    serde_json::json!({"transcript": "how are you"}),
                )
                .with_reply(
                    ServiceName::ContextLlm,
                    serde_json::json!({
                        "context": "You are Nova.",
                        "rules": {"tone": "upbeat", "forbidden_topics": ["politics"]},
                    }),
                )
                .with_reply(
                    ServiceName::ResponseLlm,
                    serde_json::json!({"response": "Doing great, thanks!"}),
                )
                .with_reply(
                    ServiceName::Tts,
                    serde_json::json!({"audio_data": "QUJD"}),
                ),
        )
    }

    fn nova_session() -> Session {
        Session::new(CharacterDetails {
            name: "Nova".into(),
            persona: "upbeat".into(),
            ..CharacterDetails::default()
        })
    }

    #[tokio::test]
    async fn chat_turn_builds_context_then_reply() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        let turn = orch.run_chat(&mut session, "hello").await.unwrap();
        assert_eq!(turn.reply, "Doing great, thanks!");
        let persona = session.persona_context.as_ref().unwrap();
        assert_eq!(persona.context, "You are Nova.");
        assert_eq!(persona.rules["tone"], "upbeat");

        let ctx_payload = transport.last_payload(ServiceName::ContextLlm).unwrap();
        assert_eq!(ctx_payload["user_input"], "hello");
        assert_eq!(ctx_payload["character_details"]["name"], "Nova");
        assert_eq!(ctx_payload["character_details"]["persona"], "upbeat");
    }

    #[tokio::test]
    async fn rules_map_is_forwarded_to_response_stage() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        orch.run_chat(&mut session, "hello").await.unwrap();

        let payload = transport.last_payload(ServiceName::ResponseLlm).unwrap();
        assert_eq!(payload["user_query"], "hello");
        assert_eq!(payload["persona_context"], "You are Nova.");
        assert_eq!(payload["rules"]["tone"], "upbeat");
        assert_eq!(payload["rules"]["forbidden_topics"][0], "politics");
    }

    #[tokio::test]
    async fn missing_rules_defaults_to_empty_map() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .with_reply(
                    ServiceName::ContextLlm,
                    serde_json::json!({"context": "You are Nova."}),
                )
                .with_reply(
                    ServiceName::ResponseLlm,
                    serde_json::json!({"response": "ok"}),
                ),
        );
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        orch.run_chat(&mut session, "hello").await.unwrap();

        let payload = transport.last_payload(ServiceName::ResponseLlm).unwrap();
        assert!(payload["rules"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persona_context_is_built_once_per_session() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        orch.run_chat(&mut session, "first").await.unwrap();
        orch.run_chat(&mut session, "second").await.unwrap();
        orch.run_chat(&mut session, "third").await.unwrap();

        assert_eq!(transport.call_count(ServiceName::ContextLlm), 1);
        assert_eq!(transport.call_count(ServiceName::ResponseLlm), 3);
    }

    #[tokio::test]
    async fn disabled_cache_recomputes_context_every_turn() {
        let transport = scripted_happy_path();
        let config = PipelineConfig {
            cache_persona_context: false,
            ..PipelineConfig::default()
        };
        let orch = orchestrator(transport.clone(), config);
        let mut session = nova_session();

        orch.run_chat(&mut session, "first").await.unwrap();
        orch.run_chat(&mut session, "second").await.unwrap();

        assert_eq!(transport.call_count(ServiceName::ContextLlm), 2);
        assert!(session.persona_context.is_none());
    }

    #[tokio::test]
    async fn model_selected_by_query_length() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        orch.run_chat(&mut session, "short question").await.unwrap();
        let payload = transport.last_payload(ServiceName::ResponseLlm).unwrap();
        assert_eq!(payload["model"], "O4-mini");

        let long_query = "x".repeat(80);
        orch.run_chat(&mut session, &long_query).await.unwrap();
        let payload = transport.last_payload(ServiceName::ResponseLlm).unwrap();
        assert_eq!(payload["model"], "Llama-4");
    }

    #[tokio::test]
    async fn empty_reply_is_a_response_stage_failure() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .with_reply(
                    ServiceName::ContextLlm,
                    serde_json::json!({"context": "ctx"}),
                )
                .with_reply(
                    ServiceName::ResponseLlm,
                    serde_json::json!({"response": "   "}),
                ),
        );
        let orch = orchestrator(transport, PipelineConfig::default());
        let mut session = nova_session();

        let err = orch.run_chat(&mut session, "hi").await.unwrap_err();
        assert_eq!(err.stage, Stage::Response);
        assert!(matches!(err.cause, StageCause::Empty));
    }

    #[tokio::test]
    async fn empty_transcript_aborts_before_later_stages() {
        let transport = Arc::new(ScriptedTransport::default().with_reply(
            ServiceName::Stt,
            serde_json::json!({"transcript": ""}),
        ));
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        let err = orch
            .run_voice(
                &mut session,
                Bytes::from_static(b"pcm"),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Stt);
        assert!(matches!(err.cause, StageCause::Empty));
        assert_eq!(transport.call_count(ServiceName::ContextLlm), 0);
        assert_eq!(transport.call_count(ServiceName::ResponseLlm), 0);
    }

    #[tokio::test]
    async fn voice_turn_streams_audio() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport, PipelineConfig::default());
        let mut session = nova_session();

        let mut turn = orch
            .run_voice(
                &mut session,
                Bytes::from_static(b"pcm"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(turn.transcript, "how are you");
        assert_eq!(turn.reply, "Doing great, thanks!");
        assert_eq!(
            turn.audio.recv().await.unwrap(),
            Bytes::from_static(b"audio-chunk")
        );
    }

    #[tokio::test]
    async fn character_voice_reaches_synthesis() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = Session::new(CharacterDetails {
            name: "Nova".into(),
            voice_type: "cloned".into(),
            ..CharacterDetails::default()
        });

        let turn = orch
            .run_voice_rest(&mut session, Bytes::from_static(b"pcm"))
            .await
            .unwrap();
        assert_eq!(turn.audio_data, "QUJD");

        let payload = transport.last_payload(ServiceName::Tts).unwrap();
        assert_eq!(payload["text"], "Doing great, thanks!");
        assert_eq!(payload["voice_selector"], "cloned");
    }

    #[tokio::test]
    async fn streaming_synthesis_defaults_to_predefined_voice() {
        let transport = scripted_happy_path();
        let orch = orchestrator(transport.clone(), PipelineConfig::default());
        let mut session = nova_session();

        orch.run_voice(
            &mut session,
            Bytes::from_static(b"pcm"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let payload = transport.last_payload(ServiceName::Tts).unwrap();
        assert_eq!(payload["voice_selector"], "predefined");
    }

    #[tokio::test]
    async fn malformed_body_is_reported_as_such() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .with_reply(ServiceName::Stt, serde_json::json!({"wrong_field": 1})),
        );
        let orch = orchestrator(transport, PipelineConfig::default());
        let mut session = nova_session();

        let err = orch
            .run_voice(
                &mut session,
                Bytes::from_static(b"pcm"),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Stt);
        assert!(matches!(err.cause, StageCause::Malformed { .. }));
    }
}
