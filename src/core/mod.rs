pub mod pipeline;
pub mod resilience;
pub mod segmenter;
pub mod session;
pub mod vad;

// Re-export commonly used types for convenience
pub use pipeline::{Orchestrator, PipelineConfig, Stage, StageCause, StageError};
pub use resilience::{
    BreakerConfig, BreakerRegistry, CallOutcome, CircuitOpen, HttpTransport, ResilientClient,
    RetryPolicy, ServiceName, ServiceTransport, StreamOutcome, TransportFailure,
};
pub use segmenter::{SegmenterConfig, SegmenterEvent, UtteranceSegmenter};
pub use session::{CharacterDetails, PersonaContext, Sender, Session, SessionStore, Turn, TurnState};
pub use vad::{VadConfig, VadDetector, VadError};
