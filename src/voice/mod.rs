//! Realtime speech-to-speech interpretation, client side.
//!
//! Audio is PCM16 little-endian, 24kHz mono throughout.
//!
//! ## Design
//! - `codec`: WAV container and base64 helpers
//! - `direction`: the two interpretation directions and their prompts/voices
//! - `protocol`: realtime event wire format (outbound builders, inbound decoding)
//! - `transport`: bidirectional frame transport (tungstenite, axum socket, in-memory)
//! - `turn`: pure turn-taking state machine returning effects
//! - `session`, `dispatcher`, `playback`, `capture`: per-conversation state and I/O
//! - `engine`: the cooperative loop tying it all together, direct or via the relay

pub mod capture;
pub mod codec;
pub mod direction;
pub mod dispatcher;
pub mod engine;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod turn;

pub use capture::{CaptureError, CaptureSource, PcmFileCapture};
pub use direction::{Direction, DirectionTable, LanguageCode};
pub use engine::{ConversationEngine, EngineCommand, EngineConfig, EngineEvent, EngineHandle};
pub use playback::{AudioSink, PlaybackQueue, WavFileSink};
pub use session::Session;
pub use transport::{Connector, Transport, TransportConfig, TransportError, TransportMode, WsConnector};
pub use turn::{TurnMachine, TurnState};
