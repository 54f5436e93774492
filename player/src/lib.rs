//! Live Ogg/Opus streaming playback client.
//!
//! Consumes a chunked HTTP byte stream of an Ogg/Opus broadcast, decodes it
//! incrementally, and schedules the PCM for gapless playback while keeping
//! an accurate current-position clock for progress display. Both the media
//! fetch and the companion control channel survive transport failures with
//! bounded, backoff-governed reconnection.
//!
//! The library can be used to build custom players or for integration
//! testing; [`player::Player`] is the batteries-included surface.

pub mod clock;
pub mod codec;
pub mod control;
pub mod ogg;
pub mod output;
pub mod player;
pub mod reconnect;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod transport;

pub use clock::{ClockSource, SharedClock, Ticker};
pub use codec::{ChunkDecoder, DecodedAudio, OggOpusDecoder};
pub use control::{ControlChannel, ControlEvent, OutboundMessage, TrackMetadata};
pub use output::{CpalOutput, OutputDevice};
pub use player::{PlaybackState, Player, PlayerConfig, StreamParts};
pub use reconnect::{Backoff, ConnectionAttempt, ConnectionState, ReconnectPolicy};
pub use scheduler::{AudioScheduler, ScheduleCursor};
pub use session::{SessionEnd, StreamSession};
pub use stats::StreamStats;
pub use transport::{ChunkSource, HttpChunkSource};
