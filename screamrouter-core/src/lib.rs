//! Real-time audio dataplane: time-shift buffering, per-source DSP, mix
//! scheduling, sink mixing and multi-sink synchronization.
//!
//! [`manager::AudioManager`] is the entry point a host process holds; every
//! other type here is reachable through it or exists to be implemented against
//! (see [`sender::Sender`]) by a separate wire-protocol crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod input_processor;
pub mod manager;
pub mod mixer;
pub mod packet;
pub mod queue;
pub mod scheduler;
pub mod sender;
pub mod sync;
pub mod tsm;

pub use config::AudioEngineConfig;
pub use error::{Error, Result};
pub use manager::{AudioManager, SinkSpec};
pub use packet::{ProcessedAudioChunk, TaggedAudioPacket};
pub use sender::{Mp3Encoder, Sender};
