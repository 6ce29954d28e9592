//! The external contract a Sink Mixer dispatches through. Concrete wire-protocol
//! senders (Scream, RTP, local hardware playback, FIFO, WebRTC) live in
//! `screamrouter-senders` and implement this trait; the mixer only ever sees a
//! trait object.

use crate::error::Result;

/// One outbound destination for a sink's mixed/downconverted payload.
pub trait Sender: Send {
    /// May block (socket creation, device open). Must be idempotent against being
    /// called again after `close()`.
    fn setup(&mut self) -> Result<()>;

    fn close(&mut self);

    /// Called from the sink's tick thread. Must be non-blocking and lossy except
    /// for the local hardware-playback sender, which may block within one period.
    fn send_payload(&mut self, payload: &[u8], csrcs: &[u32]);

    /// Whether this sender has asynchronously transitioned to closed (e.g. a
    /// WebRTC peer disconnect) and should be removed at the next tick.
    fn is_closed(&self) -> bool {
        false
    }
}

/// A single encoded MP3 frame, produced by the MP3 worker from the stereo
/// side-chain and consumed by the sink's MP3 output queue.
#[derive(Debug, Clone)]
pub struct EncodedMp3Frame {
    pub data: Vec<u8>,
}

/// Opaque MP3 frame encoder; the dataplane treats the encoder internals as a
/// black box (`screamrouter-senders` wraps `mp3lame-encoder` behind this).
pub trait Mp3Encoder: Send {
    fn encode(&mut self, interleaved_stereo_pcm_i32: &[i32]) -> Vec<EncodedMp3Frame>;
}
