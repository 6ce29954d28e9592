//! Concrete `screamrouter_core::Sender` implementations for every wire
//! protocol a sink can fan out to, plus the MP3 side-chain encoder.

pub mod fifo;
pub mod hardware;
pub mod mp3;
mod net;
pub mod rtp;
pub mod scream;
pub mod webrtc;

pub use fifo::FifoSender;
pub use hardware::HardwarePlaybackSender;
pub use mp3::LameMp3Encoder;
pub use rtp::{RtpL16MultiDeviceSender, RtpL16Sender, RtpOpusSender};
pub use scream::ScreamSender;
pub use webrtc::WebRtcListener;
