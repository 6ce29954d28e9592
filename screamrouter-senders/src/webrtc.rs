//! WebRTC sender: the one async-native sink in the dataplane. Owns a small
//! dedicated tokio runtime and bridges the synchronous `Sender` contract to it
//! through a bounded channel, rather than making the whole mixer thread async.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use bytes::Bytes;
use tokio::runtime::Runtime;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use screamrouter_core::error::{Error, Result};
use screamrouter_core::sender::Sender;

const MIME_TYPE_OPUS: &str = "audio/opus";
const FRAME_DURATION_MS: u32 = 20;
const OPUS_FRAME_SAMPLES: usize = 960;
const CHANNEL_CAPACITY: usize = 8;

/// A single negotiated outbound audio track, as produced by whatever
/// signaling front-end (WHIP/callback) accepted the peer.
pub fn new_audio_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        "audio".to_owned(),
        "screamrouter".to_owned(),
    ))
}

pub struct WebRtcListener {
    track: Arc<TrackLocalStaticSample>,
    channels: u16,
    encoder: audiopus::coder::Encoder,
    runtime: Runtime,
    tx: Option<mpsc::SyncSender<Bytes>>,
    closed: Arc<AtomicBool>,
}

impl WebRtcListener {
    pub fn new(track: Arc<TrackLocalStaticSample>, channels: u16) -> Result<Self> {
        let opus_channels = match channels {
            1 => audiopus::Channels::Mono,
            2 => audiopus::Channels::Stereo,
            n => return Err(Error::UnsupportedChannelCount(n)),
        };
        let encoder = audiopus::coder::Encoder::new(
            audiopus::SampleRate::Hz48000,
            opus_channels,
            audiopus::Application::Audio,
        )
        .map_err(|e| Error::other(format!("opus encoder init failed: {e}")))?;
        let runtime = Runtime::new().map_err(|e| Error::SenderSetupFailed {
            sink_id: "webrtc".into(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            track,
            channels,
            encoder,
            runtime,
            tx: None,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Sender for WebRtcListener {
    fn setup(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::sync_channel::<Bytes>(CHANNEL_CAPACITY);
        let track = self.track.clone();
        let closed = self.closed.clone();
        let frame_duration = std::time::Duration::from_millis(FRAME_DURATION_MS as u64);

        self.runtime.spawn(async move {
            while let Ok(data) = rx.recv() {
                let sample = Sample {
                    data,
                    duration: frame_duration,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    closed.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });

        self.tx = Some(tx);
        Ok(())
    }

    fn close(&mut self) {
        self.tx = None;
        self.closed.store(true, Ordering::Relaxed);
    }

    fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let channels = self.channels.max(1) as usize;
        let samples: Vec<i16> = payload
            .chunks_exact(4)
            .map(|c| {
                i32::from_le_bytes([c[0], c[1], c[2], c[3]]).clamp(i16::MIN as i32, i16::MAX as i32) as i16
            })
            .collect();
        let expected = OPUS_FRAME_SAMPLES * channels;
        if samples.len() != expected {
            tracing::debug!(got = samples.len(), expected, "webrtc sender: frame size mismatch, dropping");
            return;
        }

        let mut opus_buf = [0u8; 4000];
        let written = match self.encoder.encode(&samples, &mut opus_buf) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "webrtc sender: opus encode failed, dropping");
                return;
            }
        };

        if tx.try_send(Bytes::copy_from_slice(&opus_buf[..written])).is_err() {
            tracing::trace!("webrtc sender: channel full, dropping frame");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
