//! Error types for the audio dataplane. Transient per-chunk failures (malformed
//! packet, resample glitch) are not modeled as `Error` at all — they are counters,
//! per §7; this enum covers the failures that reject an operation outright
//! (typed `add_*`/`connect` rejections, sender setup failure).

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannelCount(u16),

    #[error("no sink registered with id {0}")]
    UnknownSink(String),

    #[error("no source registered with tag {0}")]
    UnknownSource(String),

    #[error("binding already exists for source={source_tag} sink={sink_id}")]
    BindingAlreadyExists { source_tag: String, sink_id: String },

    #[error("no binding exists for source={source_tag} sink={sink_id}")]
    NoSuchBinding { source_tag: String, sink_id: String },

    #[error("sender setup failed for sink {sink_id}: {reason}")]
    SenderSetupFailed { sink_id: String, reason: String },

    #[error("dsp error: {0}")]
    Dsp(#[from] screamrouter_dsp::DspError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_errors_carry_source_and_sink_for_logs() {
        let err = Error::BindingAlreadyExists {
            source_tag: "src-a".into(),
            sink_id: "sink-1".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("src-a"));
        assert!(rendered.contains("sink-1"));
    }

    #[test]
    fn sender_setup_failure_carries_reason() {
        let err = Error::SenderSetupFailed {
            sink_id: "sink-1".into(),
            reason: "device busy".into(),
        };
        assert!(err.to_string().contains("device busy"));
    }
}
