//! Local capture stream shared read-only by every peer connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const VIDEO_MIME: &str = "video/VP8";
pub const AUDIO_MIME: &str = "audio/opus";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no audio or video requested")]
    NothingRequested,
    #[error("media device unavailable: {0}")]
    Unavailable(String),
    #[error("media stream already stopped")]
    Stopped,
    #[error("failed to write sample: {0}")]
    Write(#[from] webrtc::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

pub struct LocalTrack {
    kind: TrackKind,
    id: String,
    enabled: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl LocalTrack {
    fn new(kind: TrackKind, id: String, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: VIDEO_MIME.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: AUDIO_MIME.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            kind,
            id,
            enabled: AtomicBool::new(true),
            rtc,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Pushes one encoded frame to every connection carrying this track.
    /// Disabled tracks swallow the frame and report `false`.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, MediaError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, constraints: MediaConstraints) -> Self {
        let stream_id = stream_id.into();
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(
                TrackKind::Video,
                format!("{stream_id}-video"),
                &stream_id,
            )));
        }
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(
                TrackKind::Audio,
                format!("{stream_id}-audio"),
                &stream_id,
            )));
        }
        Self {
            stream_id,
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Video)
            .for_each(|track| track.set_enabled(enabled));
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Audio)
            .for_each(|track| track.set_enabled(enabled));
    }

    pub fn is_video_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Video).any(|track| track.is_enabled())
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Audio).any(|track| track.is_enabled())
    }

    /// Ends capture. Idempotent; returns whether this call did the stopping.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in &self.tracks {
            track.set_enabled(false);
        }
        debug!(stream = %self.stream_id, "local media stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalMedia>, MediaError>;
}

/// Devices that hand out sample-fed tracks. Frames reach peers through
/// [`LocalTrack::write_sample`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleDevices;

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalMedia>, MediaError> {
        if !constraints.video && !constraints.audio {
            return Err(MediaError::NothingRequested);
        }
        let stream_id = uuid::Uuid::new_v4().to_string();
        Ok(Arc::new(LocalMedia::new(stream_id, constraints)))
    }
}
