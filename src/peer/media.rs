//! Local media acquisition.
//!
//! Capture devices sit behind [`MediaDevices`]; [`MediaController`] owns the
//! resulting tracks together with the per-device [`MediaGrant`]. Enabling or
//! disabling a track only flips a flag on it, the peer link is never touched.

use crate::error::MediaError;
use crate::utils::random_id;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn from_codec(kind: RTPCodecType) -> Option<MediaKind> {
        match kind {
            RTPCodecType::Video => Some(MediaKind::Video),
            RTPCodecType::Audio => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("camera"),
            MediaKind::Audio => f.write_str("microphone"),
        }
    }
}

/// A captured local track that can be attached to a peer link.
///
/// Clones share the enabled/stopped flags.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Pushes one encoded sample to every link the track is bound to.
    ///
    /// Returns `Ok(false)` when the sample was dropped because the track is
    /// disabled or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.track.write_sample(sample).await?;
        Ok(true)
    }
}

/// The local camera/microphone stream.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub stream_id: String,
    pub video: Option<LocalTrack>,
    pub audio: Option<LocalTrack>,
}

impl LocalMedia {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.video.iter().chain(self.audio.iter())
    }

    fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Camera and microphone availability as the user currently sees it.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaGrant {
    pub camera: bool,
    pub microphone: bool,
}

/// Source of capture tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAccess {
    Granted,
    Denied,
    Missing,
}

/// Devices backed by `webrtc` static-sample tracks (VP8 video, Opus audio).
///
/// The application feeds encoded frames through [`LocalTrack::write_sample`].
#[derive(Debug, Clone, Copy)]
pub struct SyntheticDevices {
    pub camera: DeviceAccess,
    pub microphone: DeviceAccess,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            camera: DeviceAccess::Granted,
            microphone: DeviceAccess::Granted,
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, MediaError> {
        let (access, mime_type) = match kind {
            MediaKind::Video => (self.camera, MIME_TYPE_VP8),
            MediaKind::Audio => (self.microphone, MIME_TYPE_OPUS),
        };
        match access {
            DeviceAccess::Denied => return Err(MediaError::PermissionDenied(kind)),
            DeviceAccess::Missing => return Err(MediaError::DeviceUnavailable(kind)),
            DeviceAccess::Granted => {}
        }

        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            format!("{kind}-{}", random_id()),
            stream_id.to_owned(),
        );
        Ok(LocalTrack::new(kind, Arc::new(track)))
    }
}

/// Owns the local stream and the grant flags across matches.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    local: Option<LocalMedia>,
    grant: MediaGrant,
    requested: Option<(bool, bool)>,
    camera_on: bool,
    microphone_on: bool,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: None,
            grant: MediaGrant::default(),
            requested: None,
            camera_on: true,
            microphone_on: true,
        }
    }

    pub fn local(&self) -> Option<&LocalMedia> {
        self.local.as_ref()
    }

    pub fn grant(&self) -> MediaGrant {
        self.grant
    }

    /// Requests capture for the given devices, replacing any current stream.
    ///
    /// Fails as a whole if any requested device fails; nothing stays open.
    pub async fn acquire(&mut self, video: bool, audio: bool) -> Result<&LocalMedia, MediaError> {
        self.camera_on = true;
        self.microphone_on = true;
        self.open(video, audio).await
    }

    /// Re-opens the previously requested devices, keeping the user's toggles.
    pub async fn reacquire(&mut self) -> Result<Option<&LocalMedia>, MediaError> {
        let Some((video, audio)) = self.requested else {
            return Ok(None);
        };
        self.open(video, audio).await.map(Some)
    }

    async fn open(&mut self, video: bool, audio: bool) -> Result<&LocalMedia, MediaError> {
        self.release();
        self.requested = Some((video, audio));

        let stream_id = random_id();
        let mut media = LocalMedia {
            stream_id: stream_id.clone(),
            video: None,
            audio: None,
        };

        let wanted = [(MediaKind::Video, video), (MediaKind::Audio, audio)];
        for kind in wanted.into_iter().filter_map(|(kind, on)| on.then_some(kind)) {
            match self.devices.open(kind, &stream_id).await {
                Ok(track) => match kind {
                    MediaKind::Video => {
                        track.set_enabled(self.camera_on);
                        media.video = Some(track);
                    }
                    MediaKind::Audio => {
                        track.set_enabled(self.microphone_on);
                        media.audio = Some(track);
                    }
                },
                Err(e) => {
                    warn!("media acquisition failed: {e}");
                    media.stop_all();
                    return Err(e);
                }
            }
        }

        self.grant = MediaGrant {
            camera: video && media.video.is_some() && self.camera_on,
            microphone: audio && media.audio.is_some() && self.microphone_on,
        };
        info!(
            "local media ready: camera={} microphone={}",
            self.grant.camera, self.grant.microphone
        );
        Ok(self.local.insert(media))
    }

    /// Flips the camera track's enabled flag. `None` without a video track.
    pub fn toggle_camera(&mut self) -> Option<bool> {
        let track = self.local.as_ref()?.video.as_ref()?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.camera_on = enabled;
        self.grant.camera = enabled;
        debug!("camera enabled: {enabled}");
        Some(enabled)
    }

    /// Flips the microphone track's enabled flag. `None` without an audio track.
    pub fn toggle_microphone(&mut self) -> Option<bool> {
        let track = self.local.as_ref()?.audio.as_ref()?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        self.microphone_on = enabled;
        self.grant.microphone = enabled;
        debug!("microphone enabled: {enabled}");
        Some(enabled)
    }

    /// Stops every local track and drops the stream. Safe to repeat.
    pub fn release(&mut self) {
        if let Some(media) = self.local.take() {
            media.stop_all();
            debug!("local media released");
        }
        self.grant = MediaGrant::default();
    }
}
