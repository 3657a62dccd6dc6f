use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, fmt::Display};

use crate::contract::{Codec, Dimensions, Rotation};

/// Crop applied by the frame bridge; the transform size is the encoder's
/// frame size before rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropState {
    pub transform_width: u32,
    pub transform_height: u32,
    pub transform_rotation: i32,
    pub offset_x: f32,
    pub offset_y: f32,
    pub scale: f32,
    pub mirrored: bool,
}

impl CropState {
    #[must_use]
    pub fn new(transform_width: u32, transform_height: u32) -> Self {
        Self {
            transform_width,
            transform_height,
            transform_rotation: 0,
            offset_x: 0.0,
            offset_y: 0.0,
            scale: 1.0,
            mirrored: false,
        }
    }
}

/// Filter and paint state forwarded untouched to the frame bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayState {
    pub filter: Option<Vec<u8>>,
    pub paint_path: Option<PathBuf>,
    pub entities: Vec<Vec<u8>>,
}

impl OverlayState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.paint_path.is_none() && self.entities.is_empty()
    }
}

/// Immutable description of one conversion job. Every time is in microseconds.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub rotation: Rotation,
    pub is_secret: bool,
    pub source_dims: Dimensions,
    pub target_dims: Dimensions,
    /// Target frames per second; 0 selects the configured default.
    pub frame_rate: u32,
    /// Target bitrate in bps; values <= 0 select a heuristic.
    pub bitrate: i64,
    /// Bitrate reported by the source container, used as an upper clamp when > 0.
    pub original_bitrate: i64,
    pub start_us: i64,
    /// Exclusive end of the trim window; negative means unbounded.
    pub end_us: i64,
    /// Loop point for avatar clips; negative disables looping.
    pub avatar_start_us: i64,
    pub need_compress: bool,
    pub duration_us: i64,
    pub overlay: OverlayState,
    pub crop: Option<CropState>,
    pub is_photo: bool,
    pub is_round: bool,
    pub muted: bool,
    /// Start with the increased codec poll timeout.
    pub increased_timeout: bool,
}

impl TranscodeRequest {
    #[must_use]
    pub fn new(
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
        source_dims: Dimensions,
        target_dims: Dimensions,
        duration_us: i64,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            rotation: Rotation::Deg0,
            is_secret: false,
            source_dims,
            target_dims,
            frame_rate: 0,
            bitrate: 0,
            original_bitrate: 0,
            start_us: 0,
            end_us: -1,
            avatar_start_us: -1,
            need_compress: false,
            duration_us,
            overlay: OverlayState::default(),
            crop: None,
            is_photo: false,
            is_round: false,
            muted: false,
            increased_timeout: false,
        }
    }

    #[must_use]
    pub fn end_time(&self) -> Option<i64> {
        (self.end_us >= 0).then_some(self.end_us)
    }
}

impl Display for TranscodeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TranscodeRequest(source={}, {} -> {}, rotation={}, fps={}, bitrate={}, window=[{}, {}), photo={}, compress={})",
            self.source_path.display(),
            self.source_dims,
            self.target_dims,
            self.rotation.degrees(),
            self.frame_rate,
            self.bitrate,
            self.start_us,
            self.end_us,
            self.is_photo,
            self.need_compress
        )
    }
}

/// Tunables shared by every conversion a `Transcoder` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderConfig {
    pub poll_timeout: Duration,
    pub increased_poll_timeout: Duration,
    pub target_codec: Codec,
    /// Drop everything before the second start code of the first keyframe.
    pub strip_spurious_leading_nal: bool,
    pub default_frame_rate: u32,
    pub fallback_audio_buffer: usize,
    pub retry_with_increased_timeout: bool,
}

impl TranscoderConfig {
    #[must_use]
    pub fn new(target_codec: Codec) -> Self {
        Self {
            target_codec,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn poll_timeout_for(&self, increased: bool) -> Duration {
        if increased {
            self.increased_poll_timeout
        } else {
            self.poll_timeout
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_micros(2_500),
            increased_poll_timeout: Duration::from_micros(22_000),
            target_codec: Codec::H264,
            strip_spurious_leading_nal: true,
            default_frame_rate: 30,
            fallback_audio_buffer: 64 * 1024,
            retry_with_increased_timeout: true,
        }
    }
}

impl Display for TranscoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TranscoderConfig(codec={}, poll={:?}, increased_poll={:?}, strip_leading_nal={}, default_fps={}, retry={})",
            self.target_codec,
            self.poll_timeout,
            self.increased_poll_timeout,
            self.strip_spurious_leading_nal,
            self.default_frame_rate,
            self.retry_with_increased_timeout
        )
    }
}
