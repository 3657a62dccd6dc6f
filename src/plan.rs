use std::time::Duration;
use std::{fmt, fmt::Display};

use tracing::debug;

use crate::contract::{
    Codec, Dimensions, DownscaleFilter, MIME_AUDIO_AAC, MIME_AUDIO_MPEG, MIME_AUDIO_UNKNOWN,
    MediaKind, SampleSource, TrackFormat, TranscodeError,
};
use crate::request::{TranscodeRequest, TranscoderConfig};
use crate::tracks::find_track;

pub const PHOTO_I_FRAME_INTERVAL_SECS: u32 = 1;
pub const VIDEO_I_FRAME_INTERVAL_SECS: u32 = 2;

const FALLBACK_BITRATE: u32 = 921_600;
const DOWNSCALE_FILTER_RATIO: f64 = 0.9;

/// Frame spacing derived from the target rate. The drop threshold leaves
/// headroom below the nominal period so source jitter does not thin the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub frame_period_us: i64,
    pub min_frame_gap_us: i64,
}

impl Pacing {
    #[must_use]
    pub fn for_rate(frame_rate: u32) -> Self {
        let fps = i64::from(frame_rate.max(1));
        let headroom = if fps < 30 { 5 } else { 1 };
        Self {
            frame_period_us: (1000 / fps) * 1000,
            min_frame_gap_us: (1000 / (fps + headroom)) * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimWindow {
    pub start_us: i64,
    pub end_us: Option<i64>,
}

impl TrimWindow {
    #[must_use]
    pub fn contains(&self, pts: i64) -> bool {
        pts >= self.start_us && self.end_us.is_none_or(|end| pts < end)
    }

    #[must_use]
    pub fn is_past_end(&self, pts: i64) -> bool {
        self.end_us.is_some_and(|end| pts >= end)
    }
}

/// Everything one attempt needs from the request, computed once before any
/// collaborator is touched.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub increased_timeout: bool,
    pub encoder_poll_timeout: Duration,
    pub decoder_poll_timeout: Duration,
    pub target_codec: Codec,
    pub frame_rate: u32,
    pub pacing: Pacing,
    pub window: TrimWindow,
    /// Avatar wrap-around point; present only when it lies more than one
    /// frame away from the trim start.
    pub loop_point_us: Option<i64>,
    pub photo_bitrate: u32,
    pub transcode_bitrate: u32,
    pub photo_dims: Dimensions,
    pub encoder_dims: Dimensions,
    pub downscale: Option<DownscaleFilter>,
    pub photo_frame_count: u64,
    pub duration_us: i64,
}

impl ResolvedPlan {
    pub fn resolve(
        request: &TranscodeRequest,
        config: &TranscoderConfig,
        increased_timeout: bool,
    ) -> Result<Self, TranscodeError> {
        if request.duration_us < 0 {
            return Err(TranscodeError::InvalidRequest(format!(
                "duration must not be negative, got {}",
                request.duration_us
            )));
        }
        if request.start_us < 0 {
            return Err(TranscodeError::InvalidRequest(format!(
                "start time must not be negative, got {}",
                request.start_us
            )));
        }
        let end_us = request.end_time();
        if let Some(end) = end_us.filter(|end| *end <= request.start_us) {
            return Err(TranscodeError::InvalidRequest(format!(
                "trim window [{}, {end}) is empty",
                request.start_us
            )));
        }

        let frame_rate = if request.frame_rate == 0 {
            config.default_frame_rate.max(1)
        } else {
            request.frame_rate
        };
        let pacing = Pacing::for_rate(frame_rate);

        let loop_point_us = (request.avatar_start_us >= 0
            && (request.avatar_start_us - request.start_us).abs()
                > 1_000_000 / i64::from(frame_rate))
        .then_some(request.avatar_start_us);

        let photo_bitrate = heuristic_bitrate(request);
        let transcode_bitrate = clamp_to_original(photo_bitrate, request.original_bitrate);

        let plan = Self {
            increased_timeout,
            encoder_poll_timeout: config.poll_timeout_for(increased_timeout),
            decoder_poll_timeout: config.poll_timeout,
            target_codec: config.target_codec,
            frame_rate,
            pacing,
            window: TrimWindow {
                start_us: request.start_us,
                end_us,
            },
            loop_point_us,
            photo_bitrate,
            transcode_bitrate,
            photo_dims: round_to_macroblocks(request.target_dims),
            encoder_dims: encoder_dims(request),
            downscale: downscale_filter(request),
            photo_frame_count: photo_frame_count(request.duration_us, frame_rate),
            duration_us: request.duration_us,
        };
        debug!(%plan, "resolved conversion plan");
        Ok(plan)
    }

    #[must_use]
    pub fn photo_encoder_format(&self) -> TrackFormat {
        TrackFormat {
            bitrate: Some(self.photo_bitrate),
            frame_rate: Some(self.frame_rate),
            i_frame_interval_secs: Some(PHOTO_I_FRAME_INTERVAL_SECS),
            ..TrackFormat::video(self.target_codec.mime(), self.photo_dims)
        }
    }

    #[must_use]
    pub fn video_encoder_format(&self) -> TrackFormat {
        TrackFormat {
            bitrate: Some(self.transcode_bitrate),
            frame_rate: Some(self.frame_rate),
            i_frame_interval_secs: Some(VIDEO_I_FRAME_INTERVAL_SECS),
            ..TrackFormat::video(self.target_codec.mime(), self.encoder_dims)
        }
    }

    /// Presentation time of photo frame `index`, in nanoseconds.
    #[must_use]
    pub fn photo_frame_time_ns(&self, index: u64) -> i64 {
        let ns = u128::from(index) * 1_000_000_000 / u128::from(self.frame_rate.max(1));
        i64::try_from(ns).unwrap_or(i64::MAX)
    }
}

impl Display for ResolvedPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResolvedPlan(codec={}, fps={}, bitrate={}/{}, encoder={}, photo={}, window=[{}, {:?}), loop={:?}, poll={:?})",
            self.target_codec,
            self.frame_rate,
            self.transcode_bitrate,
            self.photo_bitrate,
            self.encoder_dims,
            self.photo_dims,
            self.window.start_us,
            self.window.end_us,
            self.loop_point_us,
            self.encoder_poll_timeout
        )
    }
}

fn heuristic_bitrate(request: &TranscodeRequest) -> u32 {
    if request.avatar_start_us >= 0 {
        match request.duration_us {
            d if d <= 2_000_000 => 2_600_000,
            d if d <= 5_000_000 => 2_200_000,
            _ => 1_560_000,
        }
    } else if request.bitrate <= 0 {
        FALLBACK_BITRATE
    } else {
        u32::try_from(request.bitrate).unwrap_or(u32::MAX)
    }
}

fn clamp_to_original(bitrate: u32, original_bitrate: i64) -> u32 {
    if original_bitrate > 0 {
        bitrate.min(u32::try_from(original_bitrate).unwrap_or(u32::MAX))
    } else {
        bitrate
    }
}

fn round_to_16(value: u32) -> u32 {
    ((value.saturating_add(8) / 16) * 16).max(16)
}

fn round_to_macroblocks(dims: Dimensions) -> Dimensions {
    let width = dims.width.get();
    let height = dims.height.get();
    if width % 16 == 0 && height % 16 == 0 {
        return dims;
    }
    let rounded = Dimensions::new(round_to_16(width), round_to_16(height)).unwrap_or(dims);
    debug!(from = %dims, to = %rounded, "rounded photo size to macroblock grid");
    rounded
}

fn encoder_dims(request: &TranscodeRequest) -> Dimensions {
    let Some(crop) = request.crop else {
        return request.target_dims;
    };
    let Some(dims) = Dimensions::new(crop.transform_width, crop.transform_height) else {
        return request.target_dims;
    };
    if request.rotation.swaps_axes() {
        dims.transposed()
    } else {
        dims
    }
}

fn downscale_filter(request: &TranscodeRequest) -> Option<DownscaleFilter> {
    if request.is_round {
        return None;
    }
    let source_side = f64::from(request.source_dims.longest_side());
    let target_side = f64::from(request.target_dims.longest_side());
    if target_side / source_side >= DOWNSCALE_FILTER_RATIO {
        return None;
    }
    let kernel = (source_side / target_side * 0.8).clamp(1.0, 2.0);
    Some(DownscaleFilter {
        source: request.source_dims,
        target: request.target_dims,
        kernel_radius: kernel as u32,
    })
}

fn photo_frame_count(duration_us: i64, frame_rate: u32) -> u64 {
    let duration = u64::try_from(duration_us).unwrap_or(0);
    duration
        .saturating_mul(u64::from(frame_rate))
        .div_ceil(1_000_000)
        .max(1)
}

/// Which of the three exclusive execution paths an attempt takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Photo,
    Transcode,
    Copy,
}

impl Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Photo => f.write_str("photo"),
            Self::Transcode => f.write_str("transcode"),
            Self::Copy => f.write_str("copy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrackPlan {
    pub index: usize,
    pub format: TrackFormat,
    pub reencode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPlan {
    None,
    Passthrough { index: usize, format: TrackFormat },
    Reencode { index: usize, format: TrackFormat },
}

impl AudioPlan {
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Passthrough { index, .. } | Self::Reencode { index, .. } => Some(*index),
        }
    }
}

/// Per-attempt track decisions taken after inspecting the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPlan {
    pub video: Option<VideoTrackPlan>,
    pub audio: AudioPlan,
}

impl TrackPlan {
    pub fn inspect(
        source: &dyn SampleSource,
        request: &TranscodeRequest,
        plan: &ResolvedPlan,
    ) -> Result<Self, TranscodeError> {
        let video = match find_track(source, MediaKind::Video)? {
            Some((index, format)) => {
                let reencode = request.need_compress || format.mime != plan.target_codec.mime();
                Some(VideoTrackPlan {
                    index,
                    format,
                    reencode,
                })
            }
            None => None,
        };

        let audio = if request.muted || plan.loop_point_us.is_some() {
            AudioPlan::None
        } else {
            match find_track(source, MediaKind::Audio)? {
                Some((_, format)) if format.mime == MIME_AUDIO_UNKNOWN => AudioPlan::None,
                Some((index, format))
                    if format.mime == MIME_AUDIO_AAC || format.mime == MIME_AUDIO_MPEG =>
                {
                    AudioPlan::Passthrough { index, format }
                }
                Some((index, format)) => AudioPlan::Reencode { index, format },
                None => AudioPlan::None,
            }
        };

        Ok(Self { video, audio })
    }

    #[must_use]
    pub fn branch(&self) -> Branch {
        match &self.video {
            Some(video) if video.reencode => Branch::Transcode,
            _ => Branch::Copy,
        }
    }
}
