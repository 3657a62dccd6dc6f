use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, fmt::Display};

use crate::request::{CropState, OverlayState};

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_VIDEO_HEVC: &str = "video/hevc";
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIME_AUDIO_MPEG: &str = "audio/mpeg";
pub const MIME_AUDIO_UNKNOWN: &str = "audio/unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
}

impl Codec {
    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::H264 => MIME_VIDEO_AVC,
            Self::Hevc => MIME_VIDEO_HEVC,
        }
    }

    #[must_use]
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            MIME_VIDEO_AVC => Some(Self::H264),
            MIME_VIDEO_HEVC => Some(Self::Hevc),
            _ => None,
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    #[must_use]
    pub fn longest_side(self) -> u32 {
        self.width.get().max(self.height.get())
    }

    #[must_use]
    pub fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Result<Self, TranscodeError> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(TranscodeError::InvalidRequest(format!(
                "rotation must be a multiple of 90 degrees, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn degrees(self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    #[must_use]
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// Codec-level description of a track, as reported by a source, negotiated by
/// a codec or handed to a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackFormat {
    pub mime: String,
    pub dims: Option<Dimensions>,
    pub bitrate: Option<u32>,
    pub frame_rate: Option<u32>,
    pub i_frame_interval_secs: Option<u32>,
    pub max_input_size: Option<usize>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    pub duration_us: Option<i64>,
    /// First codec-specific data buffer (SPS for H.264).
    pub csd0: Option<Vec<u8>>,
    /// Second codec-specific data buffer (PPS for H.264).
    pub csd1: Option<Vec<u8>>,
    /// The encoder repeats csd0+csd1 in front of every keyframe.
    pub prepend_header_to_sync_frames: bool,
}

impl TrackFormat {
    #[must_use]
    pub fn video(mime: impl Into<String>, dims: Dimensions) -> Self {
        Self {
            mime: mime.into(),
            dims: Some(dims),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        if self.mime.starts_with("video/") {
            Some(MediaKind::Video)
        } else if self.mime.starts_with("audio/") {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    /// Bytes an encoder duplicates in front of each keyframe, or 0 when the
    /// format does not declare the duplication.
    #[must_use]
    pub fn prepended_header_len(&self) -> usize {
        if !self.prepend_header_to_sync_frames {
            return 0;
        }
        self.csd0.as_ref().map_or(0, Vec::len) + self.csd1.as_ref().map_or(0, Vec::len)
    }
}

impl Display for TrackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackFormat(mime={}", self.mime)?;
        if let Some(dims) = self.dims {
            write!(f, ", dims={dims}")?;
        }
        if let Some(bitrate) = self.bitrate {
            write!(f, ", bitrate={bitrate}")?;
        }
        if let Some(rate) = self.sample_rate {
            write!(f, ", sample_rate={rate}")?;
        }
        write!(
            f,
            ", csd0={}, csd1={}, prepend_header={})",
            self.csd0.as_ref().map_or(0, Vec::len),
            self.csd1.as_ref().map_or(0, Vec::len),
            self.prepend_header_to_sync_frames
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    pub const END_OF_STREAM: Self = Self(1 << 2);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn is_key_frame(self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    #[must_use]
    pub fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    #[must_use]
    pub fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

/// Placement and timing of one sample inside a codec or source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    #[must_use]
    pub fn new(size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            offset: 0,
            size,
            presentation_time_us,
            flags,
        }
    }

    #[must_use]
    pub fn end_of_stream() -> Self {
        Self::new(0, 0, BufferFlags::END_OF_STREAM)
    }

    /// The bytes of `data` this info describes.
    pub fn payload<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], TranscodeError> {
        self.offset
            .checked_add(self.size)
            .and_then(|end| data.get(self.offset..end))
            .ok_or_else(|| {
                TranscodeError::Mux(format!(
                    "sample region {}+{} exceeds buffer of {} bytes",
                    self.offset,
                    self.size,
                    data.len()
                ))
            })
    }
}

/// Result of one non-blocking output dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStatus {
    TryAgainLater,
    OutputFormatChanged,
    BuffersChanged,
    Sample { index: usize, info: BufferInfo },
    /// A vendor status outside the recognized set.
    Error(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecRole {
    Decoder,
    Encoder,
}

impl Display for CodecRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoder => f.write_str("decoder"),
            Self::Encoder => f.write_str("encoder"),
        }
    }
}

/// Opaque handle to a GPU surface shared between a codec and the frame bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MuxTrack(pub usize);

impl Display for MuxTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// How a sample payload handed to [`MuxSink::write_sample`] is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLayout {
    /// Start-code delimited NAL units; the sink rewrites them to length prefixes.
    AnnexB,
    /// Ready for the container as-is.
    Framed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionMode {
    Photo,
    Video,
}

/// Parameters for a scaling shader that softens aggressive downscales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownscaleFilter {
    pub source: Dimensions,
    pub target: Dimensions,
    pub kernel_radius: u32,
}

#[derive(Debug, Clone)]
pub struct FrameBridgeConfig {
    pub mode: CompositionMode,
    /// Still image for [`CompositionMode::Photo`].
    pub photo_path: Option<PathBuf>,
    pub encoder_surface: SurfaceHandle,
    pub target: Dimensions,
    pub source: Dimensions,
    pub rotation: Rotation,
    pub crop: Option<CropState>,
    pub overlay: OverlayState,
    pub frame_rate: u32,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub destination: PathBuf,
    pub dims: Dimensions,
    pub is_secret: bool,
}

#[derive(Debug, Clone)]
pub struct AudioReencodeConfig {
    pub source_path: PathBuf,
    pub track_index: usize,
    pub format: TrackFormat,
    pub start_us: i64,
    pub end_us: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("illegal codec state: {0}")]
    IllegalState(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid buffer index {0}")]
    InvalidBuffer(usize),
    #[error("driver error: {0}")]
    Driver(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("conversion canceled")]
    Canceled,
    #[error("{role} failure: {source}")]
    Codec {
        role: CodecRole,
        #[source]
        source: CodecError,
    },
    #[error("unexpected status from {role} dequeue: {code}")]
    UnexpectedStatus { role: CodecRole, code: i32 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("missing {0} track")]
    MissingTrack(MediaKind),
    #[error("source error: {0}")]
    Source(String),
    #[error("mux error: {0}")]
    Mux(String),
    #[error("frame bridge error: {0}")]
    Bridge(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub(crate) fn codec(role: CodecRole) -> impl FnOnce(CodecError) -> Self {
        move |source| Self::Codec { role, source }
    }

    /// Encoder session-state faults are the driver quirk a longer poll
    /// timeout works around.
    #[must_use]
    pub fn is_transient_codec_fault(&self) -> bool {
        matches!(
            self,
            Self::Codec {
                role: CodecRole::Encoder,
                source: CodecError::IllegalState(_),
            }
        )
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Sequential reader over a demultiplexed container.
pub trait SampleSource {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Result<TrackFormat, TranscodeError>;

    fn select_track(&mut self, index: usize) -> Result<(), TranscodeError>;

    fn unselect_track(&mut self, index: usize) -> Result<(), TranscodeError>;

    /// Positions every selected track at the last sync sample at or before `time_us`.
    fn seek_to_previous_sync(&mut self, time_us: i64) -> Result<(), TranscodeError>;

    /// Copies the current sample into `buf`; `None` once no samples remain.
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TranscodeError>;

    /// Size of the current sample, when the source can tell ahead of a read.
    fn sample_size(&self) -> Option<usize> {
        None
    }

    fn sample_track_index(&self) -> Option<usize>;

    fn sample_time_us(&self) -> i64;

    fn sample_flags(&self) -> BufferFlags;

    /// Moves to the next sample; `false` once the source is exhausted.
    fn advance(&mut self) -> bool;

    fn release(&mut self) {}
}

/// Container writer fed by the pipeline.
pub trait MuxSink {
    fn add_track(&mut self, format: &TrackFormat, kind: MediaKind)
    -> Result<MuxTrack, TranscodeError>;

    /// Writes `info.payload(data)`. Returns the bytes flushed to the
    /// destination so far, or 0 when nothing new reached it.
    fn write_sample(
        &mut self,
        track: MuxTrack,
        data: &[u8],
        info: &BufferInfo,
        layout: PayloadLayout,
    ) -> Result<u64, TranscodeError>;

    fn finalize(&mut self) -> Result<(), TranscodeError>;

    fn last_frame_timestamp_us(&self, track: MuxTrack) -> i64;
}

/// Off-screen compositor between the decoder output and the encoder input surface.
pub trait FrameBridge {
    /// Surface the decoder renders into; `None` in photo mode.
    fn decoder_surface(&self) -> Option<SurfaceHandle>;

    fn change_composition_shader(&mut self, filter: DownscaleFilter)
    -> Result<(), TranscodeError>;

    /// Blocks until the decoder has delivered a new image to the surface.
    fn await_new_image(&mut self) -> Result<(), TranscodeError>;

    fn draw_composed_frame(&mut self) -> Result<(), TranscodeError>;

    fn set_presentation_time(&mut self, time_ns: i64) -> Result<(), TranscodeError>;

    fn swap_buffers(&mut self) -> Result<(), TranscodeError>;

    fn release(&mut self) {}
}

/// Self-contained decode+encode pipeline for an audio track.
pub trait AudioReencoder {
    fn output_format(&self) -> TrackFormat;

    /// Advances the pipeline by one step; returns `true` once all audio is written.
    fn step(&mut self, sink: &mut dyn MuxSink, track: MuxTrack) -> Result<bool, TranscodeError>;

    fn release(&mut self) {}
}

/// One hardware decoder or encoder instance.
pub trait CodecDriver {
    fn configure(
        &mut self,
        format: &TrackFormat,
        surface: Option<SurfaceHandle>,
    ) -> Result<(), CodecError>;

    fn create_input_surface(&mut self) -> Result<SurfaceHandle, CodecError> {
        Err(CodecError::Unsupported(
            "input surfaces are not supported by this codec".to_string(),
        ))
    }

    fn start(&mut self) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;

    fn release(&mut self);

    /// Drops every queued input and pending output.
    fn flush(&mut self) -> Result<(), CodecError>;

    fn output_format(&self) -> Result<TrackFormat, CodecError>;

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError>;

    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> Result<(), CodecError>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<CodecStatus, CodecError>;

    fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError>;

    /// Returns an output buffer to the codec, rendering it to the configured
    /// surface first when `render` is set.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError>;

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError>;
}

/// Factory for every collaborator of one conversion attempt.
pub trait MediaBackend {
    fn open_source(&self, path: &std::path::Path) -> Result<Box<dyn SampleSource>, TranscodeError>;

    fn create_sink(&self, config: &SinkConfig) -> Result<Box<dyn MuxSink>, TranscodeError>;

    fn create_decoder(&self, format: &TrackFormat) -> Result<Box<dyn CodecDriver>, TranscodeError> {
        Err(TranscodeError::Unsupported(format!(
            "no hardware decoder for {}",
            format.mime
        )))
    }

    fn create_encoder(&self, codec: Codec) -> Result<Box<dyn CodecDriver>, TranscodeError> {
        Err(TranscodeError::Unsupported(format!(
            "no hardware encoder for {codec}"
        )))
    }

    fn create_frame_bridge(
        &self,
        _config: FrameBridgeConfig,
    ) -> Result<Box<dyn FrameBridge>, TranscodeError> {
        Err(TranscodeError::Unsupported(
            "frame bridge is not available".to_string(),
        ))
    }

    fn create_audio_reencoder(
        &self,
        config: AudioReencodeConfig,
    ) -> Result<Box<dyn AudioReencoder>, TranscodeError> {
        Err(TranscodeError::Unsupported(format!(
            "no audio re-encoder for {}",
            config.format.mime
        )))
    }
}

/// Progress sink and cancellation probe, polled on the conversion thread.
pub trait ConvertListener {
    fn did_write_data(&self, bytes_written: u64, progress: f32);

    fn is_canceled(&self) -> bool {
        false
    }
}
