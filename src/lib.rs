mod annexb_source;
mod audio;
mod bitstream;
mod contract;
mod copy;
mod file_backend;
mod file_sink;
mod orchestrator;
mod packer;
mod photo;
mod plan;
mod progress;
mod request;
mod session;
mod timeline;
mod tracks;
mod transcode;
mod video_output;

pub use annexb_source::ElementaryStreamSource;
pub use audio::AudioPassthrough;
pub use bitstream::{
    AccessUnit, ParameterSetCache, StatefulBitstreamAssembler, find_four_byte_start_codes,
    length_prefixed_nal_ranges, length_prefixed_to_annexb, rewrite_annexb_to_length_prefixed,
    skip_leading_bytes, split_parameter_sets, spurious_leading_nal_len,
};
pub use contract::{
    AudioReencodeConfig, AudioReencoder, BufferFlags, BufferInfo, Codec, CodecDriver, CodecError,
    CodecRole, CodecStatus, CompositionMode, ConvertListener, Dimensions, DownscaleFilter,
    FrameBridge, FrameBridgeConfig, MIME_AUDIO_AAC, MIME_AUDIO_MPEG, MIME_AUDIO_UNKNOWN,
    MIME_VIDEO_AVC, MIME_VIDEO_HEVC, MediaBackend, MediaKind, MuxSink, MuxTrack, PayloadLayout,
    Rotation, SampleSource, SinkConfig, SurfaceHandle, TrackFormat, TranscodeError,
};
pub use file_backend::FileBackend;
pub use file_sink::AnnexBFileSink;
pub use orchestrator::{ConvertOutcome, ConvertState, Transcoder};
pub use packer::{AnnexBPacker, SamplePacker};
pub use plan::{
    AudioPlan, Branch, PHOTO_I_FRAME_INTERVAL_SECS, Pacing, ResolvedPlan, TrackPlan, TrimWindow,
    VIDEO_I_FRAME_INTERVAL_SECS, VideoTrackPlan,
};
pub use progress::Progress;
pub use request::{CropState, OverlayState, TranscodeRequest, TranscoderConfig};
pub use session::{CodecSession, Decoder, Encoder, Role};
pub use timeline::{FrameAction, FrameTimeline, FrameVerdict};
pub use tracks::{MuxTracks, SampleBuffer, find_track};
pub use video_output::{EncoderPoll, VideoOutput};
