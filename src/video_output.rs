use std::time::Duration;

use tracing::{debug, warn};

use crate::bitstream::{skip_leading_bytes, split_parameter_sets, spurious_leading_nal_len};
use crate::contract::{
    BufferInfo, Codec, CodecRole, CodecStatus, Dimensions, MediaKind, MuxSink, PayloadLayout,
    TrackFormat, TranscodeError,
};
use crate::progress::Progress;
use crate::session::{CodecSession, Encoder};
use crate::tracks::MuxTracks;

/// Outcome of one encoder output poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderPoll {
    TryAgain,
    Handled,
    EndOfStream,
}

/// Moves encoded video from the encoder into the sink, registering the video
/// track on the first usable format and compensating for in-band headers.
#[derive(Debug)]
pub struct VideoOutput {
    codec: Codec,
    dims: Dimensions,
    poll_timeout: Duration,
    prepend_header_size: usize,
    first_keyframe_pending: bool,
    strip_spurious_leading_nal: bool,
}

impl VideoOutput {
    pub fn new(
        codec: Codec,
        dims: Dimensions,
        poll_timeout: Duration,
        strip_spurious_leading_nal: bool,
    ) -> Self {
        Self {
            codec,
            dims,
            poll_timeout,
            prepend_header_size: 0,
            first_keyframe_pending: true,
            strip_spurious_leading_nal,
        }
    }

    #[must_use]
    pub fn prepend_header_size(&self) -> usize {
        self.prepend_header_size
    }

    pub fn drain_encoder(
        &mut self,
        encoder: &mut CodecSession<Encoder>,
        sink: &mut dyn MuxSink,
        tracks: &mut MuxTracks,
        progress: &mut Progress<'_>,
    ) -> Result<EncoderPoll, TranscodeError> {
        match encoder.poll_output(self.poll_timeout)? {
            CodecStatus::TryAgainLater => Ok(EncoderPoll::TryAgain),
            CodecStatus::BuffersChanged => Ok(EncoderPoll::Handled),
            CodecStatus::OutputFormatChanged => {
                if tracks.get(MediaKind::Video).is_none() {
                    let format = encoder.output_format().cloned().ok_or_else(|| {
                        TranscodeError::Mux("encoder announced a format change without a format".to_string())
                    })?;
                    tracks.register(sink, &format, MediaKind::Video)?;
                    self.prepend_header_size = format.prepended_header_len();
                    if self.prepend_header_size != 0 {
                        debug!(
                            prepend_header_size = self.prepend_header_size,
                            "encoder repeats parameter sets before keyframes"
                        );
                    }
                }
                Ok(EncoderPoll::Handled)
            }
            CodecStatus::Sample { index, info } => {
                if info.size > 1 {
                    let data = encoder.output_buffer(index)?;
                    if info.flags.is_codec_config() {
                        if tracks.get(MediaKind::Video).is_none() {
                            let format = self.format_from_config(info.payload(data)?);
                            tracks.register(sink, &format, MediaKind::Video)?;
                        }
                    } else {
                        self.write_sample(data, info, sink, tracks, progress)?;
                    }
                }
                encoder.release_output(index, false)?;
                if info.flags.is_end_of_stream() {
                    debug!("encoder reached end of stream");
                    Ok(EncoderPoll::EndOfStream)
                } else {
                    Ok(EncoderPoll::Handled)
                }
            }
            CodecStatus::Error(code) => Err(TranscodeError::UnexpectedStatus {
                role: CodecRole::Encoder,
                code,
            }),
        }
    }

    fn write_sample(
        &mut self,
        data: &[u8],
        mut info: BufferInfo,
        sink: &mut dyn MuxSink,
        tracks: &MuxTracks,
        progress: &mut Progress<'_>,
    ) -> Result<(), TranscodeError> {
        let key_frame = info.flags.is_key_frame();
        if key_frame && self.prepend_header_size != 0 {
            skip_leading_bytes(&mut info, self.prepend_header_size);
        }
        if key_frame && self.first_keyframe_pending {
            self.first_keyframe_pending = false;
            if self.strip_spurious_leading_nal {
                if let Some(skip) = spurious_leading_nal_len(info.payload(data)?) {
                    debug!(skip, "dropping leading NAL unit from first keyframe");
                    skip_leading_bytes(&mut info, skip);
                }
            }
        }

        let track = tracks.get(MediaKind::Video).ok_or_else(|| {
            TranscodeError::Mux("encoded sample arrived before the video track was known".to_string())
        })?;
        let written = sink.write_sample(track, data, &info, PayloadLayout::AnnexB)?;
        progress.on_write(written, info.presentation_time_us);
        Ok(())
    }

    fn format_from_config(&self, csd: &[u8]) -> TrackFormat {
        let mut format = TrackFormat::video(self.codec.mime(), self.dims);
        match split_parameter_sets(csd) {
            Some((sps, pps)) => {
                debug!(sps = sps.len(), pps = pps.len(), "parameter sets taken from config buffer");
                format.csd0 = Some(sps);
                format.csd1 = Some(pps);
            }
            None => warn!(
                size = csd.len(),
                "no start code boundary in config buffer, registering track without parameter sets"
            ),
        }
        format
    }
}
