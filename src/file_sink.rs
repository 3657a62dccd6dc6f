use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::bitstream::length_prefixed_to_annexb;
use crate::contract::{
    BufferInfo, MediaKind, MuxSink, MuxTrack, PayloadLayout, SinkConfig, TrackFormat,
    TranscodeError,
};

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const VIDEO_TRACK: MuxTrack = MuxTrack(0);

/// Writes the video track as a raw Annex-B elementary stream. Parameter sets
/// from the track format go first, followed by every sample in write order.
#[derive(Debug)]
pub struct AnnexBFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    has_video: bool,
    bytes_written: u64,
    last_video_pts_us: i64,
}

impl AnnexBFileSink {
    pub fn create(config: &SinkConfig) -> Result<Self, TranscodeError> {
        let file = File::create(&config.destination)?;
        info!(
            path = %config.destination.display(),
            dims = %config.dims,
            is_secret = config.is_secret,
            "created elementary stream sink"
        );
        Ok(Self {
            path: config.destination.clone(),
            writer: Some(BufWriter::new(file)),
            has_video: false,
            bytes_written: 0,
            last_video_pts_us: 0,
        })
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TranscodeError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            TranscodeError::Mux(format!("{} is already finalized", self.path.display()))
        })?;
        writer.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn write_parameter_set(&mut self, csd: Option<&[u8]>) -> Result<(), TranscodeError> {
        let Some(csd) = csd.filter(|csd| !csd.is_empty()) else {
            return Ok(());
        };
        if !csd.starts_with(&START_CODE) {
            self.write_all(&START_CODE)?;
        }
        self.write_all(csd)
    }
}

impl MuxSink for AnnexBFileSink {
    fn add_track(
        &mut self,
        format: &TrackFormat,
        kind: MediaKind,
    ) -> Result<MuxTrack, TranscodeError> {
        if kind == MediaKind::Audio {
            return Err(TranscodeError::Unsupported(
                "elementary stream output carries video only".to_string(),
            ));
        }
        if self.has_video {
            return Err(TranscodeError::Mux(
                "elementary stream output already has a video track".to_string(),
            ));
        }
        self.write_parameter_set(format.csd0.as_deref())?;
        self.write_parameter_set(format.csd1.as_deref())?;
        self.has_video = true;
        debug!(%format, header_bytes = self.bytes_written, "video track added");
        Ok(VIDEO_TRACK)
    }

    fn write_sample(
        &mut self,
        track: MuxTrack,
        data: &[u8],
        info: &BufferInfo,
        layout: PayloadLayout,
    ) -> Result<u64, TranscodeError> {
        if track != VIDEO_TRACK || !self.has_video {
            return Err(TranscodeError::Mux(format!("unknown output {track}")));
        }
        let payload = info.payload(data)?;
        if payload.is_empty() || info.flags.is_codec_config() {
            return Ok(0);
        }
        match layout {
            PayloadLayout::AnnexB => self.write_all(payload)?,
            PayloadLayout::Framed => {
                let annexb = length_prefixed_to_annexb(payload)?;
                self.write_all(&annexb)?;
            }
        }
        self.last_video_pts_us = self.last_video_pts_us.max(info.presentation_time_us);
        Ok(self.bytes_written)
    }

    fn finalize(&mut self) -> Result<(), TranscodeError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        info!(
            path = %self.path.display(),
            bytes = self.bytes_written,
            last_video_pts_us = self.last_video_pts_us,
            "elementary stream finalized"
        );
        Ok(())
    }

    fn last_frame_timestamp_us(&self, _track: MuxTrack) -> i64 {
        self.last_video_pts_us
    }
}
