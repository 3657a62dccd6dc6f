use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::bitstream::StatefulBitstreamAssembler;
use crate::contract::{BufferFlags, Codec, Dimensions, SampleSource, TrackFormat, TranscodeError};
use crate::packer::{AnnexBPacker, SamplePacker};

const READ_CHUNK_BYTES: usize = 64 * 1024;
const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone)]
struct Sample {
    data: Vec<u8>,
    time_us: i64,
    is_keyframe: bool,
}

/// Single-track [`SampleSource`] over a raw Annex-B elementary stream.
///
/// Each access unit becomes one sample with start codes kept in place.
/// Elementary streams carry no timing, so sample `i` is stamped at
/// `i / frame_rate` seconds.
#[derive(Debug)]
pub struct ElementaryStreamSource {
    format: TrackFormat,
    samples: Vec<Sample>,
    cursor: usize,
    selected: bool,
}

impl ElementaryStreamSource {
    pub fn open(
        path: &Path,
        codec: Codec,
        frame_rate: u32,
        dims: Dimensions,
    ) -> Result<Self, TranscodeError> {
        let data = fs::read(path)?;
        info!(path = %path.display(), bytes = data.len(), %codec, "opened elementary stream");
        Self::from_bytes(&data, codec, frame_rate, dims)
    }

    pub fn from_bytes(
        data: &[u8],
        codec: Codec,
        frame_rate: u32,
        dims: Dimensions,
    ) -> Result<Self, TranscodeError> {
        let fps = i64::from(frame_rate.max(1));
        let mut assembler = StatefulBitstreamAssembler::with_codec(codec);
        let mut access_units = Vec::new();
        for chunk in data.chunks(READ_CHUNK_BYTES) {
            access_units.extend(assembler.push_chunk(chunk, codec));
        }
        access_units.extend(assembler.flush()?);
        if access_units.is_empty() {
            return Err(TranscodeError::Source(
                "elementary stream holds no access units".to_string(),
            ));
        }

        let mut packer = AnnexBPacker;
        let samples: Vec<Sample> = access_units
            .iter()
            .zip(0i64..)
            .map(|(au, i)| Sample {
                data: packer.pack(au),
                time_us: i * 1_000_000 / fps,
                is_keyframe: au.is_keyframe,
            })
            .collect();

        let mut format = TrackFormat::video(codec.mime(), dims);
        format.frame_rate = Some(frame_rate.max(1));
        format.max_input_size = samples.iter().map(|s| s.data.len()).max();
        format.duration_us = Some(samples.len() as i64 * 1_000_000 / fps);
        match assembler.parameter_sets().required_for_codec(codec) {
            Some(sets) => match codec {
                Codec::H264 => {
                    format.csd0 = sets.first().map(|sps| with_start_code(sps));
                    format.csd1 = sets.get(1).map(|pps| with_start_code(pps));
                }
                Codec::Hevc => {
                    format.csd0 = Some(sets.iter().flat_map(|set| with_start_code(set)).collect());
                }
            },
            None => warn!(%codec, "stream carries no complete parameter sets"),
        }

        debug!(
            samples = samples.len(),
            keyframes = samples.iter().filter(|s| s.is_keyframe).count(),
            %format,
            "indexed elementary stream"
        );
        Ok(Self {
            format,
            samples,
            cursor: 0,
            selected: false,
        })
    }

    fn current(&self) -> Option<&Sample> {
        if self.selected {
            self.samples.get(self.cursor)
        } else {
            None
        }
    }
}

impl SampleSource for ElementaryStreamSource {
    fn track_count(&self) -> usize {
        1
    }

    fn track_format(&self, index: usize) -> Result<TrackFormat, TranscodeError> {
        check_track(index)?;
        Ok(self.format.clone())
    }

    fn select_track(&mut self, index: usize) -> Result<(), TranscodeError> {
        check_track(index)?;
        self.selected = true;
        Ok(())
    }

    fn unselect_track(&mut self, index: usize) -> Result<(), TranscodeError> {
        check_track(index)?;
        self.selected = false;
        Ok(())
    }

    fn seek_to_previous_sync(&mut self, time_us: i64) -> Result<(), TranscodeError> {
        self.cursor = self
            .samples
            .iter()
            .rposition(|s| s.is_keyframe && s.time_us <= time_us)
            .unwrap_or(0);
        debug!(time_us, cursor = self.cursor, "seeked to sync sample");
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TranscodeError> {
        let Some(sample) = self.current() else {
            return Ok(None);
        };
        let size = sample.data.len();
        let buf_len = buf.len();
        let dst = buf.get_mut(..size).ok_or_else(|| {
            TranscodeError::Source(format!(
                "sample of {size} bytes does not fit a {buf_len} byte buffer"
            ))
        })?;
        dst.copy_from_slice(&sample.data);
        Ok(Some(size))
    }

    fn sample_size(&self) -> Option<usize> {
        self.current().map(|s| s.data.len())
    }

    fn sample_track_index(&self) -> Option<usize> {
        self.current().map(|_| 0)
    }

    fn sample_time_us(&self) -> i64 {
        self.current().map_or(-1, |s| s.time_us)
    }

    fn sample_flags(&self) -> BufferFlags {
        match self.current() {
            Some(s) if s.is_keyframe => BufferFlags::KEY_FRAME,
            _ => BufferFlags::NONE,
        }
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.samples.len() {
            self.cursor += 1;
        }
        self.cursor < self.samples.len()
    }
}

fn check_track(index: usize) -> Result<(), TranscodeError> {
    if index == 0 {
        Ok(())
    } else {
        Err(TranscodeError::Source(format!(
            "elementary stream has one track, got index {index}"
        )))
    }
}

fn with_start_code(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len() + START_CODE.len());
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(nal);
    out
}
