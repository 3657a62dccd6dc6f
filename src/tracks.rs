use tracing::{debug, info};

use crate::contract::{MediaKind, MuxSink, MuxTrack, SampleSource, TrackFormat, TranscodeError};

const GROWTH_SLACK: usize = 1024;

/// First track of `kind` in the source.
pub fn find_track(
    source: &dyn SampleSource,
    kind: MediaKind,
) -> Result<Option<(usize, TrackFormat)>, TranscodeError> {
    for index in 0..source.track_count() {
        let format = source.track_format(index)?;
        if format.kind() == Some(kind) {
            return Ok(Some((index, format)));
        }
    }
    Ok(None)
}

/// Sink track indices of one attempt. Each media kind is registered at most once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MuxTracks {
    video: Option<MuxTrack>,
    audio: Option<MuxTrack>,
}

impl MuxTracks {
    #[must_use]
    pub fn get(&self, kind: MediaKind) -> Option<MuxTrack> {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }

    pub fn register(
        &mut self,
        sink: &mut dyn MuxSink,
        format: &TrackFormat,
        kind: MediaKind,
    ) -> Result<MuxTrack, TranscodeError> {
        let slot = match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        };
        if let Some(existing) = slot {
            return Err(TranscodeError::Mux(format!(
                "{kind} track already registered as {existing}"
            )));
        }
        let track = sink.add_track(format, kind)?;
        info!(%kind, %track, %format, "registered output track");
        *slot = Some(track);
        Ok(track)
    }
}

/// Reusable read buffer that grows when the source announces a larger sample.
#[derive(Debug)]
pub struct SampleBuffer {
    data: Vec<u8>,
}

impl SampleBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Reads the current sample. `None` once the source has nothing left.
    pub fn read_from(
        &mut self,
        source: &mut dyn SampleSource,
    ) -> Result<Option<usize>, TranscodeError> {
        if let Some(size) = source.sample_size().filter(|size| *size > self.data.len()) {
            let grown = size + GROWTH_SLACK;
            debug!(from = self.data.len(), to = grown, "growing sample buffer");
            self.data.resize(grown, 0);
        }
        source.read_sample(&mut self.data)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
