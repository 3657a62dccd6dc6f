use tracing::debug;

use crate::contract::{
    BufferInfo, MuxSink, MuxTrack, PayloadLayout, SampleSource, TrackFormat, TranscodeError,
};
use crate::plan::TrimWindow;
use crate::progress::Progress;
use crate::tracks::SampleBuffer;

/// Copies compressed audio samples from the shared source straight into the
/// sink, rebased so the trim start lands at zero.
#[derive(Debug)]
pub struct AudioPassthrough {
    source_track: usize,
    mux_track: MuxTrack,
    buffer: SampleBuffer,
    window: TrimWindow,
}

impl AudioPassthrough {
    pub fn new(
        source_track: usize,
        mux_track: MuxTrack,
        format: &TrackFormat,
        fallback_buffer: usize,
        window: TrimWindow,
    ) -> Self {
        let capacity = format
            .max_input_size
            .filter(|size| *size > 0)
            .unwrap_or(fallback_buffer);
        debug!(source_track, %mux_track, capacity, "audio pass-through ready");
        Self {
            source_track,
            mux_track,
            buffer: SampleBuffer::with_capacity(capacity),
            window,
        }
    }

    #[must_use]
    pub fn source_track(&self) -> usize {
        self.source_track
    }

    /// Copies the source's current sample and advances past it. Returns
    /// `false` when the source had nothing left to read.
    pub fn copy_current(
        &mut self,
        source: &mut dyn SampleSource,
        sink: &mut dyn MuxSink,
        progress: &mut Progress<'_>,
    ) -> Result<bool, TranscodeError> {
        let Some(size) = self.buffer.read_from(source)? else {
            return Ok(false);
        };
        let pts = source.sample_time_us();
        let flags = source.sample_flags();
        source.advance();

        if size > 0 && self.window.contains(pts) {
            let info = BufferInfo::new(size, pts - self.window.start_us, flags);
            let written =
                sink.write_sample(self.mux_track, self.buffer.bytes(), &info, PayloadLayout::Framed)?;
            progress.on_write(written, info.presentation_time_us);
        }
        Ok(true)
    }
}
