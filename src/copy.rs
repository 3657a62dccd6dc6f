use tracing::{debug, info, warn};

use crate::bitstream::rewrite_annexb_to_length_prefixed;
use crate::contract::{
    BufferFlags, BufferInfo, MediaKind, MuxSink, MuxTrack, PayloadLayout, TranscodeError,
};
use crate::orchestrator::{AttemptContext, AttemptResources, ConvertState, require};
use crate::plan::{AudioPlan, TrackPlan};
use crate::progress::Progress;
use crate::tracks::SampleBuffer;

/// Sample read before the zero point was known.
struct HeldSample {
    track: MuxTrack,
    pts: i64,
    flags: BufferFlags,
    data: Vec<u8>,
}

/// Remuxes the source without touching a codec. Video start codes are
/// rewritten to length prefixes; audio is copied verbatim.
///
/// A trimmed copy is rebased to the first video sample after the seek, which
/// is the sync frame. Audio stored ahead of it in container order is held
/// back until that sample arrives so the sync frame is never dropped.
pub(crate) fn run(
    ctx: &mut AttemptContext<'_>,
    res: &mut AttemptResources,
    track_plan: &TrackPlan,
) -> Result<(), TranscodeError> {
    let plan = ctx.plan;
    let audio = match &track_plan.audio {
        AudioPlan::Passthrough { index, format } | AudioPlan::Reencode { index, format } => {
            Some((*index, format))
        }
        AudioPlan::None => None,
    };
    let has_video = track_plan.video.is_some();
    if !has_video && audio.is_none() {
        warn!("source has no copyable tracks");
        return Ok(());
    }

    let mut routes: Vec<(usize, MuxTrack, bool)> = Vec::with_capacity(2);
    let mut max_input_size = 0usize;
    let sink = require(&mut res.sink, "sink")?;
    if let Some(video) = &track_plan.video {
        let track = res.tracks.register(sink, &video.format, MediaKind::Video)?;
        routes.push((video.index, track, true));
        max_input_size = max_input_size.max(video.format.max_input_size.unwrap_or(0));
    }
    if let Some((index, format)) = audio {
        let track = res.tracks.register(sink, format, MediaKind::Audio)?;
        routes.push((index, track, false));
        max_input_size = max_input_size.max(format.max_input_size.unwrap_or(0));
    }
    for &(index, _, _) in &routes {
        res.select_track(index)?;
    }

    let source = require(&mut res.source, "sample source")?;
    source.seek_to_previous_sync(plan.window.start_us)?;
    let sink = require(&mut res.sink, "sink")?;

    let capacity = if max_input_size == 0 {
        ctx.config.fallback_audio_buffer
    } else {
        max_input_size
    };
    let mut buffer = SampleBuffer::with_capacity(capacity);
    let mut origin_us: Option<i64> = (plan.window.start_us <= 0).then_some(0);
    let mut held: Vec<HeldSample> = Vec::new();
    let mut samples = 0u64;

    ctx.progress.check_canceled()?;
    ctx.enter(ConvertState::Running);

    loop {
        ctx.progress.check_canceled()?;

        let Some(index) = source.sample_track_index() else {
            break;
        };
        let Some(&(_, mux_track, is_video)) = routes.iter().find(|route| route.0 == index) else {
            source.advance();
            continue;
        };
        let Some(size) = buffer.read_from(source)? else {
            break;
        };

        if size > 0 {
            let pts = source.sample_time_us();
            if plan.window.is_past_end(pts) {
                debug!(pts, "reached end of trim window");
                break;
            }
            if is_video {
                rewrite_annexb_to_length_prefixed(&mut buffer.bytes_mut()[..size]);
            }
            let flags = source.sample_flags();
            let origin = match origin_us {
                Some(origin) => origin,
                None if is_video || !has_video => {
                    debug!(origin_us = pts, held = held.len(), "anchored copy timeline");
                    origin_us = Some(pts);
                    for sample in held.drain(..) {
                        samples += write_rebased(
                            sink,
                            &mut ctx.progress,
                            sample.track,
                            &sample.data,
                            sample.pts - pts,
                            sample.flags,
                        )?;
                    }
                    pts
                }
                None => {
                    held.push(HeldSample {
                        track: mux_track,
                        pts,
                        flags,
                        data: buffer.bytes()[..size].to_vec(),
                    });
                    source.advance();
                    continue;
                }
            };
            samples += write_rebased(
                sink,
                &mut ctx.progress,
                mux_track,
                &buffer.bytes()[..size],
                pts - origin,
                flags,
            )?;
        }

        source.advance();
    }

    if origin_us.is_none() && !held.is_empty() {
        warn!(held = held.len(), "no video sample in copy window, anchoring on audio");
        let origin = held.iter().map(|sample| sample.pts).min().unwrap_or(0);
        for sample in held.drain(..) {
            samples += write_rebased(
                sink,
                &mut ctx.progress,
                sample.track,
                &sample.data,
                sample.pts - origin,
                sample.flags,
            )?;
        }
    }

    ctx.enter(ConvertState::Draining);
    info!(samples, origin_us = ?origin_us, "copy finished");
    Ok(())
}

/// Writes one framed sample at `output_us`; samples before the zero point are
/// dropped. Returns the number of samples written.
fn write_rebased(
    sink: &mut dyn MuxSink,
    progress: &mut Progress<'_>,
    track: MuxTrack,
    data: &[u8],
    output_us: i64,
    flags: BufferFlags,
) -> Result<u64, TranscodeError> {
    if output_us < 0 {
        return Ok(0);
    }
    let info = BufferInfo::new(data.len(), output_us, flags);
    let written = sink.write_sample(track, data, &info, PayloadLayout::Framed)?;
    progress.on_write(written, output_us);
    Ok(1)
}
