use tracing::{debug, info};

use crate::contract::{CompositionMode, FrameBridgeConfig, MediaBackend, TranscodeError};
use crate::orchestrator::{AttemptContext, AttemptResources, ConvertState, require};
use crate::session::CodecSession;
use crate::video_output::{EncoderPoll, VideoOutput};

/// Encodes a still image, with its overlay animation, as a video of the
/// requested duration. No decoder takes part.
pub(crate) fn run<B: MediaBackend + ?Sized>(
    backend: &B,
    ctx: &mut AttemptContext<'_>,
    res: &mut AttemptResources,
) -> Result<(), TranscodeError> {
    let request = ctx.request;
    let plan = ctx.plan;

    info!(
        dims = %plan.photo_dims,
        bitrate = plan.photo_bitrate,
        duration_us = request.duration_us,
        frames = plan.photo_frame_count,
        "creating photo encoder"
    );
    let encoder = res
        .encoder
        .insert(CodecSession::new(backend.create_encoder(plan.target_codec)?));
    encoder.configure(&plan.photo_encoder_format(), None)?;
    let encoder_surface = encoder.create_input_surface()?;
    encoder.start()?;

    res.bridge = Some(backend.create_frame_bridge(FrameBridgeConfig {
        mode: CompositionMode::Photo,
        photo_path: Some(request.source_path.clone()),
        encoder_surface,
        target: plan.photo_dims,
        source: request.source_dims,
        rotation: request.rotation,
        crop: None,
        overlay: request.overlay.clone(),
        frame_rate: plan.frame_rate,
    })?);

    let mut output = VideoOutput::new(
        plan.target_codec,
        plan.photo_dims,
        plan.encoder_poll_timeout,
        ctx.config.strip_spurious_leading_nal,
    );
    let AttemptResources {
        sink,
        encoder,
        bridge,
        tracks,
        ..
    } = res;
    let sink = require(sink, "sink")?;
    let bridge = require(bridge, "frame bridge")?;
    let encoder = encoder
        .as_mut()
        .ok_or_else(|| TranscodeError::Unsupported("encoder was not acquired".to_string()))?;

    let mut frames_presented = 0u64;
    let mut frames_done = false;
    let mut output_done = false;

    ctx.progress.check_canceled()?;
    ctx.enter(ConvertState::Running);

    while !output_done {
        ctx.progress.check_canceled()?;

        let mut frames_available = !frames_done;
        let mut encoder_output_available = true;
        while frames_available || encoder_output_available {
            ctx.progress.check_canceled()?;

            match output.drain_encoder(encoder, sink, tracks, &mut ctx.progress)? {
                EncoderPoll::TryAgain => encoder_output_available = false,
                EncoderPoll::EndOfStream => {
                    output_done = true;
                    break;
                }
                EncoderPoll::Handled => continue,
            }

            if frames_done {
                frames_available = false;
                continue;
            }

            bridge.draw_composed_frame()?;
            bridge.set_presentation_time(plan.photo_frame_time_ns(frames_presented))?;
            bridge.swap_buffers()?;
            frames_presented += 1;

            if frames_presented >= plan.photo_frame_count {
                frames_done = true;
                frames_available = false;
                ctx.enter(ConvertState::Draining);
                debug!(frames_presented, "all photo frames presented");
                encoder.signal_end_of_input()?;
            }
        }
    }

    info!(frames_presented, "photo encode finished");
    Ok(())
}
