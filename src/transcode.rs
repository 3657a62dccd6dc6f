use std::time::Duration;

use tracing::{debug, info, warn};

use crate::audio::AudioPassthrough;
use crate::contract::{
    AudioReencodeConfig, BufferFlags, BufferInfo, CodecRole, CodecStatus, CompositionMode,
    FrameBridge, FrameBridgeConfig, MediaBackend, MediaKind, SampleSource, TranscodeError,
};
use crate::orchestrator::{AttemptContext, AttemptResources, ConvertState, require};
use crate::plan::{AudioPlan, TrackPlan};
use crate::progress::Progress;
use crate::session::{CodecSession, Decoder};
use crate::timeline::{FrameAction, FrameTimeline};
use crate::video_output::{EncoderPoll, VideoOutput};

/// Full decode, compose and encode pipeline for the video track, with audio
/// either copied inline or re-encoded step by step.
pub(crate) fn run<B: MediaBackend + ?Sized>(
    backend: &B,
    ctx: &mut AttemptContext<'_>,
    res: &mut AttemptResources,
    track_plan: &TrackPlan,
) -> Result<(), TranscodeError> {
    let request = ctx.request;
    let plan = ctx.plan;
    let video = track_plan
        .video
        .as_ref()
        .ok_or(TranscodeError::MissingTrack(MediaKind::Video))?;
    let mut timeline = FrameTimeline::new(plan);

    res.select_track(video.index)?;
    require(&mut res.source, "sample source")?.seek_to_previous_sync(timeline.initial_seek_us())?;

    info!(
        dims = %plan.encoder_dims,
        bitrate = plan.transcode_bitrate,
        fps = plan.frame_rate,
        "creating video encoder"
    );
    let encoder = res
        .encoder
        .insert(CodecSession::new(backend.create_encoder(plan.target_codec)?));
    encoder.configure(&plan.video_encoder_format(), None)?;
    let encoder_surface = encoder.create_input_surface()?;
    encoder.start()?;

    let bridge = res.bridge.insert(backend.create_frame_bridge(FrameBridgeConfig {
        mode: CompositionMode::Video,
        photo_path: None,
        encoder_surface,
        target: request.target_dims,
        source: request.source_dims,
        rotation: request.rotation,
        crop: request.crop,
        overlay: request.overlay.clone(),
        frame_rate: plan.frame_rate,
    })?);
    if let Some(filter) = plan.downscale {
        debug!(kernel_radius = filter.kernel_radius, "installing downscale shader");
        bridge.change_composition_shader(filter)?;
    }
    let decoder_surface = bridge
        .decoder_surface()
        .ok_or_else(|| TranscodeError::Bridge("frame bridge has no decoder surface".to_string()))?;

    let decoder = res
        .decoder
        .insert(CodecSession::new(backend.create_decoder(&video.format)?));
    decoder.configure(&video.format, Some(decoder_surface))?;
    decoder.start()?;

    let mut passthrough = None;
    match &track_plan.audio {
        AudioPlan::Passthrough { index, format } => {
            let sink = require(&mut res.sink, "sink")?;
            let mux_track = res.tracks.register(sink, format, MediaKind::Audio)?;
            res.select_track(*index)?;
            require(&mut res.source, "sample source")?.seek_to_previous_sync(plan.window.start_us)?;
            passthrough = Some(AudioPassthrough::new(
                *index,
                mux_track,
                format,
                ctx.config.fallback_audio_buffer,
                plan.window,
            ));
        }
        AudioPlan::Reencode { index, format } => {
            let reencoder = res.audio.insert(backend.create_audio_reencoder(AudioReencodeConfig {
                source_path: request.source_path.clone(),
                track_index: *index,
                format: format.clone(),
                start_us: plan.window.start_us,
                end_us: plan.window.end_us,
            })?);
            let sink = require(&mut res.sink, "sink")?;
            res.tracks
                .register(sink, &reencoder.output_format(), MediaKind::Audio)?;
        }
        AudioPlan::None => {}
    }

    let mut output = VideoOutput::new(
        plan.target_codec,
        plan.encoder_dims,
        plan.encoder_poll_timeout,
        ctx.config.strip_spurious_leading_nal,
    );
    let AttemptResources {
        source,
        sink,
        decoder,
        encoder,
        bridge,
        audio,
        tracks,
        ..
    } = res;
    let source = require(source, "sample source")?;
    let sink = require(sink, "sink")?;
    let bridge = require(bridge, "frame bridge")?;
    let decoder = decoder
        .as_mut()
        .ok_or_else(|| TranscodeError::Unsupported("decoder was not acquired".to_string()))?;
    let encoder = encoder
        .as_mut()
        .ok_or_else(|| TranscodeError::Unsupported("encoder was not acquired".to_string()))?;
    let audio_track = tracks.get(MediaKind::Audio);
    let mut audio = audio.as_deref_mut().zip(audio_track);

    let poll = plan.decoder_poll_timeout;
    let mut audio_done = audio.is_none();
    let mut input_done = false;
    let mut decoder_done = false;
    let mut output_done = false;

    ctx.progress.check_canceled()?;
    ctx.enter(ConvertState::Running);

    while !output_done || !audio_done {
        ctx.progress.check_canceled()?;

        if let Some((reencoder, track)) = audio.as_mut() {
            if !audio_done {
                audio_done = reencoder.step(sink, *track)?;
            }
        }
        if output_done {
            continue;
        }

        if !input_done {
            let mut end_of_input = false;
            match source.sample_track_index() {
                Some(index) if index == video.index => {
                    if feed_decoder(source, decoder, poll)? {
                        input_done = true;
                        debug!("source exhausted, decoder input closed");
                    }
                }
                Some(index) if passthrough.as_ref().is_some_and(|p| p.source_track() == index) => {
                    if let Some(copier) = passthrough.as_mut() {
                        end_of_input = !copier.copy_current(source, sink, &mut ctx.progress)?;
                    }
                }
                Some(_) => {
                    source.advance();
                }
                None => end_of_input = true,
            }
            if end_of_input {
                if let Some(index) = decoder.dequeue_input(poll)? {
                    decoder.queue_input(index, BufferInfo::end_of_stream())?;
                    input_done = true;
                    debug!("source exhausted, decoder input closed");
                }
            }
        }

        let mut decoder_output_available = !decoder_done;
        let mut encoder_output_available = true;
        while decoder_output_available || encoder_output_available {
            ctx.progress.check_canceled()?;

            match output.drain_encoder(encoder, sink, tracks, &mut ctx.progress)? {
                EncoderPoll::TryAgain => encoder_output_available = false,
                EncoderPoll::EndOfStream => {
                    output_done = true;
                    break;
                }
                EncoderPoll::Handled => continue,
            }

            if decoder_done {
                decoder_output_available = false;
                continue;
            }

            match decoder.poll_output(poll)? {
                CodecStatus::TryAgainLater => decoder_output_available = false,
                CodecStatus::OutputFormatChanged => {
                    if let Some(format) = decoder.output_format() {
                        debug!(%format, "decoder output format");
                    }
                }
                CodecStatus::BuffersChanged => {}
                CodecStatus::Sample { index, info } => {
                    let verdict = timeline.on_decoded(
                        info.presentation_time_us,
                        info.size,
                        info.flags.is_end_of_stream(),
                    );
                    if verdict.past_end {
                        input_done = true;
                        decoder_done = true;
                    }

                    match verdict.action {
                        FrameAction::Rewind { seek_to_us } => {
                            ctx.enter(ConvertState::SeekReset);
                            source.seek_to_previous_sync(seek_to_us)?;
                            decoder.flush()?;
                            input_done = false;
                            decoder_done = false;
                            ctx.enter(ConvertState::Running);
                        }
                        FrameAction::Skip => decoder.release_output(index, false)?,
                        FrameAction::Render { output_us } => {
                            decoder.release_output(index, true)?;
                            present_frame(bridge, output_us, &ctx.progress)?;
                        }
                    }

                    if verdict.end_of_stream {
                        decoder_output_available = false;
                        decoder_done = true;
                        ctx.enter(ConvertState::Draining);
                        debug!(past_end = verdict.past_end, "decoder stream end");
                        encoder.signal_end_of_input()?;
                    }
                }
                CodecStatus::Error(code) => {
                    return Err(TranscodeError::UnexpectedStatus {
                        role: CodecRole::Decoder,
                        code,
                    });
                }
            }
        }
    }

    info!(
        last_output_us = ?timeline.max_output_us(),
        "video transcode finished"
    );
    Ok(())
}

/// Moves the current video sample into a decoder input buffer, or closes the
/// decoder input once the source is exhausted. Returns `true` in that case.
fn feed_decoder(
    source: &mut dyn SampleSource,
    decoder: &mut CodecSession<Decoder>,
    timeout: Duration,
) -> Result<bool, TranscodeError> {
    let Some(index) = decoder.dequeue_input(timeout)? else {
        return Ok(false);
    };
    let buf = decoder.input_buffer(index)?;
    match source.read_sample(buf)? {
        Some(size) => {
            let info = BufferInfo::new(size, source.sample_time_us(), BufferFlags::NONE);
            decoder.queue_input(index, info)?;
            source.advance();
            Ok(false)
        }
        None => {
            decoder.queue_input(index, BufferInfo::end_of_stream())?;
            Ok(true)
        }
    }
}

/// Waits for the decoded image and hands the composed frame to the encoder.
/// A frame that never arrives is skipped rather than failing the attempt.
fn present_frame(
    bridge: &mut dyn FrameBridge,
    output_us: i64,
    progress: &Progress<'_>,
) -> Result<(), TranscodeError> {
    progress.check_canceled()?;
    match bridge.await_new_image() {
        Ok(()) => {}
        Err(err) if err.is_canceled() => return Err(err),
        Err(err) => {
            warn!(output_us, error = %err, "decoded frame did not reach the bridge, skipping");
            return progress.check_canceled();
        }
    }
    progress.check_canceled()?;
    bridge.draw_composed_frame()?;
    bridge.set_presentation_time(output_us * 1000)?;
    bridge.swap_buffers()
}
