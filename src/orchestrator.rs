use std::time::Instant;
use std::{fmt, fmt::Display};

use tracing::{debug, error, info, warn};

use crate::contract::{
    AudioReencoder, ConvertListener, FrameBridge, MediaBackend, MediaKind, MuxSink, SampleSource,
    SinkConfig, TranscodeError,
};
use crate::plan::{Branch, ResolvedPlan, TrackPlan};
use crate::progress::Progress;
use crate::request::{TranscodeRequest, TranscoderConfig};
use crate::session::{CodecSession, Decoder, Encoder};
use crate::tracks::MuxTracks;
use crate::{copy, photo, transcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertState {
    Init,
    Configured,
    Running,
    /// The decoder was flushed and the source re-seeked for an avatar loop.
    SeekReset,
    Draining,
    Finalized { failed: bool },
}

impl Display for ConvertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Configured => f.write_str("configured"),
            Self::Running => f.write_str("running"),
            Self::SeekReset => f.write_str("seek-reset"),
            Self::Draining => f.write_str("draining"),
            Self::Finalized { failed: false } => f.write_str("finalized"),
            Self::Finalized { failed: true } => f.write_str("finalized(failed)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    Completed,
    Failed,
    Canceled,
}

impl ConvertOutcome {
    #[must_use]
    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }

    #[must_use]
    pub fn is_canceled(self) -> bool {
        self == Self::Canceled
    }
}

/// Per-attempt view shared by the three branches.
pub(crate) struct AttemptContext<'a> {
    pub request: &'a TranscodeRequest,
    pub config: &'a TranscoderConfig,
    pub plan: &'a ResolvedPlan,
    pub progress: Progress<'a>,
    state: ConvertState,
}

impl AttemptContext<'_> {
    pub fn enter(&mut self, next: ConvertState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "conversion state");
            self.state = next;
        }
    }
}

/// Every collaborator an attempt acquires. Teardown releases whatever was
/// acquired, in a fixed order, whether the attempt succeeded or not.
#[derive(Default)]
pub(crate) struct AttemptResources {
    pub source: Option<Box<dyn SampleSource>>,
    pub selected_tracks: Vec<usize>,
    pub sink: Option<Box<dyn MuxSink>>,
    pub decoder: Option<CodecSession<Decoder>>,
    pub encoder: Option<CodecSession<Encoder>>,
    pub bridge: Option<Box<dyn FrameBridge>>,
    pub audio: Option<Box<dyn AudioReencoder>>,
    pub tracks: MuxTracks,
}

impl AttemptResources {
    pub fn select_track(&mut self, index: usize) -> Result<(), TranscodeError> {
        require(&mut self.source, "sample source")?.select_track(index)?;
        self.selected_tracks.push(index);
        Ok(())
    }

    /// Releases everything and returns the sink's last video timestamp, if a
    /// video track was written.
    fn teardown(&mut self) -> Option<i64> {
        if let Some(source) = self.source.as_deref_mut() {
            for index in self.selected_tracks.drain(..) {
                if let Err(err) = source.unselect_track(index) {
                    warn!(index, error = %err, "failed to unselect track");
                }
            }
        }
        if let Some(mut decoder) = self.decoder.take() {
            decoder.shutdown();
        }
        if let Some(mut bridge) = self.bridge.take() {
            bridge.release();
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.shutdown();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.release();
        }
        if let Some(mut source) = self.source.take() {
            source.release();
        }

        let mut sink = self.sink.take()?;
        if let Err(err) = sink.finalize() {
            error!(error = %err, "failed to finalize output");
        }
        self.tracks
            .get(MediaKind::Video)
            .map(|track| sink.last_frame_timestamp_us(track))
    }
}

pub(crate) fn require<'a, T: ?Sized>(
    slot: &'a mut Option<Box<T>>,
    what: &str,
) -> Result<&'a mut T, TranscodeError> {
    slot.as_deref_mut()
        .ok_or_else(|| TranscodeError::Unsupported(format!("{what} was not acquired")))
}

/// Drives conversions against one media backend. Runs each job on the
/// calling thread and retries once with a longer codec poll timeout when the
/// encoder reports a session-state fault.
pub struct Transcoder<B: MediaBackend> {
    backend: B,
    config: TranscoderConfig,
    listener: Option<Box<dyn ConvertListener>>,
    last_frame_timestamp_us: i64,
    state: ConvertState,
}

impl<B: MediaBackend> Transcoder<B> {
    pub fn new(backend: B, config: TranscoderConfig) -> Self {
        Self {
            backend,
            config,
            listener: None,
            last_frame_timestamp_us: 0,
            state: ConvertState::Init,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: impl ConvertListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    /// Presentation time of the last video sample the sink finalized, or the
    /// request duration when no video track was written.
    #[must_use]
    pub fn last_frame_timestamp_us(&self) -> i64 {
        self.last_frame_timestamp_us
    }

    #[must_use]
    pub fn state(&self) -> ConvertState {
        self.state
    }

    pub fn convert(&mut self, request: &TranscodeRequest) -> ConvertOutcome {
        let started = Instant::now();
        info!(%request, config = %self.config, "starting conversion");

        let mut increased_timeout = request.increased_timeout;
        let mut attempt = 1u32;
        loop {
            match self.run_attempt(request, increased_timeout) {
                Ok(()) => {
                    info!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        last_frame_us = self.last_frame_timestamp_us,
                        "conversion completed"
                    );
                    return ConvertOutcome::Completed;
                }
                Err(err) if err.is_canceled() => {
                    info!(attempt, "conversion canceled");
                    return ConvertOutcome::Canceled;
                }
                Err(err)
                    if err.is_transient_codec_fault()
                        && !increased_timeout
                        && self.config.retry_with_increased_timeout =>
                {
                    warn!(attempt, error = %err, "encoder fault, repeating with increased timeout");
                    increased_timeout = true;
                    attempt += 1;
                    self.state = ConvertState::Init;
                }
                Err(err) => {
                    error!(attempt, error = %err, "conversion failed");
                    return ConvertOutcome::Failed;
                }
            }
        }
    }

    fn run_attempt(
        &mut self,
        request: &TranscodeRequest,
        increased_timeout: bool,
    ) -> Result<(), TranscodeError> {
        let mut resources = AttemptResources::default();
        let listener = self.listener.as_deref();
        let (result, state) = execute(
            &self.backend,
            &self.config,
            listener,
            request,
            increased_timeout,
            &mut resources,
        );

        let last_frame = resources.teardown();
        self.last_frame_timestamp_us = last_frame.unwrap_or(request.duration_us);

        let finalized = ConvertState::Finalized {
            failed: result.is_err(),
        };
        debug!(from = %state, to = %finalized, "conversion state");
        self.state = finalized;
        result
    }
}

fn execute<B: MediaBackend + ?Sized>(
    backend: &B,
    config: &TranscoderConfig,
    listener: Option<&dyn ConvertListener>,
    request: &TranscodeRequest,
    increased_timeout: bool,
    resources: &mut AttemptResources,
) -> (Result<(), TranscodeError>, ConvertState) {
    let plan = match ResolvedPlan::resolve(request, config, increased_timeout) {
        Ok(plan) => plan,
        Err(err) => return (Err(err), ConvertState::Init),
    };
    let mut ctx = AttemptContext {
        request,
        config,
        plan: &plan,
        progress: Progress::new(listener, request.duration_us),
        state: ConvertState::Init,
    };
    let result = run_branch(backend, &mut ctx, resources);
    (result, ctx.state)
}

fn run_branch<B: MediaBackend + ?Sized>(
    backend: &B,
    ctx: &mut AttemptContext<'_>,
    resources: &mut AttemptResources,
) -> Result<(), TranscodeError> {
    let request = ctx.request;
    resources.sink = Some(backend.create_sink(&SinkConfig {
        destination: request.destination_path.clone(),
        dims: request.target_dims,
        is_secret: request.is_secret,
    })?);
    ctx.progress.check_canceled()?;

    if request.is_photo {
        ctx.enter(ConvertState::Configured);
        info!(branch = %Branch::Photo, "branch selected");
        return photo::run(backend, ctx, resources);
    }

    let source = resources.source.insert(backend.open_source(&request.source_path)?);
    let track_plan = TrackPlan::inspect(&**source, request, ctx.plan)?;
    let branch = track_plan.branch();
    ctx.enter(ConvertState::Configured);
    info!(%branch, audio = ?track_plan.audio.index(), "branch selected");

    match branch {
        Branch::Transcode => transcode::run(backend, ctx, resources, &track_plan),
        Branch::Copy | Branch::Photo => copy::run(ctx, resources, &track_plan),
    }
}
