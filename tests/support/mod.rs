#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use hw_transcode::{
    BufferFlags, BufferInfo, Codec, CodecDriver, CodecError, CodecStatus, CompositionMode,
    ConvertListener, Dimensions, DownscaleFilter, FrameBridge, FrameBridgeConfig, MIME_AUDIO_AAC,
    MIME_VIDEO_AVC, MediaBackend, MediaKind, MuxSink, MuxTrack, PayloadLayout, SampleSource,
    SinkConfig, SurfaceHandle, TrackFormat, TranscodeError, TranscodeRequest,
};

pub const FPS: i64 = 30;
pub const VIDEO_FRAMES: i64 = 300;
pub const GOP: i64 = 30;
pub const DURATION_US: i64 = 10_000_000;
const AUDIO_SAMPLE_RATE: i64 = 48_000;
const AUDIO_FRAME: i64 = 1024;
const ENCODED_SAMPLE_BYTES: usize = 16;

pub fn video_pts(frame: i64) -> i64 {
    frame * 1_000_000 / FPS
}

pub fn audio_pts(index: i64) -> i64 {
    index * AUDIO_FRAME * 1_000_000 / AUDIO_SAMPLE_RATE
}

pub fn dims(width: u32, height: u32) -> Dimensions {
    Dimensions::new(width, height).expect("test dimensions are non-zero")
}

/// 10 s, 30 fps, 640x480 source request with no trim and no compression.
pub fn request() -> TranscodeRequest {
    let mut request = TranscodeRequest::new(
        "in.mp4",
        "out.mp4",
        dims(640, 480),
        dims(640, 480),
        DURATION_US,
    );
    request.frame_rate = 30;
    request
}

#[derive(Debug, Clone)]
pub struct WrittenSample {
    pub track: MuxTrack,
    pub kind: MediaKind,
    pub pts: i64,
    pub flags: BufferFlags,
    pub layout: PayloadLayout,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SinkRecord {
    pub tracks: Vec<(MediaKind, TrackFormat)>,
    pub samples: Vec<WrittenSample>,
    pub finalize_calls: u32,
    pub bytes: u64,
}

impl SinkRecord {
    pub fn samples_of(&self, kind: MediaKind) -> Vec<&WrittenSample> {
        self.samples.iter().filter(|s| s.kind == kind).collect()
    }

    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|(k, _)| *k == kind)
    }
}

/// Everything the fakes observed, shared with the test through `Rc`.
#[derive(Debug, Default)]
pub struct Log {
    pub sinks: Vec<SinkRecord>,
    pub encoders_created: u32,
    pub decoders_created: u32,
    /// Timeout of the first output poll of every encoder.
    pub encoder_poll_timeouts: Vec<Duration>,
    pub bridge_modes: Vec<CompositionMode>,
    pub downscale: Vec<DownscaleFilter>,
    pub decoder_flushes: u32,
    pub sources_released: u32,
    surface: VecDeque<i64>,
    encoder_input: VecDeque<i64>,
    encoder_eos: bool,
}

#[derive(Debug, Default)]
struct Script {
    encoder_faults: u32,
    encoder_status_error: Option<i32>,
    without_audio: bool,
    audio_lead_us: i64,
}

/// In-memory backend: a 10 s, 30 fps H.264 source with AAC audio, a decoder
/// that emits every queued sample at once, a bridge that moves rendered
/// frames to the encoder and an encoder that emits one sample per frame.
pub struct FakeBackend {
    log: Rc<RefCell<Log>>,
    script: RefCell<Script>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(Log::default())),
            script: RefCell::new(Script::default()),
        }
    }

    /// The next `count` encoders fail their first output poll with a
    /// session-state fault.
    pub fn with_encoder_faults(self, count: u32) -> Self {
        self.script.borrow_mut().encoder_faults = count;
        self
    }

    pub fn with_encoder_status_error(self, code: i32) -> Self {
        self.script.borrow_mut().encoder_status_error = Some(code);
        self
    }

    pub fn without_audio(self) -> Self {
        self.script.borrow_mut().without_audio = true;
        self
    }

    /// Stores every audio sample `lead_us` earlier in container order than
    /// its timestamp, so audio can precede the sync frame after a seek.
    pub fn with_audio_stored_ahead(self, lead_us: i64) -> Self {
        self.script.borrow_mut().audio_lead_us = lead_us;
        self
    }

    pub fn log(&self) -> Rc<RefCell<Log>> {
        Rc::clone(&self.log)
    }
}

impl MediaBackend for FakeBackend {
    fn open_source(&self, _path: &Path) -> Result<Box<dyn SampleSource>, TranscodeError> {
        let script = self.script.borrow();
        Ok(Box::new(FakeSource::new(
            !script.without_audio,
            script.audio_lead_us,
            Rc::clone(&self.log),
        )))
    }

    fn create_sink(&self, _config: &SinkConfig) -> Result<Box<dyn MuxSink>, TranscodeError> {
        let mut log = self.log.borrow_mut();
        log.sinks.push(SinkRecord::default());
        Ok(Box::new(FakeSink {
            log: Rc::clone(&self.log),
            index: log.sinks.len() - 1,
        }))
    }

    fn create_decoder(&self, _format: &TrackFormat) -> Result<Box<dyn CodecDriver>, TranscodeError> {
        self.log.borrow_mut().decoders_created += 1;
        Ok(Box::new(FakeDecoder {
            log: Rc::clone(&self.log),
            input: vec![0; 64 * 1024],
            pending: VecDeque::new(),
            outstanding: Vec::new(),
            next_index: 0,
        }))
    }

    fn create_encoder(&self, _codec: Codec) -> Result<Box<dyn CodecDriver>, TranscodeError> {
        let mut script = self.script.borrow_mut();
        let fault_pending = script.encoder_faults > 0;
        script.encoder_faults = script.encoder_faults.saturating_sub(1);

        let mut log = self.log.borrow_mut();
        log.encoders_created += 1;
        log.surface.clear();
        log.encoder_input.clear();
        log.encoder_eos = false;
        Ok(Box::new(FakeEncoder {
            log: Rc::clone(&self.log),
            fault_pending,
            status_error: script.encoder_status_error,
            polled: false,
            format_sent: false,
            eos_sent: false,
            encoded: 0,
            next_index: 0,
            buffers: HashMap::new(),
        }))
    }

    fn create_frame_bridge(
        &self,
        config: FrameBridgeConfig,
    ) -> Result<Box<dyn FrameBridge>, TranscodeError> {
        self.log.borrow_mut().bridge_modes.push(config.mode);
        Ok(Box::new(FakeBridge {
            log: Rc::clone(&self.log),
            mode: config.mode,
            pending_ns: 0,
        }))
    }
}

struct FakeSample {
    track: usize,
    pts: i64,
    key: bool,
    data: Vec<u8>,
}

struct FakeSource {
    log: Rc<RefCell<Log>>,
    samples: Vec<FakeSample>,
    selected: [bool; 2],
    with_audio: bool,
    cursor: usize,
}

impl FakeSource {
    fn new(with_audio: bool, audio_lead_us: i64, log: Rc<RefCell<Log>>) -> Self {
        let mut samples: Vec<FakeSample> = (0..VIDEO_FRAMES)
            .map(|frame| {
                let key = frame % GOP == 0;
                let mut data = vec![0, 0, 0, 1, if key { 0x65 } else { 0x41 }];
                data.extend(std::iter::repeat_n(0x80, 19));
                FakeSample {
                    track: 0,
                    pts: video_pts(frame),
                    key,
                    data,
                }
            })
            .collect();
        if with_audio {
            samples.extend(
                (0..)
                    .map(audio_pts)
                    .take_while(|pts| *pts < DURATION_US)
                    .map(|pts| FakeSample {
                        track: 1,
                        pts,
                        key: true,
                        data: vec![0x21; 12],
                    }),
            );
        }
        samples.sort_by_key(|s| {
            let stored_at = if s.track == 1 { s.pts - audio_lead_us } else { s.pts };
            (stored_at, s.track)
        });
        Self {
            log,
            samples,
            selected: [false; 2],
            with_audio,
            cursor: 0,
        }
    }

    fn current_index(&self) -> Option<usize> {
        (self.cursor..self.samples.len()).find(|&i| self.selected[self.samples[i].track])
    }

    fn current(&self) -> Option<&FakeSample> {
        self.current_index().map(|i| &self.samples[i])
    }

    fn check_track(&self, index: usize) -> Result<(), TranscodeError> {
        if index < self.track_count() {
            Ok(())
        } else {
            Err(TranscodeError::Source(format!("no track {index}")))
        }
    }
}

impl SampleSource for FakeSource {
    fn track_count(&self) -> usize {
        if self.with_audio { 2 } else { 1 }
    }

    fn track_format(&self, index: usize) -> Result<TrackFormat, TranscodeError> {
        self.check_track(index)?;
        let mut format = if index == 0 {
            let mut video = TrackFormat::video(MIME_VIDEO_AVC, dims(640, 480));
            video.frame_rate = Some(30);
            video.max_input_size = Some(2048);
            video
        } else {
            let mut audio = TrackFormat::audio(MIME_AUDIO_AAC, 48_000, 2);
            audio.max_input_size = Some(512);
            audio
        };
        format.duration_us = Some(DURATION_US);
        Ok(format)
    }

    fn select_track(&mut self, index: usize) -> Result<(), TranscodeError> {
        self.check_track(index)?;
        self.selected[index] = true;
        Ok(())
    }

    fn unselect_track(&mut self, index: usize) -> Result<(), TranscodeError> {
        self.check_track(index)?;
        self.selected[index] = false;
        Ok(())
    }

    fn seek_to_previous_sync(&mut self, time_us: i64) -> Result<(), TranscodeError> {
        let sync = if self.selected[0] {
            self.samples
                .iter()
                .filter(|s| s.track == 0 && s.key && s.pts <= time_us)
                .map(|s| s.pts)
                .max()
                .unwrap_or(0)
        } else {
            time_us
        };
        self.cursor = self
            .samples
            .iter()
            .position(|s| s.pts >= sync)
            .unwrap_or(self.samples.len());
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TranscodeError> {
        let Some(sample) = self.current() else {
            return Ok(None);
        };
        let size = sample.data.len();
        buf.get_mut(..size)
            .ok_or_else(|| TranscodeError::Source("read buffer too small".to_string()))?
            .copy_from_slice(&sample.data);
        Ok(Some(size))
    }

    fn sample_size(&self) -> Option<usize> {
        self.current().map(|s| s.data.len())
    }

    fn sample_track_index(&self) -> Option<usize> {
        self.current().map(|s| s.track)
    }

    fn sample_time_us(&self) -> i64 {
        self.current().map_or(-1, |s| s.pts)
    }

    fn sample_flags(&self) -> BufferFlags {
        match self.current() {
            Some(s) if s.key => BufferFlags::KEY_FRAME,
            _ => BufferFlags::NONE,
        }
    }

    fn advance(&mut self) -> bool {
        if let Some(index) = self.current_index() {
            self.cursor = index + 1;
        }
        self.current_index().is_some()
    }

    fn release(&mut self) {
        self.log.borrow_mut().sources_released += 1;
    }
}

struct FakeSink {
    log: Rc<RefCell<Log>>,
    index: usize,
}

impl MuxSink for FakeSink {
    fn add_track(
        &mut self,
        format: &TrackFormat,
        kind: MediaKind,
    ) -> Result<MuxTrack, TranscodeError> {
        let mut log = self.log.borrow_mut();
        let record = &mut log.sinks[self.index];
        record.tracks.push((kind, format.clone()));
        Ok(MuxTrack(record.tracks.len() - 1))
    }

    fn write_sample(
        &mut self,
        track: MuxTrack,
        data: &[u8],
        info: &BufferInfo,
        layout: PayloadLayout,
    ) -> Result<u64, TranscodeError> {
        let payload = info.payload(data)?.to_vec();
        let mut log = self.log.borrow_mut();
        let record = &mut log.sinks[self.index];
        let kind = record
            .tracks
            .get(track.0)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| TranscodeError::Mux(format!("unknown {track}")))?;
        record.bytes += payload.len() as u64;
        record.samples.push(WrittenSample {
            track,
            kind,
            pts: info.presentation_time_us,
            flags: info.flags,
            layout,
            payload,
        });
        Ok(record.bytes)
    }

    fn finalize(&mut self) -> Result<(), TranscodeError> {
        self.log.borrow_mut().sinks[self.index].finalize_calls += 1;
        Ok(())
    }

    fn last_frame_timestamp_us(&self, track: MuxTrack) -> i64 {
        self.log.borrow().sinks[self.index]
            .samples
            .iter()
            .filter(|s| s.track == track)
            .map(|s| s.pts)
            .max()
            .unwrap_or(0)
    }
}

struct FakeDecoder {
    log: Rc<RefCell<Log>>,
    input: Vec<u8>,
    pending: VecDeque<BufferInfo>,
    outstanding: Vec<(usize, i64)>,
    next_index: usize,
}

impl CodecDriver for FakeDecoder {
    fn configure(
        &mut self,
        _format: &TrackFormat,
        _surface: Option<SurfaceHandle>,
    ) -> Result<(), CodecError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn release(&mut self) {}

    fn flush(&mut self) -> Result<(), CodecError> {
        self.pending.clear();
        self.outstanding.clear();
        self.log.borrow_mut().decoder_flushes += 1;
        Ok(())
    }

    fn output_format(&self) -> Result<TrackFormat, CodecError> {
        Ok(TrackFormat::video("video/raw", dims(640, 480)))
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        Ok(Some(0))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        if index == 0 {
            Ok(&mut self.input)
        } else {
            Err(CodecError::InvalidBuffer(index))
        }
    }

    fn queue_input_buffer(&mut self, _index: usize, info: BufferInfo) -> Result<(), CodecError> {
        self.pending.push_back(info);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> Result<CodecStatus, CodecError> {
        let Some(input) = self.pending.pop_front() else {
            return Ok(CodecStatus::TryAgainLater);
        };
        let eos = input.flags.is_end_of_stream();
        let index = self.next_index;
        self.next_index += 1;
        self.outstanding.push((index, input.presentation_time_us));
        Ok(CodecStatus::Sample {
            index,
            info: BufferInfo::new(
                if eos { 0 } else { 1 },
                input.presentation_time_us,
                input.flags,
            ),
        })
    }

    fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError> {
        Err(CodecError::InvalidBuffer(index))
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        let position = self
            .outstanding
            .iter()
            .position(|(i, _)| *i == index)
            .ok_or(CodecError::InvalidBuffer(index))?;
        let (_, pts) = self.outstanding.remove(position);
        if render {
            self.log.borrow_mut().surface.push_back(pts);
        }
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
        Err(CodecError::Unsupported("decoder takes end of stream in-band".to_string()))
    }
}

struct FakeBridge {
    log: Rc<RefCell<Log>>,
    mode: CompositionMode,
    pending_ns: i64,
}

impl FrameBridge for FakeBridge {
    fn decoder_surface(&self) -> Option<SurfaceHandle> {
        match self.mode {
            CompositionMode::Video => Some(SurfaceHandle(3)),
            CompositionMode::Photo => None,
        }
    }

    fn change_composition_shader(
        &mut self,
        filter: DownscaleFilter,
    ) -> Result<(), TranscodeError> {
        self.log.borrow_mut().downscale.push(filter);
        Ok(())
    }

    fn await_new_image(&mut self) -> Result<(), TranscodeError> {
        self.log
            .borrow_mut()
            .surface
            .pop_front()
            .map(|_| ())
            .ok_or_else(|| TranscodeError::Bridge("no decoded image".to_string()))
    }

    fn draw_composed_frame(&mut self) -> Result<(), TranscodeError> {
        Ok(())
    }

    fn set_presentation_time(&mut self, time_ns: i64) -> Result<(), TranscodeError> {
        self.pending_ns = time_ns;
        Ok(())
    }

    fn swap_buffers(&mut self) -> Result<(), TranscodeError> {
        self.log
            .borrow_mut()
            .encoder_input
            .push_back(self.pending_ns / 1000);
        Ok(())
    }
}

struct FakeEncoder {
    log: Rc<RefCell<Log>>,
    fault_pending: bool,
    status_error: Option<i32>,
    polled: bool,
    format_sent: bool,
    eos_sent: bool,
    encoded: u64,
    next_index: usize,
    buffers: HashMap<usize, Vec<u8>>,
}

impl FakeEncoder {
    fn emit(&mut self, data: Vec<u8>, pts: i64, flags: BufferFlags) -> CodecStatus {
        let index = self.next_index;
        self.next_index += 1;
        let size = data.len();
        self.buffers.insert(index, data);
        CodecStatus::Sample {
            index,
            info: BufferInfo::new(size, pts, flags),
        }
    }
}

impl CodecDriver for FakeEncoder {
    fn configure(
        &mut self,
        _format: &TrackFormat,
        _surface: Option<SurfaceHandle>,
    ) -> Result<(), CodecError> {
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<SurfaceHandle, CodecError> {
        Ok(SurfaceHandle(7))
    }

    fn start(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn release(&mut self) {}

    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn output_format(&self) -> Result<TrackFormat, CodecError> {
        let mut format = TrackFormat::video(MIME_VIDEO_AVC, dims(640, 480));
        format.csd0 = Some(vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e]);
        format.csd1 = Some(vec![0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80]);
        Ok(format)
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        Err(CodecError::Unsupported("surface input only".to_string()))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        Err(CodecError::InvalidBuffer(index))
    }

    fn queue_input_buffer(&mut self, index: usize, _info: BufferInfo) -> Result<(), CodecError> {
        Err(CodecError::InvalidBuffer(index))
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<CodecStatus, CodecError> {
        if !self.polled {
            self.polled = true;
            self.log.borrow_mut().encoder_poll_timeouts.push(timeout);
        }
        if self.fault_pending {
            self.fault_pending = false;
            return Err(CodecError::IllegalState(
                "dequeue while the session is resetting".to_string(),
            ));
        }
        if !self.format_sent {
            self.format_sent = true;
            return Ok(CodecStatus::OutputFormatChanged);
        }
        if let Some(code) = self.status_error {
            return Ok(CodecStatus::Error(code));
        }

        let (next, eos) = {
            let mut log = self.log.borrow_mut();
            (log.encoder_input.pop_front(), log.encoder_eos)
        };
        if let Some(pts) = next {
            let key = self.encoded % GOP as u64 == 0;
            self.encoded += 1;
            let mut data = vec![0, 0, 0, 1, if key { 0x65 } else { 0x41 }];
            data.resize(ENCODED_SAMPLE_BYTES, 0x9a);
            let flags = if key { BufferFlags::KEY_FRAME } else { BufferFlags::NONE };
            return Ok(self.emit(data, pts, flags));
        }
        if eos && !self.eos_sent {
            self.eos_sent = true;
            return Ok(self.emit(Vec::new(), 0, BufferFlags::END_OF_STREAM));
        }
        Ok(CodecStatus::TryAgainLater)
    }

    fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError> {
        self.buffers
            .get(&index)
            .map(Vec::as_slice)
            .ok_or(CodecError::InvalidBuffer(index))
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> Result<(), CodecError> {
        self.buffers
            .remove(&index)
            .map(|_| ())
            .ok_or(CodecError::InvalidBuffer(index))
    }

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError> {
        self.log.borrow_mut().encoder_eos = true;
        Ok(())
    }
}

/// Records progress and cancels once `cancel_after` writes were reported.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub writes: Rc<Cell<u32>>,
    pub last_progress: Rc<Cell<f32>>,
    pub last_bytes: Rc<Cell<u64>>,
    cancel_after: Option<u32>,
}

impl RecordingListener {
    pub fn canceling_after(writes: u32) -> Self {
        Self {
            cancel_after: Some(writes),
            ..Self::default()
        }
    }
}

impl ConvertListener for RecordingListener {
    fn did_write_data(&self, bytes_written: u64, progress: f32) {
        self.writes.set(self.writes.get() + 1);
        self.last_progress.set(progress);
        self.last_bytes.set(bytes_written);
    }

    fn is_canceled(&self) -> bool {
        self.cancel_after
            .is_some_and(|limit| self.writes.get() >= limit)
    }
}
