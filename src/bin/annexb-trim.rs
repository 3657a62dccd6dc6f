use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hw_transcode::{
    Codec, ConvertListener, ConvertOutcome, Dimensions, ElementaryStreamSource, FileBackend,
    SampleSource, TranscodeRequest, TranscoderConfig, Transcoder,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Trim an Annex-B elementary stream on keyframe boundaries")]
struct Args {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value_t = 30)]
    fps: u32,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    /// Trim start in milliseconds.
    #[arg(long, default_value_t = 0)]
    start_ms: i64,
    /// Trim end in milliseconds; omit to copy to the end of the stream.
    #[arg(long)]
    end_ms: Option<i64>,
    #[arg(long, default_value_t = false)]
    increased_timeout: bool,
}

struct LogProgress;

impl ConvertListener for LogProgress {
    fn did_write_data(&self, bytes_written: u64, progress: f32) {
        info!(bytes_written, progress, "progress");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let codec = parse_codec(&args.codec)?;
    let dims = Dimensions::new(args.width, args.height)
        .with_context(|| format!("invalid dimensions {}x{}", args.width, args.height))?;

    let source = ElementaryStreamSource::open(&args.input, codec, args.fps, dims)
        .with_context(|| format!("failed to index input stream: {}", args.input.display()))?;
    let duration_us = source
        .track_format(0)
        .context("failed to read input track format")?
        .duration_us
        .unwrap_or(0);

    let mut request = TranscodeRequest::new(&args.input, &args.output, dims, dims, duration_us);
    request.frame_rate = args.fps;
    request.start_us = args.start_ms * 1000;
    request.end_us = args.end_ms.map_or(-1, |ms| ms * 1000);
    request.increased_timeout = args.increased_timeout;

    let backend =
        FileBackend::new(codec, args.fps, dims).with_indexed_source(&args.input, source);
    let mut transcoder =
        Transcoder::new(backend, TranscoderConfig::new(codec)).with_listener(LogProgress);

    match transcoder.convert(&request) {
        ConvertOutcome::Completed => {
            println!(
                "output={}, last_frame_us={}, input_duration_us={}",
                args.output.display(),
                transcoder.last_frame_timestamp_us(),
                duration_us
            );
            Ok(())
        }
        ConvertOutcome::Canceled => bail!("conversion canceled"),
        ConvertOutcome::Failed => bail!("conversion failed: {}", args.input.display()),
    }
}

fn parse_codec(value: &str) -> Result<Codec> {
    match value.to_ascii_lowercase().as_str() {
        "h264" | "avc" => Ok(Codec::H264),
        "hevc" | "h265" => Ok(Codec::Hevc),
        _ => bail!("unsupported codec: {value}"),
    }
}
