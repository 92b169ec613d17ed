//! FFmpeg command compiler
//!
//! Turns a source's declarative processing options into the ordered argument
//! list for one ffmpeg relay process, plus the details shown in status output.
//! Everything here is pure: identical inputs give byte-identical commands.

use crate::config::{InputCodec, OutputCodec, SourceConfig, SplitOrientation};
use std::collections::BTreeMap;
use thiserror::Error;

/// Name of the pipeline binary as it appears in the compiled argument list
pub const FFMPEG_BIN: &str = "ffmpeg";

/// Port every camera serves RTSP on
pub const RTSP_PORT: u16 = 554;

/// Base URL of the media router that receives published legs
pub const PUBLISH_BASE: &str = "rtsp://mediamtx:8554";

const VERTICAL_CROPS: (&str, &str) = ("crop=w=iw/2:h=ih:x=0:y=0", "crop=w=iw/2:h=ih:x=in_w/2:y=0");
const HORIZONTAL_CROPS: (&str, &str) = ("crop=w=iw:h=ih/2:x=0:y=0", "crop=w=iw:h=ih/2:x=0:y=in_h/2");

/// Error type for command compilation
#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    /// A bitrate string could not be interpreted
    #[error("Invalid bitrate '{0}': expected <number>[k|M]")]
    InvalidBitrate(String),
}

/// A fully compiled pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCommand {
    /// Program to run
    pub program: String,
    /// Arguments, excluding the program itself
    pub args: Vec<String>,
    /// Human-readable summary of what the command does
    pub details: BTreeMap<String, String>,
}

impl CompiledCommand {
    /// Program followed by all arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Number of publish legs in the command
    pub fn output_legs(&self) -> usize {
        self.args
            .iter()
            .filter(|arg| arg.starts_with(PUBLISH_BASE))
            .count()
    }
}

/// Largest accepted bitrate in kbit/s (100 Gbit/s)
pub const MAX_BITRATE_K: u64 = 100_000_000;

/// Parse a bitrate like "2M", "1500k" or "500" into kbit/s
///
/// `m`/`M` multiplies by 1000, `k`/`K` by 1, and no unit means the value is
/// already in kbit/s. Fractional values are truncated after scaling. Values
/// above [`MAX_BITRATE_K`] are rejected.
pub fn parse_bitrate_k(rate: &str) -> Result<u64, CompileError> {
    let trimmed = rate.trim();
    let invalid = || CompileError::InvalidBitrate(rate.to_string());

    let (number, multiplier) = match trimmed.chars().last() {
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1000.0),
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1.0),
        Some(_) => (trimmed, 1.0),
        None => return Err(invalid()),
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }

    let scaled = value * multiplier;
    if scaled > MAX_BITRATE_K as f64 {
        return Err(invalid());
    }

    Ok(scaled as u64)
}

/// Build the camera's RTSP ingest URL
///
/// Paths that already carry `user=` and `password=` parameters are used as-is;
/// otherwise configured credentials are interpolated as `user:pass@`.
pub fn input_url(source: &SourceConfig) -> String {
    let path = &source.path;
    if path.contains("user=") && path.contains("password=") {
        return format!("rtsp://{}:{}{}", source.address, RTSP_PORT, path);
    }

    match (&source.user, &source.password) {
        (Some(user), Some(password)) => format!(
            "rtsp://{}:{}@{}:{}{}",
            user, password, source.address, RTSP_PORT, path
        ),
        _ => format!("rtsp://{}:{}{}", source.address, RTSP_PORT, path),
    }
}

/// Publish target URL for a stream name
pub fn publish_url(stream_name: &str) -> String {
    format!("{}/{}", PUBLISH_BASE, stream_name)
}

/// Decoder, encoder and rate-control arguments for one run
struct CodecParams {
    decoder: Vec<String>,
    encoder: Vec<String>,
    rate_control: Vec<String>,
}

fn codec_params(
    source: &SourceConfig,
    hwaccel: bool,
    details: &mut BTreeMap<String, String>,
) -> Result<CodecParams, CompileError> {
    let processing = &source.processing;
    let output = processing.output_codec;
    details.insert("codec".to_string(), output.as_str().to_string());

    let decoder: &[&str] = match (hwaccel, processing.input_codec) {
        (true, InputCodec::H265) => &["-c:v", "hevc_cuvid"],
        (true, InputCodec::H264) => &["-c:v", "h264_cuvid"],
        (false, _) => &[],
    };

    let encoder: &[&str] = match (hwaccel, output) {
        (_, OutputCodec::Copy) => &["-c:v", "copy"],
        (true, OutputCodec::H265) => &["-c:v", "hevc_nvenc", "-preset", "p5"],
        (true, OutputCodec::H264) => &["-c:v", "h264_nvenc", "-preset", "p5"],
        (false, OutputCodec::H265) => &["-c:v", "libx265"],
        (false, OutputCodec::H264) => &["-c:v", "libx264"],
    };

    let mut rate_control = Vec::new();
    if output != OutputCodec::Copy {
        let maxrate_k = parse_bitrate_k(&processing.maxrate)?;
        let bufsize_k = maxrate_k
            .checked_mul(2)
            .ok_or_else(|| CompileError::InvalidBitrate(processing.maxrate.clone()))?;
        parse_bitrate_k(&processing.bitrate)?;

        details.insert("bitrate".to_string(), processing.bitrate.clone());
        details.insert("maxrate".to_string(), processing.maxrate.clone());

        rate_control.extend([
            "-b:v".to_string(),
            processing.bitrate.clone(),
            "-maxrate".to_string(),
            processing.maxrate.clone(),
            "-bufsize".to_string(),
            format!("{}k", bufsize_k),
        ]);

        if let Some(interval) = processing.keyframe_interval {
            details.insert("keyframe_interval".to_string(), interval.to_string());
            rate_control.extend(["-g".to_string(), interval.to_string()]);
        }
    }

    Ok(CodecParams {
        decoder: to_strings(decoder),
        encoder: to_strings(encoder),
        rate_control,
    })
}

fn to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Filter graph splitting the decoded frame into two cropped halves
pub fn split_filter_graph(orientation: SplitOrientation, hwaccel: bool) -> String {
    let (crop1, crop2) = match orientation {
        SplitOrientation::Vertical => VERTICAL_CROPS,
        SplitOrientation::Horizontal => HORIZONTAL_CROPS,
    };
    // CUDA frames have to come back to system memory before the CPU filters
    let download = if hwaccel { "hwdownload,format=nv12," } else { "" };

    format!(
        "[0:v]{}split=2[split1][split2];[split1]{}[part1];[split2]{}[part2]",
        download, crop1, crop2
    )
}

/// Compile a source into an ffmpeg invocation
///
/// `hwaccel` is the effective acceleration flag for this run, i.e. the
/// source's preference combined with current hardware availability. The
/// source's own `processing.hwaccel` field is ignored here.
///
/// # Errors
/// Returns `CompileError::InvalidBitrate` when a non-copy output codec is
/// configured with an unparseable `bitrate` or `maxrate`.
pub fn build_ffmpeg_command(
    source: &SourceConfig,
    hwaccel: bool,
) -> Result<CompiledCommand, CompileError> {
    let name = &source.name;
    let split = &source.processing.split;

    let mut details = BTreeMap::new();
    details.insert("camera".to_string(), name.clone());
    details.insert(
        "splitting".to_string(),
        if split.enabled { "Enabled" } else { "Disabled" }.to_string(),
    );
    details.insert(
        "audio".to_string(),
        if split.enabled { "part2 only" } else { "copy" }.to_string(),
    );

    let codec = codec_params(source, hwaccel, &mut details)?;

    let mut args = to_strings(&["-hide_banner", "-loglevel", "error"]);

    if hwaccel {
        args.extend(to_strings(&[
            "-hwaccel",
            "cuda",
            "-hwaccel_output_format",
            "cuda",
        ]));
    }

    args.extend(codec.decoder.iter().cloned());
    args.extend(to_strings(&[
        "-fflags",
        "nobuffer",
        "-flags",
        "low_delay",
        "-analyzeduration",
        "500000",
        "-probesize",
        "500000",
        "-timeout",
        "15000000",
        "-rtsp_transport",
        "tcp",
        "-i",
    ]));
    args.push(input_url(source));

    let leg = |args: &mut Vec<String>, target: String| {
        args.extend(codec.encoder.iter().cloned());
        args.extend(codec.rate_control.iter().cloned());
        args.extend(to_strings(&["-f", "rtsp", "-rtsp_transport", "tcp"]));
        args.push(publish_url(&target));
    };

    if split.enabled {
        args.push("-filter_complex".to_string());
        args.push(split_filter_graph(split.orientation, hwaccel));

        args.extend(to_strings(&["-map", "[part1]", "-an"]));
        leg(&mut args, format!("{}_part1", name));

        args.extend(to_strings(&["-map", "[part2]", "-map", "0:a?", "-c:a", "copy"]));
        leg(&mut args, format!("{}_part2", name));
    } else {
        args.extend(to_strings(&["-map", "0:v", "-map", "0:a?", "-c:a", "copy"]));
        leg(&mut args, name.clone());
    }

    Ok(CompiledCommand {
        program: FFMPEG_BIN.to_string(),
        args,
        details,
    })
}
