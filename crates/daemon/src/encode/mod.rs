//! Pipeline command compilation

pub mod ffmpeg;
pub mod redact;

pub use ffmpeg::{
    build_ffmpeg_command, input_url, parse_bitrate_k, publish_url, split_filter_graph,
    CompileError, CompiledCommand, FFMPEG_BIN, PUBLISH_BASE,
};
pub use redact::{redact_arg, sanitize_command, sanitized_command_line};
