//! # Media Tool Module
//!
//! Questo modulo è il confine verso i tool esterni (ffmpeg / ffprobe).
//!
//! ## Responsabilità:
//! - Risoluzione dei percorsi dei tool (override da config o PATH)
//! - Invocazione con timeout e terminazione forzata del processo
//! - Cattura di exit code, stdout e stderr
//! - Costruzione degli argument template: probe, encode, extract, concat,
//!   playability
//! - Parsing del JSON di ffprobe in `MediaInfo`
//! - Streaming del progresso di encoding (`-progress pipe:1`)
//!
//! ## Template di comando:
//! - **probe**: `-v quiet -print_format json -show_format -show_streams`
//! - **encode**: codec/preset/CRF da config, audio copiato, metadata
//!   preservati, progresso su stdout
//! - **extract**: stream copy di una finestra `-ss/-t` (split senza ricodifica)
//! - **concat**: demuxer concat con list file (merge senza ricodifica)
//! - **playability**: decode test `-f null` su una finestra di 5 secondi
//!
//! ## Garanzie:
//! - Ogni invocazione ha un timeout; allo scadere il processo viene ucciso
//! - La cancellazione uccide il processo ffmpeg in corso
//! - Nessun output del tool viene interpretato oltre il contratto
//!   exit code / stdout / stderr
//!
//! ## Esempio:
//! ```rust,no_run
//! # use safe_video_compressor::{Config, MediaTool};
//! # use std::time::Duration;
//! # async fn run(config: Config, path: std::path::PathBuf) -> safe_video_compressor::error::Result<()> {
//! let tool = MediaTool::resolve(&config.tool);
//! let info = tool.probe(&path, Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{CompressionSettings, ToolSettings};
use crate::error::{CompressError, Result};
use crate::pipeline::CancelToken;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, warn};

/// Decode-test window length for playability checks, in seconds
pub const PLAYABILITY_WINDOW_SECONDS: f64 = 5.0;

/// Captured result of one external tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Media stream information extracted from a probe
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub duration: f64,
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub pix_fmt: String,
    pub video_streams: usize,
    pub audio_streams: usize,
}

impl MediaInfo {
    /// True when the source uses a 10-bit pixel format
    pub fn is_10bit(&self) -> bool {
        self.pix_fmt.contains("10le") || self.pix_fmt.contains("10be")
    }

    /// Parse the JSON document produced by `ffprobe -print_format json`
    pub fn from_probe_json(info: &serde_json::Value) -> Result<Self> {
        let format = &info["format"];
        let duration = format["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);

        let bitrate = format["bit_rate"]
            .as_str()
            .and_then(|b| b.parse::<u64>().ok())
            .unwrap_or(0);

        let empty_vec = vec![];
        let streams = info["streams"].as_array().unwrap_or(&empty_vec);

        let video_streams = streams
            .iter()
            .filter(|s| s["codec_type"] == "video")
            .count();
        let audio_streams = streams
            .iter()
            .filter(|s| s["codec_type"] == "audio")
            .count();

        let video_stream = streams
            .iter()
            .find(|s| s["codec_type"] == "video")
            .unwrap_or(&serde_json::Value::Null);

        let width = video_stream["width"].as_u64().unwrap_or(0) as u32;
        let height = video_stream["height"].as_u64().unwrap_or(0) as u32;
        let codec = video_stream["codec_name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let pix_fmt = video_stream["pix_fmt"].as_str().unwrap_or("").to_string();

        Ok(MediaInfo {
            duration,
            bitrate,
            width,
            height,
            codec,
            pix_fmt,
            video_streams,
            audio_streams,
        })
    }
}

/// Boundary to ffmpeg/ffprobe
#[derive(Debug, Clone)]
pub struct MediaTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl MediaTool {
    /// Resolve tool paths from configuration overrides or platform names
    pub fn resolve(settings: &ToolSettings) -> Self {
        let ffmpeg = settings
            .ffmpeg_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(Self::platform_command("ffmpeg")));
        let ffprobe = settings
            .ffprobe_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(Self::platform_command("ffprobe")));

        debug!("Resolved tools: ffmpeg={}, ffprobe={}", ffmpeg.display(), ffprobe.display());
        Self { ffmpeg, ffprobe }
    }

    fn platform_command(base: &str) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.exe", base)
        } else {
            base.to_string()
        }
    }

    /// Verify both tools are present and runnable
    pub async fn check_dependencies(&self) -> Result<()> {
        for (name, path) in [("ffmpeg", &self.ffmpeg), ("ffprobe", &self.ffprobe)] {
            let args = vec!["-version".to_string()];
            let output = self
                .invoke(path, &args, Duration::from_secs(10), None)
                .await
                .map_err(|_| CompressError::Dependency(format!("{} is not runnable", name)))?;
            if !output.success() {
                return Err(CompressError::Dependency(format!(
                    "{} is not runnable (exit code {})",
                    name, output.exit_code
                )));
            }
        }
        Ok(())
    }

    /// Run ffmpeg with the given arguments
    pub async fn ffmpeg(
        &self,
        args: &[String],
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<ToolOutput> {
        self.invoke(&self.ffmpeg, args, timeout, cancel).await
    }

    /// Run ffprobe with the given arguments
    pub async fn ffprobe(&self, args: &[String], timeout: Duration) -> Result<ToolOutput> {
        self.invoke(&self.ffprobe, args, timeout, None).await
    }

    /// Invoke a tool, capturing exit code and both streams.
    ///
    /// The child is spawned with kill_on_drop, so both the timeout and the
    /// cancellation path forcibly terminate the external process.
    async fn invoke(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<ToolOutput> {
        let name = tool_name(program);
        debug!("Running {} {}", name, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompressError::Dependency(format!("{} not found", name))
            } else {
                CompressError::Io(e)
            }
        })?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            result = &mut wait => result?,
            _ = cancelled_or_never(cancel) => {
                // Dropping the pinned future kills the child
                return Err(CompressError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("{} exceeded {}s timeout, killing", name, timeout.as_secs());
                return Err(CompressError::Timeout { tool: name, seconds: timeout.as_secs() });
            }
        };

        Ok(ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Probe media metadata with ffprobe
    pub async fn probe(&self, path: &Path, timeout: Duration) -> Result<MediaInfo> {
        let args = probe_args(path);
        let output = self.ffprobe(&args, timeout).await?;

        if !output.success() {
            return Err(CompressError::Tool {
                tool: "ffprobe".to_string(),
                message: stderr_tail(&output.stderr),
            });
        }

        let info: serde_json::Value = serde_json::from_str(&output.stdout)?;
        MediaInfo::from_probe_json(&info)
    }

    /// Run an encode, streaming `-progress pipe:1` lines into `on_progress`
    /// as fractions of `source_duration`.
    pub async fn run_encode(
        &self,
        args: &[String],
        source_duration: f64,
        timeout: Duration,
        cancel: &CancelToken,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<()> {
        debug!("Running ffmpeg {}", args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompressError::Dependency("ffmpeg not found".to_string())
            } else {
                CompressError::Io(e)
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CompressError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ffmpeg stdout not captured",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CompressError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "ffmpeg stderr not captured",
            ))
        })?;

        // Drained concurrently: a chatty encoder can fill the stderr
        // pipe and stall the encode behind it otherwise
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if let Some(fraction) = parse_progress_line(&line, source_duration) {
                                on_progress(fraction);
                            }
                        }
                        // Stream closed: the encoder is exiting
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(CompressError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("ffmpeg exceeded {}s timeout, killing", timeout.as_secs());
                    let _ = child.kill().await;
                    return Err(CompressError::Timeout {
                        tool: "ffmpeg".to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
            }
        }

        let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
            .await
            .map_err(|_| CompressError::Timeout { tool: "ffmpeg".to_string(), seconds: 30 })??;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(CompressError::Tool {
                tool: "ffmpeg".to_string(),
                message: stderr_tail(&stderr_text),
            });
        }

        Ok(())
    }
}

/// Stderr lines retained while draining; enough context for diagnostics
const STDERR_TAIL_CAPACITY: usize = 32;

/// Read a child's stderr to EOF, keeping a bounded tail
async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_CAPACITY);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn cancelled_or_never(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| program.display().to_string())
}

/// Last few stderr lines, enough to diagnose without dumping full logs
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let tail = lines.len().saturating_sub(5);
    lines[tail..].join("\n")
}

/// Parse one `-progress pipe:1` key=value line into a completion fraction.
///
/// `out_time_ms` is microseconds despite the name. "N/A" values are skipped.
pub fn parse_progress_line(line: &str, total_seconds: f64) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_ms" | "out_time_us" => {
            if total_seconds <= 0.0 {
                return None;
            }
            let micros: i64 = value.trim().parse().ok()?;
            Some((micros as f64 / 1_000_000.0 / total_seconds).clamp(0.0, 1.0))
        }
        "progress" if value.trim() == "end" => Some(1.0),
        _ => None,
    }
}

/// ffprobe metadata template
pub fn probe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        path.to_string_lossy().to_string(),
    ]
}

/// Encode template: codec/preset/CRF from config, audio copied, optional
/// 10-bit pixel format and metadata preservation, progress on stdout
pub fn encode_args(
    source: &Path,
    destination: &Path,
    settings: &CompressionSettings,
    info: &MediaInfo,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-c:v".to_string(),
        settings.video_codec.clone(),
        "-preset".to_string(),
        settings.preset.clone(),
        "-crf".to_string(),
        settings.crf.to_string(),
    ];

    if settings.preserve_10bit && info.is_10bit() {
        args.push("-pix_fmt".to_string());
        args.push("yuv420p10le".to_string());
    }

    args.push("-c:a".to_string());
    args.push("copy".to_string());

    if settings.preserve_metadata {
        args.push("-map_metadata".to_string());
        args.push("0".to_string());
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }

    if let Some(reduction) = settings.bitrate_reduction {
        if info.bitrate > 0 {
            let target_kbps = (info.bitrate as f64 / 1000.0 * reduction) as u64;
            args.push("-b:v".to_string());
            args.push(format!("{}k", target_kbps));
        }
    }

    args.push("-progress".to_string());
    args.push("pipe:1".to_string());
    args.push("-nostats".to_string());
    args.push("-loglevel".to_string());
    args.push("error".to_string());
    args.push(destination.to_string_lossy().to_string());
    args
}

/// Stream-copy extraction of one segment window
pub fn extract_args(source: &Path, start: f64, duration: f64, destination: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-ss".to_string(),
        format!("{:.3}", start),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-t".to_string(),
        format!("{:.3}", duration),
        "-c".to_string(),
        "copy".to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        destination.to_string_lossy().to_string(),
    ]
}

/// Concat-demuxer merge of compressed segments listed in `list_file`
pub fn concat_args(list_file: &Path, destination: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_file.to_string_lossy().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        destination.to_string_lossy().to_string(),
    ]
}

/// Decode test of a short window; `start` None means from the beginning
pub fn playability_args(path: &Path, start: Option<f64>) -> Vec<String> {
    let mut args = vec!["-v".to_string(), "error".to_string()];
    if let Some(start) = start {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", start));
    }
    args.push("-t".to_string());
    args.push(format!("{:.1}", PLAYABILITY_WINDOW_SECONDS));
    args.push("-i".to_string());
    args.push(path.to_string_lossy().to_string());
    args.push("-f".to_string());
    args.push("null".to_string());
    args.push("-".to_string());
    args
}

/// Estimated encode wall time by preset speed class
pub fn estimate_encode_seconds(size_bytes: u64, preset: &str) -> f64 {
    let minutes_per_gb = match preset {
        "ultrafast" => 5.0,
        "fast" => 8.0,
        "medium" => 15.0,
        "slow" => 25.0,
        _ => 15.0,
    };
    let gb = size_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    minutes_per_gb * gb * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> MediaInfo {
        MediaInfo {
            duration: 3600.0,
            bitrate: 8_000_000,
            width: 1920,
            height: 1080,
            codec: "h264".to_string(),
            pix_fmt: "yuv420p".to_string(),
            video_streams: 1,
            audio_streams: 1,
        }
    }

    #[test]
    fn test_parse_progress_line() {
        // out_time_ms is microseconds
        assert_eq!(parse_progress_line("out_time_ms=30000000", 60.0), Some(0.5));
        assert_eq!(parse_progress_line("progress=end", 60.0), Some(1.0));
        assert_eq!(parse_progress_line("out_time_ms=N/A", 60.0), None);
        assert_eq!(parse_progress_line("fps=25.0", 60.0), None);
        assert_eq!(parse_progress_line("garbage", 60.0), None);
        // Values past the end clamp to 1.0
        assert_eq!(parse_progress_line("out_time_ms=120000000", 60.0), Some(1.0));
    }

    #[test]
    fn test_probe_json_parsing() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{
                "format": {"duration": "4200.50", "bit_rate": "8000000"},
                "streams": [
                    {"codec_type": "video", "codec_name": "h264",
                     "width": 1920, "height": 1080, "pix_fmt": "yuv420p10le"},
                    {"codec_type": "audio", "codec_name": "aac"}
                ]
            }"#,
        )
        .unwrap();

        let info = MediaInfo::from_probe_json(&json).unwrap();
        assert_eq!(info.duration, 4200.5);
        assert_eq!(info.bitrate, 8_000_000);
        assert_eq!(info.width, 1920);
        assert_eq!(info.codec, "h264");
        assert_eq!(info.video_streams, 1);
        assert_eq!(info.audio_streams, 1);
        assert!(info.is_10bit());
    }

    #[test]
    fn test_encode_args_basic() {
        let settings = CompressionSettings::default();
        let args = encode_args(
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            &settings,
            &sample_info(),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx265"));
        assert!(joined.contains("-preset medium"));
        assert!(joined.contains("-crf 23"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-map_metadata 0"));
        assert!(joined.contains("-progress pipe:1"));
        // Source is 8-bit: no pixel format override
        assert!(!joined.contains("-pix_fmt"));
    }

    #[test]
    fn test_encode_args_10bit_and_bitrate() {
        let mut settings = CompressionSettings::default();
        settings.bitrate_reduction = Some(0.5);
        let mut info = sample_info();
        info.pix_fmt = "yuv420p10le".to_string();

        let args = encode_args(Path::new("in.mkv"), Path::new("out.mkv"), &settings, &info);
        let joined = args.join(" ");
        assert!(joined.contains("-pix_fmt yuv420p10le"));
        assert!(joined.contains("-b:v 4000k"));
    }

    #[test]
    fn test_extract_and_concat_args() {
        let extract = extract_args(Path::new("in.mp4"), 600.0, 300.0, Path::new("seg.mp4"));
        let joined = extract.join(" ");
        assert!(joined.contains("-ss 600.000"));
        assert!(joined.contains("-t 300.000"));
        assert!(joined.contains("-c copy"));

        let concat = concat_args(Path::new("list.txt"), Path::new("merged.mp4"));
        let joined = concat.join(" ");
        assert!(joined.contains("-f concat"));
        assert!(joined.contains("-safe 0"));
        assert!(joined.ends_with("merged.mp4"));
    }

    #[test]
    fn test_playability_args() {
        let begin = playability_args(Path::new("v.mp4"), None);
        assert!(!begin.join(" ").contains("-ss"));

        let middle = playability_args(Path::new("v.mp4"), Some(1800.0));
        let joined = middle.join(" ");
        assert!(joined.contains("-ss 1800.000"));
        assert!(joined.contains("-f null"));
    }

    #[test]
    fn test_estimate_encode_seconds() {
        let gb = 1024u64 * 1024 * 1024;
        assert_eq!(estimate_encode_seconds(gb, "ultrafast"), 300.0);
        assert_eq!(estimate_encode_seconds(gb, "medium"), 900.0);
        assert_eq!(estimate_encode_seconds(gb, "unknown"), 900.0);
        assert_eq!(estimate_encode_seconds(2 * gb, "slow"), 3000.0);
    }

    #[test]
    fn test_stderr_tail() {
        let stderr = "a\nb\nc\nd\ne\nf\ng";
        assert_eq!(stderr_tail(stderr), "c\nd\ne\nf\ng");
        assert_eq!(stderr_tail("one"), "one");
        assert_eq!(stderr_tail(""), "");
    }

    // An encoder spraying per-frame warnings writes far more than one
    // pipe buffer to stderr before any progress appears; the encode
    // must still finish instead of stalling into the timeout.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_encode_survives_stderr_flood() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake_encoder.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             i=0\n\
             while [ $i -lt 4096 ]; do\n\
               echo 'Non-monotonous DTS in output stream' 1>&2\n\
               i=$((i+1))\n\
             done\n\
             echo 'progress=end'\n\
             exit 0\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let settings = ToolSettings {
            ffmpeg_path: Some(script),
            ..Default::default()
        };
        let tool = MediaTool::resolve(&settings);
        let result = tool
            .run_encode(&[], 60.0, Duration::from_secs(10), &CancelToken::new(), &|_: f64| {})
            .await;
        assert!(result.is_ok(), "encode stalled on stderr: {:?}", result);
    }
}
