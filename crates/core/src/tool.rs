//! External processing tool (ffmpeg) invocation.
//!
//! Builds the stream-copy and re-encode command lines and runs them as a child
//! process with cooperative cancellation.

use crate::mode::{MergeTarget, ResolvedStrategy};
use crate::queue::AudioPolicy;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Only the tail of stderr is kept as the diagnostic.
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Sample format every input's audio is normalized to before concatenation.
const AUDIO_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool failed with exit code {exit_code:?}: {diagnostic}")]
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("Tool run was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One local input for the tool, in concatenation order.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub path: PathBuf,
    pub has_audio: bool,
    pub duration_seconds: f64,
}

/// Everything the tool needs for one merge.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub inputs: Vec<MergeInput>,
    pub output: PathBuf,
    pub strategy: ResolvedStrategy,
    pub target: MergeTarget,
    /// Scratch directory for tool side files such as the concat list.
    pub scratch_dir: PathBuf,
}

/// Black-box media processor.
#[async_trait]
pub trait MergeTool: Send + Sync {
    /// Runs the merge, returning the output path on success.
    async fn merge(
        &self,
        request: &MergeRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ToolError>;
}

/// Escapes a path for a concat demuxer `file '...'` line.
///
/// Everything between single quotes is literal to the demuxer, backslashes included,
/// so only the quote itself needs closing, escaping and reopening.
fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}

/// Writes the concat demuxer list for `inputs` to `list_path`.
pub fn write_concat_list(list_path: &Path, inputs: &[MergeInput]) -> std::io::Result<()> {
    let mut list = String::new();
    for input in inputs {
        let _ = writeln!(list, "file '{}'", escape_concat_path(&input.path));
    }
    std::fs::write(list_path, list)
}

/// Builds the stream-copy concatenation command.
pub fn build_concat_command(
    program: &str,
    list_path: &Path,
    output: &Path,
    audio: AudioPolicy,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-y", "-hide_banner", "-loglevel", "error"]);
    cmd.args(["-f", "concat", "-safe", "0", "-fflags", "+genpts"]);
    cmd.arg("-i").arg(list_path);
    cmd.args(["-map", "0:v:0"]);
    match audio {
        AudioPolicy::KeepAll => {
            cmd.args(["-map", "0:a?"]);
        }
        AudioPolicy::Remove => {
            cmd.arg("-an");
        }
    }
    cmd.args(["-c", "copy", "-movflags", "+faststart"]);
    cmd.arg(output);
    cmd
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{:.3}", fps)
    }
}

/// Builds the `-filter_complex` graph normalizing every input to `target` and
/// concatenating them.
///
/// `silence_inputs[i]` is the input index of the generated silent track for entry `i`,
/// if it has one.
fn reencode_filter(
    inputs: &[MergeInput],
    target: &MergeTarget,
    silence_inputs: &[Option<usize>],
) -> String {
    let (w, h) = (target.width, target.height);
    let fps = format_fps(target.fps);
    let keep_audio = target.audio == AudioPolicy::KeepAll;
    let mut graph = String::new();

    for (i, input) in inputs.iter().enumerate() {
        let _ = write!(
            graph,
            "[{i}:v:0]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p[v{i}];"
        );
        if keep_audio {
            let source = match (input.has_audio, silence_inputs.get(i).copied().flatten()) {
                (true, _) | (false, None) => format!("[{i}:a:0]"),
                (false, Some(s)) => format!("[{s}:a]"),
            };
            let _ = write!(
                graph,
                "{source}aformat=sample_rates={AUDIO_SAMPLE_RATE}:channel_layouts=stereo[a{i}];"
            );
        }
    }

    for i in 0..inputs.len() {
        let _ = write!(graph, "[v{i}]");
        if keep_audio {
            let _ = write!(graph, "[a{i}]");
        }
    }

    let n = inputs.len();
    if keep_audio {
        let _ = write!(graph, "concat=n={n}:v=1:a=1[outv][outa]");
    } else {
        let _ = write!(graph, "concat=n={n}:v=1:a=0[outv]");
    }
    graph
}

/// Builds the full re-encode command for the SAFE strategy.
pub fn build_reencode_command(program: &str, request: &MergeRequest) -> Command {
    let target = &request.target;
    let keep_audio = target.audio == AudioPolicy::KeepAll;

    let mut cmd = Command::new(program);
    cmd.args(["-y", "-hide_banner", "-loglevel", "error"]);
    for input in &request.inputs {
        cmd.arg("-i").arg(&input.path);
    }

    // Entries without audio get a generated silent track of matching length.
    let mut silence_inputs = vec![None; request.inputs.len()];
    if keep_audio {
        let mut next_index = request.inputs.len();
        for (i, input) in request.inputs.iter().enumerate() {
            if !input.has_audio {
                cmd.args(["-f", "lavfi", "-t"]);
                cmd.arg(format!("{:.3}", input.duration_seconds.max(0.001)));
                cmd.arg("-i").arg(format!(
                    "anullsrc=channel_layout=stereo:sample_rate={}",
                    AUDIO_SAMPLE_RATE
                ));
                silence_inputs[i] = Some(next_index);
                next_index += 1;
            }
        }
    }

    cmd.arg("-filter_complex")
        .arg(reencode_filter(&request.inputs, target, &silence_inputs));
    cmd.args(["-map", "[outv]"]);
    cmd.args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"]);
    if keep_audio {
        cmd.args(["-map", "[outa]", "-c:a", "aac", "-b:a", "192k"]);
    } else {
        cmd.arg("-an");
    }
    cmd.args(["-movflags", "+faststart"]);
    cmd.arg(&request.output);
    cmd
}

fn tail(diagnostic: &[u8]) -> String {
    let start = diagnostic.len().saturating_sub(MAX_DIAGNOSTIC_BYTES);
    String::from_utf8_lossy(&diagnostic[start..]).trim().to_string()
}

/// Runs a prepared command, honoring `cancel`.
///
/// On cancellation the process is asked to quit (`q` on stdin, which ffmpeg treats as
/// a graceful stop) and killed if it is still running after `grace`.
pub async fn run_command(
    cmd: Command,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<(), ToolError> {
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let mut stdin = child.stdin.take();
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        })
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            if let Some(stdin) = stdin.as_mut() {
                let _ = stdin.write_all(b"q\n").await;
                let _ = stdin.flush().await;
            }
            drop(stdin.take());
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => debug!("tool stopped after quit request"),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "tool ignored quit request, killing");
                    let _ = child.kill().await;
                }
            }
            return Err(ToolError::Cancelled);
        }
    };

    let diagnostic = match stderr_task {
        Some(task) => task.await.map(|buf| tail(&buf)).unwrap_or_default(),
        None => String::new(),
    };

    if status.success() {
        if !diagnostic.is_empty() {
            debug!(%diagnostic, "tool succeeded with diagnostics");
        }
        Ok(())
    } else {
        Err(ToolError::Failed {
            exit_code: status.code(),
            diagnostic,
        })
    }
}

/// [`MergeTool`] backed by the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    program: String,
    cancel_grace: Duration,
}

impl FfmpegTool {
    pub fn new(program: impl Into<String>, cancel_grace: Duration) -> Self {
        Self {
            program: program.into(),
            cancel_grace,
        }
    }
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new("ffmpeg", Duration::from_secs(5))
    }
}

#[async_trait]
impl MergeTool for FfmpegTool {
    async fn merge(
        &self,
        request: &MergeRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ToolError> {
        let cmd = match request.strategy {
            ResolvedStrategy::Fast => {
                let list_path = request.scratch_dir.join("concat_list.txt");
                write_concat_list(&list_path, &request.inputs)?;
                build_concat_command(&self.program, &list_path, &request.output, request.target.audio)
            }
            ResolvedStrategy::Safe => build_reencode_command(&self.program, request),
        };

        info!(
            strategy = %request.strategy,
            inputs = request.inputs.len(),
            output = %request.output.display(),
            "running merge tool"
        );
        debug!(command = ?cmd, "tool command line");

        run_command(cmd, cancel, self.cancel_grace).await?;
        Ok(request.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn input(path: &str, has_audio: bool) -> MergeInput {
        MergeInput {
            path: PathBuf::from(path),
            has_audio,
            duration_seconds: 12.5,
        }
    }

    fn safe_request(inputs: Vec<MergeInput>, audio: AudioPolicy) -> MergeRequest {
        MergeRequest {
            inputs,
            output: PathBuf::from("/work/out.mp4"),
            strategy: ResolvedStrategy::Safe,
            target: MergeTarget {
                width: 1920,
                height: 1080,
                fps: 30.0,
                audio,
            },
            scratch_dir: PathBuf::from("/work"),
        }
    }

    #[test]
    fn test_concat_command_matches_stream_copy_contract() {
        let cmd = build_concat_command(
            "ffmpeg",
            Path::new("/work/list.txt"),
            Path::new("/work/out.mp4"),
            AudioPolicy::KeepAll,
        );
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));
        assert_eq!(
            args,
            vec![
                "-y", "-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0",
                "-fflags", "+genpts", "-i", "/work/list.txt", "-map", "0:v:0", "-map", "0:a?",
                "-c", "copy", "-movflags", "+faststart", "/work/out.mp4",
            ]
        );
    }

    #[test]
    fn test_concat_command_remove_audio() {
        let cmd = build_concat_command(
            "ffmpeg",
            Path::new("l.txt"),
            Path::new("o.mp4"),
            AudioPolicy::Remove,
        );
        let args = get_command_args(&cmd);
        assert!(has_flag(&args, "-an"));
        assert!(!has_flag(&args, "0:a?"));
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("list.txt");
        write_concat_list(
            &list,
            &[input("/m/plain.mp4", true), input("/m/it's here.mp4", true)],
        )
        .unwrap();

        let content = std::fs::read_to_string(&list).unwrap();
        assert_eq!(
            content,
            "file '/m/plain.mp4'\nfile '/m/it'\\''s here.mp4'\n"
        );
    }

    #[test]
    fn test_concat_list_keeps_backslashes() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("list.txt");
        write_concat_list(
            &list,
            &[input(r"/m/a\b.mp4", true), input(r"C:\clips\it's.mp4", true)],
        )
        .unwrap();

        let content = std::fs::read_to_string(&list).unwrap();
        assert_eq!(
            content,
            "file '/m/a\\b.mp4'\nfile 'C:\\clips\\it'\\''s.mp4'\n"
        );
    }

    #[test]
    fn test_reencode_synthesizes_silence_for_missing_audio() {
        let request = safe_request(
            vec![input("/a.mp4", true), input("/b.mp4", false)],
            AudioPolicy::KeepAll,
        );
        let cmd = build_reencode_command("ffmpeg", &request);
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-f", "lavfi"));
        assert!(has_flag_with_value(&args, "-t", "12.500"));
        assert!(has_flag_with_value(
            &args,
            "-i",
            "anullsrc=channel_layout=stereo:sample_rate=48000"
        ));

        let graph = args
            .windows(2)
            .find(|p| p[0] == "-filter_complex")
            .map(|p| p[1].clone())
            .unwrap();
        assert!(graph.contains("[0:a:0]aformat"));
        assert!(graph.contains("[2:a]aformat"));
        assert!(graph.contains("[v0][a0][v1][a1]concat=n=2:v=1:a=1[outv][outa]"));
        assert!(has_flag_with_value(&args, "-map", "[outa]"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
    }

    #[test]
    fn test_reencode_without_audio() {
        let request = safe_request(
            vec![input("/a.mp4", true), input("/b.mp4", true)],
            AudioPolicy::Remove,
        );
        let args = get_command_args(&build_reencode_command("ffmpeg", &request));

        assert!(has_flag(&args, "-an"));
        assert!(!has_flag(&args, "[outa]"));
        assert!(!has_flag_with_value(&args, "-f", "lavfi"));
        assert!(args.iter().any(|a| a.ends_with("concat=n=2:v=1:a=0[outv]")));
    }

    #[test]
    fn test_format_fps() {
        assert_eq!(format_fps(30.0), "30");
        assert_eq!(format_fps(29.97), "29.970");
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_code_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'Invalid data found' >&2; exit 3"]);

        let err = run_command(cmd, &CancellationToken::new(), Duration::from_millis(100))
            .await
            .unwrap_err();

        match err {
            ToolError::Failed { exit_code, diagnostic } => {
                assert_eq!(exit_code, Some(3));
                assert!(diagnostic.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_cancel_kills_stubborn_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = run_command(cmd, &cancel, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let tool = FfmpegTool::new("/nonexistent/clipmerge-ffmpeg", Duration::from_millis(10));
        let dir = tempdir().unwrap();
        let mut request = safe_request(vec![input("/a.mp4", true)], AudioPolicy::KeepAll);
        request.scratch_dir = dir.path().to_path_buf();

        let err = tool.merge(&request, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::Io(_)));
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_.-]{1,30}")
            .unwrap()
            .prop_filter("non-empty path", |s| s.len() > 1)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_reencode_command_completeness(
            paths in prop::collection::vec((path_strategy(), any::<bool>()), 1..6),
            width in 2u32..4000,
            height in 2u32..4000,
            fps in 1u32..120,
        ) {
            let inputs: Vec<MergeInput> = paths.iter().map(|(p, a)| input(p, *a)).collect();
            let mut request = safe_request(inputs.clone(), AudioPolicy::KeepAll);
            request.target.width = width;
            request.target.height = height;
            request.target.fps = fps as f64;

            let args = get_command_args(&build_reencode_command("ffmpeg", &request));

            for input in &inputs {
                let path = input.path.to_string_lossy().to_string();
                prop_assert!(has_flag_with_value(&args, "-i", &path), "missing input {}", path);
            }
            let silent = inputs.iter().filter(|i| !i.has_audio).count();
            let lavfi = args.windows(2).filter(|p| p[0] == "-f" && p[1] == "lavfi").count();
            prop_assert_eq!(lavfi, silent);

            let graph = args.windows(2).find(|p| p[0] == "-filter_complex").map(|p| p[1].clone()).unwrap();
            let scale = format!("scale={}:{}", width, height);
            let fps_filter = format!("fps={}", fps);
            let concat = format!("concat=n={}:v=1:a=1", inputs.len());
            prop_assert!(graph.contains(&scale));
            prop_assert!(graph.contains(&fps_filter));
            prop_assert!(graph.contains(&concat));
            prop_assert_eq!(args.last().map(String::as_str), Some("/work/out.mp4"));
        }
    }
}
