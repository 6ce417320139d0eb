//! The boundary to the external codec engine.
//!
//! The processor only talks to an [`Engine`]: load it once, put the input file
//! into the engine's workspace, run an argument list while listening for
//! progress, read the output back and remove what was written.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, info, trace};

use crate::command::{duration_cap, run_command, tool_error, ProgressParser};
use crate::error::{Error, Result};

const ENGINE_ARGUMENTS: [&str; 6] = [
    "-hide_banner",
    "-nostats",
    "-nostdin",
    "-progress",
    "pipe:1",
    "-y",
];
const MAX_LINE_LENGTH: usize = 8 * 1024;
const LOG_TAIL_LINES: usize = 20;

pub trait Engine: Send + Sync + 'static {
    fn is_loaded(&self) -> bool;

    /// Prepares the engine. Only the first successful call does any work;
    /// concurrent callers wait for the same initialization.
    fn load(&self) -> impl Future<Output = Result<()>> + Send;

    fn write_input(&self, name: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Runs one conversion. Completion ratios in `[0, 1]` are sent on
    /// `progress` in non-decreasing order.
    fn run(
        &self,
        arguments: Vec<String>,
        progress: mpsc::Sender<f64>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn read_output(&self, name: &str) -> impl Future<Output = Result<Bytes>> + Send;

    /// Deletes a workspace file. Missing files are not an error.
    fn remove(&self, name: &str) -> impl Future<Output = Result<()>> + Send;
}

struct Loaded {
    ffmpeg: PathBuf,
    workspace: TempDir,
}

/// Runs the `ffmpeg` executable against files in a private temporary
/// directory.
pub struct FfmpegEngine {
    configured_path: Option<PathBuf>,
    run_timeout: Duration,
    loaded: OnceCell<Loaded>,
}

impl FfmpegEngine {
    pub fn new(configured_path: Option<PathBuf>, run_timeout: Duration) -> Self {
        FfmpegEngine {
            configured_path,
            run_timeout,
            loaded: OnceCell::new(),
        }
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.loaded
            .get()
            .ok_or_else(|| Error::EngineInit("conversion library has not been loaded".to_owned()))
    }

    fn workspace_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.loaded()?.workspace.path().join(name))
    }
}

fn locate_ffmpeg(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        debug!("configured ffmpeg {} does not exist, searching PATH", path.display());
    }

    which::which("ffmpeg").map_err(|err| {
        Error::EngineInit(format!("ffmpeg not found; is it installed and in PATH? ({err})"))
    })
}

async fn initialize(configured: Option<&Path>) -> Result<Loaded> {
    let ffmpeg = locate_ffmpeg(configured)?;

    let output = run_command(&ffmpeg, &["-hide_banner", "-version"], "ffmpeg -version")
        .await
        .map_err(|err| Error::EngineInit(err.to_string()))?;

    let version = String::from_utf8_lossy(&output.stdout);
    info!(
        "conversion library ready: {} ({})",
        version.lines().next().unwrap_or("unknown version"),
        ffmpeg.display()
    );

    let workspace = tempfile::Builder::new()
        .prefix("ffconvert-")
        .tempdir()
        .map_err(|err| Error::EngineInit(format!("failed to create workspace: {err}")))?;

    Ok(Loaded { ffmpeg, workspace })
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), b"\n".to_vec(), MAX_LINE_LENGTH)
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == LOG_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

impl Engine for FfmpegEngine {
    fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    async fn load(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| initialize(self.configured_path.as_deref()))
            .await?;
        Ok(())
    }

    async fn write_input(&self, name: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.workspace_path(name)?, data).await?;
        Ok(())
    }

    async fn run(&self, arguments: Vec<String>, progress: mpsc::Sender<f64>) -> Result<()> {
        let loaded = self.loaded()?;
        let mut parser = ProgressParser::new(duration_cap(&arguments));

        debug!("ffmpeg arguments: {:?}", arguments);

        let mut child = Command::new(&loaded.ffmpeg)
            .args(ENGINE_ARGUMENTS)
            .args(&arguments)
            .current_dir(loaded.workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| tool_error("failed to start ffmpeg", err))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::EngineRun("ffmpeg output was not captured".to_owned()));
        };

        let mut stdout = FramedRead::new(stdout, line_codec());
        let mut stderr = FramedRead::new(stderr, line_codec());
        let mut tail = VecDeque::with_capacity(LOG_TAIL_LINES);

        let work = async {
            let (mut stdout_open, mut stderr_open) = (true, true);
            // After a decode error the reader yields one `None` and then
            // resumes, so that `None` is not end of stream.
            let (mut stdout_skipped, mut stderr_skipped) = (false, false);

            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout.next(), if stdout_open => match line {
                        Some(Ok(line)) => {
                            stdout_skipped = false;
                            let line = String::from_utf8_lossy(&line);
                            if let Some(ratio) = parser.progress_line(&line) {
                                // Nobody listening is fine.
                                let _ = progress.send(ratio).await;
                            }
                        }
                        Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                            trace!("ffmpeg: skipping overlong progress line");
                            stdout_skipped = true;
                        }
                        None if stdout_skipped => stdout_skipped = false,
                        Some(Err(_)) | None => stdout_open = false,
                    },
                    line = stderr.next(), if stderr_open => match line {
                        Some(Ok(line)) if line.is_empty() => stderr_skipped = false,
                        Some(Ok(line)) => {
                            stderr_skipped = false;
                            let line = String::from_utf8_lossy(&line).into_owned();
                            trace!("ffmpeg: {}", line);
                            parser.log_line(&line);
                            push_tail(&mut tail, line);
                        }
                        Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                            trace!("ffmpeg: skipping overlong log line");
                            stderr_skipped = true;
                        }
                        None if stderr_skipped => stderr_skipped = false,
                        Some(Err(_)) | None => stderr_open = false,
                    },
                }
            }

            child.wait().await
        };

        let status = match tokio::time::timeout(self.run_timeout, work).await {
            Ok(status) => status.map_err(|err| tool_error("failed waiting for ffmpeg", err))?,
            Err(_elapsed) => {
                // `child` is killed when dropped.
                return Err(Error::EngineRun(format!(
                    "ffmpeg timed out after {:?}",
                    self.run_timeout
                )));
            }
        };

        if !status.success() {
            let log = Vec::from(tail).join("\n");
            return Err(Error::EngineRun(format!("ffmpeg exited with {status}\n\n{log}")));
        }

        Ok(())
    }

    async fn read_output(&self, name: &str) -> Result<Bytes> {
        let data = tokio::fs::read(self.workspace_path(name)?).await?;
        Ok(Bytes::from(data))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.workspace_path(name)?).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
