use regex::Regex;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

use crate::error::Error;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Duration: (\d\d):(\d\d):(\d\d)\.(\d\d),").expect("duration pattern")
});

pub async fn run_command(
    executable: &Path,
    arguments: &[&str],
    descriptor: &str,
) -> std::io::Result<Output> {
    let output = Command::new(executable)
        .args(arguments)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let text = String::from_utf8_lossy(&output.stderr);
        return Err(std::io::Error::other(format!(
            "{descriptor} failed\n\n{}",
            text.trim()
        )));
    }

    Ok(output)
}

fn cap_u64(cap: &regex::Captures, i: usize) -> Option<u64> {
    cap.get(i)?.as_str().parse::<u64>().ok()
}

/// Reads the input duration from an ffmpeg log line such as
/// `  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s`.
pub fn parse_duration(line: &str) -> Option<Duration> {
    let cap = DURATION_RE.captures(line)?;

    let seconds = cap_u64(&cap, 1)? * 3600 + cap_u64(&cap, 2)? * 60 + cap_u64(&cap, 3)?;
    let centis = cap_u64(&cap, 4)?;

    Some(Duration::from_millis(seconds * 1000 + centis * 10))
}

/// Extracts the `-t` duration cap from an ffmpeg argument list.
pub fn duration_cap(arguments: &[String]) -> Option<Duration> {
    let position = arguments.iter().position(|arg| arg == "-t")?;
    let seconds = arguments.get(position + 1)?.parse::<f64>().ok()?;

    (seconds.is_finite() && seconds > 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Turns ffmpeg log output into a completion ratio.
///
/// The total comes from the input `Duration:` line on stderr (shortened by
/// any `-t` cap), elapsed time from `out_time_us` on the `-progress` stream.
/// Ratios only ever increase.
#[derive(Debug, Default)]
pub struct ProgressParser {
    cap: Option<Duration>,
    total: Option<Duration>,
    last: f64,
}

impl ProgressParser {
    pub fn new(cap: Option<Duration>) -> Self {
        ProgressParser {
            cap,
            total: cap,
            last: 0.0,
        }
    }

    pub fn log_line(&mut self, line: &str) {
        if let Some(duration) = parse_duration(line) {
            self.total = Some(match self.cap {
                Some(cap) => cap.min(duration),
                None => duration,
            });
        }
    }

    /// Feeds one `key=value` line of `-progress` output; returns a new ratio
    /// when it moved forward.
    pub fn progress_line(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;

        let ratio = match key {
            "out_time_us" | "out_time_ms" => {
                let total = self.total?.as_micros();
                let elapsed = value.trim().parse::<i64>().ok()?.max(0) as u128;
                if total == 0 {
                    return None;
                }
                (elapsed as f64 / total as f64).min(1.0)
            }
            "progress" if value.trim() == "end" => 1.0,
            _ => return None,
        };

        if ratio > self.last {
            self.last = ratio;
            return Some(ratio);
        }

        None
    }
}

pub fn tool_error(descriptor: &str, err: impl ToString) -> Error {
    Error::EngineRun(format!("{descriptor}: {}", err.to_string()))
}
