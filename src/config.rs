use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PORT: u16 = 3600;
const DEFAULT_MAX_INPUT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Largest accepted upload; a file of exactly this size is allowed.
    pub max_input_bytes: u64,
    /// Explicit ffmpeg location. When unset (or missing) `PATH` is searched.
    pub ffmpeg_path: Option<PathBuf>,
    pub run_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            ffmpeg_path: None,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        Config {
            port: parse_or(&lookup, "PORT", defaults.port),
            max_input_bytes: parse_or(
                &lookup,
                "FFCONVERT_MAX_INPUT_BYTES",
                defaults.max_input_bytes,
            ),
            ffmpeg_path: lookup("FFMPEG_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            run_timeout: Duration::from_secs(parse_or(
                &lookup,
                "FFCONVERT_RUN_TIMEOUT_SECS",
                defaults.run_timeout.as_secs(),
            )),
        }
    }
}

fn parse_or<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(value) => value.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("ignoring invalid {key}={value:?}");
            default
        }),
    }
}
