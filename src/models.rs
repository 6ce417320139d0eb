use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::validate::{check_size, classify, output_file_name};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Container::Mp4 => "video/mp4",
            Container::Webm => "video/webm",
        }
    }

    /// The container a file of this type gets converted into.
    pub fn other(self) -> Container {
        match self {
            Container::Mp4 => Container::Webm,
            Container::Webm => Container::Mp4,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Optimization {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "fps")]
    LimitFps,
    #[serde(rename = "length")]
    LimitDuration,
    #[serde(rename = "quality")]
    LowerQuality,
    /// Fixed smaller-output preset. Does not measure or target a byte size.
    #[serde(rename = "size")]
    TargetSize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionOptions {
    #[serde(default = "default_include_audio")]
    pub include_audio: bool,
    #[serde(default)]
    pub optimization: Optimization,
}

fn default_include_audio() -> bool {
    true
}

impl Default for ConversionOptions {
    fn default() -> Self {
        ConversionOptions {
            include_audio: true,
            optimization: Optimization::None,
        }
    }
}

/// One conversion request, from upload until it is handed to the processor.
#[derive(Debug, Clone)]
pub struct MediaJob {
    pub file_name: String,
    pub input: Bytes,
    pub source: Container,
    pub target: Container,
    pub size: u64,
    options: ConversionOptions,
}

impl MediaJob {
    /// Validates the name and size and infers the container pair.
    pub fn new(file_name: &str, input: Bytes, max_input_bytes: u64) -> Result<MediaJob> {
        let (source, target) = classify(file_name)?;
        let size = input.len() as u64;
        check_size(size, max_input_bytes)?;

        Ok(MediaJob {
            file_name: file_name.to_owned(),
            input,
            source,
            target,
            size,
            options: ConversionOptions::default(),
        })
    }

    pub fn set_options(&mut self, options: ConversionOptions) {
        self.options = options;
    }

    pub fn options(&self) -> ConversionOptions {
        self.options
    }

    pub fn output_file_name(&self) -> String {
        output_file_name(&self.file_name, self.target)
    }
}

/// A finished conversion, ready to be downloaded.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub data: Bytes,
    pub mime_type: &'static str,
    pub file_name: String,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Loading,
    Running,
    Succeeded,
    Failed,
}

impl State {
    pub fn is_active(self) -> bool {
        matches!(self, State::Loading | State::Running)
    }
}

pub enum FileType {
    Input,
    Output,
}

/// Name of a job's file inside the engine workspace.
pub fn build_path(id: Uuid, file_type: FileType, container: Container) -> String {
    match file_type {
        FileType::Input => format!("{id}-input.{container}"),
        FileType::Output => format!("{id}-output.{container}"),
    }
}
