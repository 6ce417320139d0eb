//! Table-driven mapping from a target container and user options to ffmpeg
//! encoding parameters.
//!
//! Plans are plain values: building one never touches the engine, and the same
//! inputs always produce the same argument list.

use serde::Serialize;
use std::time::Duration;

use crate::models::{Container, ConversionOptions, Optimization};

const FPS_CAP: u32 = 15;
const DURATION_CAP: Duration = Duration::from_secs(30);
const REDUCED_AUDIO_BITRATE_KBPS: u32 = 64;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp8,
    H264,
}

impl VideoCodec {
    fn encoder(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "libvpx",
            VideoCodec::H264 => "libx264",
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Vorbis,
    Aac,
}

impl AudioCodec {
    fn encoder(self) -> &'static str {
        match self {
            AudioCodec::Vorbis => "libvorbis",
            AudioCodec::Aac => "aac",
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTrack {
    Omit,
    Encode {
        codec: AudioCodec,
        bitrate_kbps: Option<u32>,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EncodePlan {
    pub container: Container,
    pub video: VideoCodec,
    pub audio: AudioTrack,
    pub crf: u8,
    /// Lets CRF alone drive quality (libvpx otherwise applies a default bitrate).
    pub unconstrained_bitrate: bool,
    pub preset: Option<&'static str>,
    pub max_fps: Option<u32>,
    pub max_duration: Option<Duration>,
}

struct Defaults {
    video: VideoCodec,
    audio: AudioCodec,
    crf: u8,
    lower_quality_crf: u8,
    target_size_crf: u8,
    unconstrained_bitrate: bool,
    preset: Option<&'static str>,
}

fn defaults(target: Container) -> Defaults {
    match target {
        Container::Webm => Defaults {
            video: VideoCodec::Vp8,
            audio: AudioCodec::Vorbis,
            crf: 30,
            lower_quality_crf: 40,
            target_size_crf: 40,
            unconstrained_bitrate: true,
            preset: None,
        },
        Container::Mp4 => Defaults {
            video: VideoCodec::H264,
            audio: AudioCodec::Aac,
            crf: 23,
            lower_quality_crf: 28,
            target_size_crf: 35,
            unconstrained_bitrate: false,
            preset: Some("fast"),
        },
    }
}

pub fn build_plan(target: Container, options: &ConversionOptions) -> EncodePlan {
    let defaults = defaults(target);

    let mut plan = EncodePlan {
        container: target,
        video: defaults.video,
        audio: match options.include_audio {
            true => AudioTrack::Encode {
                codec: defaults.audio,
                bitrate_kbps: None,
            },
            false => AudioTrack::Omit,
        },
        crf: defaults.crf,
        unconstrained_bitrate: defaults.unconstrained_bitrate,
        preset: defaults.preset,
        max_fps: None,
        max_duration: None,
    };

    match options.optimization {
        Optimization::None => {}
        Optimization::LimitFps => plan.max_fps = Some(FPS_CAP),
        Optimization::LimitDuration => plan.max_duration = Some(DURATION_CAP),
        Optimization::LowerQuality => plan.crf = defaults.lower_quality_crf,
        Optimization::TargetSize => {
            plan.crf = defaults.target_size_crf;
            plan.max_fps = Some(FPS_CAP);
            if let AudioTrack::Encode { bitrate_kbps, .. } = &mut plan.audio {
                *bitrate_kbps = Some(REDUCED_AUDIO_BITRATE_KBPS);
            }
        }
    }

    plan
}

impl EncodePlan {
    /// Argument template with `$INPUT` and `$OUTPUT` placeholders.
    pub fn arguments(&self) -> Vec<String> {
        let mut arguments: Vec<String> = vec![
            "-i".into(),
            "$INPUT".into(),
            "-c:v".into(),
            self.video.encoder().into(),
            "-crf".into(),
            self.crf.to_string(),
        ];

        if self.unconstrained_bitrate {
            arguments.extend(["-b:v".to_string(), "0".to_string()]);
        }

        if let Some(preset) = self.preset {
            arguments.extend(["-preset".to_string(), preset.to_string()]);
        }

        if let Some(fps) = self.max_fps {
            arguments.extend(["-fpsmax".to_string(), fps.to_string()]);
        }

        if let Some(duration) = self.max_duration {
            arguments.extend(["-t".to_string(), duration.as_secs().to_string()]);
        }

        match self.audio {
            AudioTrack::Omit => arguments.push("-an".into()),
            AudioTrack::Encode {
                codec,
                bitrate_kbps,
            } => {
                arguments.extend(["-c:a".to_string(), codec.encoder().to_string()]);
                if let Some(kbps) = bitrate_kbps {
                    arguments.extend(["-b:a".to_string(), format!("{kbps}k")]);
                }
            }
        }

        arguments.push("$OUTPUT".into());
        arguments
    }

    /// Concrete argv for the engine, with the placeholders filled in.
    pub fn build_arguments(&self, input: &str, output: &str) -> Vec<String> {
        self.arguments()
            .into_iter()
            .map(|arg| match arg.as_str() {
                "$INPUT" => input.to_owned(),
                "$OUTPUT" => output.to_owned(),
                _ => arg,
            })
            .collect()
    }
}
