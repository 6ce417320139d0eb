use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engine::FfmpegEngine;
use crate::processor::Processor;
use crate::web::start_web_server;

mod command;
mod config;
mod engine;
mod error;
mod models;
mod plan;
mod processor;
mod validate;
mod web;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ffconvert=debug,actix_web=info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env();
    tracing::debug!("configuration: {:?}", config);

    // ffmpeg is located and checked on the first conversion, not at startup.
    let engine = FfmpegEngine::new(config.ffmpeg_path.clone(), config.run_timeout);
    let processor = Processor::new(engine);

    start_web_server(processor, &config).await
}
