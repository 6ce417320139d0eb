use actix_web::{
    http::header::{ContentDisposition, DispositionParam, DispositionType},
    http::StatusCode,
    web, App, HttpResponse, HttpServer, Responder, Result,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, ErrorKind};
use crate::models::{Container, ConversionOptions, MediaJob, Optimization};
use crate::plan::{build_plan, EncodePlan};
use crate::processor::Processor;
use crate::validate::{check_size, classify};

struct AppState<E> {
    processor: Processor<E>,
    max_input_bytes: u64,
}

fn default_include_audio() -> bool {
    true
}

#[derive(Deserialize)]
struct SubmitParams {
    name: String,
    #[serde(default = "default_include_audio")]
    include_audio: bool,
    #[serde(default)]
    optimization: Optimization,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: Uuid,
    source: Container,
    target: Container,
    output_file_name: String,
    arguments: Vec<String>,
}

#[derive(Deserialize)]
struct PlanParams {
    target: Container,
    #[serde(default = "default_include_audio")]
    include_audio: bool,
    #[serde(default)]
    optimization: Optimization,
}

#[derive(Serialize)]
struct PlanResponse {
    plan: EncodePlan,
    arguments: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorKind,
    description: String,
}

fn build_error_response(err: &Error) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    HttpResponse::build(status).json(ErrorResponse {
        error: err.kind(),
        description: err.to_string(),
    })
}

/// Collects the request body, giving up as soon as it grows past `limit`.
async fn receive_upload(payload: &mut web::Payload, limit: u64) -> Result<Bytes, Error> {
    let mut body = BytesMut::new();

    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| std::io::Error::other(err.to_string()))?;
        check_size((body.len() + chunk.len()) as u64, limit)?;
        body.extend_from_slice(&chunk);
    }

    Ok(body.freeze())
}

async fn status<E: Engine>(data: web::Data<AppState<E>>) -> impl Responder {
    web::Json(data.processor.status())
}

async fn submit<E: Engine>(
    data: web::Data<AppState<E>>,
    params: web::Query<SubmitParams>,
    mut payload: web::Payload,
) -> Result<HttpResponse> {
    // Reject the wrong kind of file before reading any of it.
    if let Err(err) = classify(&params.name) {
        info!("rejected upload {:?}: {}", params.name, err);
        return Ok(build_error_response(&err));
    }

    // No point reading the body while a job is running; `submit` still
    // decides if the state changes in between.
    if data.processor.status().state.is_active() {
        info!("rejected upload {:?}: busy", params.name);
        return Ok(build_error_response(&Error::Busy));
    }

    let input = match receive_upload(&mut payload, data.max_input_bytes).await {
        Ok(input) => input,
        Err(err) => {
            info!("rejected upload {:?}: {}", params.name, err);
            return Ok(build_error_response(&err));
        }
    };

    let options = ConversionOptions {
        include_audio: params.include_audio,
        optimization: params.optimization,
    };

    let mut job = match MediaJob::new(&params.name, input, data.max_input_bytes) {
        Ok(job) => job,
        Err(err) => return Ok(build_error_response(&err)),
    };
    job.set_options(options);

    let source = job.source;
    let target = job.target;
    let output_file_name = job.output_file_name();
    let arguments = build_plan(target, &options).arguments();

    match data.processor.submit(job) {
        Ok(submitted) => Ok(HttpResponse::build(StatusCode::ACCEPTED).json(SubmitResponse {
            id: submitted.id,
            source,
            target,
            output_file_name,
            arguments,
        })),
        Err(err) => Ok(build_error_response(&err)),
    }
}

async fn output<E: Engine>(data: web::Data<AppState<E>>) -> HttpResponse {
    let Some(output) = data.processor.output() else {
        return build_error_response(&Error::NoOutput);
    };

    HttpResponse::Ok()
        .content_type(output.mime_type)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(output.file_name)],
        })
        .body(output.data)
}

async fn reset<E: Engine>(data: web::Data<AppState<E>>) -> HttpResponse {
    data.processor.reset();
    HttpResponse::NoContent().finish()
}

async fn plan(params: web::Query<PlanParams>) -> impl Responder {
    let options = ConversionOptions {
        include_audio: params.include_audio,
        optimization: params.optimization,
    };
    let plan = build_plan(params.target, &options);
    let arguments = plan.arguments();

    web::Json(PlanResponse { plan, arguments })
}

fn routes<E: Engine>(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(status::<E>))
        .route("/", web::post().to(submit::<E>))
        .route("/output", web::get().to(output::<E>))
        .route("/reset", web::post().to(reset::<E>))
        .route("/plan", web::get().to(plan));
}

pub async fn start_web_server<E: Engine>(
    processor: Processor<E>,
    config: &Config,
) -> std::io::Result<()> {
    let app_state = web::Data::new(AppState {
        processor,
        max_input_bytes: config.max_input_bytes,
    });
    let port = config.port;

    info!("Starting web server at 0.0.0.0:{port}...");

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::<E>)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
