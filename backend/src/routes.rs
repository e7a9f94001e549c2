use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{mime, web, HttpMessage, HttpRequest, HttpResponse, ResponseError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use shared::{Base64Request, BatchResponse, ErrorResponse, HealthResponse};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::inference::{InferenceError, InferenceService};

const NO_IMAGE: &str = "No image provided. Please upload an image file.";
const NO_IMAGE_SELECTED: &str = "No image selected.";
const NO_IMAGE_DATA: &str = "No image data provided.";
const NO_IMAGES: &str = "No images provided.";

impl ResponseError for InferenceError {
    fn status_code(&self) -> StatusCode {
        if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = self.client_message();
        if self.is_client_error() {
            warn!("Rejected request: {}", message);
        } else {
            error!("Request failed: {}", message);
        }
        HttpResponse::build(self.status_code()).json(ErrorResponse { error: message })
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(health)))
        .service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/api/detect").route(web::post().to(predict)))
        .service(web::resource("/predict_base64").route(web::post().to(predict_base64)))
        .service(web::resource("/batch_predict").route(web::post().to(batch_predict)));
}

async fn health(service: web::Data<InferenceService>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        message: "Deepfake Detection API is running".to_string(),
        model_loaded: service.is_loaded(),
        device: service.device_name(),
    })
}

/// A file part of a multipart request.
struct Upload {
    filename: String,
    data: Vec<u8>,
}

fn is_multipart(req: &HttpRequest) -> bool {
    matches!(req.mime_type(), Ok(Some(content_type)) if content_type.type_() == mime::MULTIPART)
}

/// Collects every part named `field_name`, in request order. A part without
/// a filename gets an empty one. A body that is not multipart has no parts.
async fn collect_uploads(
    req: &HttpRequest,
    mut payload: Multipart,
    field_name: &str,
    max_bytes: usize,
) -> Result<Vec<Upload>, InferenceError> {
    let mut uploads = Vec::new();
    if !is_multipart(req) {
        return Ok(uploads);
    }

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| InferenceError::validation(format!("Invalid multipart payload: {}", e)))?
    {
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let wanted = field.name() == Some(field_name);

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| {
                InferenceError::validation(format!("Invalid multipart payload: {}", e))
            })?;
            if !wanted {
                continue;
            }
            if data.len() + chunk.len() > max_bytes {
                return Err(too_large(max_bytes));
            }
            data.extend_from_slice(&chunk);
        }

        if wanted {
            uploads.push(Upload {
                filename: filename.unwrap_or_default(),
                data,
            });
        }
    }

    Ok(uploads)
}

fn too_large(max_bytes: usize) -> InferenceError {
    InferenceError::validation(format!(
        "Image exceeds the maximum upload size of {} bytes.",
        max_bytes
    ))
}

/// Runs CPU-bound work on the blocking pool.
async fn run_blocking<T, F>(work: F) -> Result<T, InferenceError>
where
    F: FnOnce() -> Result<T, InferenceError> + Send + 'static,
    T: Send + 'static,
{
    web::block(work)
        .await
        .map_err(|e| InferenceError::Processing(e.to_string()))?
}

async fn predict(
    req: HttpRequest,
    service: web::Data<InferenceService>,
    config: web::Data<AppConfig>,
    payload: Multipart,
) -> Result<HttpResponse, InferenceError> {
    service.ensure_loaded()?;

    let upload = collect_uploads(&req, payload, "image", config.max_upload_bytes)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::validation(NO_IMAGE))?;
    if upload.filename.is_empty() {
        return Err(InferenceError::validation(NO_IMAGE_SELECTED));
    }

    let request_id = Uuid::new_v4();
    info!(
        "[{}] predicting {} ({} bytes)",
        request_id,
        upload.filename,
        upload.data.len()
    );
    let service = service.into_inner();
    let result = run_blocking(move || service.infer(&upload.data)).await?;
    info!(
        "[{}] {} with confidence {:.4}",
        request_id, result.prediction, result.confidence
    );

    Ok(HttpResponse::Ok().json(result))
}

/// Decodes a base64 payload, tolerating a `data:<mime>;base64,` prefix and
/// embedded whitespace.
fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, InferenceError> {
    let encoded = match encoded.trim_start().strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => encoded,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| InferenceError::Processing(format!("Invalid base64 image data: {}", e)))
}

async fn predict_base64(
    service: web::Data<InferenceService>,
    config: web::Data<AppConfig>,
    body: web::Bytes,
) -> Result<HttpResponse, InferenceError> {
    service.ensure_loaded()?;

    let request: Base64Request = serde_json::from_slice(&body)
        .map_err(|e| InferenceError::validation(format!("Invalid JSON body: {}", e)))?;
    let encoded = request
        .image
        .ok_or_else(|| InferenceError::validation(NO_IMAGE_DATA))?;
    let image = decode_base64_image(&encoded)?;
    if image.len() > config.max_upload_bytes {
        return Err(too_large(config.max_upload_bytes));
    }

    let request_id = Uuid::new_v4();
    info!("[{}] predicting base64 image ({} bytes)", request_id, image.len());
    let service = service.into_inner();
    let result = run_blocking(move || service.infer(&image)).await?;
    info!(
        "[{}] {} with confidence {:.4}",
        request_id, result.prediction, result.confidence
    );

    Ok(HttpResponse::Ok().json(result))
}

async fn batch_predict(
    req: HttpRequest,
    service: web::Data<InferenceService>,
    config: web::Data<AppConfig>,
    payload: Multipart,
) -> Result<HttpResponse, InferenceError> {
    service.ensure_loaded()?;

    let uploads = collect_uploads(&req, payload, "images", config.max_upload_bytes).await?;
    if uploads.is_empty() {
        return Err(InferenceError::validation(NO_IMAGES));
    }
    let items: Vec<(String, Vec<u8>)> = uploads
        .into_iter()
        .map(|upload| (upload.filename, upload.data))
        .collect();

    let request_id = Uuid::new_v4();
    info!("[{}] batch of {} images", request_id, items.len());
    let service = service.into_inner();
    let results = run_blocking(move || service.infer_batch(items)).await?;
    let failed = results
        .iter()
        .filter(|entry| matches!(entry, shared::BatchEntry::Error { .. }))
        .count();
    info!(
        "[{}] batch finished: {} succeeded, {} failed",
        request_id,
        results.len() - failed,
        failed
    );

    Ok(HttpResponse::Ok().json(BatchResponse { results }))
}
