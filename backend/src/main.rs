mod config;
mod inference;
mod routes;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use config::AppConfig;
use inference::InferenceService;
use inference::service::describe_device;
use routes::configure_routes;
use std::env;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;
    let device = config.device().map_err(|e| {
        log::error!("Invalid device setting: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;
    log::info!(
        "Using device {} and checkpoint {}",
        describe_device(device),
        config.model_path.display()
    );

    // The model is loaded before the server accepts requests; a failed load
    // keeps the server up and every inference route reports it.
    let service = web::Data::new(InferenceService::load(&config.model_path, device));
    if !service.is_loaded() {
        log::warn!("Serving without a model; inference routes will return errors");
    }

    // base64 inflates payloads by a third
    let payload_limit = config.max_upload_bytes / 3 * 4 + 4096;
    let bind_address = config.bind_address();
    let app_config = web::Data::new(config);

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(service.clone())
            .app_data(app_config.clone())
            .app_data(web::PayloadConfig::new(payload_limit))
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
