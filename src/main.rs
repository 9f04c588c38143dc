mod classify;
mod config;
mod error;
mod extractor;
mod stream;

use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    response::Response,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Semaphore, time::Duration};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::{MenuEntry, build_menu};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::stream::DownloadQuery;

const STALE_JOB_SECONDS: u64 = 2 * 60 * 60;
const RELAY_CONNECT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    http_client: reqwest::Client,
    extract_semaphore: Arc<Semaphore>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
    original_url: String,
    formats: Vec<MenuEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "clipfetch_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Arc::new(AppConfig::from_env());

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "No se pudo crear la carpeta temporal de descargas: {error}"
            ))
        })?;
    stream::sweep_stale_jobs(&config.scratch_dir, Duration::from_secs(STALE_JOB_SECONDS)).await;

    if config.extractor.proxy_url.is_some() {
        info!("Proxy de salida configurado para yt-dlp y el relay HTTP.");
    } else {
        warn!("YT_DLP_PROXY no configurado. Las extracciones saldran con la IP del servidor.");
    }

    let state = AppState {
        http_client: build_relay_client(&config)?,
        extract_semaphore: Arc::new(Semaphore::new(config.max_concurrent_extractions)),
        config: Arc::clone(&config),
    };

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(state).layer(cors);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!(
            "No se pudo iniciar el puerto {}: {error}",
            config.bind_addr
        ))
    })?;

    info!("Backend listo en http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/download", get(download))
        .with_state(state)
}

fn build_relay_client(config: &AppConfig) -> Result<reqwest::Client, ApiError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(RELAY_CONNECT_TIMEOUT_SECONDS))
        .user_agent(config.extractor.user_agent.clone());

    if let Some(proxy_url) = config.extractor.proxy_url.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|error| ApiError::internal(format!("YT_DLP_PROXY invalido: {error}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|error| ApiError::internal(format!("No se pudo crear cliente HTTP: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn analyze(
    State(state): State<AppState>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let url = extractor::validate_media_url(&payload.url)?;
    info!("Solicitud de analisis para {url}");

    let permit = state
        .extract_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("No se pudo reservar capacidad de extraccion."))?;
    let info = extractor::fetch_media_info(&state.config.extractor, url).await;
    drop(permit);
    let info = info?;

    let formats = build_menu(&info, &state.config.policy)?;
    info!("Analisis completado para {url}: {} formatos.", formats.len());

    Ok(Json(AnalyzeResponse {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Sin titulo".to_string()),
        thumbnail: info.thumbnail,
        original_url: info
            .webpage_url
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| url.to_string()),
        formats,
        description: info.description,
    }))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    info!(
        "Solicitud de descarga: {:?} (formato {})",
        query.title, query.format_id
    );

    let permit = state
        .extract_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("No se pudo reservar capacidad de extraccion."))?;

    stream::deliver(&state.http_client, &state.config, permit, query).await
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS no esta configurado. Se usaran origenes de desarrollo por defecto.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });

    info!(
        "CORS allow-list cargada con {} origen(es).",
        allowed_origins.len()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static("x-download-filename"),
        ]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}
