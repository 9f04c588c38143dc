//! Frontera con yt-dlp: arma los argumentos, ejecuta el proceso y
//! convierte su JSON en descriptores de variantes.

use std::{io::ErrorKind, path::Path};

use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, warn};
use url::Url;

use crate::config::ExtractorConfig;
use crate::error::{ApiError, ExtractorContext, map_extractor_failure};

#[derive(Debug, Default, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<serde_json::Value>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Variant {
    pub format_id: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

impl MediaInfo {
    // Cada formato se decodifica por separado: uno malformado se descarta
    // sin invalidar el lote completo.
    pub fn variants(&self) -> Vec<Variant> {
        self.formats
            .iter()
            .filter_map(|raw| match serde_json::from_value::<Variant>(raw.clone()) {
                Ok(variant) => Some(variant),
                Err(error) => {
                    debug!("Formato ignorado por estructura inesperada: {error}");
                    None
                }
            })
            .collect()
    }
}

pub fn validate_media_url(input: &str) -> Result<&str, ApiError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid_input("El campo url es obligatorio."));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|_| ApiError::invalid_input("El campo url no es una URL valida."))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::invalid_input(
            "El campo url debe usar http o https.",
        ));
    }

    Ok(trimmed)
}

pub async fn fetch_media_info(
    config: &ExtractorConfig,
    url: &str,
) -> Result<MediaInfo, ApiError> {
    let mut args = base_args(config);
    args.push("-J".to_string());
    args.push(url.to_string());

    let output = run_yt_dlp(config, args, ExtractorContext::Analyze).await?;
    parse_media_info(&output.stdout, ExtractorContext::Analyze)
}

pub async fn resolve_variant_info(
    config: &ExtractorConfig,
    url: &str,
    format_id: &str,
) -> Result<MediaInfo, ApiError> {
    let mut args = base_args(config);
    args.push("-f".to_string());
    args.push(format_id.to_string());
    args.push("-J".to_string());
    args.push(url.to_string());

    let output = run_yt_dlp(config, args, ExtractorContext::Resolve).await?;
    parse_media_info(&output.stdout, ExtractorContext::Resolve)
}

pub async fn materialize_variant(
    config: &ExtractorConfig,
    url: &str,
    format_id: &str,
    job_dir: &Path,
) -> Result<Option<String>, ApiError> {
    let output_template = format!("{}/%(title).140B-%(id)s.%(ext)s", job_dir.to_string_lossy());

    let mut args = base_args(config);
    args.extend([
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        output_template,
        "-f".to_string(),
        format_id.to_string(),
        url.to_string(),
    ]);

    let output = run_yt_dlp(config, args, ExtractorContext::Resolve).await?;
    Ok(extract_printed_path(&output.stdout))
}

fn base_args(config: &ExtractorConfig) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-cache-dir".to_string(),
        "--retries".to_string(),
        config.retries.to_string(),
        "--fragment-retries".to_string(),
        config.fragment_retries.to_string(),
        "--socket-timeout".to_string(),
        config.socket_timeout_seconds.to_string(),
        "--user-agent".to_string(),
        config.user_agent.clone(),
    ];

    if config.force_ipv4 {
        args.push("--force-ipv4".to_string());
    }
    if config.geo_bypass {
        args.push("--geo-bypass".to_string());
    }
    if let Some(proxy_url) = config.proxy_url.as_deref() {
        args.push("--proxy".to_string());
        args.push(proxy_url.to_string());
    }

    args
}

async fn run_yt_dlp(
    config: &ExtractorConfig,
    args: Vec<String>,
    context: ExtractorContext,
) -> Result<std::process::Output, ApiError> {
    let command_future = Command::new("yt-dlp").args(args).output();
    let output = timeout(Duration::from_secs(config.timeout_seconds), command_future)
        .await
        .map_err(|_| {
            context.failure("La operacion de yt-dlp excedio el tiempo limite. Reintenta mas tarde.")
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp no esta instalado en el sistema. Instala yt-dlp y reinicia el backend.",
                )
            } else {
                ApiError::internal(format!("No se pudo ejecutar yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(map_extractor_failure(context, &output.stderr));
    }

    Ok(output)
}

fn parse_media_info(stdout: &[u8], context: ExtractorContext) -> Result<MediaInfo, ApiError> {
    serde_json::from_slice(stdout).map_err(|error| {
        warn!("yt-dlp devolvio JSON que no se pudo interpretar: {error}");
        context.failure("yt-dlp devolvio una respuesta que no se pudo interpretar.")
    })
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}
