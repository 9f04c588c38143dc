//! Proxy de transferencia: resuelve la variante elegida, retransmite los
//! bytes por partes y garantiza la limpieza del artefacto temporal.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::{Stream, StreamExt, stream::BoxStream};
use serde::Deserialize;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, non_empty};
use crate::error::ApiError;
use crate::extractor;

const MAX_TITLE_CHARS: usize = 150;
const ILLEGAL_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub url: String,
    pub format_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub quality: String,
}

enum Resolved {
    Remote { source_url: String },
    Local { job: ScratchJob, path: PathBuf, length: u64 },
}

pub async fn deliver(
    client: &reqwest::Client,
    config: &AppConfig,
    permit: OwnedSemaphorePermit,
    query: DownloadQuery,
) -> Result<Response, ApiError> {
    let url = extractor::validate_media_url(&query.url)?;
    let format_id = non_empty(&query.format_id)
        .ok_or_else(|| ApiError::invalid_input("El campo format_id es obligatorio."))?;

    // El permiso solo cubre el trabajo de yt-dlp; la retransmision no debe
    // ocupar capacidad de extraccion.
    let resolved = resolve_variant(config, url, format_id).await;
    drop(permit);
    let resolved = resolved?;

    let filename = build_download_filename(&query.title, &query.quality, &query.ext);
    let content_type = content_type_for_filename(&filename);

    match resolved {
        Resolved::Remote { source_url } => {
            let response = client.get(&source_url).send().await.map_err(|error| {
                ApiError::resolution_failed(format!(
                    "No se pudo abrir el origen del formato: {error}"
                ))
            })?;
            if !response.status().is_success() {
                return Err(ApiError::resolution_failed(format!(
                    "El origen respondio {} al pedir el formato.",
                    response.status()
                )));
            }

            let content_length = response.content_length();
            let source = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            let body = Body::from_stream(RelayStream::new(source, None, filename.clone()));
            build_response(body, &filename, content_type, content_length)
        }
        Resolved::Local { job, path, length } => {
            let file = tokio::fs::File::open(&path).await.map_err(|error| {
                ApiError::artifact_missing(format!(
                    "No se pudo abrir el archivo temporal descargado: {error}"
                ))
            })?;
            let source = ReaderStream::with_capacity(file, config.chunk_bytes);
            let body = Body::from_stream(RelayStream::new(source, Some(job), filename.clone()));
            build_response(body, &filename, content_type, Some(length))
        }
    }
}

async fn resolve_variant(
    config: &AppConfig,
    url: &str,
    format_id: &str,
) -> Result<Resolved, ApiError> {
    let info = extractor::resolve_variant_info(&config.extractor, url, format_id).await?;

    if let Some(direct) = info.url.as_deref().and_then(non_empty) {
        return Ok(Resolved::Remote {
            source_url: direct.to_string(),
        });
    }

    // Seleccion sin referencia remota unica (p. ej. pistas que requieren
    // mezcla): el extractor la materializa en disco antes de retransmitir.
    let job = ScratchJob::create(&config.scratch_dir).await?;
    let printed =
        extractor::materialize_variant(&config.extractor, url, format_id, job.dir()).await?;
    let path = locate_artifact(job.dir(), printed.as_deref()).await?;
    let length = tokio::fs::metadata(&path)
        .await
        .map_err(|error| {
            ApiError::artifact_missing(format!(
                "No se pudo leer el archivo temporal descargado: {error}"
            ))
        })?
        .len();

    Ok(Resolved::Local { job, path, length })
}

async fn locate_artifact(job_dir: &Path, printed: Option<&str>) -> Result<PathBuf, ApiError> {
    let canonical_dir = tokio::fs::canonicalize(job_dir).await.map_err(|error| {
        ApiError::artifact_missing(format!("No se pudo resolver la carpeta temporal: {error}"))
    })?;

    if let Some(candidate) = printed
        && let Ok(path) = tokio::fs::canonicalize(candidate).await
        && path.starts_with(&canonical_dir)
        && tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_file())
    {
        return Ok(path);
    }

    let mut entries = tokio::fs::read_dir(&canonical_dir).await.map_err(|error| {
        ApiError::artifact_missing(format!("No se pudo abrir la carpeta temporal: {error}"))
    })?;

    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::artifact_missing(format!("No se pudo recorrer la carpeta temporal: {error}"))
    })? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        if entry.metadata().await.is_ok_and(|meta| meta.is_file()) {
            return Ok(entry.path());
        }
    }

    Err(ApiError::artifact_missing(
        "La descarga termino pero el archivo temporal no aparece en disco.",
    ))
}

pub struct ScratchJob {
    dir: PathBuf,
}

impl ScratchJob {
    pub async fn create(root: &Path) -> Result<Self, ApiError> {
        let dir = root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|error| {
            ApiError::internal(format!(
                "No se pudo preparar la carpeta temporal de descarga: {error}"
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for ScratchJob {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_dir_all(&self.dir)
            && error.kind() != ErrorKind::NotFound
        {
            info!("No se pudo limpiar la carpeta temporal {:?}: {error}", self.dir);
        }
    }
}

pub struct RelayStream {
    inner: BoxStream<'static, Result<Bytes, std::io::Error>>,
    job: Option<ScratchJob>,
    label: String,
    relayed: u64,
    done: bool,
}

impl RelayStream {
    pub fn new(
        source: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
        job: Option<ScratchJob>,
        label: String,
    ) -> Self {
        Self {
            inner: source.boxed(),
            job,
            label,
            relayed: 0,
            done: false,
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                warn!(
                    "Fallo leyendo el origen de {} tras {} bytes: {error}",
                    this.label, this.relayed
                );
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                if !this.done {
                    this.done = true;
                    this.job = None;
                    info!(
                        "Transferencia completada: {} ({} bytes)",
                        this.label, this.relayed
                    );
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                "Cliente desconectado durante {} tras {} bytes; se liberan los recursos.",
                self.label, self.relayed
            );
        }
    }
}

fn build_response(
    body: Body,
    filename: &str,
    content_type: &'static str,
    content_length: Option<u64>,
) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    if let Some(length) = content_length {
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string())
                .map_err(|_| ApiError::internal("No se pudo crear el tamano de descarga."))?,
        );
    }

    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    headers.insert(
        HeaderName::from_static("x-download-filename"),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("No se pudo crear el nombre del archivo."))?,
    );

    Ok((headers, body).into_response())
}

pub fn sanitize_title(raw: &str) -> String {
    if raw.trim().is_empty() {
        return "untitled".to_string();
    }

    let stripped: String = raw
        .chars()
        .filter(|character| !ILLEGAL_FILENAME_CHARS.contains(character) && !character.is_control())
        .collect();
    let mut clean = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if clean.starts_with('.') {
        clean.insert_str(0, "file");
    }
    if clean.is_empty() {
        return "download".to_string();
    }
    if clean.chars().count() > MAX_TITLE_CHARS {
        clean = clean
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect::<String>()
            .trim_end()
            .to_string();
    }

    clean
}

pub fn build_download_filename(title: &str, quality: &str, ext: &str) -> String {
    let base = sanitize_title(title);

    let ext: String = ext
        .chars()
        .filter(|character| character.is_ascii_alphanumeric())
        .collect();
    let ext = if ext.is_empty() {
        "bin".to_string()
    } else {
        ext.to_ascii_lowercase()
    };

    let quality: String = quality
        .chars()
        .filter(|character| !ILLEGAL_FILENAME_CHARS.contains(character) && !character.is_control())
        .collect();

    match non_empty(&quality) {
        Some(quality) => format!("{base} ({quality}).{ext}"),
        None => format!("{base}.{ext}"),
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

pub async fn sweep_stale_jobs(scratch_dir: &Path, older_than: Duration) {
    let mut entries = match tokio::fs::read_dir(scratch_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir la carpeta temporal para limpieza: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("No se pudo recorrer la carpeta temporal para limpieza: {error}");
                break;
            }
        };

        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };

        let age = now.duration_since(modified).unwrap_or_default();
        if age < older_than {
            continue;
        }

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(error) = removed
            && error.kind() != ErrorKind::NotFound
        {
            warn!("No se pudo eliminar el residuo temporal {:?}: {error}", path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn sanitize_title_strips_illegal_chars_and_whitespace() {
        assert_eq!(sanitize_title("  mi/clip: final?  "), "miclip final");
        assert_eq!(sanitize_title("a\tb\n  c"), "a b c");
        assert_eq!(sanitize_title("<>\"|*normal*"), "normal");
    }

    #[test]
    fn sanitize_title_placeholders() {
        assert_eq!(sanitize_title(""), "untitled");
        assert_eq!(sanitize_title("   "), "untitled");
        assert_eq!(sanitize_title("///???***"), "download");
    }

    #[test]
    fn sanitize_title_guards_leading_dot() {
        assert_eq!(sanitize_title(".oculto"), "file.oculto");
    }

    #[test]
    fn sanitize_title_caps_length() {
        let long = "a".repeat(400);
        assert_eq!(sanitize_title(&long).chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn download_filename_combines_parts() {
        assert_eq!(
            build_download_filename("Mi Clip", "720p", "mp4"),
            "Mi Clip (720p).mp4"
        );
        assert_eq!(build_download_filename("Mi Clip", "", "mp4"), "Mi Clip.mp4");
        assert_eq!(
            build_download_filename("", "Original", ""),
            "untitled (Original).bin"
        );
    }

    #[test]
    fn content_disposition_has_ascii_and_utf8_forms() {
        let header = build_content_disposition("canción (720p).mp4");
        assert!(header.starts_with("attachment; filename=\"canci_n (720p).mp4\""));
        assert!(header.contains("filename*=UTF-8''"));
        assert!(header.is_ascii());
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for_filename("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.m4a"), "audio/mp4");
        assert_eq!(
            content_type_for_filename("desconocido.xyz"),
            "application/octet-stream"
        );
        assert_eq!(content_type_for_filename("sin_ext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn scratch_jobs_get_unique_dirs_and_vanish_on_drop() {
        let root = tempfile::tempdir().unwrap();

        let first = ScratchJob::create(root.path()).await.unwrap();
        let second = ScratchJob::create(root.path()).await.unwrap();
        assert_ne!(first.dir(), second.dir());
        assert!(first.dir().is_dir());

        let kept = first.dir().to_path_buf();
        drop(first);
        assert!(!kept.exists());
        assert!(second.dir().is_dir());
    }

    #[tokio::test]
    async fn relay_passes_every_byte_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchJob::create(root.path()).await.unwrap();
        let job_dir = job.dir().to_path_buf();

        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..4)
            .map(|_| Ok(Bytes::from_static(b"abc")))
            .collect();
        let mut relay = RelayStream::new(
            futures_util::stream::iter(chunks),
            Some(job),
            "clip.mp4".to_string(),
        );

        let mut total = 0usize;
        while let Some(chunk) = relay.next().await {
            total += chunk.unwrap().len();
        }

        assert_eq!(total, 12);
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn dropping_the_relay_stops_the_source_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchJob::create(root.path()).await.unwrap();
        let job_dir = job.dir().to_path_buf();

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = futures_util::stream::unfold(0u32, move |sent| {
            let counter = Arc::clone(&counter);
            async move {
                if sent >= 8 {
                    return None;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Some((
                    Ok::<Bytes, std::io::Error>(Bytes::from_static(b"zz")),
                    sent + 1,
                ))
            }
        });

        let mut relay = RelayStream::new(source, Some(job), "clip.mp4".to_string());
        let first = relay.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        drop(relay);

        assert_eq!(pulled.load(Ordering::SeqCst), 1);
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn locate_artifact_prefers_printed_path() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchJob::create(root.path()).await.unwrap();
        let file = job.dir().join("clip.mp4");
        tokio::fs::write(&file, b"datos").await.unwrap();

        let found = locate_artifact(job.dir(), Some(file.to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!(found.file_name().unwrap(), "clip.mp4");
    }

    #[tokio::test]
    async fn locate_artifact_rejects_paths_outside_the_job() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchJob::create(root.path()).await.unwrap();
        let outside = root.path().join("fuera.mp4");
        tokio::fs::write(&outside, b"datos").await.unwrap();

        let error = locate_artifact(job.dir(), Some(outside.to_str().unwrap()))
            .await
            .unwrap_err();
        assert_eq!(error.code, Some("ARTIFACT_MISSING"));
    }

    #[tokio::test]
    async fn locate_artifact_scans_and_skips_partials() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchJob::create(root.path()).await.unwrap();
        tokio::fs::write(job.dir().join("clip.mp4.part"), b"a")
            .await
            .unwrap();
        tokio::fs::write(job.dir().join("clip.mp4"), b"datos")
            .await
            .unwrap();

        let found = locate_artifact(job.dir(), None).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "clip.mp4");
    }

    #[tokio::test]
    async fn locate_artifact_reports_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchJob::create(root.path()).await.unwrap();

        let error = locate_artifact(job.dir(), None).await.unwrap_err();
        assert_eq!(error.code, Some("ARTIFACT_MISSING"));
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_entries() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("viejo");
        tokio::fs::create_dir_all(&stale).await.unwrap();
        tokio::fs::write(stale.join("clip.mp4"), b"datos")
            .await
            .unwrap();

        sweep_stale_jobs(root.path(), Duration::from_secs(3600)).await;
        assert!(stale.exists());

        sweep_stale_jobs(root.path(), Duration::ZERO).await;
        assert!(!stale.exists());
    }
}
