use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("INVALID_INPUT"),
        }
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("SOURCE_UNAVAILABLE"),
        }
    }

    pub fn no_formats() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "No se encontraron formatos descargables en esta URL.".to_string(),
            code: Some("NO_FORMATS"),
        }
    }

    pub fn resolution_failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("RESOLUTION_FAILED"),
        }
    }

    pub fn artifact_missing(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: Some("ARTIFACT_MISSING"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ExtractorContext {
    Analyze,
    Resolve,
}

impl ExtractorContext {
    pub fn failure(self, message: impl Into<String>) -> ApiError {
        match self {
            Self::Analyze => ApiError::source_unavailable(message),
            Self::Resolve => ApiError::resolution_failed(message),
        }
    }
}

// Las pistas sobre stderr de yt-dlp son de mejor esfuerzo: el texto no es
// estable entre versiones, asi que solo se buscan fragmentos conocidos.
pub fn map_extractor_failure(context: ExtractorContext, stderr: &[u8]) -> ApiError {
    let message = last_stderr_line(stderr);
    let lower = message.to_ascii_lowercase();

    if lower.contains("is not a valid url") || lower.contains("unsupported url") {
        return ApiError::invalid_input(format!("URL no soportada o invalida: {message}"));
    }

    if looks_like_access_gate(&lower) {
        return ApiError::source_unavailable(format!(
            "El origen esta restringido (login, edad o region). Configura YT_DLP_PROXY y reintenta. ({message})"
        ));
    }

    if lower.contains("requested format is not available") {
        return ApiError::resolution_failed(format!(
            "El formato solicitado ya no esta disponible en el origen. ({message})"
        ));
    }

    context.failure(message)
}

fn looks_like_access_gate(lower: &str) -> bool {
    lower.contains("sign in")
        || lower.contains("login required")
        || lower.contains("age-restricted")
        || lower.contains("age restricted")
        || lower.contains("geo restriction")
        || lower.contains("geo-restricted")
        || lower.contains("not available in your country")
        || lower.contains("confirm you're not a bot")
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp no pudo completar la operacion")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_invalid_url_hint() {
        let error = map_extractor_failure(
            ExtractorContext::Analyze,
            b"ERROR: 'nota' is not a valid URL.",
        );
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Some("INVALID_INPUT"));
    }

    #[test]
    fn maps_access_gate_to_source_unavailable() {
        let error = map_extractor_failure(
            ExtractorContext::Analyze,
            b"ERROR: Sign in to confirm your age. This video may be inappropriate.",
        );
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Some("SOURCE_UNAVAILABLE"));
        assert!(error.message.contains("YT_DLP_PROXY"));
    }

    #[test]
    fn maps_missing_format_to_resolution_failed() {
        let error = map_extractor_failure(
            ExtractorContext::Resolve,
            b"WARNING: ignoring\nERROR: Requested format is not available.",
        );
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, Some("RESOLUTION_FAILED"));
    }

    #[test]
    fn unknown_failure_follows_context() {
        let analyze = map_extractor_failure(ExtractorContext::Analyze, b"ERROR: boom");
        assert_eq!(analyze.code, Some("SOURCE_UNAVAILABLE"));

        let resolve = map_extractor_failure(ExtractorContext::Resolve, b"ERROR: boom");
        assert_eq!(resolve.code, Some("RESOLUTION_FAILED"));
        assert_eq!(resolve.message, "ERROR: boom");
    }

    #[test]
    fn empty_stderr_gets_fallback_message() {
        let error = map_extractor_failure(ExtractorContext::Analyze, b"  \n \n");
        assert!(error.message.contains("yt-dlp"));
    }
}
