use std::{collections::HashSet, path::PathBuf};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_MAX_CONCURRENT_EXTRACTIONS: usize = 3;
const DEFAULT_CHUNK_BYTES: usize = 8 * 1024;
const EXTRACTOR_RETRIES: u32 = 5;
const EXTRACTOR_FRAGMENT_RETRIES: u32 = 5;
const EXTRACTOR_SOCKET_TIMEOUT_SECONDS: u32 = 10;
const EXTRACTOR_TIMEOUT_SECONDS: u64 = 180;
const SPOOFED_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/100.0.4896.88 Safari/537.36";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub scratch_dir: PathBuf,
    pub chunk_bytes: usize,
    pub max_concurrent_extractions: usize,
    pub extractor: ExtractorConfig,
    pub policy: ClassifierPolicy,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub retries: u32,
    pub fragment_retries: u32,
    pub socket_timeout_seconds: u32,
    pub force_ipv4: bool,
    pub geo_bypass: bool,
    pub user_agent: String,
    pub proxy_url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            retries: EXTRACTOR_RETRIES,
            fragment_retries: EXTRACTOR_FRAGMENT_RETRIES,
            socket_timeout_seconds: EXTRACTOR_SOCKET_TIMEOUT_SECONDS,
            force_ipv4: true,
            geo_bypass: true,
            user_agent: SPOOFED_USER_AGENT.to_string(),
            proxy_url: None,
            timeout_seconds: EXTRACTOR_TIMEOUT_SECONDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierPolicy {
    pub allowed_exts: HashSet<&'static str>,
    pub free_video_heights: HashSet<u32>,
    pub free_audio_exts: HashSet<&'static str>,
    pub min_video_height: u32,
    pub premium_video_floor: u32,
    pub premium_sort_offset: u32,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            allowed_exts: ["mp4", "m4a", "webm", "ogg", "mov", "flv", "avi"]
                .into_iter()
                .collect(),
            free_video_heights: [240, 360, 720, 1080].into_iter().collect(),
            free_audio_exts: ["mp3", "m4a"].into_iter().collect(),
            min_video_height: 240,
            premium_video_floor: 1080,
            premium_sort_offset: 2000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let scratch_dir = std::env::var("SCRATCH_DIR")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| std::env::temp_dir().join("clipfetch"));

        let proxy_url = std::env::var("YT_DLP_PROXY")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string));

        Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins,
            scratch_dir,
            chunk_bytes: read_usize_env("DOWNLOAD_CHUNK_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_CHUNK_BYTES),
            max_concurrent_extractions: read_usize_env("MAX_CONCURRENT_EXTRACTIONS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_EXTRACTIONS),
            extractor: ExtractorConfig {
                proxy_url,
                ..ExtractorConfig::default()
            },
            policy: ClassifierPolicy::default(),
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_trims_and_filters() {
        assert_eq!(non_empty("  hola  "), Some("hola"));
        assert_eq!(non_empty("   "), None);
        assert_eq!(non_empty(""), None);
    }

    #[test]
    fn default_policy_tiers() {
        let policy = ClassifierPolicy::default();
        assert!(policy.allowed_exts.contains("mp4"));
        assert!(!policy.allowed_exts.contains("mkv"));
        assert!(policy.free_video_heights.contains(&1080));
        assert!(!policy.free_video_heights.contains(&1440));
        assert!(policy.free_audio_exts.contains("m4a"));
        assert!(!policy.free_audio_exts.contains("webm"));
    }

    #[test]
    fn default_extractor_knobs() {
        let extractor = ExtractorConfig::default();
        assert_eq!(extractor.retries, 5);
        assert_eq!(extractor.socket_timeout_seconds, 10);
        assert!(extractor.force_ipv4);
        assert!(extractor.proxy_url.is_none());
    }
}
