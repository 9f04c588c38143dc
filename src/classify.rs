//! Reduce la lista cruda de variantes del extractor a un menu corto,
//! etiquetado y sin duplicados.

use std::{cmp::Ordering, collections::HashSet};

use serde::Serialize;

use crate::config::{ClassifierPolicy, non_empty};
use crate::error::ApiError;
use crate::extractor::{MediaInfo, Variant};

pub const BEST_FORMAT_ID: &str = "best";

#[derive(Debug, Clone, Serialize)]
pub struct MenuEntry {
    pub quality: String,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    pub is_premium: bool,
    pub format_id: String,
}

struct Candidate {
    entry: MenuEntry,
    order: u32,
    height: u32,
    bitrate: f64,
    size: f64,
}

pub fn build_menu(
    info: &MediaInfo,
    policy: &ClassifierPolicy,
) -> Result<Vec<MenuEntry>, ApiError> {
    let variants = info.variants();

    let menu = if variants.is_empty() {
        direct_fallback(info).into_iter().collect()
    } else {
        classify(&variants, policy)
    };

    if menu.is_empty() {
        return Err(ApiError::no_formats());
    }

    Ok(menu)
}

pub fn classify(variants: &[Variant], policy: &ClassifierPolicy) -> Vec<MenuEntry> {
    let mut candidates: Vec<Candidate> = variants
        .iter()
        .filter_map(|variant| classify_one(variant, policy))
        .collect();

    // La mejor variante de cada etiqueta debe ganar la de-duplicacion.
    candidates.sort_by(|a, b| {
        b.height
            .cmp(&a.height)
            .then_with(|| b.bitrate.partial_cmp(&a.bitrate).unwrap_or(Ordering::Equal))
            .then_with(|| b.size.partial_cmp(&a.size).unwrap_or(Ordering::Equal))
    });

    let mut seen_qualities = HashSet::new();
    let mut menu: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| seen_qualities.insert(candidate.entry.quality.clone()))
        .collect();

    menu.sort_by_key(|candidate| candidate.order);
    menu.into_iter().map(|candidate| candidate.entry).collect()
}

fn classify_one(variant: &Variant, policy: &ClassifierPolicy) -> Option<Candidate> {
    let format_id = variant.format_id.as_deref().and_then(non_empty)?;
    variant.url.as_deref().and_then(non_empty)?;
    let ext = variant.ext.as_deref().and_then(non_empty)?;
    if !policy.allowed_exts.contains(ext) {
        return None;
    }

    let has_video = codec_present(variant.vcodec.as_deref());
    let has_audio = codec_present(variant.acodec.as_deref());

    let (quality, is_premium, base_order) = if !has_video && has_audio {
        let quality = match variant.abr {
            Some(abr) if abr > 0.0 => format!("Audio {}kbps", abr.round() as u32),
            _ => "Audio".to_string(),
        };
        let is_premium = !policy.free_audio_exts.contains(ext);
        (quality, is_premium, 0)
    } else if has_video && has_audio {
        match variant.height {
            Some(height) if policy.free_video_heights.contains(&height) => {
                let quality = if height == 1080 {
                    "1080p (HD)".to_string()
                } else {
                    format!("{height}p")
                };
                (quality, false, height)
            }
            Some(height) if height > policy.premium_video_floor => {
                let quality = if height == 2160 {
                    "Premium 4K (2160p)".to_string()
                } else {
                    format!("Premium HD ({height}p)")
                };
                (quality, true, height)
            }
            Some(_) => return None,
            None => match variant.tbr {
                Some(tbr) if tbr > 0.0 => {
                    let rounded = tbr.round() as u32;
                    (format!("{rounded}kbps"), false, rounded)
                }
                _ => return None,
            },
        }
    } else if has_video {
        let height = variant.height?;
        if height < policy.min_video_height {
            return None;
        }
        (format!("Video {height}p (no audio)"), true, height)
    } else {
        return None;
    };

    let order = if is_premium {
        base_order + policy.premium_sort_offset
    } else {
        base_order
    };

    Some(Candidate {
        entry: MenuEntry {
            quality,
            ext: ext.to_string(),
            size_mb: size_mb(variant.filesize.or(variant.filesize_approx)),
            is_premium,
            format_id: format_id.to_string(),
        },
        order,
        height: variant.height.unwrap_or_default(),
        bitrate: variant.tbr.or(variant.abr).unwrap_or_default(),
        size: variant.filesize.or(variant.filesize_approx).unwrap_or_default(),
    })
}

fn direct_fallback(info: &MediaInfo) -> Option<MenuEntry> {
    info.url.as_deref().and_then(non_empty)?;
    let ext = info.ext.as_deref().and_then(non_empty)?;

    Some(MenuEntry {
        quality: "Original".to_string(),
        ext: ext.to_string(),
        size_mb: size_mb(info.filesize.or(info.filesize_approx)),
        is_premium: false,
        format_id: BEST_FORMAT_ID.to_string(),
    })
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}

fn size_mb(bytes: Option<f64>) -> Option<f64> {
    bytes
        .filter(|value| *value > 0.0)
        .map(|value| (value / (1024.0 * 1024.0) * 100.0).round() / 100.0)
}
