//! Profile photo storage under `<workspace>/uploads`.

use crate::error::{AppError, AppResult};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, ImageFormat};
use std::path::Path;
use tracing::{info, warn};

pub const UPLOADS_DIR: &str = "uploads";
pub const PHOTO_SIDE: u32 = 600;
const JPEG_QUALITY: u8 = 80;

/// Filesystem-safe stem of an uploaded file name.
pub fn sanitize_stem(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = match base.rsplit_once('.') {
        Some((s, _)) if !s.is_empty() => s,
        _ => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "photo".to_string()
    } else {
        cleaned
    }
}

/// Square JPEG re-encode of `bytes`, cropped to cover.
pub fn normalize(bytes: &[u8]) -> AppResult<Vec<u8>> {
    let format = image::guess_format(bytes)
        .map_err(|_| AppError::bad_params("photo must be a JPEG, PNG or GIF image"))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif) {
        return Err(AppError::bad_params("photo must be a JPEG, PNG or GIF image"));
    }
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| AppError::bad_params(format!("photo could not be decoded: {e}")))?;
    let rgb = img
        .resize_to_fill(PHOTO_SIDE, PHOTO_SIDE, FilterType::Lanczos3)
        .to_rgb8();

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| anyhow::anyhow!("jpeg encode failed: {e}"))?;
    Ok(out)
}

/// Stores a normalized photo and returns its public path (`/uploads/<file>`).
pub fn store_photo(
    workspace: &Path,
    file_name: &str,
    bytes: &[u8],
    max_bytes: usize,
) -> AppResult<String> {
    if bytes.is_empty() {
        return Err(AppError::bad_params("photo is empty"));
    }
    if bytes.len() > max_bytes {
        return Err(AppError::bad_params(format!(
            "photo exceeds {} bytes",
            max_bytes
        )));
    }
    let jpeg = normalize(bytes)?;

    let dir = workspace.join(UPLOADS_DIR);
    std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
    let file = format!(
        "{}-{}.jpg",
        chrono::Utc::now().timestamp_millis(),
        sanitize_stem(file_name)
    );
    std::fs::write(dir.join(&file), &jpeg).map_err(anyhow::Error::from)?;
    info!(file = %file, bytes = jpeg.len(), "photo stored");
    Ok(format!("/{}/{}", UPLOADS_DIR, file))
}

/// Removes a previously stored photo. Paths outside the uploads folder are ignored.
pub fn delete_photo(workspace: &Path, public_path: &str) {
    let Some(name) = public_path
        .strip_prefix('/')
        .unwrap_or(public_path)
        .strip_prefix("uploads/")
    else {
        return;
    };
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return;
    }
    let path = workspace.join(UPLOADS_DIR).join(name);
    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.to_string_lossy(), error = %e, "photo cleanup failed");
    }
}
