use crate::config::ListingPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{MediaKind, TemporaryUpload};
use std::collections::HashSet;

pub fn file_extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Decides whether a staged file is an image or a video and re-checks it
/// against the upload rules. Anything that does not pass is treated as a
/// tampered upload.
pub fn classify_upload(upload: &TemporaryUpload, policy: &ListingPolicy) -> LifecycleResult<MediaKind> {
    if upload.size_bytes > policy.max_file_bytes {
        return Err(LifecycleError::security(
            "finalize_media",
            format!(
                "upload {} is {} bytes, above the {} byte limit",
                upload.id, upload.size_bytes, policy.max_file_bytes
            ),
        ));
    }
    let ext = file_extension(&upload.original_filename).ok_or_else(|| {
        LifecycleError::security(
            "finalize_media",
            format!("upload {} has no file extension", upload.id),
        )
    })?;
    let kind = if policy.video_extensions.contains(&ext) {
        MediaKind::Video
    } else if policy.image_extensions.contains(&ext) {
        MediaKind::Image
    } else {
        return Err(LifecycleError::security(
            "finalize_media",
            format!("upload {} has disallowed type .{ext}", upload.id),
        ));
    };
    let expected = family_of(kind);

    let Some(detected) = upload.detected_type.as_deref() else {
        return Err(LifecycleError::security(
            "finalize_media",
            format!("upload {} content could not be recognised", upload.id),
        ));
    };
    if media_family(detected) != Some(expected) {
        return Err(LifecycleError::security(
            "finalize_media",
            format!("upload {} is named .{ext} but its content is {detected}", upload.id),
        ));
    }
    // declared types outside image/video say nothing about the file
    if let Some(declared) = upload.content_type.as_deref().and_then(media_family)
        && declared != expected
    {
        return Err(LifecycleError::security(
            "finalize_media",
            format!("upload {} declared {declared} content but holds {detected}", upload.id),
        ));
    }
    Ok(kind)
}

fn family_of(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
    }
}

/// `image` or `video` for media types, `None` for anything else.
fn media_family(content_type: &str) -> Option<&'static str> {
    let top = content_type.trim().split('/').next()?.to_ascii_lowercase();
    match top.as_str() {
        "image" => Some("image"),
        "video" => Some("video"),
        _ => None,
    }
}

/// Recognises a file from its leading bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        return match &bytes[8..12] {
            b"WEBP" => Some("image/webp"),
            b"AVI " => Some("video/x-msvideo"),
            _ => None,
        };
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"heic" | b"heix" | b"mif1" => Some("image/heif"),
            b"avif" => Some("image/avif"),
            b"qt  " => Some("video/quicktime"),
            _ => Some("video/mp4"),
        };
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/webm");
    }
    if bytes.starts_with(b"MZ") {
        return Some("application/x-msdownload");
    }
    if bytes.starts_with(&[0x7F, b'E', b'L', b'F']) {
        return Some("application/x-elf");
    }
    if bytes.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if bytes.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        return Some("application/zip");
    }
    None
}

pub fn folder_for(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "images",
        MediaKind::Video => "videos",
    }
}

/// Checks a direct media URL: http(s) only, and on a trusted host when the
/// policy names any.
pub fn validate_media_url(url: &str, policy: &ListingPolicy) -> LifecycleResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| LifecycleError::validation("upload_media", format!("invalid media url: {url}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(LifecycleError::validation(
            "upload_media",
            format!("unsupported url scheme: {url}"),
        ));
    }
    if !policy.trusted_media_hosts.is_empty() {
        let host = parsed.host_str().unwrap_or_default();
        if !host_allowed(host, &policy.trusted_media_hosts) {
            return Err(LifecycleError::validation(
                "upload_media",
                format!("media host not allowed: {host}"),
            ));
        }
    }
    Ok(())
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_lowercase();
    allowed
        .iter()
        .map(|d| d.trim().to_lowercase())
        .any(|d| host == d || host.ends_with(&format!(".{d}")))
}

/// Keeps the first occurrence of every value, in order.
pub fn deduplicate(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
