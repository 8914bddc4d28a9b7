use anyhow::{anyhow, Result};
use tracing::debug;

const MAX_MATRIX_FILE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub data: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    pub size: usize,
}

/// Matrix message type for an attachment, by MIME major type.
pub fn msgtype_for(content_type: &str) -> &'static str {
    match content_type.split('/').next().unwrap_or_default() {
        "video" => "m.video",
        "image" => "m.image",
        "audio" => "m.audio",
        _ => "m.file",
    }
}

/// File extension for an image MIME type, used when a pasted image arrives
/// with a bare name. Anything unrecognized is treated as png.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/bmp" => "bmp",
        _ => "png",
    }
}

/// Give an extensionless attachment name an extension so remote clients can
/// pick a viewer. Names that already carry one pass through untouched.
pub fn attachment_filename(name: &str, content_type: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    if base.contains('.') {
        return name.to_string();
    }
    format!("{}.{}", name, extension_for(content_type))
}

/// Best-effort MIME type from a filename extension, for uploads where the
/// gateway handed us bytes without one.
pub fn content_type_for_name(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub struct MediaHandler {
    client: reqwest::Client,
}

impl Default for MediaHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Fetch a remote attachment by plain URL (the form remote gateways hand
    /// us when they do not inline the bytes).
    pub async fn download_from_url(&self, url: &str) -> Result<MediaInfo> {
        debug!("downloading media from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("failed to download from {}: {}", url, e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download from {}: status {}",
                url,
                response.status()
            ));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response
            .bytes()
            .await
            .map_err(|e| anyhow!("failed to read response body: {}", e))?
            .to_vec();

        let size = data.len();
        let filename = url.rsplit('/').next().unwrap_or("attachment").to_string();

        debug!("downloaded {} bytes from {}", size, url);

        Ok(MediaInfo {
            data,
            content_type,
            filename,
            size,
        })
    }

    /// Read a room-avatar image off disk for upload.
    pub async fn load_local_file(&self, path: &str) -> Result<MediaInfo> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow!("failed to read {}: {}", path, e))?;
        let filename = path.rsplit('/').next().unwrap_or(path).to_string();
        let content_type = match filename.rsplit('.').next() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => "image/png",
        }
        .to_string();
        let size = data.len();
        Ok(MediaInfo {
            data,
            content_type,
            filename,
            size,
        })
    }

    pub fn check_upload_size(size: usize) -> Result<()> {
        if size > MAX_MATRIX_FILE_SIZE {
            return Err(anyhow!(
                "file too large for upload: {} bytes (max {})",
                size,
                MAX_MATRIX_FILE_SIZE
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("image/png", "m.image")]
    #[test_case("image/jpeg", "m.image")]
    #[test_case("video/mp4", "m.video")]
    #[test_case("audio/ogg", "m.audio")]
    #[test_case("application/pdf", "m.file")]
    #[test_case("", "m.file")]
    fn msgtype_follows_mime_major(content_type: &str, expected: &str) {
        assert_eq!(msgtype_for(content_type), expected);
    }

    #[test_case("photo.jpg", "image/png", "photo.jpg"; "existing extension kept")]
    #[test_case("ima_abc123", "image/jpeg", "ima_abc123.jpg"; "jpeg extension added")]
    #[test_case("ima_abc123", "image/tiff", "ima_abc123.png"; "unknown image type falls back to png")]
    #[test_case("ima_abc123", "application/octet-stream", "ima_abc123.png"; "opaque type falls back to png")]
    fn attachment_names_get_extensions(name: &str, content_type: &str, expected: &str) {
        assert_eq!(attachment_filename(name, content_type), expected);
    }

    #[test]
    fn oversized_upload_is_rejected() {
        assert!(MediaHandler::check_upload_size(51 * 1024 * 1024).is_err());
        assert!(MediaHandler::check_upload_size(1024).is_ok());
    }
}
