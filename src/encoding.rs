//! Image acquisition helpers: base64 encoding of image files

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;

/// Encoding error types
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid base64 image data: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Read a whole image file and return its standard base64 encoding
pub fn encode_image_to_base64(path: impl AsRef<Path>) -> Result<String, EncodingError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|source| EncodingError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(encode_bytes(&data))
}

/// Async variant of [`encode_image_to_base64`]
pub async fn encode_image_to_base64_async(path: impl AsRef<Path>) -> Result<String, EncodingError> {
    let path = path.as_ref();
    let data = tokio::fs::read(path).await.map_err(|source| EncodingError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(encode_bytes(&data))
}

pub fn encode_bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a base64 image payload back to raw bytes
pub fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, EncodingError> {
    Ok(STANDARD.decode(encoded.trim())?)
}

/// Best-effort media type from magic bytes, `image/jpeg` when unknown
pub fn sniff_media_type(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
