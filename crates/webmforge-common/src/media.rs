//! WebM input detection.
//!
//! An upload is accepted when its declared media type is `video/webm` or its
//! name carries the `.webm` extension, and its first bytes are the EBML
//! header magic shared by Matroska and WebM.

use std::path::Path;

/// Accepted input media type.
pub const WEBM_MEDIA_TYPE: &str = "video/webm";

/// Accepted input extension (without dot).
pub const WEBM_EXTENSION: &str = "webm";

/// Output media type.
pub const MP4_MEDIA_TYPE: &str = "video/mp4";

/// Output extension (with dot).
pub const MP4_EXTENSION: &str = ".mp4";

/// EBML header magic.
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Whether a declared media type names WebM. Parameters such as
/// `; codecs=vp9` are ignored.
pub fn is_webm_media_type(media_type: &str) -> bool {
    media_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case(WEBM_MEDIA_TYPE))
        .unwrap_or(false)
}

/// Whether a file name carries the `.webm` extension (case-insensitive).
pub fn is_webm_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(WEBM_EXTENSION))
        .unwrap_or(false)
}

/// Whether the content begins with the EBML magic.
pub fn has_ebml_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(&EBML_MAGIC)
}

/// Declared-format check: media type OR extension.
pub fn is_declared_webm(name: &str, media_type: Option<&str>) -> bool {
    media_type.map(is_webm_media_type).unwrap_or(false) || is_webm_name(name)
}

/// Derive the download name of the converted file from the upload name.
pub fn output_name_for(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("converted");
    format!("{stem}{MP4_EXTENSION}")
}
