//! Image loading for `--image`: MIME detection from the extension and base64
//! encoding into [`ImageData`].

use std::path::Path;

use base64::Engine;
use mux_protocol::ImageData;

/// Largest image accepted, 20 MiB.
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

fn mime_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Read an image file into inline base64 data.
pub fn load_image(path: &Path) -> Result<ImageData, String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| format!("no file extension: {}", path.display()))?;
    let mime_type = mime_type_for_extension(ext).ok_or_else(|| {
        format!("unsupported image format '.{ext}' (supported: png, jpg, jpeg, gif, webp)")
    })?;

    let metadata =
        std::fs::metadata(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    if metadata.len() > MAX_IMAGE_BYTES {
        return Err(format!(
            "{} is too large: {} bytes (max {} MiB)",
            path.display(),
            metadata.len(),
            MAX_IMAGE_BYTES / 1024 / 1024
        ));
    }

    let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(ImageData::new(mime_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types() {
        assert_eq!(mime_type_for_extension("PNG"), Some("image/png"));
        assert_eq!(mime_type_for_extension("jpeg"), Some("image/jpeg"));
        assert_eq!(mime_type_for_extension("webp"), Some("image/webp"));
        assert_eq!(mime_type_for_extension("bmp"), None);
    }

    #[test]
    fn load_png_as_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        std::fs::write(&path, b"\x89PNG\r\n\x1a\n").unwrap();

        let image = load_image(&path).unwrap();
        assert_eq!(image.mime_type, "image/png");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&image.data)
            .unwrap();
        assert_eq!(decoded, b"\x89PNG\r\n\x1a\n");
        assert!(image.data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn missing_file() {
        let err = load_image(Path::new("/nonexistent/image.png")).unwrap_err();
        assert!(err.contains("cannot read"));
    }

    #[test]
    fn unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"pdf").unwrap();
        assert!(load_image(&path).unwrap_err().contains("unsupported image format"));
    }

    #[test]
    fn no_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noext");
        std::fs::write(&path, b"data").unwrap();
        assert!(load_image(&path).unwrap_err().contains("no file extension"));
    }
}
