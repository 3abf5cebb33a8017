use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::info;
use unicode_segmentation::UnicodeSegmentation;

pub fn hash(text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    let hash = hasher.finalize();
    hash.to_string()
}

/// Cuts `text` down to at most `limit` graphemes, marking the cut.
pub fn truncate(text: &str, limit: usize) -> String {
    let mut graphemes = text.graphemes(true);
    let head: String = graphemes.by_ref().take(limit).collect();
    if graphemes.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Decodes the payload of a `data:...;base64,` URL. Bare base64 is accepted too.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let payload = match url.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => url,
    };
    STANDARD.decode(payload.trim()).context("artifact is not valid base64")
}

/// Writes one artifact to `<dir>/<batch>.<index>.png`.
pub fn save_image(dir: &Path, batch: &uuid::Uuid, index: usize, data_url: &str) -> Result<PathBuf> {
    let data = decode_data_url(data_url)?;
    let path = dir.join(format!("{}.{}.png", batch, index));
    info!("Writing {} bytes to {}", data.len(), path.display());
    std::fs::write(&path, &data).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash() {
        assert_eq!(hash("hello"), "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("", 3), "");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("abcd", 3), "abc…");
        assert_eq!(truncate("héllo wörld", 5), "héllo…");
    }

    #[test]
    fn test_decode_data_url() {
        assert_eq!(decode_data_url("data:image/png;base64,QUJD").unwrap(), b"ABC");
        assert_eq!(decode_data_url("QUJD").unwrap(), b"ABC");
        assert!(decode_data_url("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn test_save_image() {
        let dir = tempfile::tempdir().unwrap();
        let batch = uuid::Uuid::new_v4();
        let path = save_image(dir.path(), &batch, 2, "data:image/png;base64,QUJD").unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("{}.2.png", batch));
        assert_eq!(std::fs::read(path).unwrap(), b"ABC");
    }
}
