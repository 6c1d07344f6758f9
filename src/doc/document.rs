//! Loading documents from disk

use crate::doc::types::Document;
use crate::error::DocumentError;
use std::fs;
use std::path::Path;
use tracing::debug;

/// File extensions accepted as analyzable text
pub const SUPPORTED_EXTENSIONS: &[&str] = &["csv", "json", "md", "py", "txt", "yaml", "yml"];

/// Read a text document, validating type and encoding
pub fn read_document(path: &Path) -> Result<Document, DocumentError> {
    if !path.exists() {
        return Err(DocumentError::NotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(DocumentError::NotAFile(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(DocumentError::UnsupportedType {
            extension: if extension.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{}", extension)
            },
            supported: SUPPORTED_EXTENSIONS
                .iter()
                .map(|e| format!(".{}", e))
                .collect::<Vec<_>>()
                .join(", "),
        });
    }

    let bytes = fs::read(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let text = String::from_utf8(bytes).map_err(|_| DocumentError::Binary(path.to_path_buf()))?;

    let document = Document::new(path.display().to_string(), text);
    debug!(
        "Loaded {} ({} words, ~{} units)",
        document.source, document.word_count, document.units
    );

    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_text_document() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.md");
        fs::write(&path, "# Title\n\nSome body text.").unwrap();

        let doc = read_document(&path).unwrap();
        assert_eq!(doc.word_count, 5);
        assert!(doc.source.ends_with("notes.md"));
    }

    #[test]
    fn test_missing_file() {
        let err = read_document(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(matches!(err, DocumentError::NotFound(_)));
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("folder.txt");
        fs::create_dir(&dir).unwrap();
        assert!(matches!(read_document(&dir).unwrap_err(), DocumentError::NotAFile(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.png");
        fs::write(&path, "not really").unwrap();

        match read_document(&path).unwrap_err() {
            DocumentError::UnsupportedType { extension, supported } => {
                assert_eq!(extension, ".png");
                assert!(supported.contains(".md"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_extension_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("README.TXT");
        fs::write(&path, "upper case extension").unwrap();
        assert!(read_document(&path).is_ok());
    }

    #[test]
    fn test_binary_content_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob.txt");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert!(matches!(read_document(&path).unwrap_err(), DocumentError::Binary(_)));
    }
}
