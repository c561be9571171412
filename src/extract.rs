//! Text extraction seam.
//!
//! Ingestion consumes plain text plus an optional page/row count; producing
//! that text from binary formats (pdf, docx, spreadsheets) is the job of
//! external collaborators implementing [`TextExtractor`]. The crate ships
//! only the plain-text implementation — enough for txt/md/rtf sources and
//! for tests.

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ExtractionError {
    #[error("unsupported file format: .{extension}")]
    #[diagnostic(
        code(draftsmith::extract::unsupported),
        help("Supported without an external extractor: txt, md, rtf.")
    )]
    UnsupportedFormat { extension: String },

    #[error("failed to read source file {path}: {source}")]
    #[diagnostic(code(draftsmith::extract::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of extracting a source file.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    /// Pages for paginated formats, rows for tabular ones; `None` when the
    /// format has no such notion.
    pub page_or_row_count: Option<u32>,
}

/// Turns an uploaded file into plain text.
pub trait TextExtractor: std::fmt::Debug + Send + Sync {
    fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError>;
}

/// Extractor for formats that are already plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        let text = std::fs::read_to_string(path).map_err(|source| ExtractionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Extraction {
            text,
            page_or_row_count: None,
        })
    }
}

/// Resolve the extractor for a file extension.
///
/// Binary formats return `UnsupportedFormat` until a collaborator registers
/// an implementation for them; the caller surfaces that on the document.
pub fn extractor_for(extension: &str) -> Result<Box<dyn TextExtractor>, ExtractionError> {
    match extension.to_ascii_lowercase().as_str() {
        "txt" | "md" | "rtf" => Ok(Box::new(PlainTextExtractor)),
        other => Err(ExtractionError::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_text_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "first paragraph\nsecond paragraph").unwrap();
        let extraction = PlainTextExtractor.extract(file.path()).unwrap();
        assert_eq!(extraction.text, "first paragraph\nsecond paragraph");
        assert!(extraction.page_or_row_count.is_none());
    }

    #[test]
    fn unknown_extension_is_typed_error() {
        let err = extractor_for("xlsx").unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFormat { .. }));
    }
}
