//! PDF text extraction via the `pdftotext` CLI (poppler-utils).
//!
//! Output is gated by plausibility checks before the pipeline trusts
//! it: scanned or font-mangled PDFs extract into garbage that would
//! poison the summarization stage, and the abstract is a better input
//! than that.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{Extraction, Extractor};

/// Default timeout for one extraction
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of plausibility checks in `text_confidence`
const CONFIDENCE_CHECKS: f64 = 4.0;

/// Extractor shelling out to `pdftotext`
pub struct PdftotextExtractor {
    /// Path to the pdftotext binary (default: "pdftotext")
    binary_path: String,
    timeout: Duration,
}

impl Default for PdftotextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PdftotextExtractor {
    pub fn new() -> Self {
        Self {
            binary_path: "pdftotext".to_string(),
            timeout: EXTRACT_TIMEOUT,
        }
    }

    /// Create an extractor with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout: EXTRACT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Extractor for PdftotextExtractor {
    fn name(&self) -> &str {
        "pdftotext"
    }

    async fn extract(&self, pdf_path: &Path) -> Result<Extraction> {
        let metadata = std::fs::metadata(pdf_path)
            .with_context(|| format!("PDF file not found: {}", pdf_path.display()))?;
        if metadata.len() == 0 {
            anyhow::bail!("PDF file is empty: {}", pdf_path.display());
        }

        // "-" sends the text to stdout
        let output = timeout(
            self.timeout,
            Command::new(&self.binary_path)
                .arg("-layout")
                .arg("-enc")
                .arg("UTF-8")
                .arg(pdf_path)
                .arg("-")
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .with_context(|| {
            format!(
                "pdftotext timed out after {:?} on {}",
                self.timeout,
                pdf_path.display()
            )
        })?
        .with_context(|| format!("Failed to run pdftotext on {}", pdf_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "pdftotext failed with exit code {} on {}: {}",
                exit_code,
                pdf_path.display(),
                stderr.trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let confidence = text_confidence(&text);

        Ok(Extraction { text, confidence })
    }
}

/// Score extracted text against four plausibility checks: enough
/// characters, average word length in a sane band, a mostly-ASCII
/// prefix, and basic sentence shape. Returns the fraction passed.
///
/// The word-length band is wide (2 to 30) so chemical and gene names in
/// scientific papers do not fail the gate.
pub fn text_confidence(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let mut passed = 0u32;

    if trimmed.chars().count() > 100 {
        passed += 1;
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if !words.is_empty() {
        let sample = &words[..words.len().min(100)];
        let avg_len =
            sample.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / sample.len() as f64;
        if (2.0..=30.0).contains(&avg_len) {
            passed += 1;
        }
    }

    let prefix: Vec<char> = trimmed.chars().take(1000).collect();
    if !prefix.is_empty() {
        let ascii = prefix.iter().filter(|c| c.is_ascii()).count();
        if ascii as f64 / prefix.len() as f64 >= 0.5 {
            passed += 1;
        }
    }

    let head: String = trimmed.chars().take(500).collect();
    let has_spaces = head.contains(' ');
    let has_periods = head.contains('.');
    if has_spaces && (has_periods || words.len() > 100) {
        passed += 1;
    }

    f64::from(passed) / CONFIDENCE_CHECKS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_accepts_prose() {
        let text = "The dominant sequence transduction models are based on complex \
                    recurrent or convolutional neural networks. We propose a new simple \
                    network architecture, the Transformer, based solely on attention.";
        assert_eq!(text_confidence(text), 1.0);
    }

    #[test]
    fn test_confidence_rejects_empty() {
        assert_eq!(text_confidence(""), 0.0);
        assert_eq!(text_confidence("   \n  "), 0.0);
    }

    #[test]
    fn test_confidence_penalizes_short_text() {
        // Sentence shape and word lengths are fine, length is not
        let score = text_confidence("A short but valid sentence.");
        assert!(score < 1.0);
        assert!(score > 0.0);
    }

    #[test]
    fn test_confidence_penalizes_glyph_soup() {
        // Ligature-mangled extraction output: no spaces, no periods,
        // one endless word
        let soup = "\u{fb01}\u{fb02}".repeat(200);
        assert!(text_confidence(&soup) < 1.0);
    }

    #[test]
    fn test_confidence_allows_long_words() {
        // Gene names and chemical formulas push word length up but stay
        // inside the band
        let text = format!(
            "Phosphatidylinositol-4,5-bisphosphate 3-kinase signaling was measured. {}",
            "The pathway analysis covered many samples with consistent results. ".repeat(10)
        );
        assert_eq!(text_confidence(&text), 1.0);
    }

    #[tokio::test]
    async fn test_extract_missing_file() {
        let extractor = PdftotextExtractor::new();
        let result = extractor.extract(Path::new("/nonexistent/file.pdf")).await;
        assert!(result.is_err());
    }
}
