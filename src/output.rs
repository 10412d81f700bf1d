//! Persisting decoded text and the post-run sanity check
//!
//! Outputs are named from the run configuration alone, so re-running the
//! same configuration overwrites rather than duplicates them.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SampleError, ValidationFailure};

/// Minimum Jaccard similarity a generated line must exceed
pub const SANITY_JACCARD_THRESHOLD: f64 = 0.9;

/// Paths of one run's outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub text: PathBuf,
    pub json: PathBuf,
}

/// Writes decoded sequences as `.txt` and `.json`
#[derive(Debug, Clone)]
pub struct OutputWriter {
    out_dir: PathBuf,
    base_name: String,
}

impl OutputWriter {
    pub fn new<P: AsRef<Path>>(out_dir: P, model_identifier: &str, top_p: f64, steps: usize) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            base_name: output_base_name(model_identifier, top_p, steps),
        }
    }

    pub fn paths(&self) -> OutputPaths {
        OutputPaths {
            text: self.out_dir.join(format!("{}.txt", self.base_name)),
            json: self.out_dir.join(format!("{}.json", self.base_name)),
        }
    }

    /// One line per sequence in both files, same order as `lines`
    pub fn write(&self, lines: &[String]) -> Result<OutputPaths> {
        std::fs::create_dir_all(&self.out_dir)?;
        let paths = self.paths();

        let mut text_out = BufWriter::new(File::create(&paths.text)?);
        let mut json_out = BufWriter::new(File::create(&paths.json)?);
        for line in lines {
            writeln!(text_out, "{}", line)?;
            writeln!(json_out, "{}", serde_json::to_string(&[line])?)?;
        }
        text_out.flush()?;
        json_out.flush()?;

        tracing::info!("written the decoded output to {}", paths.text.display());
        Ok(paths)
    }
}

/// `<model>.samples_<top_p>.steps=<steps>`; top_p always keeps a decimal point
pub fn output_base_name(model_identifier: &str, top_p: f64, steps: usize) -> String {
    format!("{}.samples_{:?}.steps={}", model_identifier, top_p, steps)
}

/// Set of whitespace-separated tokens
pub fn token_set(line: &str) -> BTreeSet<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// |A ∩ B| / |A ∪ B|; two empty sets are identical
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Summary of a passing validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub lines_checked: usize,
    pub min_similarity: f64,
}

/// Strict positional comparison against a reference corpus
#[derive(Debug, Clone)]
pub struct SanityValidator {
    threshold: f64,
}

impl Default for SanityValidator {
    fn default() -> Self {
        Self {
            threshold: SANITY_JACCARD_THRESHOLD,
        }
    }
}

impl SanityValidator {
    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Compare reference line i with generated line i for every reference
    /// line. Fails on the first line whose similarity is not above the
    /// threshold; a reference line with no generated counterpart fails too.
    pub fn validate(&self, generated: &[String], reference: &[String]) -> Result<ValidationReport> {
        let mut min_similarity = 1.0f64;
        for (index, reference_line) in reference.iter().enumerate() {
            let reference_set = token_set(reference_line);
            let generated_set = generated
                .get(index)
                .map(|line| token_set(line))
                .unwrap_or_default();

            let similarity = jaccard(&generated_set, &reference_set);
            if similarity <= self.threshold {
                let symmetric_difference = generated_set
                    .symmetric_difference(&reference_set)
                    .cloned()
                    .collect();
                return Err(SampleError::Validation(Box::new(ValidationFailure {
                    index,
                    similarity,
                    generated: generated_set,
                    reference: reference_set,
                    symmetric_difference,
                })));
            }
            min_similarity = min_similarity.min(similarity);
        }

        tracing::info!(
            "Sanity check passed: {} lines, min jaccard {:.4}",
            reference.len(),
            min_similarity
        );
        Ok(ValidationReport {
            lines_checked: reference.len(),
            min_similarity,
        })
    }

    /// Validate against a reference file read line by line
    pub fn validate_file<P: AsRef<Path>>(
        &self,
        generated: &[String],
        reference_path: P,
    ) -> Result<ValidationReport> {
        let reference = read_lines(reference_path)?;
        self.validate(generated, &reference)
    }
}

/// Read a text file into lines, without trailing newlines
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    reader
        .lines()
        .map(|line| line.map_err(SampleError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_base_name_formatting() {
        assert_eq!(
            output_base_name("e2e.ema_200000.pt", 1.0, 200),
            "e2e.ema_200000.pt.samples_1.0.steps=200"
        );
        assert_eq!(output_base_name("m", 0.9, 2), "m.samples_0.9.steps=2");
    }

    #[test]
    fn test_jaccard_partial_overlap() {
        let a = token_set("the cat sat");
        let b = token_set("the cat sit");
        assert_eq!(jaccard(&a, &b), 0.5);
        assert_eq!(jaccard(&token_set(""), &token_set("")), 1.0);
    }

    #[test]
    fn test_validation_failure_payload() {
        let err = SanityValidator::default()
            .validate(&lines(&["a b", "the cat sit"]), &lines(&["a b", "the cat sat"]))
            .unwrap_err();
        match err {
            SampleError::Validation(failure) => {
                assert_eq!(failure.index, 1);
                assert_eq!(failure.similarity, 0.5);
                assert_eq!(failure.symmetric_difference, token_set("sat sit"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let validator = SanityValidator::with_threshold(0.5);
        let res = validator.validate(&lines(&["the cat sit"]), &lines(&["the cat sat"]));
        assert!(res.is_err());
    }

    #[test]
    fn test_missing_generated_line_fails() {
        let res = SanityValidator::default().validate(&lines(&["a"]), &lines(&["a", "b"]));
        assert!(matches!(res, Err(SampleError::Validation(f)) if f.index == 1));
    }

    #[test]
    fn test_extra_generated_lines_ignored() -> Result<()> {
        let report = SanityValidator::default().validate(&lines(&["a", "b"]), &lines(&["a"]))?;
        assert_eq!(report.lines_checked, 1);
        Ok(())
    }

    #[test]
    fn test_write_text_and_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = OutputWriter::new(dir.path().join("out"), "run.ckpt", 0.9, 2);
        let paths = writer.write(&lines(&["the cat sat", "a \"quoted\" b"]))?;

        assert_eq!(
            paths.text.file_name().unwrap().to_string_lossy(),
            "run.ckpt.samples_0.9.steps=2.txt"
        );
        assert_eq!(read_lines(&paths.text)?, lines(&["the cat sat", "a \"quoted\" b"]));

        let json = read_lines(&paths.json)?;
        assert_eq!(json.len(), 2);
        let parsed: Vec<String> = serde_json::from_str(&json[1])?;
        assert_eq!(parsed, vec!["a \"quoted\" b".to_string()]);

        // Same configuration overwrites
        writer.write(&lines(&["x"]))?;
        assert_eq!(read_lines(&paths.text)?, lines(&["x"]));
        Ok(())
    }
}
