//! Pipeline options for profile construction.

use crate::error::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the merge-table file inside a model directory.
pub const DEFAULT_BPE_CODES: &str = "bpe-codes.txt";

/// Default name of the engine argument file inside a model directory.
pub const DEFAULT_ENGINE_ARGS: &str = "sockeye-args.txt";

/// Options for controlling how language profiles are assembled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Directory holding the external tokenizer/detokenizer programs.
    /// If None, `<model_dir>/scripts` is used.
    pub scripts_dir: Option<PathBuf>,

    /// Merge-table file name, resolved relative to the model directory.
    pub bpe_codes: String,

    /// Engine argument file name, resolved relative to the model directory.
    pub engine_args: String,

    /// Tokenizer program file name inside the scripts directory.
    pub tokenizer: String,

    /// Detokenizer program file name inside the scripts directory.
    pub detokenizer: String,

    /// Language code passed to the detokenizer.
    pub detokenizer_lang: String,

    /// Subprocess timeout in milliseconds (0 = no timeout).
    pub timeout_ms: u64,

    /// Subword continuation marker.
    pub bpe_separator: String,

    /// Whether to preprocess batch items in parallel.
    pub parallel: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            scripts_dir: None,
            bpe_codes: DEFAULT_BPE_CODES.to_string(),
            engine_args: DEFAULT_ENGINE_ARGS.to_string(),
            tokenizer: "tokenizer.perl".to_string(),
            detokenizer: "detokenize.pl".to_string(),
            detokenizer_lang: "en".to_string(),
            timeout_ms: 30_000,
            bpe_separator: "@@".to_string(),
            parallel: true,
        }
    }
}

impl PipelineOptions {
    /// Creates new options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads options from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Sets the directory of external programs.
    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = Some(dir.into());
        self
    }

    /// Sets the merge-table file name.
    pub fn with_bpe_codes(mut self, name: impl Into<String>) -> Self {
        self.bpe_codes = name.into();
        self
    }

    /// Sets the subprocess timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Disables subprocess timeouts.
    pub fn without_timeout(mut self) -> Self {
        self.timeout_ms = 0;
        self
    }

    /// Sets the detokenizer language code.
    pub fn with_detokenizer_lang(mut self, lang: impl Into<String>) -> Self {
        self.detokenizer_lang = lang.into();
        self
    }

    /// Disables parallel processing.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Returns the subprocess timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Resolves the scripts directory for a model directory.
    pub fn scripts_path(&self, model_dir: &Path) -> PathBuf {
        self.scripts_dir
            .clone()
            .unwrap_or_else(|| model_dir.join("scripts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PipelineOptions::default();
        assert_eq!(options.bpe_codes, "bpe-codes.txt");
        assert_eq!(options.detokenizer_lang, "en");
        assert_eq!(options.timeout(), Some(Duration::from_secs(30)));
        assert!(options.parallel);
    }

    #[test]
    fn test_builder_chain() {
        let options = PipelineOptions::new()
            .with_scripts_dir("/opt/scripts")
            .with_timeout(Duration::from_millis(250))
            .sequential();
        assert_eq!(options.scripts_dir, Some(PathBuf::from("/opt/scripts")));
        assert_eq!(options.timeout_ms, 250);
        assert!(!options.parallel);

        let options = options.without_timeout();
        assert!(options.timeout().is_none());
    }

    #[test]
    fn test_scripts_path_fallback() {
        let options = PipelineOptions::default();
        assert_eq!(
            options.scripts_path(Path::new("/models/ko")),
            PathBuf::from("/models/ko/scripts")
        );
        let options = options.with_scripts_dir("/shared");
        assert_eq!(
            options.scripts_path(Path::new("/models/ko")),
            PathBuf::from("/shared")
        );
    }

    #[test]
    fn test_from_json_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"timeout_ms": 500, "detokenizer_lang": "de"}"#).unwrap();

        let options = PipelineOptions::from_json_file(&path).unwrap();
        assert_eq!(options.timeout_ms, 500);
        assert_eq!(options.detokenizer_lang, "de");
        assert_eq!(options.tokenizer, "tokenizer.perl");
    }
}
