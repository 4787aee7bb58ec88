//! # Language Profiles
//!
//! A [`LanguageProfile`] binds one model to its forward (preprocessing) and
//! reverse (postprocessing) chains:
//!
//! | Language | Forward | Reverse |
//! |----------|---------|---------|
//! | Default  | unescape, clean, tokenizer, [bpe] | [debpe], detokenizer |
//! | Korean   | unescape, clean, segment-hangul, tokenizer, [bpe] | [debpe], detokenizer |
//! | Chinese  | unescape, clean, segment-han, tokenizer, [bpe] | [debpe], detokenizer |
//!
//! Bracketed stages are present only if the merge table exists when the
//! profile is built. Profiles are built once per model load through a
//! [`ProfileSlot`] and are immutable afterwards.

use crate::bpe::{BpeDecoder, BpeEncoder, MergeTable};
use crate::chain::{CancellationToken, ProcessorChain, TextStage};
use crate::control::ControlCharFilter;
use crate::entity::EntityCanonicalizer;
use crate::error::{Error, Result};
use crate::external::ExternalStage;
use crate::options::PipelineOptions;
use crate::segment::{Script, ScriptSegmenter};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Target language of a model, derived from its registered name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Language {
    /// Latin-script and other space-delimited languages, carrying the tokenizer language code.
    Default(String),
    Korean,
    Chinese,
}

impl Language {
    /// Maps a model name such as `ko`, `zh-en` or `de` to a language.
    ///
    /// The language code is the part of the name before the first `-` or `_`.
    pub fn from_model_name(name: &str) -> Self {
        let code = name
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match code.as_str() {
            "ko" => Language::Korean,
            "zh" => Language::Chinese,
            _ => Language::Default(code),
        }
    }

    /// Language code passed to the tokenizer.
    pub fn code(&self) -> &str {
        match self {
            Language::Default(code) => code,
            Language::Korean => "ko",
            Language::Chinese => "zh",
        }
    }

    /// Script that needs explicit segmentation, if any.
    pub fn script(&self) -> Option<Script> {
        match self {
            Language::Default(_) => None,
            Language::Korean => Some(Script::Hangul),
            Language::Chinese => Some(Script::Han),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// What the host runtime knows about a model at load time.
#[derive(Debug, Clone)]
pub struct ModelContext {
    /// Registered model name; determines the language.
    pub model_name: String,
    /// Directory holding the model artifacts.
    pub model_dir: PathBuf,
    /// Maximum number of items per request batch.
    pub batch_size: usize,
    /// Device assigned to the engine, if any.
    pub gpu_id: Option<u32>,
}

impl ModelContext {
    pub fn new(model_name: impl Into<String>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_name: model_name.into(),
            model_dir: model_dir.into(),
            batch_size: 1,
            gpu_id: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_gpu(mut self, gpu_id: u32) -> Self {
        self.gpu_id = Some(gpu_id);
        self
    }

    pub fn language(&self) -> Language {
        Language::from_model_name(&self.model_name)
    }
}

/// The forward and reverse chains of one model.
#[derive(Debug)]
pub struct LanguageProfile {
    language: Language,
    forward: ProcessorChain,
    reverse: ProcessorChain,
    subword: bool,
}

impl LanguageProfile {
    /// Builds the chains for `language` from resources under `model_dir`.
    ///
    /// Fails with [`Error::InvalidState`] when the language code is empty or
    /// not alphanumeric, e.g. for a model named `-en`.
    pub fn build(language: Language, model_dir: &Path, options: &PipelineOptions) -> Result<Self> {
        let code = language.code();
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidState(format!(
                "model name yields invalid language code '{code}'"
            )));
        }

        let scripts = options.scripts_path(model_dir);
        let timeout = options.timeout();

        let tokenizer =
            ExternalStage::tokenizer(scripts.join(&options.tokenizer), language.code(), timeout)?;
        let detokenizer = ExternalStage::detokenizer(
            scripts.join(&options.detokenizer),
            &options.detokenizer_lang,
            timeout,
        )?;

        // Checked exactly once; the answer is fixed for the profile's lifetime
        let codes = model_dir.join(&options.bpe_codes);
        let table = if codes.is_file() {
            Some(MergeTable::from_file(&codes)?)
        } else {
            log::info!("no merge table at {}, subword stage disabled", codes.display());
            None
        };

        let mut forward: Vec<Box<dyn TextStage>> = vec![
            Box::new(EntityCanonicalizer::new()),
            Box::new(ControlCharFilter::new()),
        ];
        if let Some(script) = language.script() {
            forward.push(Box::new(ScriptSegmenter::new(script)));
        }
        forward.push(Box::new(tokenizer));

        let mut reverse: Vec<Box<dyn TextStage>> = Vec::new();
        let subword = table.is_some();
        if let Some(table) = table {
            forward.push(Box::new(BpeEncoder::with_separator(
                table,
                options.bpe_separator.as_str(),
            )));
            reverse.push(Box::new(BpeDecoder::with_separator(&options.bpe_separator)?));
        }
        reverse.push(Box::new(detokenizer));

        Ok(Self::from_chains(
            language,
            ProcessorChain::new(forward),
            ProcessorChain::new(reverse),
            subword,
        ))
    }

    /// Assembles a profile from ready-made chains.
    pub fn from_chains(
        language: Language,
        forward: ProcessorChain,
        reverse: ProcessorChain,
        subword: bool,
    ) -> Self {
        Self {
            language,
            forward,
            reverse,
            subword,
        }
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    pub fn forward(&self) -> &ProcessorChain {
        &self.forward
    }

    pub fn reverse(&self) -> &ProcessorChain {
        &self.reverse
    }

    /// Whether the subword encoder/decoder pair is part of the chains.
    pub fn has_subword(&self) -> bool {
        self.subword
    }

    /// Raw request text -> engine input.
    pub fn preprocess(&self, text: &str) -> Result<String> {
        self.forward.run(text)
    }

    pub fn preprocess_cancellable(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        self.forward.run_cancellable(text, cancel)
    }

    /// Engine output -> response text.
    pub fn postprocess(&self, text: &str) -> Result<String> {
        self.reverse.run(text)
    }

    pub fn postprocess_cancellable(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.reverse.run_cancellable(text, cancel)
    }
}

/// Lifecycle of a model's profile.
#[derive(Debug, Clone, Default)]
pub enum ProfileState {
    #[default]
    Uninitialized,
    Initializing,
    Ready(Arc<LanguageProfile>),
    Failed(String),
}

impl ProfileState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProfileState::Ready(_))
    }
}

/// Holds the profile of one model through its load lifecycle.
///
/// `Uninitialized -> Initializing -> Ready | Failed`. A failed load is final:
/// there is no retry and no fallback to a partial chain.
#[derive(Debug, Default)]
pub struct ProfileSlot {
    state: ProfileState,
}

impl ProfileSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that is ready from the start.
    pub fn ready(profile: LanguageProfile) -> Self {
        Self {
            state: ProfileState::Ready(Arc::new(profile)),
        }
    }

    pub fn state(&self) -> &ProfileState {
        &self.state
    }

    /// Builds the profile for `context`.
    pub fn initialize(
        &mut self,
        context: &ModelContext,
        options: &PipelineOptions,
    ) -> Result<Arc<LanguageProfile>> {
        self.initialize_with(|| {
            LanguageProfile::build(context.language(), &context.model_dir, options)
        })
    }

    /// Runs `build` as the `Initializing -> Ready | Failed` transition.
    ///
    /// Calling this on a ready slot returns the existing profile. A panic in
    /// `build` leaves the slot failed.
    pub fn initialize_with(
        &mut self,
        build: impl FnOnce() -> Result<LanguageProfile>,
    ) -> Result<Arc<LanguageProfile>> {
        match &self.state {
            ProfileState::Ready(profile) => return Ok(profile.clone()),
            ProfileState::Failed(reason) => {
                return Err(Error::InvalidState(format!("profile load failed: {reason}")));
            }
            ProfileState::Initializing => {
                return Err(Error::InvalidState("profile is already initializing".into()));
            }
            ProfileState::Uninitialized => {}
        }

        self.state = ProfileState::Initializing;
        let guard = InitGuard {
            state: &mut self.state,
        };
        match build() {
            Ok(profile) => {
                log::info!(
                    "profile '{}' ready: forward {:?}, reverse {:?}",
                    profile.language(),
                    profile.forward().stage_names(),
                    profile.reverse().stage_names()
                );
                let profile = Arc::new(profile);
                *guard.state = ProfileState::Ready(profile.clone());
                Ok(profile)
            }
            Err(e) => {
                log::error!("profile load failed: {e}");
                *guard.state = ProfileState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Returns the profile if it is ready.
    pub fn profile(&self) -> Result<Arc<LanguageProfile>> {
        match &self.state {
            ProfileState::Ready(profile) => Ok(profile.clone()),
            ProfileState::Failed(reason) => {
                Err(Error::InvalidState(format!("profile load failed: {reason}")))
            }
            _ => Err(Error::InvalidState("profile is not initialized".into())),
        }
    }
}

/// Moves a slot still `Initializing` to `Failed` when dropped, which only
/// happens if the build unwinds.
struct InitGuard<'a> {
    state: &'a mut ProfileState,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if matches!(self.state, ProfileState::Initializing) {
            log::error!("profile load failed: build panicked");
            *self.state = ProfileState::Failed("profile build panicked".into());
        }
    }
}
