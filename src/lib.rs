//! # nmtprep
//!
//! Text preparation for neural machine translation serving: raw request text
//! goes through a forward chain before the translation engine, and engine
//! output goes through a reverse chain before it is returned.
//!
//! ## Stages
//!
//! - **unescape**: repairs and decodes HTML character references
//! - **clean**: NFKC normalization and control/format character removal
//! - **segment-han / segment-hangul**: isolates ideographs or syllables with spaces
//! - **tokenizer / detokenizer**: external programs fed through pipes
//! - **bpe / debpe**: subword encoding from a merge table, and its inverse
//!
//! ## Quick Start
//!
//! ```no_run
//! use nmtprep::{EchoTranslator, ModelContext, PipelineOptions, RequestItem, TranslationService};
//!
//! fn main() -> nmtprep::Result<()> {
//!     let mut service = TranslationService::new(EchoTranslator, PipelineOptions::default());
//!     service.initialize(&ModelContext::new("de", "/models/de").with_batch_size(16))?;
//!
//!     let item = RequestItem::new().with_json("body", serde_json::json!("Fish &amp; chips"));
//!     for response in service.handle(&[item])? {
//!         println!("{}", response.translation);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `async`: Tokio wrappers that run the blocking pipeline off the runtime
//!   and cancel abandoned requests

pub mod bpe;
pub mod chain;
pub mod control;
pub mod entity;
pub mod error;
pub mod external;
pub mod options;
pub mod profile;
pub mod request;
pub mod segment;
pub mod service;

#[cfg(feature = "async")]
pub mod async_api;

// Re-exports
pub use bpe::{BpeDecoder, BpeEncoder, MergeTable};
pub use chain::{CancellationToken, ProcessorChain, TextStage};
pub use control::{clean, ControlCharFilter};
pub use entity::{unescape, EntityCanonicalizer};
pub use error::{Error, Result};
pub use external::{ExternalProgram, ExternalStage};
pub use options::PipelineOptions;
pub use profile::{Language, LanguageProfile, ModelContext, ProfileSlot, ProfileState};
pub use request::{RequestItem, TranslationInput, TranslationResponse};
pub use segment::{Script, ScriptSegmenter};
pub use service::{EchoTranslator, TranslationService, Translator, TranslatorInput, TranslatorOutput};

/// Canonicalizes entities and then strips control characters.
///
/// These are the in-process stages every forward chain starts with.
///
/// # Example
///
/// ```
/// assert_eq!(nmtprep::normalize("a&amp;nbsp;b\u{200B}"), "a b");
/// ```
pub fn normalize(text: &str) -> String {
    clean(&unescape(text))
}
