//! Async API for non-blocking request handling.
//!
//! Enable the `async` feature to use these APIs:
//!
//! ```toml
//! [dependencies]
//! nmtprep = { version = "0.1", features = ["async"] }
//! ```
//!
//! The pipeline blocks on external programs, so every call runs on tokio's
//! blocking pool. Dropping a returned future before it completes cancels the
//! request and kills any external program it is waiting on.

use crate::chain::CancellationToken;
use crate::error::{Error, Result};
use crate::options::PipelineOptions;
use crate::profile::LanguageProfile;
use crate::request::{RequestItem, TranslationResponse};
use crate::service::{TranslationService, Translator};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

/// Cancels its token unless disarmed.
struct CancelOnDrop {
    token: CancellationToken,
    armed: bool,
}

impl CancelOnDrop {
    fn new(token: CancellationToken) -> Self {
        Self { token, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("request abandoned, cancelling");
            self.token.cancel();
        }
    }
}

async fn run_blocking<T, F>(job: F) -> Result<T>
where
    F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let guard = CancelOnDrop::new(token.clone());
    let result = tokio::task::spawn_blocking(move || job(&token))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    guard.disarm();
    result
}

/// Asynchronously loads pipeline options from a JSON file.
pub async fn load_options(path: impl AsRef<Path>) -> Result<PipelineOptions> {
    let data = fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Asynchronously runs the forward chain of `profile`.
///
/// # Example
///
/// ```no_run
/// # async fn example(profile: std::sync::Arc<nmtprep::LanguageProfile>) -> nmtprep::Result<()> {
/// let text = nmtprep::async_api::preprocess(profile, "Fish &amp; chips").await?;
/// println!("{}", text);
/// # Ok(())
/// # }
/// ```
pub async fn preprocess(profile: Arc<LanguageProfile>, text: impl Into<String>) -> Result<String> {
    let text = text.into();
    run_blocking(move |cancel| profile.preprocess_cancellable(&text, cancel)).await
}

/// Asynchronously runs the reverse chain of `profile`.
pub async fn postprocess(profile: Arc<LanguageProfile>, text: impl Into<String>) -> Result<String> {
    let text = text.into();
    run_blocking(move |cancel| profile.postprocess_cancellable(&text, cancel)).await
}

/// Async handle to a shared [`TranslationService`].
///
/// # Example
///
/// ```no_run
/// # async fn example() -> nmtprep::Result<()> {
/// use nmtprep::async_api::AsyncTranslationService;
/// use nmtprep::{EchoTranslator, ModelContext, PipelineOptions, RequestItem, TranslationService};
///
/// let mut service = TranslationService::new(EchoTranslator, PipelineOptions::default());
/// service.initialize(&ModelContext::new("de", "/models/de"))?;
///
/// let service = AsyncTranslationService::new(service);
/// let item = RequestItem::new().with_json("body", serde_json::json!("Guten Tag"));
/// let responses = service.handle(vec![item]).await?;
/// # Ok(())
/// # }
/// ```
pub struct AsyncTranslationService<T> {
    inner: Arc<TranslationService<T>>,
}

impl<T> Clone for AsyncTranslationService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Translator + 'static> AsyncTranslationService<T> {
    pub fn new(service: TranslationService<T>) -> Self {
        Self {
            inner: Arc::new(service),
        }
    }

    pub fn service(&self) -> &TranslationService<T> {
        &self.inner
    }

    /// Handles one batch on the blocking pool.
    pub async fn handle(&self, batch: Vec<RequestItem>) -> Result<Vec<TranslationResponse>> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move |cancel| inner.handle_cancellable(&batch, cancel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ProcessorChain, TextStage};
    use crate::entity::EntityCanonicalizer;
    use crate::profile::Language;
    use crate::service::EchoTranslator;
    use serde_json::json;

    fn profile() -> LanguageProfile {
        let forward: Vec<Box<dyn TextStage>> = vec![Box::new(EntityCanonicalizer::new())];
        LanguageProfile::from_chains(
            Language::Default("en".into()),
            ProcessorChain::new(forward),
            ProcessorChain::empty(),
            false,
        )
    }

    #[tokio::test]
    async fn test_preprocess() {
        let text = preprocess(Arc::new(profile()), "Fish &amp;amp; chips")
            .await
            .unwrap();
        assert_eq!(text, "Fish & chips");
    }

    #[tokio::test]
    async fn test_handle() {
        let service = TranslationService::with_profile(
            EchoTranslator,
            profile(),
            PipelineOptions::default(),
        );
        let service = AsyncTranslationService::new(service);
        let responses = service
            .handle(vec![RequestItem::new().with_json("body", json!("a &lt; b"))])
            .await
            .unwrap();
        assert_eq!(responses[0].translation, "a < b");
    }

    #[tokio::test]
    async fn test_load_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"timeout_ms": 500, "parallel": false}"#).unwrap();
        let options = load_options(&path).await.unwrap();
        assert_eq!(options.timeout_ms, 500);
        assert!(!options.parallel);
    }

    #[test]
    fn test_guard_cancels_unless_disarmed() {
        let token = CancellationToken::new();
        CancelOnDrop::new(token.clone()).disarm();
        assert!(!token.is_cancelled());

        drop(CancelOnDrop::new(token.clone()));
        assert!(token.is_cancelled());
    }
}
