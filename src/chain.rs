//! # Processor Chain
//!
//! Text stages and their ordered composition.
//!
//! A [`TextStage`] is a `&str -> String` transformation holding only
//! immutable, construction-time state, so a single instance can be shared
//! across threads. A [`ProcessorChain`] threads text through its stages in
//! order; the first failing stage aborts the chain and is named in the error.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for one request.
///
/// Clones share the same flag. Pure stages ignore it; external program
/// stages poll it while waiting and kill their subprocess once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A single text transformation.
pub trait TextStage: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Transforms `text`.
    fn run(&self, text: &str) -> Result<String>;

    /// Transforms `text`, aborting early if `cancel` is set.
    ///
    /// Stages that never block can rely on the default.
    fn run_cancellable(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        let _ = cancel;
        self.run(text)
    }
}

/// An ordered list of stages applied sequentially.
///
/// An empty chain is the identity transform.
#[derive(Default)]
pub struct ProcessorChain {
    stages: Vec<Box<dyn TextStage>>,
}

impl ProcessorChain {
    /// Creates a chain from stages in application order.
    pub fn new(stages: Vec<Box<dyn TextStage>>) -> Self {
        Self { stages }
    }

    /// Creates the identity chain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in application order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage in order.
    pub fn run(&self, text: &str) -> Result<String> {
        self.run_cancellable(text, &CancellationToken::new())
    }

    /// Runs every stage in order, passing `cancel` to each.
    pub fn run_cancellable(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        let mut current = text.to_string();
        for stage in &self.stages {
            current = stage
                .run_cancellable(&current, cancel)
                .map_err(|e| Error::Stage {
                    stage: stage.name().to_string(),
                    source: Box::new(e),
                })?;
            log::trace!("{} -> {:?}", stage.name(), current);
        }
        Ok(current)
    }
}

impl fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorChain")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl TextStage for ProcessorChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn run(&self, text: &str) -> Result<String> {
        ProcessorChain::run(self, text)
    }

    fn run_cancellable(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        ProcessorChain::run_cancellable(self, text, cancel)
    }
}
