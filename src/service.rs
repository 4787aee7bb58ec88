//! Per-request translation handling.
//!
//! [`TranslationService`] owns a model's [`ProfileSlot`] and its translation
//! engine. Each batch runs strictly as preprocess -> inference -> postprocess.
//! Items without text are skipped rather than failing the batch; any other
//! failure is logged in full and surfaced as a generic inference error.

use crate::chain::CancellationToken;
use crate::error::{Error, Result};
use crate::options::PipelineOptions;
use crate::profile::{LanguageProfile, ModelContext, ProfileSlot};
use crate::request::{extract_input, RequestItem, TranslationInput, TranslationResponse};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One sentence handed to the translation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatorInput {
    pub sentence_id: u64,
    pub text: String,
    pub constraints: Option<Vec<String>>,
    pub avoid: Option<Vec<String>>,
}

/// One engine result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslatorOutput {
    pub translation: String,
    pub score: Option<f32>,
    /// Source/target token index pairs.
    pub alignment: Option<Vec<(usize, usize)>>,
}

impl TranslatorOutput {
    pub fn new(translation: impl Into<String>) -> Self {
        Self {
            translation: translation.into(),
            ..Default::default()
        }
    }
}

/// The translation engine boundary.
pub trait Translator: Send + Sync {
    /// Translates a batch. Outputs should match inputs one to one.
    fn translate(&self, inputs: &[TranslatorInput]) -> Result<Vec<TranslatorOutput>>;
}

/// Engine stand-in that returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTranslator;

impl Translator for EchoTranslator {
    fn translate(&self, inputs: &[TranslatorInput]) -> Result<Vec<TranslatorOutput>> {
        Ok(inputs
            .iter()
            .map(|input| TranslatorOutput::new(input.text.clone()))
            .collect())
    }
}

/// Serves translation requests for one model.
#[derive(Debug)]
pub struct TranslationService<T> {
    slot: ProfileSlot,
    options: PipelineOptions,
    translator: T,
    batch_size: usize,
    next_sentence_id: AtomicU64,
}

impl<T: Translator> TranslationService<T> {
    /// Creates a service whose profile still has to be initialized.
    pub fn new(translator: T, options: PipelineOptions) -> Self {
        Self {
            slot: ProfileSlot::new(),
            options,
            translator,
            batch_size: 1,
            next_sentence_id: AtomicU64::new(0),
        }
    }

    /// Creates a ready service around an already built profile.
    pub fn with_profile(translator: T, profile: LanguageProfile, options: PipelineOptions) -> Self {
        let mut service = Self::new(translator, options);
        service.slot = ProfileSlot::ready(profile);
        service
    }

    /// Builds the profile for a model. Must succeed before requests are served.
    pub fn initialize(&mut self, context: &ModelContext) -> Result<()> {
        self.batch_size = context.batch_size;
        if context.gpu_id.is_none() {
            log::warn!("no gpu_id found in context for model '{}'", context.model_name);
        }
        self.slot.initialize(context, &self.options)?;
        Ok(())
    }

    pub fn slot(&self) -> &ProfileSlot {
        &self.slot
    }

    pub fn profile(&self) -> Result<Arc<LanguageProfile>> {
        self.slot.profile()
    }

    pub fn translator(&self) -> &T {
        &self.translator
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Handles one batch.
    pub fn handle(&self, batch: &[RequestItem]) -> Result<Vec<TranslationResponse>> {
        self.handle_cancellable(batch, &CancellationToken::new())
    }

    /// Handles one batch; setting `cancel` kills in-flight external programs.
    pub fn handle_cancellable(
        &self,
        batch: &[RequestItem],
        cancel: &CancellationToken,
    ) -> Result<Vec<TranslationResponse>> {
        let result = self.profile().and_then(|profile| {
            let inputs = self.preprocess(&profile, batch, cancel)?;
            let outputs = self.inference(inputs)?;
            self.postprocess(&profile, &outputs, cancel)
        });

        match result {
            Ok(responses) => {
                if responses.len() != batch.len() {
                    log::warn!(
                        "returning {} translations for {} request items",
                        responses.len(),
                        batch.len()
                    );
                }
                Ok(responses)
            }
            Err(e) => {
                log::error!("request failed: {e:?}");
                Err(Error::unknown_inference())
            }
        }
    }

    /// Extracts and preprocesses the text of every item, skipping items without text.
    pub fn preprocess(
        &self,
        profile: &LanguageProfile,
        batch: &[RequestItem],
        cancel: &CancellationToken,
    ) -> Result<Vec<TranslationInput>> {
        let process = |(index, item): (usize, &RequestItem)| {
            let Some(mut input) = extract_input(item) else {
                log::warn!("{}", Error::MalformedRequest(format!("item {index} has no text")));
                return None;
            };
            Some(profile.preprocess_cancellable(&input.text, cancel).map(|text| {
                input.text = text;
                input
            }))
        };

        if self.options.parallel && batch.len() > 1 {
            batch.par_iter().enumerate().filter_map(process).collect()
        } else {
            batch.iter().enumerate().filter_map(process).collect()
        }
    }

    /// Sends preprocessed inputs to the engine. An empty batch is not sent.
    pub fn inference(&self, inputs: Vec<TranslationInput>) -> Result<Vec<TranslatorOutput>> {
        if inputs.is_empty() {
            log::warn!("input to inference is empty");
            return Ok(Vec::new());
        }

        let first_id = self
            .next_sentence_id
            .fetch_add(inputs.len() as u64, Ordering::Relaxed);
        let inputs: Vec<TranslatorInput> = inputs
            .into_iter()
            .zip(first_id..)
            .map(|(input, sentence_id)| TranslatorInput {
                sentence_id,
                text: input.text,
                constraints: input.constraints,
                avoid: input.avoid,
            })
            .collect();

        let outputs = self.translator.translate(&inputs)?;
        if outputs.len() != inputs.len() {
            log::warn!(
                "number of translation outputs ({}) doesn't match the number of inputs ({})",
                outputs.len(),
                inputs.len()
            );
        }
        Ok(outputs)
    }

    /// Postprocesses engine outputs into responses, in order.
    pub fn postprocess(
        &self,
        profile: &LanguageProfile,
        outputs: &[TranslatorOutput],
        cancel: &CancellationToken,
    ) -> Result<Vec<TranslationResponse>> {
        outputs
            .iter()
            .map(|output| {
                let translation = profile.postprocess_cancellable(&output.translation, cancel)?;
                Ok(TranslationResponse { translation })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ProcessorChain, TextStage};
    use crate::profile::Language;
    use serde_json::json;
    use std::sync::Mutex;

    struct Upper;

    impl TextStage for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn run(&self, text: &str) -> Result<String> {
            Ok(text.to_uppercase())
        }
    }

    struct Failing;

    impl TextStage for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _text: &str) -> Result<String> {
            Err(Error::external("/bin/false", "exit status 1"))
        }
    }

    /// Records the inputs it receives and echoes them.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<TranslatorInput>>);

    impl Translator for Recorder {
        fn translate(&self, inputs: &[TranslatorInput]) -> Result<Vec<TranslatorOutput>> {
            self.0.lock().unwrap().extend_from_slice(inputs);
            EchoTranslator.translate(inputs)
        }
    }

    fn service<T: Translator>(translator: T, forward: Vec<Box<dyn TextStage>>) -> TranslationService<T> {
        let profile = LanguageProfile::from_chains(
            Language::Default("en".into()),
            ProcessorChain::new(forward),
            ProcessorChain::empty(),
            false,
        );
        TranslationService::with_profile(translator, profile, PipelineOptions::default())
    }

    #[test]
    fn test_handle_in_order() {
        let svc = service(EchoTranslator, vec![Box::new(Upper)]);
        let batch = vec![
            RequestItem::new().with_json("body", json!("one")),
            RequestItem::new().with_json("body", json!({"text": "two"})),
            RequestItem::new().with_bytes("file", "three\r\n"),
        ];
        let responses = svc.handle(&batch).unwrap();
        let texts: Vec<_> = responses.iter().map(|r| r.translation.as_str()).collect();
        assert_eq!(texts, vec!["ONE", "TWO", "THREE"]);
    }

    #[test]
    fn test_items_without_text_are_skipped() {
        let svc = service(EchoTranslator, vec![]);
        let batch = vec![
            RequestItem::new().with_json("body", json!("kept")),
            RequestItem::new().with_json("zzz", json!("no body")),
            RequestItem::new().with_json("body", json!({"zzz": 1})),
        ];
        let responses = svc.handle(&batch).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].translation, "kept");
    }

    #[test]
    fn test_empty_batch_skips_engine() {
        let svc = service(Recorder::default(), vec![]);
        let responses = svc
            .handle(&[RequestItem::new().with_json("nothing", json!(null))])
            .unwrap();
        assert!(responses.is_empty());
        assert!(svc.translator().0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sentence_ids_increase_across_batches() {
        let svc = service(Recorder::default(), vec![]);
        let batch = vec![
            RequestItem::new().with_json("body", json!("a")),
            RequestItem::new().with_json("body", json!("b")),
        ];
        svc.handle(&batch).unwrap();
        svc.handle(&batch[..1]).unwrap();

        let ids: Vec<u64> = svc
            .translator()
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.sentence_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_constraints_passed_through() {
        let svc = service(Recorder::default(), vec![]);
        let batch = vec![RequestItem::new().with_json(
            "body",
            json!({"text": "x", "constraints": ["Haus"], "avoid": ["Heim"]}),
        )];
        svc.handle(&batch).unwrap();
        let seen = svc.translator().0.lock().unwrap();
        assert_eq!(seen[0].constraints, Some(vec!["Haus".to_string()]));
        assert_eq!(seen[0].avoid, Some(vec!["Heim".to_string()]));
    }

    #[test]
    fn test_stage_failure_is_generic_500() {
        let svc = service(EchoTranslator, vec![Box::new(Failing)]);
        let batch = vec![RequestItem::new().with_json("body", json!("x"))];
        match svc.handle(&batch) {
            Err(Error::Inference { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "Unknown inference error");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The shared profile survives a failed request
        assert!(svc.slot().state().is_ready());
    }

    #[test]
    fn test_uninitialized_service_fails() {
        let svc = TranslationService::new(EchoTranslator, PipelineOptions::default());
        let batch = vec![RequestItem::new().with_json("body", json!("x"))];
        assert!(matches!(svc.handle(&batch), Err(Error::Inference { .. })));
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let batch: Vec<_> = (0..16)
            .map(|i| RequestItem::new().with_json("body", json!(format!("item {i}"))))
            .collect();
        let parallel = service(EchoTranslator, vec![Box::new(Upper)]);
        let profile = LanguageProfile::from_chains(
            Language::Default("en".into()),
            ProcessorChain::new(vec![Box::new(Upper)]),
            ProcessorChain::empty(),
            false,
        );
        let sequential = TranslationService::with_profile(
            EchoTranslator,
            profile,
            PipelineOptions::default().sequential(),
        );
        assert_eq!(parallel.handle(&batch).unwrap(), sequential.handle(&batch).unwrap());
    }
}
