//! Request payload extraction.
//!
//! A request item is a map of named fields. Text arrives under `body`
//! (a string, or an object with `text` and optional `constraints`/`avoid`);
//! uploaded files arrive as raw bytes under `body`, `file` or `data`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Fields that may carry text.
const TEXT_FIELDS: &[&str] = &["body"];

/// Fields that may carry uploaded file bytes, in lookup order.
const FILE_FIELDS: &[&str] = &["body", "file", "data"];

/// One field value of a request item.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Json(Value),
    Bytes(Vec<u8>),
}

/// One item of a request batch, as handed over by the host runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestItem {
    fields: BTreeMap<String, FieldValue>,
}

impl RequestItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an item from a JSON object. Non-object values yield an empty item.
    pub fn from_json(value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, FieldValue::Json(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        Self { fields }
    }

    pub fn with_json(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), FieldValue::Json(value));
        self
    }

    pub fn with_bytes(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.fields
            .insert(name.into(), FieldValue::Bytes(bytes.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Text to translate plus optional decoding hints, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid: Option<Vec<String>>,
}

impl TranslationInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// One response item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResponse {
    pub translation: String,
}

/// Returns the text request carried by `item`, if any.
pub fn get_request(item: &RequestItem) -> Option<TranslationInput> {
    TEXT_FIELDS.iter().find_map(|field| match item.get(field)? {
        FieldValue::Json(Value::String(text)) => Some(TranslationInput::new(text.as_str())),
        FieldValue::Json(Value::Object(map)) => {
            let text = map.get("text")?.as_str()?;
            Some(TranslationInput {
                text: text.to_string(),
                constraints: term_list(map, "constraints"),
                avoid: term_list(map, "avoid"),
            })
        }
        _ => None,
    })
}

/// Reads an optional list of strings. A malformed value drops only that hint.
fn term_list(map: &Map<String, Value>, name: &str) -> Option<Vec<String>> {
    match map.get(name)? {
        Value::Null => None,
        value => match serde_json::from_value(value.clone()) {
            Ok(terms) => Some(terms),
            Err(e) => {
                log::warn!("ignoring malformed '{name}' in request: {e}");
                None
            }
        },
    }
}

/// Returns the uploaded file bytes carried by `item`, if any.
pub fn get_file_data(item: &RequestItem) -> Option<&[u8]> {
    FILE_FIELDS.iter().find_map(|field| match item.get(field)? {
        FieldValue::Bytes(bytes) => Some(bytes.as_slice()),
        FieldValue::Json(_) => None,
    })
}

/// Decodes an upload as UTF-8, dropping invalid sequences and carriage returns.
pub fn decode_bytes(data: &[u8]) -> String {
    let mut text = String::with_capacity(data.len());
    let mut rest = data;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // `valid_up_to` marks a verified UTF-8 prefix
                text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match e.error_len() {
                    Some(len) => rest = &after[len..],
                    None => break, // truncated sequence at the end
                }
            }
        }
    }
    text.retain(|c| c != '\r');
    text.trim().to_string()
}

/// Extracts the input of one item. File data takes precedence over text.
///
/// Returns None when the item has no usable text.
pub fn extract_input(item: &RequestItem) -> Option<TranslationInput> {
    let input = match get_file_data(item) {
        Some(data) if !data.is_empty() => TranslationInput::new(decode_bytes(data)),
        _ => get_request(item)?,
    };
    (!input.text.is_empty()).then_some(input)
}

/// Reads engine command line arguments stored in a file, split on any whitespace.
pub fn read_engine_args(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.split_whitespace().map(str::to_string).collect())
}
