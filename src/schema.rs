use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    #[schemars(description = "Free text, returned as a JSON string")]
    String,

    #[schemars(description = "Whole number, returned as a JSON number")]
    Int,

    #[schemars(description = "Decimal number, returned as a JSON number")]
    Float,

    #[schemars(description = "Either an integer or a decimal, returned as a JSON number")]
    Number,

    #[schemars(description = "Calendar date, returned as a YYYY-MM-DD string")]
    Date,

    #[schemars(description = "true or false")]
    Boolean,
}

impl FieldFormat {
    /// Checks that an extracted value has the shape this format asks for.
    /// Numeric formats also accept numeric strings, since agents often quote amounts.
    pub fn conforms(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldFormat::String, Value::String(s)) => !s.trim().is_empty(),
            (FieldFormat::String, Value::Number(_)) => true,
            (FieldFormat::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldFormat::Int, Value::String(s)) => s.trim().parse::<i64>().is_ok(),
            (FieldFormat::Float | FieldFormat::Number, Value::Number(_)) => true,
            (FieldFormat::Float | FieldFormat::Number, Value::String(s)) => {
                s.trim().parse::<f64>().is_ok()
            }
            (FieldFormat::Date, Value::String(s)) => {
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok()
            }
            (FieldFormat::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldFormat::String => "string",
            FieldFormat::Int => "integer",
            FieldFormat::Float => "Number (float)",
            FieldFormat::Number => "Number (float or int)",
            FieldFormat::Date => "date string (YYYY-MM-DD)",
            FieldFormat::Boolean => "boolean",
        };
        f.write_str(label)
    }
}

/// One extractable attribute of a document.
///
/// `key` is the JSON key every agent reply uses for this field. Changing it invalidates
/// every record extracted under the old key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FieldDescriptor {
    #[schemars(description = "JSON key used for this field in every extraction reply. Unique within a document type.")]
    pub key: String,

    #[serde(default)]
    #[schemars(description = "Human readable name used as the section heading. Defaults to the key.")]
    pub display_name: String,

    #[schemars(description = "What the field means and how it relates to the rest of the document")]
    pub description: String,

    #[schemars(description = "Expected shape of the extracted value")]
    pub format: FieldFormat,

    #[serde(default)]
    #[schemars(description = "Labels that commonly sit next to the value on the page, e.g. 'Now Due'")]
    pub identifier_hints: Vec<String>,

    #[serde(default)]
    #[schemars(description = "Extra rules for this field. One instruction per line.")]
    pub special_instructions: Option<String>,
}

impl FieldDescriptor {
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.key
        } else {
            &self.display_name
        }
    }

    /// Renders the labelled sub-section used in every prompt's field description block.
    pub fn render_section(&self) -> String {
        let mut out = format!("## {}\n\n", self.label());
        out.push_str(&format!("Field:                  \"{}\"\n", self.key));
        out.push_str(&format!(
            "Description:            {}\n",
            self.description.trim()
        ));
        out.push_str(&format!("Format:                 {}\n", self.format));

        if !self.identifier_hints.is_empty() {
            let hints = self
                .identifier_hints
                .iter()
                .map(|h| format!("\"{}\"", h))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("Example Identifiers:    {}\n", hints));
        }

        if let Some(instructions) = &self.special_instructions {
            let lines: Vec<&str> = instructions
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            if !lines.is_empty() {
                out.push_str("Special Instructions:\n");
                for line in lines {
                    let line = line.strip_prefix("- ").unwrap_or(line);
                    out.push_str(&format!("- {}\n", line));
                }
            }
        }

        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    Url { url: String },
    Inline { mime_type: String, data: String },
}

impl ImageRef {
    pub fn url(url: impl Into<String>) -> Self {
        ImageRef::Url { url: url.into() }
    }

    /// `data:` URL form, usable wherever an agent accepts image URLs.
    pub fn to_data_url(&self) -> String {
        match self {
            ImageRef::Url { url } => url.clone(),
            ImageRef::Inline { mime_type, data } => format!("data:{};base64,{}", mime_type, data),
        }
    }
}

/// What the agent sees for one content unit. Excerpts are the only basis for extracted
/// values; images give context during extraction and become authoritative during QA.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionContext {
    #[serde(default)]
    pub excerpt_text: Option<String>,
    #[serde(default)]
    pub page_images: Vec<ImageRef>,
}

impl ExtractionContext {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            excerpt_text: Some(text.into()),
            page_images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.page_images = images;
        self
    }

    pub fn has_excerpt(&self) -> bool {
        self.excerpt_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_images(&self) -> bool {
        !self.page_images.is_empty()
    }

    pub fn validate(&self, document: &str) -> Result<()> {
        if self.has_excerpt() || self.has_images() {
            Ok(())
        } else {
            Err(PipelineError::MissingContext {
                document: document.to_string(),
            })
        }
    }
}

/// Structural element of a document that is extracted on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ContentUnit {
    Figure,
    Paragraph,
    TableFigure,
    /// Structured key-value blocks. Never bound to the extraction step.
    Json,
}

impl ContentUnit {
    pub const EXTRACTABLE: [ContentUnit; 3] = [
        ContentUnit::Figure,
        ContentUnit::Paragraph,
        ContentUnit::TableFigure,
    ];

    pub fn is_extractable(&self) -> bool {
        !matches!(self, ContentUnit::Json)
    }
}

impl fmt::Display for ContentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContentUnit::Figure => "figure",
            ContentUnit::Paragraph => "paragraph",
            ContentUnit::TableFigure => "table-figure",
            ContentUnit::Json => "json",
        };
        f.write_str(label)
    }
}

/// A value counts as present only when it is a non-empty scalar.
pub fn is_present_scalar(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.trim().is_empty(),
        Value::Number(_) | Value::Bool(_) => true,
        Value::Null | Value::Array(_) | Value::Object(_) => false,
    }
}

/// JSON list with `", "` separators, the layout the prompts' worked examples use.
/// Every item is JSON-encoded, so quotes and backslashes stay escaped.
pub fn render_json_list<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    let items: Vec<String> = values.into_iter().map(Value::to_string).collect();
    format!("[{}]", items.join(", "))
}

/// Field key to extracted scalar. Keys exist only for values that were found; there are
/// no null or empty-string placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedRecord(BTreeMap<String, Value>);

impl ExtractedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from a parsed JSON object. Null and empty values are skipped
    /// silently; keys holding arrays or objects are returned as rejected.
    pub fn from_json_object(object: Map<String, Value>) -> (Self, Vec<String>) {
        let mut record = Self::new();
        let mut rejected = Vec::new();

        for (key, value) in object {
            if matches!(value, Value::Array(_) | Value::Object(_)) {
                rejected.push(key);
            } else {
                record.insert(key, value);
            }
        }

        (record, rejected)
    }

    /// Returns false, leaving the record untouched, when the value is not a present scalar.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if key.trim().is_empty() || !is_present_scalar(&value) {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ExtractedRecord {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (key, value) in iter {
            record.insert(key, value);
        }
        record
    }
}

/// Field key to the distinct candidate values that extraction passes disagreed on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictSet(BTreeMap<String, Vec<Value>>);

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first occurrence of each distinct present value, in order. The key is
    /// recorded only if at least two distinct candidates remain.
    pub fn insert(&mut self, key: impl Into<String>, candidates: Vec<Value>) -> bool {
        let mut distinct: Vec<Value> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if is_present_scalar(&candidate) && !distinct.contains(&candidate) {
                distinct.push(candidate);
            }
        }

        if distinct.len() < 2 {
            return false;
        }
        self.0.insert(key.into(), distinct);
        true
    }

    pub fn get(&self, key: &str) -> Option<&[Value]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Value>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
