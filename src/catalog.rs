use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::schema::{render_json_list, ConflictSet, FieldDescriptor};

const EMBEDDED_CATALOG: &str = include_str!("../catalog/invoice.yaml");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct DocumentTypeDefinition {
    #[schemars(description = "Document type name used to address this group of fields, e.g. 'invoice'")]
    pub name: String,

    #[schemars(description = "Ordered fields. Order is kept in every rendered prompt.")]
    pub fields: Vec<FieldDescriptor>,
}

/// Static, versioned set of extractable fields per document type.
///
/// Loaded once and read-only afterwards, so it can be shared behind an `Arc` without locking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FieldCatalog {
    #[schemars(description = "Version tag of the field definitions. Bump it whenever a key changes.")]
    pub version: String,

    #[schemars(description = "Document types in declaration order")]
    pub document_types: Vec<DocumentTypeDefinition>,
}

impl FieldCatalog {
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let catalog: FieldCatalog = serde_yaml::from_str(source)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let catalog: FieldCatalog = serde_json::from_str(source)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Loads a catalog file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let catalog = if is_json {
            Self::from_json_str(&source)?
        } else {
            Self::from_yaml_str(&source)?
        };

        info!(
            "Loaded field catalog {} from {} ({} document types)",
            catalog.version,
            path.display(),
            catalog.document_types.len()
        );
        Ok(catalog)
    }

    /// The invoice catalog compiled into the crate.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml_str(EMBEDDED_CATALOG)
    }

    fn validate(&self) -> Result<()> {
        let mut type_names = HashSet::new();

        for doc_type in &self.document_types {
            if doc_type.name.trim().is_empty() {
                return Err(PipelineError::InvalidCatalog(
                    "document type with an empty name".to_string(),
                ));
            }
            if !type_names.insert(doc_type.name.as_str()) {
                return Err(PipelineError::InvalidCatalog(format!(
                    "document type '{}' is declared twice",
                    doc_type.name
                )));
            }

            let mut keys = HashSet::new();
            for field in &doc_type.fields {
                if field.key.trim().is_empty() {
                    return Err(PipelineError::InvalidCatalog(format!(
                        "document type '{}' has a field with an empty key",
                        doc_type.name
                    )));
                }
                if !keys.insert(field.key.as_str()) {
                    return Err(PipelineError::InvalidCatalog(format!(
                        "document type '{}' declares key '{}' twice",
                        doc_type.name, field.key
                    )));
                }
            }
        }

        debug!(
            "Field catalog {} validated: {} document types",
            self.version,
            self.document_types.len()
        );
        Ok(())
    }

    pub fn document_type_names(&self) -> Vec<&str> {
        self.document_types.iter().map(|d| d.name.as_str()).collect()
    }

    /// True when the type exists and has at least one field.
    pub fn contains(&self, document_type: &str) -> bool {
        self.describe(document_type).is_ok()
    }

    pub fn describe(&self, document_type: &str) -> Result<&[FieldDescriptor]> {
        self.document_types
            .iter()
            .find(|d| d.name == document_type)
            .map(|d| d.fields.as_slice())
            .filter(|fields| !fields.is_empty())
            .ok_or_else(|| PipelineError::UnknownDocumentType {
                document_type: document_type.to_string(),
            })
    }

    pub fn field(&self, document_type: &str, key: &str) -> Result<Option<&FieldDescriptor>> {
        Ok(self.describe(document_type)?.iter().find(|f| f.key == key))
    }

    pub fn render_field_prompts(&self, document_type: &str) -> Result<String> {
        let sections: Vec<String> = self
            .describe(document_type)?
            .iter()
            .map(FieldDescriptor::render_section)
            .collect();
        Ok(sections.join("\n").trim_end().to_string())
    }

    pub fn render_field_keys(&self, document_type: &str) -> Result<Vec<String>> {
        Ok(self
            .describe(document_type)?
            .iter()
            .map(|f| f.key.clone())
            .collect())
    }

    /// Indented bullet list of display names and descriptions, nested under a numbered
    /// step of the extraction task prompt.
    pub fn render_field_descriptions(&self, document_type: &str) -> Result<String> {
        let lines: Vec<String> = self
            .describe(document_type)?
            .iter()
            .map(|f| format!("  - {}: {}", f.label(), f.description.trim()))
            .collect();
        Ok(lines.join("\n"))
    }

    /// Sections for the conflicted fields only, each followed by its candidate list.
    /// Keys unknown to the catalog still get a bare section so no conflict is hidden.
    pub fn render_conflict_descriptions(
        &self,
        document_type: &str,
        conflicts: &ConflictSet,
    ) -> Result<String> {
        let fields = self.describe(document_type)?;
        let mut sections = Vec::with_capacity(conflicts.len());

        let mut ordered: Vec<(&String, &Vec<Value>)> = conflicts.iter().collect();
        ordered.sort_by_key(|(key, _)| {
            fields
                .iter()
                .position(|f| &f.key == *key)
                .unwrap_or(usize::MAX)
        });

        for (key, candidates) in ordered {
            let mut section = match fields.iter().find(|f| &f.key == key) {
                Some(field) => field.render_section(),
                None => format!("## {}\n\nField:                  \"{}\"\n", key, key),
            };
            section.push_str(&format!(
                "Conflicting Values:     {}\n",
                render_json_list(candidates.iter())
            ));
            sections.push(section);
        }

        Ok(sections.join("\n").trim_end().to_string())
    }

    /// Field definitions handed to the job runner alongside the workflow steps.
    pub fn extract_config(&self, document_type: &str) -> Result<Value> {
        let fields = self.describe(document_type)?;
        let mut by_key = serde_json::Map::new();
        for field in fields {
            by_key.insert(field.key.clone(), serde_json::to_value(field)?);
        }

        Ok(serde_json::json!({
            "version": self.version,
            document_type: { "fields": Value::Object(by_key) },
        }))
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(FieldCatalog)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
