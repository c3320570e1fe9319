use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::catalog::FieldCatalog;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::prompts::{render_extraction_prompt, ExtractionPrompts};
use crate::schema::ContentUnit;

/// Summary-section slot the extraction step writes its output into.
pub const EXTRACTION_STEP_FIELD: &str = "sect-sum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Element,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    Assistant,
    Developer,
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPrompt {
    pub prompt: String,
    pub role: PromptRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPromptGroup {
    pub request: WorkflowPrompt,
    pub task: WorkflowPrompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepIncludes {
    pub page_images: bool,
}

/// Binds a prompt pair and inclusion options to the content units that use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowStepConfig {
    field: String,
    includes: StepIncludes,
    prompt: WorkflowPromptGroup,
}

impl WorkflowStepConfig {
    /// Request prompt goes out with the assistant role, task prompt with the developer role.
    pub fn extraction(prompts: ExtractionPrompts, include_page_images: bool) -> Self {
        Self {
            field: EXTRACTION_STEP_FIELD.to_string(),
            includes: StepIncludes {
                page_images: include_page_images,
            },
            prompt: WorkflowPromptGroup {
                request: WorkflowPrompt {
                    prompt: prompts.request,
                    role: PromptRole::Assistant,
                },
                task: WorkflowPrompt {
                    prompt: prompts.task,
                    role: PromptRole::Developer,
                },
            },
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn includes(&self) -> StepIncludes {
        self.includes
    }

    pub fn prompt(&self) -> &WorkflowPromptGroup {
        &self.prompt
    }
}

/// Per content-unit bindings of one stage. `None` serializes as an explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct WorkflowStep {
    figure: Option<Arc<WorkflowStepConfig>>,
    paragraph: Option<Arc<WorkflowStepConfig>>,
    #[serde(rename = "table-figure")]
    table_figure: Option<Arc<WorkflowStepConfig>>,
    json: Option<Arc<WorkflowStepConfig>>,
}

impl WorkflowStep {
    pub fn binding(&self, unit: ContentUnit) -> Option<&WorkflowStepConfig> {
        let slot = match unit {
            ContentUnit::Figure => &self.figure,
            ContentUnit::Paragraph => &self.paragraph,
            ContentUnit::TableFigure => &self.table_figure,
            ContentUnit::Json => &self.json,
        };
        slot.as_deref()
    }

    fn bind(&mut self, unit: ContentUnit, step: Arc<WorkflowStepConfig>) {
        match unit {
            ContentUnit::Figure => self.figure = Some(step),
            ContentUnit::Paragraph => self.paragraph = Some(step),
            ContentUnit::TableFigure => self.table_figure = Some(step),
            ContentUnit::Json => self.json = Some(step),
        }
    }
}

/// Every stage the runner knows about. Only chunk instructions are configured; the
/// summary, key and section stages are declared as not configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowSteps {
    chunk_instruct: Option<WorkflowStep>,
    chunk_summary: Option<WorkflowStep>,
    doc_keys: Option<WorkflowStep>,
    doc_summary: Option<WorkflowStep>,
    sect_instruct: Option<WorkflowStep>,
    sect_summary: Option<WorkflowStep>,
}

impl WorkflowSteps {
    pub fn chunk_instruct(&self) -> Option<&WorkflowStep> {
        self.chunk_instruct.as_ref()
    }

    /// Names of the stages left unconfigured.
    pub fn unconfigured_stages(&self) -> Vec<&'static str> {
        [
            ("chunk-instruct", self.chunk_instruct.is_none()),
            ("chunk-summary", self.chunk_summary.is_none()),
            ("doc-keys", self.doc_keys.is_none()),
            ("doc-summary", self.doc_summary.is_none()),
            ("sect-instruct", self.sect_instruct.is_none()),
            ("sect-summary", self.sect_summary.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, missing)| missing.then_some(name))
        .collect()
    }
}

/// Complete configuration submitted to the job runner. Built fresh for every create or
/// update and never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    name: String,
    chunk_strategy: ChunkStrategy,
    steps: WorkflowSteps,
    extract: Value,
}

impl WorkflowDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_strategy(&self) -> ChunkStrategy {
        self.chunk_strategy
    }

    pub fn steps(&self) -> &WorkflowSteps {
        &self.steps
    }

    pub fn extract(&self) -> &Value {
        &self.extract
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub workflow_id: String,
    pub name: String,
}

/// External service that runs the declared pipeline. Both calls replace the remote
/// workflow wholesale, so repeating one with the same definition is harmless.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn create(&self, definition: &WorkflowDefinition) -> Result<WorkflowHandle>;

    async fn update(
        &self,
        handle: &WorkflowHandle,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowHandle>;
}

#[async_trait]
impl<R: JobRunner + ?Sized> JobRunner for Arc<R> {
    async fn create(&self, definition: &WorkflowDefinition) -> Result<WorkflowHandle> {
        (**self).create(definition).await
    }

    async fn update(
        &self,
        handle: &WorkflowHandle,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowHandle> {
        (**self).update(handle, definition).await
    }
}

/// Builds the definition for one document type. Non-extractable unit kinds are left
/// unbound even when requested.
pub fn build_workflow_definition(
    catalog: &FieldCatalog,
    document_type: &str,
    bindings: &[ContentUnit],
    config: &PipelineConfig,
) -> Result<WorkflowDefinition> {
    let prompts = render_extraction_prompt(
        &catalog.render_field_prompts(document_type)?,
        &catalog.render_field_descriptions(document_type)?,
    );
    let step = Arc::new(WorkflowStepConfig::extraction(
        prompts,
        config.include_page_images,
    ));

    let mut chunk_instruct = WorkflowStep::default();
    for unit in bindings {
        if unit.is_extractable() {
            chunk_instruct.bind(*unit, Arc::clone(&step));
        } else {
            warn!(
                "Content unit '{}' is not extractable; leaving it unbound for '{}'",
                unit, document_type
            );
        }
    }

    let definition = WorkflowDefinition {
        name: config.workflow_name.clone(),
        chunk_strategy: config.chunk_strategy,
        steps: WorkflowSteps {
            chunk_instruct: Some(chunk_instruct),
            chunk_summary: None,
            doc_keys: None,
            doc_summary: None,
            sect_instruct: None,
            sect_summary: None,
        },
        extract: catalog.extract_config(document_type)?,
    };

    debug!(
        "Built workflow '{}' for '{}': request prompt {} chars, task prompt {} chars",
        definition.name,
        document_type,
        step.prompt().request.prompt.len(),
        step.prompt().task.prompt.len()
    );
    Ok(definition)
}

pub struct WorkflowAssembler<R: JobRunner> {
    catalog: Arc<FieldCatalog>,
    config: PipelineConfig,
    runner: R,
}

impl<R: JobRunner> WorkflowAssembler<R> {
    /// Fails with `NotInitialized` when the catalog has no fields for the configured
    /// document type.
    pub fn new(catalog: Arc<FieldCatalog>, config: PipelineConfig, runner: R) -> Result<Self> {
        if !catalog.contains(&config.document_type) {
            return Err(PipelineError::NotInitialized {
                workflow: config.workflow_name.clone(),
                document_type: config.document_type.clone(),
            });
        }

        Ok(Self {
            catalog,
            config,
            runner,
        })
    }

    pub fn document_type(&self) -> &str {
        &self.config.document_type
    }

    pub fn build_definition(&self, bindings: &[ContentUnit]) -> Result<WorkflowDefinition> {
        build_workflow_definition(
            &self.catalog,
            &self.config.document_type,
            bindings,
            &self.config,
        )
    }

    /// Definition with the extraction step bound to figures, paragraphs and tables.
    pub fn default_definition(&self) -> Result<WorkflowDefinition> {
        self.build_definition(&ContentUnit::EXTRACTABLE)
    }

    pub async fn submit_create(&self, definition: &WorkflowDefinition) -> Result<WorkflowHandle> {
        info!(
            "Creating workflow '{}' for document type '{}'",
            definition.name(),
            self.config.document_type
        );
        let handle = self.runner.create(definition).await?;
        info!("Workflow '{}' created as {}", handle.name, handle.workflow_id);
        Ok(handle)
    }

    pub async fn submit_update(
        &self,
        handle: &WorkflowHandle,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowHandle> {
        info!(
            "Replacing workflow {} with '{}' for document type '{}'",
            handle.workflow_id,
            definition.name(),
            self.config.document_type
        );
        self.runner.update(handle, definition).await
    }

    /// Regenerates the default definition and creates the workflow, or replaces it when
    /// a handle already exists.
    pub async fn sync(&self, existing: Option<&WorkflowHandle>) -> Result<WorkflowHandle> {
        let definition = self.default_definition()?;
        match existing {
            Some(handle) => self.submit_update(handle, &definition).await,
            None => self.submit_create(&definition).await,
        }
    }
}
