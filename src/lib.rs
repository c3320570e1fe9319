//! # Invoice Extraction Pipeline
//!
//! Prompt construction and workflow assembly for a three-stage, LLM-assisted field
//! extraction pipeline over invoice-like documents.
//!
//! ## Core Concepts
//!
//! - **Field Catalog**: per document type, the ordered fields to extract with descriptions,
//!   formats and the labels that usually identify them on the page
//! - **Extraction**: every content unit (figure, paragraph, table) of a document is sent to a
//!   reasoning agent with the same request/task prompt pair and returns a JSON fragment
//! - **QA**: the merged record is reviewed once against the page images, which are the
//!   source of truth at this stage
//! - **Reconciliation**: keys on which units disagreed are resolved together in one call;
//!   the agent picks one candidate per field or drops the field
//! - **Workflow**: the declarative step configuration submitted wholesale to the external
//!   job runner on every create or update
//!
//! ## Example
//!
//! ```rust,ignore
//! use invoice_extraction_pipeline::*;
//!
//! let config = PipelineConfig::default();
//! let catalog = config.load_catalog()?;
//!
//! let prompts = extraction_prompts(&catalog, "invoice")?;
//! assert!(prompts.request.contains("amount_due"));
//!
//! let pipeline = DocumentPipeline::new(catalog, &config, my_agent)?;
//! let finalized = pipeline.run(&document, None).await?;
//! println!("{}", finalized.record().to_json_pretty()?);
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod workflow;

#[cfg(feature = "remote")]
pub mod remote;

pub use catalog::{DocumentTypeDefinition, FieldCatalog};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{
    merge_fragments, parse_agent_reply, AgentRequest, AgentStage, ContentUnitInput,
    CoverageGap, DocumentInput, DocumentPipeline, FinalizedDocument, GapCause, MergeOutcome,
    PipelineEvent, PipelineState, ReasoningAgent, UnresolvedField, UnresolvedReason,
};
pub use prompts::{
    render_coverage_note, render_extraction_prompt, render_qa_prompt,
    render_reconciliation_prompt, ExtractionPrompts,
};
pub use schema::*;
pub use workflow::{
    build_workflow_definition, ChunkStrategy, JobRunner, PromptRole, StepIncludes,
    WorkflowAssembler, WorkflowDefinition, WorkflowHandle, WorkflowPrompt,
    WorkflowPromptGroup, WorkflowStep, WorkflowStepConfig, WorkflowSteps,
};

/// Extraction prompt pair for a document type.
pub fn extraction_prompts(catalog: &FieldCatalog, document_type: &str) -> Result<ExtractionPrompts> {
    Ok(render_extraction_prompt(
        &catalog.render_field_prompts(document_type)?,
        &catalog.render_field_descriptions(document_type)?,
    ))
}

/// QA prompt for an extracted record; every key of the record is listed as one to keep.
pub fn qa_prompt(
    catalog: &FieldCatalog,
    document_type: &str,
    record: &ExtractedRecord,
) -> Result<String> {
    Ok(render_qa_prompt(
        &catalog.render_field_prompts(document_type)?,
        &record.to_json_pretty()?,
        &record.keys(),
    ))
}

/// Reconciliation prompt covering every key of the conflict set.
pub fn reconciliation_prompt(
    catalog: &FieldCatalog,
    document_type: &str,
    conflicts: &ConflictSet,
) -> Result<String> {
    Ok(render_reconciliation_prompt(
        conflicts.len(),
        &catalog.render_conflict_descriptions(document_type, conflicts)?,
    ))
}
