use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use crate::catalog::FieldCatalog;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::prompts::{
    render_coverage_note, render_extraction_prompt, render_qa_prompt,
    render_reconciliation_prompt, ExtractionPrompts,
};
use crate::schema::{ConflictSet, ContentUnit, ExtractedRecord, ExtractionContext, ImageRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Extracting,
    AwaitingQa,
    QaComplete,
    ConflictsDetected,
    Reconciling,
    Reconciled,
    NoConflicts,
    Finalized,
}

impl PipelineState {
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Extracting, AwaitingQa)
                | (AwaitingQa, QaComplete)
                | (QaComplete, ConflictsDetected)
                | (ConflictsDetected, Reconciling)
                | (Reconciling, Reconciled)
                | (QaComplete, NoConflicts)
                | (NoConflicts, Finalized)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Reconciled | PipelineState::Finalized)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

struct StateTracker {
    document_id: String,
    history: Vec<PipelineState>,
}

impl StateTracker {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            history: vec![PipelineState::Extracting],
        }
    }

    fn current(&self) -> PipelineState {
        // history always holds the initial state
        self.history[self.history.len() - 1]
    }

    fn advance(&mut self, next: PipelineState) -> Result<()> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition {
                document: self.document_id.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        debug!("[{}] {} -> {}", self.document_id, current, next);
        self.history.push(next);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStage {
    Extraction,
    Qa,
    Reconciliation,
}

impl fmt::Display for AgentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStage::Extraction => "extraction",
            AgentStage::Qa => "qa",
            AgentStage::Reconciliation => "reconciliation",
        };
        f.write_str(label)
    }
}

/// Everything the reasoning agent receives for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub stage: AgentStage,
    pub document_id: String,
    pub request_prompt: String,
    pub task_prompt: Option<String>,
    pub context: ExtractionContext,
    pub notes: Vec<String>,
}

/// Black-box agent that answers a rendered prompt with raw text, expected to be a
/// single JSON object.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    async fn respond(&self, request: &AgentRequest) -> Result<String>;
}

#[async_trait]
impl<A: ReasoningAgent + ?Sized> ReasoningAgent for Arc<A> {
    async fn respond(&self, request: &AgentRequest) -> Result<String> {
        (**self).respond(request).await
    }
}

fn clean_json_output(raw: &str) -> &str {
    if let Some(start) = raw.find('{') {
        if let Some(end) = raw.rfind('}') {
            if end > start {
                return &raw[start..=end];
            }
        }
    }
    raw.trim()
}

/// Parses an agent reply into a record. Code fences and surrounding chatter are
/// stripped first; anything that is still not a JSON object is `AgentResponseMalformed`.
/// Keys holding arrays or objects are returned separately as rejected.
pub fn parse_agent_reply(
    document_id: &str,
    stage: AgentStage,
    raw: &str,
) -> Result<(ExtractedRecord, Vec<String>)> {
    let malformed = |details: String| PipelineError::AgentResponseMalformed {
        document: document_id.to_string(),
        stage: stage.to_string(),
        details,
    };

    let value: Value = serde_json::from_str(clean_json_output(raw))
        .map_err(|e| malformed(format!("not valid JSON: {}", e)))?;

    match value {
        Value::Object(object) => Ok(ExtractedRecord::from_json_object(object)),
        other => Err(malformed(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnitInput {
    pub unit_id: String,
    pub kind: ContentUnit,
    pub context: ExtractionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    pub document_id: String,
    pub units: Vec<ContentUnitInput>,
    /// Images of every page. Context during extraction, source of truth for QA and
    /// reconciliation.
    #[serde(default)]
    pub page_images: Vec<ImageRef>,
}

/// Why a content unit produced no fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapCause {
    /// The unit had neither excerpt text nor images.
    MissingContext,
    /// The agent answered, but not with a JSON object.
    MalformedReply,
    /// The agent call itself failed.
    AgentFailed,
}

/// A content unit that never produced a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageGap {
    pub unit_id: String,
    pub kind: ContentUnit,
    pub cause: GapCause,
    /// Whether sending the same extraction request again may succeed.
    pub retryable: bool,
    pub reason: String,
}

impl CoverageGap {
    fn from_error(unit: &ContentUnitInput, error: &PipelineError) -> Self {
        let cause = match error {
            PipelineError::MissingContext { .. } => GapCause::MissingContext,
            PipelineError::AgentResponseMalformed { .. } => GapCause::MalformedReply,
            _ => GapCause::AgentFailed,
        };
        Self {
            unit_id: unit.unit_id.clone(),
            kind: unit.kind,
            cause,
            retryable: error.is_retryable(),
            reason: error.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn label(&self) -> String {
        format!("{} ({})", self.unit_id, self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub record: ExtractedRecord,
    pub conflicts: ConflictSet,
}

/// Unions the fragments of one document. Keys whose fragments disagree go to the
/// conflict set instead of being overwritten; candidates keep first-seen order.
pub fn merge_fragments(fragments: &[ExtractedRecord]) -> MergeOutcome {
    let mut candidates: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for fragment in fragments {
        for (key, value) in fragment.iter() {
            let values = candidates.entry(key.as_str()).or_default();
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
    }

    let mut outcome = MergeOutcome::default();
    for (key, mut values) in candidates {
        if values.len() == 1 {
            outcome.record.insert(key, values.remove(0));
        } else {
            outcome.conflicts.insert(key, values);
        }
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// The agent left the field out: none of the candidates was valid.
    Dropped,
    /// The agent answered with an array or object.
    NonScalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedField {
    pub key: String,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    Starting { document_id: String, units: usize },
    UnitExtracted { document_id: String, unit_id: String, fields: usize },
    UnitFailed {
        document_id: String,
        unit_id: String,
        cause: GapCause,
        reason: String,
    },
    Merged { document_id: String, fields: usize, conflicts: usize },
    QaStarted { document_id: String },
    QaSkipped { document_id: String },
    QaComplete { document_id: String, fields: usize },
    Reconciling { document_id: String, conflicts: usize },
    Reconciled { document_id: String, resolved: usize, unresolved: usize },
    Finalized { document_id: String, state: PipelineState, fields: usize },
}

/// Authoritative result for one document. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizedDocument {
    document_id: String,
    record: ExtractedRecord,
    conflicts: ConflictSet,
    gaps: Vec<CoverageGap>,
    unresolved: Vec<UnresolvedField>,
    history: Vec<PipelineState>,
}

impl FinalizedDocument {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn record(&self) -> &ExtractedRecord {
        &self.record
    }

    pub fn into_record(self) -> ExtractedRecord {
        self.record
    }

    /// Conflicts detected at merge time, before reconciliation.
    pub fn conflicts(&self) -> &ConflictSet {
        &self.conflicts
    }

    pub fn gaps(&self) -> &[CoverageGap] {
        &self.gaps
    }

    pub fn unresolved(&self) -> &[UnresolvedField] {
        &self.unresolved
    }

    pub fn state(&self) -> PipelineState {
        self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }
}

pub struct DocumentPipeline<A: ReasoningAgent> {
    agent: A,
    catalog: Arc<FieldCatalog>,
    document_type: String,
    extraction: ExtractionPrompts,
    field_block: String,
    max_concurrent_units: usize,
    include_page_images: bool,
}

impl<A: ReasoningAgent> DocumentPipeline<A> {
    pub fn new(catalog: Arc<FieldCatalog>, config: &PipelineConfig, agent: A) -> Result<Self> {
        let field_block = catalog.render_field_prompts(&config.document_type)?;
        let extraction = render_extraction_prompt(
            &field_block,
            &catalog.render_field_descriptions(&config.document_type)?,
        );

        Ok(Self {
            agent,
            catalog,
            document_type: config.document_type.clone(),
            extraction,
            field_block,
            max_concurrent_units: config.max_concurrent_units.max(1),
            include_page_images: config.include_page_images,
        })
    }

    pub fn extraction_prompts(&self) -> &ExtractionPrompts {
        &self.extraction
    }

    /// Runs independent documents concurrently; each result stands on its own.
    pub async fn run_many(
        &self,
        documents: &[DocumentInput],
        progress: Option<Sender<PipelineEvent>>,
    ) -> Vec<Result<FinalizedDocument>> {
        futures::future::join_all(
            documents
                .iter()
                .map(|document| self.run(document, progress.clone())),
        )
        .await
    }

    pub async fn run(
        &self,
        document: &DocumentInput,
        progress: Option<Sender<PipelineEvent>>,
    ) -> Result<FinalizedDocument> {
        let document_id = document.document_id.as_str();
        if document.units.is_empty() && document.page_images.is_empty() {
            return Err(PipelineError::MissingContext {
                document: document_id.to_string(),
            });
        }

        info!(
            "[{}] Extracting {} content unit(s) as '{}'",
            document_id,
            document.units.len(),
            self.document_type
        );
        send_event(
            &progress,
            PipelineEvent::Starting {
                document_id: document_id.to_string(),
                units: document.units.len(),
            },
        )
        .await;

        let mut tracker = StateTracker::new(document_id);

        let mut results: Vec<(usize, Result<ExtractedRecord>)> =
            stream::iter(document.units.iter().enumerate())
                .map(|(idx, unit)| async move { (idx, self.extract_unit(document, unit).await) })
                .buffer_unordered(self.max_concurrent_units)
                .collect()
                .await;
        results.sort_by_key(|(idx, _)| *idx);

        let mut fragments = Vec::with_capacity(results.len());
        let mut gaps = Vec::new();
        for (idx, result) in results {
            let unit = &document.units[idx];
            match result {
                Ok(fragment) => {
                    send_event(
                        &progress,
                        PipelineEvent::UnitExtracted {
                            document_id: document_id.to_string(),
                            unit_id: unit.unit_id.clone(),
                            fields: fragment.len(),
                        },
                    )
                    .await;
                    fragments.push(fragment);
                }
                Err(e) => {
                    warn!(
                        "[{}] Unit {} ({}) failed, continuing without it: {}",
                        document_id, unit.unit_id, unit.kind, e
                    );
                    let gap = CoverageGap::from_error(unit, &e);
                    send_event(
                        &progress,
                        PipelineEvent::UnitFailed {
                            document_id: document_id.to_string(),
                            unit_id: unit.unit_id.clone(),
                            cause: gap.cause,
                            reason: gap.reason.clone(),
                        },
                    )
                    .await;
                    gaps.push(gap);
                }
            }
        }
        tracker.advance(PipelineState::AwaitingQa)?;

        let merged = merge_fragments(&fragments);
        debug!(
            "[{}] Merged {} fragment(s): {} field(s), {} conflict(s)",
            document_id,
            fragments.len(),
            merged.record.len(),
            merged.conflicts.len()
        );
        send_event(
            &progress,
            PipelineEvent::Merged {
                document_id: document_id.to_string(),
                fields: merged.record.len(),
                conflicts: merged.conflicts.len(),
            },
        )
        .await;

        let reviewed = self
            .review(document, &merged.record, &gaps, &progress)
            .await?;
        tracker.advance(PipelineState::QaComplete)?;

        let (record, unresolved) = if merged.conflicts.is_empty() {
            tracker.advance(PipelineState::NoConflicts)?;
            tracker.advance(PipelineState::Finalized)?;
            (reviewed, Vec::new())
        } else {
            tracker.advance(PipelineState::ConflictsDetected)?;
            tracker.advance(PipelineState::Reconciling)?;
            send_event(
                &progress,
                PipelineEvent::Reconciling {
                    document_id: document_id.to_string(),
                    conflicts: merged.conflicts.len(),
                },
            )
            .await;

            let (record, unresolved) = self
                .reconcile(document, reviewed, &merged.conflicts)
                .await?;
            tracker.advance(PipelineState::Reconciled)?;
            send_event(
                &progress,
                PipelineEvent::Reconciled {
                    document_id: document_id.to_string(),
                    resolved: merged.conflicts.len() - unresolved.len(),
                    unresolved: unresolved.len(),
                },
            )
            .await;
            (record, unresolved)
        };

        self.warn_on_nonconforming(document_id, &record);

        let state = tracker.current();
        info!(
            "[{}] {} with {} field(s), {} gap(s)",
            document_id,
            state,
            record.len(),
            gaps.len()
        );
        send_event(
            &progress,
            PipelineEvent::Finalized {
                document_id: document_id.to_string(),
                state,
                fields: record.len(),
            },
        )
        .await;

        Ok(FinalizedDocument {
            document_id: document_id.to_string(),
            record,
            conflicts: merged.conflicts,
            gaps,
            unresolved,
            history: tracker.history,
        })
    }

    /// Any failure here, including a malformed reply, becomes a coverage gap.
    async fn extract_unit(
        &self,
        document: &DocumentInput,
        unit: &ContentUnitInput,
    ) -> Result<ExtractedRecord> {
        unit.context.validate(&document.document_id)?;

        let mut context = unit.context.clone();
        if self.include_page_images {
            for image in &document.page_images {
                if !context.page_images.contains(image) {
                    context.page_images.push(image.clone());
                }
            }
        }

        let request = AgentRequest {
            stage: AgentStage::Extraction,
            document_id: document.document_id.clone(),
            request_prompt: self.extraction.request.clone(),
            task_prompt: Some(self.extraction.task.clone()),
            context,
            notes: Vec::new(),
        };

        let raw = self.agent.respond(&request).await?;
        let (fragment, rejected) =
            parse_agent_reply(&document.document_id, AgentStage::Extraction, &raw)?;

        if !rejected.is_empty() {
            warn!(
                "[{}] Unit {} returned non-scalar values for {:?}; ignoring them",
                document.document_id, unit.unit_id, rejected
            );
        }
        Ok(fragment)
    }

    /// QA pass over the non-conflicting merged record, run once per document. Without
    /// page images there is nothing to check against and the record passes through.
    async fn review(
        &self,
        document: &DocumentInput,
        merged: &ExtractedRecord,
        gaps: &[CoverageGap],
        progress: &Option<Sender<PipelineEvent>>,
    ) -> Result<ExtractedRecord> {
        let document_id = document.document_id.as_str();
        if document.page_images.is_empty() {
            info!("[{}] No page images, skipping QA", document_id);
            send_event(
                progress,
                PipelineEvent::QaSkipped {
                    document_id: document_id.to_string(),
                },
            )
            .await;
            return Ok(merged.clone());
        }

        send_event(
            progress,
            PipelineEvent::QaStarted {
                document_id: document_id.to_string(),
            },
        )
        .await;

        let prompt = render_qa_prompt(&self.field_block, &merged.to_json_pretty()?, &merged.keys());
        let gap_labels: Vec<String> = gaps.iter().map(CoverageGap::label).collect();
        let notes = render_coverage_note(document.units.len(), &gap_labels)
            .into_iter()
            .collect();

        let request = AgentRequest {
            stage: AgentStage::Qa,
            document_id: document_id.to_string(),
            request_prompt: prompt,
            task_prompt: None,
            context: ExtractionContext {
                excerpt_text: None,
                page_images: document.page_images.clone(),
            },
            notes,
        };

        let raw = self.agent.respond(&request).await?;
        let (reviewed, rejected) = parse_agent_reply(document_id, AgentStage::Qa, &raw)?;
        if !rejected.is_empty() {
            warn!(
                "[{}] QA returned non-scalar values for {:?}; dropping them",
                document_id, rejected
            );
        }

        for key in merged.keys() {
            if !reviewed.contains_key(&key) {
                debug!("[{}] QA dropped '{}' as incorrectly extracted", document_id, key);
            }
        }

        send_event(
            progress,
            PipelineEvent::QaComplete {
                document_id: document_id.to_string(),
                fields: reviewed.len(),
            },
        )
        .await;
        Ok(reviewed)
    }

    /// One reconciliation call covering every conflicted key. The reply overrides QA for
    /// those keys; a key the agent leaves out or answers with a non-scalar is dropped.
    async fn reconcile(
        &self,
        document: &DocumentInput,
        mut record: ExtractedRecord,
        conflicts: &ConflictSet,
    ) -> Result<(ExtractedRecord, Vec<UnresolvedField>)> {
        let document_id = document.document_id.as_str();
        let block = self
            .catalog
            .render_conflict_descriptions(&self.document_type, conflicts)?;

        let request = AgentRequest {
            stage: AgentStage::Reconciliation,
            document_id: document_id.to_string(),
            request_prompt: render_reconciliation_prompt(conflicts.len(), &block),
            task_prompt: None,
            context: ExtractionContext {
                excerpt_text: None,
                page_images: document.page_images.clone(),
            },
            notes: Vec::new(),
        };

        let raw = self.agent.respond(&request).await?;
        let (resolved, rejected) =
            parse_agent_reply(document_id, AgentStage::Reconciliation, &raw)?;

        let mut unresolved = Vec::new();
        for key in conflicts.keys() {
            record.remove(&key);
            match resolved.get(&key) {
                Some(value) => {
                    record.insert(key, value.clone());
                }
                None => {
                    let reason = if rejected.contains(&key) {
                        UnresolvedReason::NonScalar
                    } else {
                        UnresolvedReason::Dropped
                    };
                    info!(
                        "[{}] Reconciliation left '{}' unresolved ({:?})",
                        document_id, key, reason
                    );
                    unresolved.push(UnresolvedField { key, reason });
                }
            }
        }

        for (key, _) in resolved.iter() {
            if !conflicts.contains_key(key) {
                debug!(
                    "[{}] Ignoring reconciled value for unconflicted key '{}'",
                    document_id, key
                );
            }
        }

        Ok((record, unresolved))
    }

    fn warn_on_nonconforming(&self, document_id: &str, record: &ExtractedRecord) {
        for (key, value) in record.iter() {
            if let Ok(Some(field)) = self.catalog.field(&self.document_type, key) {
                if !field.format.conforms(value) {
                    warn!(
                        "[{}] Value {} for '{}' does not look like {}",
                        document_id, value, key, field.format
                    );
                }
            }
        }
    }
}

/// Progress is best effort: a full or closed channel drops the event instead of stalling
/// the run.
async fn send_event(sender: &Option<Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = sender {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Progress channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
