use async_trait::async_trait;
use invoice_extraction_pipeline::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Agent that answers extraction calls by excerpt text and the later stages with fixed
/// replies. Every request is recorded.
#[derive(Default)]
struct ScriptedAgent {
    extraction: HashMap<String, std::result::Result<String, String>>,
    qa_reply: Option<String>,
    reconciliation_reply: Option<String>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    fn extracts(mut self, excerpt: &str, reply: &str) -> Self {
        self.extraction
            .insert(excerpt.to_string(), Ok(reply.to_string()));
        self
    }

    fn fails_on(mut self, excerpt: &str, reason: &str) -> Self {
        self.extraction
            .insert(excerpt.to_string(), Err(reason.to_string()));
        self
    }

    fn qa(mut self, reply: &str) -> Self {
        self.qa_reply = Some(reply.to_string());
        self
    }

    fn reconciles(mut self, reply: &str) -> Self {
        self.reconciliation_reply = Some(reply.to_string());
        self
    }

    fn requests_for(&self, stage: AgentStage) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReasoningAgent for ScriptedAgent {
    async fn respond(&self, request: &AgentRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());

        let scripted = match request.stage {
            AgentStage::Extraction => {
                let excerpt = request.context.excerpt_text.clone().unwrap_or_default();
                self.extraction
                    .get(&excerpt)
                    .cloned()
                    .unwrap_or_else(|| Ok("{}".to_string()))
            }
            AgentStage::Qa => Ok(self.qa_reply.clone().unwrap_or_else(|| "{}".to_string())),
            AgentStage::Reconciliation => Ok(self
                .reconciliation_reply
                .clone()
                .unwrap_or_else(|| "{}".to_string())),
        };

        scripted.map_err(|reason| PipelineError::Runner {
            workflow: "agent".to_string(),
            details: reason,
        })
    }
}

#[derive(Default)]
struct InMemoryRunner {
    workflows: Mutex<HashMap<String, Value>>,
    next_id: Mutex<u32>,
}

#[async_trait]
impl JobRunner for InMemoryRunner {
    async fn create(&self, definition: &WorkflowDefinition) -> Result<WorkflowHandle> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let workflow_id = format!("wf-{}", *next_id);
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow_id.clone(), serde_json::to_value(definition)?);
        Ok(WorkflowHandle {
            workflow_id,
            name: definition.name().to_string(),
        })
    }

    async fn update(
        &self,
        handle: &WorkflowHandle,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowHandle> {
        let mut workflows = self.workflows.lock().unwrap();
        if !workflows.contains_key(&handle.workflow_id) {
            return Err(PipelineError::Runner {
                workflow: handle.workflow_id.clone(),
                details: "no such workflow".to_string(),
            });
        }
        workflows.insert(handle.workflow_id.clone(), serde_json::to_value(definition)?);
        Ok(handle.clone())
    }
}

fn unit(id: &str, kind: ContentUnit, excerpt: &str) -> ContentUnitInput {
    ContentUnitInput {
        unit_id: id.to_string(),
        kind,
        context: ExtractionContext::from_text(excerpt),
    }
}

fn invoice(id: &str, units: Vec<ContentUnitInput>) -> DocumentInput {
    DocumentInput {
        document_id: id.to_string(),
        units,
        page_images: vec![
            ImageRef::url(format!("https://files.example.com/{}/page-1.png", id)),
            ImageRef::url(format!("https://files.example.com/{}/page-2.png", id)),
        ],
    }
}

fn pipeline(agent: Arc<ScriptedAgent>) -> DocumentPipeline<Arc<ScriptedAgent>> {
    let config = PipelineConfig::default();
    let catalog = config.load_catalog().unwrap();
    DocumentPipeline::new(catalog, &config, agent).unwrap()
}

fn expected(value: Value) -> ExtractedRecord {
    let Value::Object(map) = value else {
        panic!("expected object");
    };
    ExtractedRecord::from_json_object(map).0
}

#[tokio::test]
async fn test_conflicting_amounts_are_reconciled() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("NOW DUE 897.25", r#"{"amount_due": "897.25"}"#)
            .extracts("TOTAL 904.10", r#"{"amount_due": "904.10"}"#)
            .qa("{}")
            .reconciles(r#"{"amount_due": "897.25"}"#),
    );
    let document = invoice(
        "inv-1",
        vec![
            unit("u1", ContentUnit::Paragraph, "NOW DUE 897.25"),
            unit("u2", ContentUnit::TableFigure, "TOTAL 904.10"),
        ],
    );

    let finalized = pipeline(Arc::clone(&agent))
        .run(&document, None)
        .await
        .unwrap();

    assert_eq!(finalized.record(), &expected(json!({ "amount_due": "897.25" })));
    assert_eq!(finalized.state(), PipelineState::Reconciled);
    assert_eq!(
        finalized.conflicts().get("amount_due").unwrap(),
        &[json!("897.25"), json!("904.10")]
    );
    assert!(finalized.gaps().is_empty());
    assert!(finalized.unresolved().is_empty());

    let reconciliation = agent.requests_for(AgentStage::Reconciliation);
    assert_eq!(reconciliation.len(), 1);
    assert!(reconciliation[0]
        .request_prompt
        .contains("conflicting extracted values for 1 field(s)"));
    assert!(reconciliation[0]
        .request_prompt
        .contains("Conflicting Values:     [\"897.25\", \"904.10\"]"));
    assert_eq!(reconciliation[0].context.page_images.len(), 2);

    assert_eq!(agent.requests_for(AgentStage::Qa).len(), 1);
    assert_eq!(
        finalized.history(),
        &[
            PipelineState::Extracting,
            PipelineState::AwaitingQa,
            PipelineState::QaComplete,
            PipelineState::ConflictsDetected,
            PipelineState::Reconciling,
            PipelineState::Reconciled,
        ]
    );
}

#[tokio::test]
async fn test_agreeing_units_finalize_without_reconciliation() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("A", r#"{"amount_due": 1142.35, "due_date": "2024-07-20"}"#)
            .extracts("B", r#"{"amount_due": 1142.35, "provider_name": "VERIZON, INC."}"#)
            .qa(r#"{"amount_due": 1142.35, "due_date": "2024-07-20", "provider_name": "VERIZON, INC."}"#),
    );
    let document = invoice(
        "inv-2",
        vec![
            unit("u1", ContentUnit::Paragraph, "A"),
            unit("u2", ContentUnit::Figure, "B"),
        ],
    );

    let finalized = pipeline(Arc::clone(&agent))
        .run(&document, None)
        .await
        .unwrap();

    assert_eq!(finalized.state(), PipelineState::Finalized);
    assert!(finalized.conflicts().is_empty());
    assert!(!finalized.history().contains(&PipelineState::Reconciling));
    assert!(agent.requests_for(AgentStage::Reconciliation).is_empty());
    assert_eq!(finalized.record().len(), 3);

    let qa = agent.requests_for(AgentStage::Qa);
    assert_eq!(qa.len(), 1);
    for key in ["amount_due", "due_date", "provider_name"] {
        assert!(qa[0].request_prompt.contains(key));
    }
    assert!(qa[0]
        .request_prompt
        .contains("[\"amount_due\", \"due_date\", \"provider_name\"]"));
    assert!(qa[0].notes.is_empty());
}

#[tokio::test]
async fn test_empty_extraction_reply_is_an_empty_record() {
    let agent = Arc::new(ScriptedAgent::default().extracts("VERIZON", "{}"));
    let document = invoice("inv-3", vec![unit("u1", ContentUnit::Paragraph, "VERIZON")]);

    let finalized = pipeline(Arc::clone(&agent))
        .run(&document, None)
        .await
        .unwrap();

    assert!(finalized.record().is_empty());
    assert!(finalized.gaps().is_empty());
    assert_eq!(finalized.state(), PipelineState::Finalized);
}

#[tokio::test]
async fn test_failed_unit_is_recorded_as_gap_and_reported_to_qa() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("ACCOUNT # 44575679", r#"{"account_number": "44575679"}"#)
            .fails_on("BROKEN", "agent timed out")
            .extracts("GARBLED", "Sure! Here is what I found.")
            .qa(r#"{"account_number": "44575679", "amount_due": 1142.35}"#),
    );
    let document = invoice(
        "inv-4",
        vec![
            unit("u1", ContentUnit::Paragraph, "ACCOUNT # 44575679"),
            unit("u2", ContentUnit::TableFigure, "BROKEN"),
            unit("u3", ContentUnit::Figure, "GARBLED"),
        ],
    );

    let finalized = pipeline(Arc::clone(&agent))
        .run(&document, None)
        .await
        .unwrap();

    let gap_ids: Vec<&str> = finalized.gaps().iter().map(|g| g.unit_id.as_str()).collect();
    assert_eq!(gap_ids, vec!["u2", "u3"]);
    assert!(finalized.gaps()[0].reason.contains("agent timed out"));
    assert_eq!(finalized.gaps()[0].cause, GapCause::AgentFailed);

    let garbled = &finalized.gaps()[1];
    assert_eq!(garbled.cause, GapCause::MalformedReply);
    assert!(garbled.is_retryable());
    assert_eq!(finalized.state(), PipelineState::Finalized);
    assert_eq!(finalized.record().len(), 2);

    let qa = agent.requests_for(AgentStage::Qa);
    assert_eq!(qa[0].notes.len(), 1);
    assert!(qa[0].notes[0].contains("2 of 3 content unit(s)"));
    assert!(qa[0].notes[0].contains("- u2 (table-figure)"));
    assert!(qa[0].notes[0].contains("- u3 (figure)"));
}

#[tokio::test]
async fn test_malformed_qa_reply_surfaces() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("A", r#"{"amount_due": 95.0}"#)
            .qa("[\"amount_due\"]"),
    );
    let document = invoice("inv-5", vec![unit("u1", ContentUnit::Paragraph, "A")]);

    let err = pipeline(agent).run(&document, None).await.unwrap_err();
    match err {
        PipelineError::AgentResponseMalformed { document, stage, .. } => {
            assert_eq!(document, "inv-5");
            assert_eq!(stage, "qa");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_reconciliation_may_drop_a_field() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("A", r#"{"provider_name": "John Doe", "due_date": "2024-07-20"}"#)
            .extracts("B", r#"{"provider_name": "Jon Doe", "due_date": "2024-07-20"}"#)
            .qa(r#"{"provider_name": "John Doe", "due_date": "2024-07-20"}"#)
            .reconciles("```json\n{}\n```"),
    );
    let document = invoice(
        "inv-6",
        vec![
            unit("u1", ContentUnit::Paragraph, "A"),
            unit("u2", ContentUnit::Paragraph, "B"),
        ],
    );

    let finalized = pipeline(agent).run(&document, None).await.unwrap();

    assert_eq!(finalized.record(), &expected(json!({ "due_date": "2024-07-20" })));
    assert_eq!(
        finalized.unresolved(),
        &[UnresolvedField {
            key: "provider_name".to_string(),
            reason: UnresolvedReason::Dropped,
        }]
    );
    assert_eq!(finalized.state(), PipelineState::Reconciled);
}

#[tokio::test]
async fn test_non_scalar_resolution_is_unresolved_not_an_error() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("A", r#"{"amount_due": "1"}"#)
            .extracts("B", r#"{"amount_due": "2"}"#)
            .reconciles(r#"{"amount_due": ["1", "2"]}"#),
    );
    let document = invoice(
        "inv-7",
        vec![
            unit("u1", ContentUnit::Paragraph, "A"),
            unit("u2", ContentUnit::Paragraph, "B"),
        ],
    );

    let finalized = pipeline(agent).run(&document, None).await.unwrap();
    assert!(finalized.record().is_empty());
    assert_eq!(finalized.unresolved()[0].reason, UnresolvedReason::NonScalar);
}

#[tokio::test]
async fn test_without_page_images_qa_is_skipped() {
    let agent = Arc::new(ScriptedAgent::default().extracts("A", r#"{"invoice_number": "INV-88"}"#));
    let mut document = invoice("inv-8", vec![unit("u1", ContentUnit::Paragraph, "A")]);
    document.page_images.clear();

    let (tx, mut rx) = mpsc::channel(32);
    let finalized = pipeline(Arc::clone(&agent))
        .run(&document, Some(tx))
        .await
        .unwrap();

    assert_eq!(finalized.record(), &expected(json!({ "invoice_number": "INV-88" })));
    assert!(agent.requests_for(AgentStage::Qa).is_empty());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&PipelineEvent::QaSkipped {
        document_id: "inv-8".to_string()
    }));
}

#[tokio::test]
async fn test_document_without_any_context_fails() {
    let agent = Arc::new(ScriptedAgent::default());
    let mut document = invoice("inv-9", Vec::new());
    document.page_images.clear();

    assert!(matches!(
        pipeline(agent).run(&document, None).await,
        Err(PipelineError::MissingContext { .. })
    ));
}

#[tokio::test]
async fn test_documents_run_independently() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("A", r#"{"amount_due": 10}"#)
            .extracts("B", r#"{"amount_due": 20}"#),
    );
    let documents = vec![
        invoice("inv-10", vec![unit("u1", ContentUnit::Paragraph, "A")]),
        invoice("inv-11", vec![unit("u1", ContentUnit::Paragraph, "B")]),
    ];

    let (tx, mut rx) = mpsc::channel(64);
    let results = pipeline(agent).run_many(&documents, Some(tx)).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));

    let mut finalized_ids = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::Finalized { document_id, .. } = event {
            finalized_ids.push(document_id);
        }
    }
    finalized_ids.sort();
    assert_eq!(finalized_ids, vec!["inv-10", "inv-11"]);
}

#[tokio::test]
async fn test_undrained_progress_channel_does_not_stall_the_run() {
    let agent = Arc::new(
        ScriptedAgent::default()
            .extracts("A", r#"{"amount_due": 10}"#)
            .qa(r#"{"amount_due": 10}"#),
    );
    let document = invoice("inv-13", vec![unit("u1", ContentUnit::Paragraph, "A")]);

    let (tx, mut rx) = mpsc::channel(2);
    let finalized = tokio::time::timeout(
        Duration::from_secs(2),
        pipeline(agent).run(&document, Some(tx)),
    )
    .await
    .expect("run finished while the receiver sat idle")
    .unwrap();
    assert_eq!(finalized.state(), PipelineState::Finalized);

    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 2);
}

#[tokio::test]
async fn test_extraction_requests_carry_prompt_pair_and_page_images() {
    let agent = Arc::new(ScriptedAgent::default());
    let document = invoice("inv-12", vec![unit("u1", ContentUnit::Paragraph, "A")]);

    let pipeline = pipeline(Arc::clone(&agent));
    pipeline.run(&document, None).await.unwrap();

    let extraction = agent.requests_for(AgentStage::Extraction);
    assert_eq!(extraction.len(), 1);
    assert_eq!(extraction[0].request_prompt, pipeline.extraction_prompts().request);
    assert_eq!(
        extraction[0].task_prompt.as_deref(),
        Some(pipeline.extraction_prompts().task.as_str())
    );
    assert_eq!(extraction[0].context.page_images.len(), 2);
}

#[tokio::test]
async fn test_workflow_update_replaces_wholesale() {
    let runner = Arc::new(InMemoryRunner::default());
    let catalog = Arc::new(FieldCatalog::embedded().unwrap());
    let assembler =
        WorkflowAssembler::new(Arc::clone(&catalog), PipelineConfig::default(), Arc::clone(&runner))
            .unwrap();

    let narrow = assembler.build_definition(&[ContentUnit::Paragraph]).unwrap();
    let handle = assembler.submit_create(&narrow).await.unwrap();

    let full = assembler.default_definition().unwrap();
    assembler.submit_update(&handle, &full).await.unwrap();
    assembler.submit_update(&handle, &full).await.unwrap();

    let stored = runner.workflows.lock().unwrap()[&handle.workflow_id].clone();
    assert_eq!(stored, serde_json::to_value(&full).unwrap());
    assert!(stored["steps"]["chunk-instruct"]["figure"].is_object());
    assert_eq!(runner.workflows.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_workflow_update_of_unknown_handle_fails() {
    let assembler = WorkflowAssembler::new(
        Arc::new(FieldCatalog::embedded().unwrap()),
        PipelineConfig::default(),
        InMemoryRunner::default(),
    )
    .unwrap();

    let handle = WorkflowHandle {
        workflow_id: "wf-404".to_string(),
        name: "account default".to_string(),
    };
    let err = assembler.sync(Some(&handle)).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("wf-404"));
}
