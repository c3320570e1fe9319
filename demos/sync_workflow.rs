use dotenv::dotenv;
use invoice_extraction_pipeline::remote::{HttpJobRunner, RemoteRunnerConfig};
use invoice_extraction_pipeline::{PipelineConfig, WorkflowAssembler, WorkflowHandle};

/// Creates the extraction workflow, or replaces it when `WORKFLOW_ID` is set.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = PipelineConfig::from_env()?;
    let catalog = config.load_catalog()?;
    println!(
        "📋 Field catalog {} loaded, document type '{}'",
        catalog.version, config.document_type
    );

    let runner = HttpJobRunner::new(RemoteRunnerConfig::from_env()?)?;
    let assembler = WorkflowAssembler::new(catalog, config.clone(), runner)?;

    let existing = std::env::var("WORKFLOW_ID").ok().map(|workflow_id| WorkflowHandle {
        workflow_id,
        name: config.workflow_name.clone(),
    });

    let definition = assembler.default_definition()?;
    println!(
        "🧩 Unconfigured stages: {}",
        definition.steps().unconfigured_stages().join(", ")
    );

    let handle = assembler.sync(existing.as_ref()).await?;
    println!("✅ Workflow '{}' is {}", handle.name, handle.workflow_id);

    Ok(())
}
