use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown document type '{document_type}': no fields are registered for it")]
    UnknownDocumentType { document_type: String },

    #[error("[{workflow}] [{document_type}] is not initialized: field catalog has not been loaded")]
    NotInitialized {
        workflow: String,
        document_type: String,
    },

    #[error("Malformed {stage} reply for document '{document}': {details}")]
    AgentResponseMalformed {
        document: String,
        stage: String,
        details: String,
    },

    #[error("Document '{document}' has neither excerpt text nor page images")]
    MissingContext { document: String },

    #[error("Invalid field catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Illegal pipeline transition for document '{document}': {from} -> {to}")]
    InvalidTransition {
        document: String,
        from: String,
        to: String,
    },

    #[error("Job runner error for workflow '{workflow}': {details}")]
    Runner { workflow: String, details: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "remote")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    /// Whether retrying the same call can succeed. Rendering is pure, so a malformed
    /// agent reply can always be retried with identical input.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::AgentResponseMalformed { .. } | PipelineError::Runner { .. } => true,
            #[cfg(feature = "remote")]
            PipelineError::Http(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
