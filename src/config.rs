use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::FieldCatalog;
use crate::error::{PipelineError, Result};
use crate::workflow::ChunkStrategy;

pub const ENV_WORKFLOW_NAME: &str = "PIPELINE_WORKFLOW_NAME";
pub const ENV_DOCUMENT_TYPE: &str = "PIPELINE_DOCUMENT_TYPE";
pub const ENV_CATALOG_PATH: &str = "PIPELINE_CATALOG_PATH";
pub const ENV_MAX_CONCURRENT_UNITS: &str = "PIPELINE_MAX_CONCURRENT_UNITS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workflow_name: String,
    pub chunk_strategy: ChunkStrategy,
    pub document_type: String,
    /// Falls back to the embedded invoice catalog when unset.
    pub catalog_path: Option<PathBuf>,
    pub max_concurrent_units: usize,
    pub include_page_images: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow_name: "account default".to_string(),
            chunk_strategy: ChunkStrategy::Element,
            document_type: "invoice".to_string(),
            catalog_path: None,
            max_concurrent_units: 8,
            include_page_images: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&source)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the `PIPELINE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var(ENV_WORKFLOW_NAME) {
            config.workflow_name = name;
        }
        if let Ok(document_type) = std::env::var(ENV_DOCUMENT_TYPE) {
            config.document_type = document_type;
        }
        if let Ok(path) = std::env::var(ENV_CATALOG_PATH) {
            config.catalog_path = Some(PathBuf::from(path));
        }
        if let Ok(raw) = std::env::var(ENV_MAX_CONCURRENT_UNITS) {
            config.max_concurrent_units = raw.trim().parse().map_err(|_| {
                PipelineError::Config(format!(
                    "{} must be a positive integer, got '{}'",
                    ENV_MAX_CONCURRENT_UNITS, raw
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_units == 0 {
            return Err(PipelineError::Config(
                "max_concurrent_units must be at least 1".to_string(),
            ));
        }
        if self.document_type.trim().is_empty() {
            return Err(PipelineError::Config(
                "document_type must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load_catalog(&self) -> Result<Arc<FieldCatalog>> {
        let catalog = match &self.catalog_path {
            Some(path) => FieldCatalog::from_path(path)?,
            None => {
                info!("No catalog path configured, using the embedded invoice catalog");
                FieldCatalog::embedded()?
            }
        };
        Ok(Arc::new(catalog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_workflow_identity() {
        let config = PipelineConfig::default();
        assert_eq!(config.workflow_name, "account default");
        assert_eq!(config.chunk_strategy, ChunkStrategy::Element);
        assert!(config.include_page_images);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "document_type: receipt\nmax_concurrent_units: 2\n").unwrap();

        let config = PipelineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.document_type, "receipt");
        assert_eq!(config.max_concurrent_units, 2);
        assert_eq!(config.workflow_name, "account default");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "max_concurrent_units: 0\n").unwrap();

        assert!(matches!(
            PipelineConfig::from_yaml_file(&path),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_embedded_catalog_is_the_fallback() {
        let catalog = PipelineConfig::default().load_catalog().unwrap();
        assert!(catalog.contains("invoice"));
    }
}
