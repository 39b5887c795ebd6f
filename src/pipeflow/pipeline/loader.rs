// SPDX-License-Identifier: MIT

//! Pipeline loader - reads definitions from YAML or JSON files

use super::types::PipelineDefinition;
use crate::adk::error::Result;
use std::fs;
use std::path::Path;

/// Loads pipeline definitions from disk
pub struct PipelineLoader;

impl PipelineLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a definition; `.json` files are read as JSON, anything else as YAML
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<PipelineDefinition> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::parse_json(&content)
        } else {
            Self::parse_yaml(&content)
        }
    }

    pub fn parse_yaml(content: &str) -> Result<PipelineDefinition> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn parse_json(content: &str) -> Result<PipelineDefinition> {
        Ok(serde_json::from_str(content)?)
    }
}

impl Default for PipelineLoader {
    fn default() -> Self {
        Self::new()
    }
}
