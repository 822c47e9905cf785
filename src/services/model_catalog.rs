use crate::config::ModelEntry;
use crate::error::{AppError, AppResult};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelObject>,
}

/// Client-visible model names and the upstream ids behind them.
pub struct ModelCatalog {
    models: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelEntry>) -> Self {
        let models = models
            .into_iter()
            .filter(|m| !m.public_name.trim().is_empty() && !m.id.trim().is_empty())
            .collect();
        Self { models }
    }

    /// Upstream id for a public model name. Matching ignores case.
    pub fn resolve(&self, public_name: &str) -> AppResult<&ModelEntry> {
        self.models
            .iter()
            .find(|m| m.public_name.eq_ignore_ascii_case(public_name))
            .ok_or_else(|| AppError::NotFound(format!("model `{}` does not exist", public_name)))
    }

    pub fn list(&self, created: u64) -> ModelList {
        ModelList {
            object: "list".to_string(),
            data: self
                .models
                .iter()
                .map(|m| ModelObject {
                    id: m.public_name.clone(),
                    object: "model".to_string(),
                    created,
                    owned_by: m.organization.clone().unwrap_or_else(|| "lmarena".to_string()),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
