use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{QuotaSentryError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuota {
    pub name: String,
    pub percentage: f64,
    pub reset_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub models: Vec<ModelQuota>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub email: String,
    pub quota: Option<QuotaSnapshot>,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn accounts(&self) -> Result<Vec<AccountInfo>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub display_name: String,
    pub model_constant: String,
    pub recommended: bool,
}

impl ModelSpec {
    // Reset-state keying survives display-id renames by preferring the
    // backend-stable constant.
    pub fn stable_key(&self) -> &str {
        if self.model_constant.trim().is_empty() {
            &self.id
        } else {
            &self.model_constant
        }
    }
}

pub trait ModelCatalog: Send + Sync {
    fn models(&self) -> Vec<ModelSpec>;
}

static DEFAULT_MODELS: Lazy<Vec<ModelSpec>> = Lazy::new(|| {
    vec![
        ModelSpec {
            id: "claude-sonnet-4".to_string(),
            display_name: "Claude Sonnet 4".to_string(),
            model_constant: "sonnet".to_string(),
            recommended: true,
        },
        ModelSpec {
            id: "claude-opus-4".to_string(),
            display_name: "Claude Opus 4".to_string(),
            model_constant: "opus".to_string(),
            recommended: false,
        },
        ModelSpec {
            id: "claude-haiku-3-5".to_string(),
            display_name: "Claude Haiku 3.5".to_string(),
            model_constant: "haiku".to_string(),
            recommended: false,
        },
    ]
});

#[derive(Debug, Clone, Default)]
pub struct StaticModelCatalog {
    models: Vec<ModelSpec>,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    pub fn builtin() -> Self {
        Self {
            models: DEFAULT_MODELS.clone(),
        }
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn models(&self) -> Vec<ModelSpec> {
        self.models.clone()
    }
}

// Reads the account list (with quota snapshots maintained by the external
// refresh subsystem) from a JSON file on every call, so observations stay as
// fresh as that file.
pub struct JsonFileAccountDirectory {
    path: String,
}

impl JsonFileAccountDirectory {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AccountDirectory for JsonFileAccountDirectory {
    async fn accounts(&self) -> Result<Vec<AccountInfo>> {
        let path = self.path.clone();
        let raw = tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
            .await
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?
            .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| QuotaSentryError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticAccountDirectory {
    accounts: Vec<AccountInfo>,
}

impl StaticAccountDirectory {
    pub fn new(accounts: Vec<AccountInfo>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn accounts(&self) -> Result<Vec<AccountInfo>> {
        Ok(self.accounts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_key_prefers_model_constant() {
        let spec = ModelSpec {
            id: "claude-sonnet-4".to_string(),
            display_name: "Claude Sonnet 4".to_string(),
            model_constant: "sonnet".to_string(),
            recommended: true,
        };
        assert_eq!(spec.stable_key(), "sonnet");

        let spec = ModelSpec {
            id: "claude-sonnet-4".to_string(),
            display_name: "Claude Sonnet 4".to_string(),
            model_constant: "  ".to_string(),
            recommended: true,
        };
        assert_eq!(spec.stable_key(), "claude-sonnet-4");
    }

    #[tokio::test]
    async fn json_directory_reads_snapshot_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            serde_json::json!([
                {
                    "id": "acc-1",
                    "email": "dev@example.com",
                    "quota": {"models": [{"name": "sonnet", "percentage": 100.0, "reset_time": "2026-03-01T10:00:00Z"}]}
                }
            ])
            .to_string(),
        )
        .unwrap();

        let directory = JsonFileAccountDirectory::new(path.to_string_lossy().to_string());
        let accounts = directory.accounts().await.expect("accounts");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "acc-1");
        let quota = accounts[0].quota.as_ref().expect("quota");
        assert_eq!(quota.models[0].percentage, 100.0);
    }
}
