use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub account_id: String,
    pub model_id: String,
    pub prompt: Option<String>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReply {
    pub reply: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub trace_id: Option<String>,
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait WakeupProbe: Send + Sync {
    async fn trigger_wakeup(&self, request: ProbeRequest) -> Result<ProbeReply>;
}

// Stand-in transport for running the daemon without a wired-up provider:
// accepts every probe and reports a synthetic reply.
#[derive(Debug, Clone, Default)]
pub struct DryRunProbe;

#[async_trait]
impl WakeupProbe for DryRunProbe {
    async fn trigger_wakeup(&self, request: ProbeRequest) -> Result<ProbeReply> {
        tracing::debug!(
            account_id = %request.account_id,
            model_id = %request.model_id,
            "dry-run wakeup probe"
        );
        Ok(ProbeReply {
            reply: format!("dry-run: {} via {}", request.account_id, request.model_id),
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            trace_id: None,
            duration_ms: Some(0),
        })
    }
}
