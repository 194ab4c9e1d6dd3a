use chrono::{NaiveDate, Utc};
use ibkr_bridge_cache::ResponseCache;
use ibkr_bridge_core::*;
use ibkr_bridge_policy::AccessPolicy;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::tools::{self, ToolContext, ToolDefinition};

/// Where a tool call is in its pipeline; traced at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    PolicyChecked,
    CacheHit,
    CacheMiss,
    GatewayCalled,
    ResultMapped,
    Completed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::PolicyChecked => "policy_checked",
            Stage::CacheHit => "cache_hit",
            Stage::CacheMiss => "cache_miss",
            Stage::GatewayCalled => "gateway_called",
            Stage::ResultMapped => "result_mapped",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Routes tool calls through validation, policy, cache and gateway.
///
/// Policy runs before the cache so a denied request never sees cached data.
/// Only complete results with a non-zero TTL are stored.
pub struct ToolDispatcher {
    gateway: Arc<dyn Gateway>,
    policy: AccessPolicy,
    cache: Arc<ResponseCache>,
}

impl ToolDispatcher {
    pub fn new(gateway: Arc<dyn Gateway>, policy: AccessPolicy, cache: Arc<ResponseCache>) -> Self {
        Self {
            gateway,
            policy,
            cache,
        }
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        tools::definitions()
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Handle one tool call dated today (UTC).
    pub async fn dispatch(&self, name: &str, raw: Value) -> Result<ToolResult, ToolError> {
        self.dispatch_on(name, raw, Utc::now().date_naive()).await
    }

    /// Handle one tool call as if evaluated on `today`.
    pub async fn dispatch_on(
        &self,
        name: &str,
        raw: Value,
        today: NaiveDate,
    ) -> Result<ToolResult, ToolError> {
        debug!(tool = name, stage = %Stage::Received, "Tool call");
        let outcome = self.run(name, raw, today).await;
        match &outcome {
            Ok(_) => debug!(tool = name, stage = %Stage::Completed, "Tool call"),
            Err(e) => warn!(
                tool = name,
                stage = %Stage::Failed,
                kind = ?e.kind(),
                retryable = e.is_retryable(),
                "Tool call failed: {}",
                e
            ),
        }
        outcome
    }

    async fn run(&self, name: &str, raw: Value, today: NaiveDate) -> Result<ToolResult, ToolError> {
        let kind = ToolKind::from_name(name)
            .ok_or_else(|| ToolError::invalid(format!("Unknown tool: {}", name)))?;

        let mut request = tools::parse(kind, raw, today)?;
        if request.requires_account() {
            let account = self.policy.resolve_account(request.account())?;
            request = request.with_account(account);
        }

        self.policy.authorize(&request).into_result()?;
        debug!(tool = name, stage = %Stage::PolicyChecked, "Tool call");

        let ttl = self.cache.ttl_policy().ttl_for(&request, today);
        let key = request.fingerprint();
        if !ttl.is_zero() {
            if let Some(cached) = self.cache.get(&key).await {
                debug!(tool = name, stage = %Stage::CacheHit, fingerprint = %key, "Tool call");
                return Ok(cached);
            }
            debug!(tool = name, stage = %Stage::CacheMiss, fingerprint = %key, "Tool call");
        }

        let ctx = ToolContext {
            gateway: &self.gateway,
            policy: &self.policy,
            today,
        };
        debug!(tool = name, stage = %Stage::GatewayCalled, "Tool call");
        let output = tools::execute(&ctx, &request).await?;

        let result = ToolResult::new(kind, Utc::now(), output.payload);
        debug!(tool = name, stage = %Stage::ResultMapped, complete = output.complete, "Tool call");

        if output.complete && !ttl.is_zero() {
            self.cache.put(&key, &result, ttl).await;
        } else if !output.complete {
            info!(tool = name, "Partial result not cached");
        }
        Ok(result)
    }
}
