use ibkr_bridge_core::*;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DenialReason {
    ReadOnlyViolation { tool: ToolKind },
    AccountNotAuthorized { account: String },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::ReadOnlyViolation { tool } => {
                write!(f, "{} modifies account state and the bridge is read-only", tool)
            }
            DenialReason::AccountNotAuthorized { account } => {
                write!(f, "Account {} is not in the authorized accounts list", account)
            }
        }
    }
}

impl From<DenialReason> for ToolError {
    fn from(reason: DenialReason) -> Self {
        let message = reason.to_string();
        match reason {
            DenialReason::ReadOnlyViolation { .. } => ToolError::ReadOnlyViolation(message),
            DenialReason::AccountNotAuthorized { .. } => ToolError::AccountNotAuthorized(message),
        }
    }
}

/// Outcome of a policy check. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(DenialReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }

    /// Convert into a `Result` for `?` chaining.
    pub fn into_result(self) -> Result<(), ToolError> {
        match self {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied(reason) => Err(reason.into()),
        }
    }
}

/// Read-only mode plus account whitelist, checked before any gateway traffic.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    readonly: bool,
    /// Empty means no restriction.
    authorized_accounts: Vec<String>,
}

impl AccessPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            readonly: config.readonly,
            authorized_accounts: config.authorized_accounts.clone(),
        }
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn authorized_accounts(&self) -> &[String] {
        &self.authorized_accounts
    }

    fn check_access_mode(&self, request: &ToolRequest) -> Option<DenialReason> {
        if self.readonly && request.kind().access_mode() == AccessMode::Write {
            return Some(DenialReason::ReadOnlyViolation {
                tool: request.kind(),
            });
        }
        None
    }

    fn check_account(&self, request: &ToolRequest) -> Option<DenialReason> {
        let account = request.account()?;
        if self.is_account_visible(account) {
            None
        } else {
            Some(DenialReason::AccountNotAuthorized {
                account: account.to_string(),
            })
        }
    }

    /// Evaluate a normalized request. Pure; no I/O.
    pub fn authorize(&self, request: &ToolRequest) -> AccessDecision {
        if let Some(reason) = self
            .check_access_mode(request)
            .or_else(|| self.check_account(request))
        {
            warn!(tool = %request.kind(), "Request denied: {}", reason);
            return AccessDecision::Denied(reason);
        }
        debug!(tool = %request.kind(), "Request allowed");
        AccessDecision::Allowed
    }

    /// Whether the whitelist admits this account.
    pub fn is_account_visible(&self, account: &str) -> bool {
        self.authorized_accounts.is_empty()
            || self.authorized_accounts.iter().any(|a| a == account)
    }

    /// Pick the account for a request that needs one.
    ///
    /// An explicit account is returned as-is (`authorize` still checks it).
    /// Without one, a single whitelisted account is used; an empty whitelist
    /// leaves the choice to the gateway; several whitelisted accounts are
    /// ambiguous.
    pub fn resolve_account(&self, requested: Option<&str>) -> Result<Option<String>, ToolError> {
        if let Some(account) = requested {
            return Ok(Some(account.to_string()));
        }
        match self.authorized_accounts.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            many => Err(ToolError::invalid(format!(
                "Multiple accounts authorized ({}); specify account_id",
                many.join(", ")
            ))),
        }
    }

    /// Drop positions held in accounts outside the whitelist.
    pub fn visible_positions(&self, positions: Vec<Position>) -> Vec<Position> {
        positions
            .into_iter()
            .filter(|p| self.is_account_visible(&p.account))
            .collect()
    }
}
