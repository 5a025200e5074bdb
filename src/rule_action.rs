//! Rule actions returned by the identification service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A header name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

impl HeaderPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Header changes applied to an allowed request before it reaches the origin.
///
/// Applied as `remove`, then `set`, then `append`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderModifications {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<HeaderPair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append: Vec<HeaderPair>,
}

/// Status code of a block response, always within `200..=599`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct BlockStatus(u16);

impl BlockStatus {
    pub const FORBIDDEN: BlockStatus = BlockStatus(403);

    pub fn new(code: u16) -> Result<Self, InvalidBlockStatus> {
        if (200..=599).contains(&code) {
            Ok(Self(code))
        } else {
            Err(InvalidBlockStatus(code))
        }
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for BlockStatus {
    type Error = InvalidBlockStatus;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::new(code)
    }
}

impl From<BlockStatus> for u16 {
    fn from(status: BlockStatus) -> Self {
        status.0
    }
}

/// A block status outside `200..=599`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("block status code {0} is outside 200..=599")]
pub struct InvalidBlockStatus(pub u16);

/// Allow-with-mutation or block decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Allow {
        ruleset_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_expression: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_header_modifications: Option<HeaderModifications>,
    },
    Block {
        ruleset_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_expression: Option<String>,
        status_code: BlockStatus,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<HeaderPair>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

impl RuleAction {
    /// Plain allow with no header changes.
    pub fn allow(ruleset_id: impl Into<String>) -> Self {
        RuleAction::Allow {
            ruleset_id: ruleset_id.into(),
            rule_id: None,
            rule_expression: None,
            request_header_modifications: None,
        }
    }

    /// Block with the given status and no headers or body.
    pub fn block(ruleset_id: impl Into<String>, status_code: BlockStatus) -> Self {
        RuleAction::Block {
            ruleset_id: ruleset_id.into(),
            rule_id: None,
            rule_expression: None,
            status_code,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ruleset_id(&self) -> &str {
        match self {
            RuleAction::Allow { ruleset_id, .. } | RuleAction::Block { ruleset_id, .. } => {
                ruleset_id
            }
        }
    }

    pub fn rule_id(&self) -> Option<&str> {
        match self {
            RuleAction::Allow { rule_id, .. } | RuleAction::Block { rule_id, .. } => {
                rule_id.as_deref()
            }
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, RuleAction::Block { .. })
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::Allow { .. } => "allow",
            RuleAction::Block { .. } => "block",
        }
    }
}

impl Default for RuleAction {
    /// Block with 403, used as the fallback when nothing else is configured.
    fn default() -> Self {
        RuleAction::block("fallback", BlockStatus::FORBIDDEN)
    }
}
