//! Health and readiness check types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Check passed, or the hosted app registered no check at all.
    Healthy,
    /// Check failed (returned unhealthy, raised, or timed out).
    Unhealthy,
}

/// Result of a health or readiness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    pub fn healthy() -> Self {
        Self {
            status: CheckStatus::Healthy,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == CheckStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_has_no_detail() {
        let result = CheckResult::healthy();
        assert!(result.is_healthy());
        assert!(result.detail.is_none());
    }

    #[test]
    fn check_result_serializes_snake_case() {
        insta::assert_json_snapshot!(CheckResult::unhealthy("db unreachable"), @r###"
        {
          "status": "unhealthy",
          "detail": "db unreachable"
        }
        "###);
    }

    #[test]
    fn check_result_deserializes() {
        let parsed: CheckResult = serde_json::from_str(r#"{"status":"healthy"}"#).unwrap();
        assert!(parsed.is_healthy());
    }
}
