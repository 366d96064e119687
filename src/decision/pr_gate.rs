//! Pluggable approval predicate for the `pr_approved_by_rag` message
//! type (§9 Open Question: "the approval criteria are not defined
//! in-source ... treat it as a pluggable predicate").

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PrVerdict {
    pub approved: bool,
    pub reasons: Vec<String>,
}

#[async_trait]
pub trait PrApprovalPredicate: Send + Sync {
    async fn evaluate(&self, pr_metadata: &Value) -> PrVerdict;
}

/// The specified default: deny until a real predicate is wired in.
pub struct DenyByDefaultPredicate;

#[async_trait]
impl PrApprovalPredicate for DenyByDefaultPredicate {
    async fn evaluate(&self, _pr_metadata: &Value) -> PrVerdict {
        PrVerdict {
            approved: false,
            reasons: vec!["no approval predicate configured, denying by default".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn default_predicate_denies_everything() {
        let predicate = DenyByDefaultPredicate;
        let verdict = predicate.evaluate(&json!({"pr": 42})).await;
        assert!(!verdict.approved);
    }
}
