//! Key layout for the state store
//!
//! Keys are `kind:component:component...` strings. Components are escaped
//! so that test names containing `:` (e.g. `mod::test`) cannot collide.

use super::types::TestIdentity;

/// Leading key component per record kind
pub mod kind {
    pub const PATTERN: &str = "pat";
    pub const RUNS: &str = "run";
    pub const HISTORY: &str = "hist";
    pub const IMPACT: &str = "imp";
    pub const BREAKER: &str = "cb";
    pub const BUDGET: &str = "budget";
}

/// Key builders
pub mod keys {
    use super::{kind, TestIdentity};

    fn escape(component: &str) -> String {
        component.replace('%', "%25").replace(':', "%3A")
    }

    fn identity_suffix(identity: &TestIdentity) -> String {
        format!(
            "{}:{}:{}",
            escape(&identity.project_id),
            escape(identity.test_suite.as_deref().unwrap_or("")),
            escape(&identity.test_name)
        )
    }

    /// Prefix shared by every identity-scoped key of a project
    pub fn project_prefix(record_kind: &str, project_id: &str) -> String {
        format!("{}:{}:", record_kind, escape(project_id))
    }

    /// Pattern key for a test identity
    pub fn pattern(identity: &TestIdentity) -> String {
        format!("{}:{}", kind::PATTERN, identity_suffix(identity))
    }

    /// Run history key for a test identity
    pub fn runs(identity: &TestIdentity) -> String {
        format!("{}:{}", kind::RUNS, identity_suffix(identity))
    }

    /// Quarantine history key for a test identity
    pub fn history(identity: &TestIdentity) -> String {
        format!("{}:{}", kind::HISTORY, identity_suffix(identity))
    }

    /// Impact window key for a test identity
    pub fn impact(identity: &TestIdentity) -> String {
        format!("{}:{}", kind::IMPACT, identity_suffix(identity))
    }

    /// Circuit breaker key (policy + test)
    pub fn breaker(policy_id: &str, identity: &TestIdentity) -> String {
        format!(
            "{}:{}:{}",
            kind::BREAKER,
            escape(policy_id),
            identity_suffix(identity)
        )
    }

    /// Retry budget key (policy + project)
    pub fn budget(policy_id: &str, project_id: &str) -> String {
        format!("{}:{}:{}", kind::BUDGET, escape(policy_id), escape(project_id))
    }
}
