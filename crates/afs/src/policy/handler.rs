//! Policy handler trait and implementations.

use std::sync::Arc;

/// The module operation being performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Listing entries
    List,
    /// Reading an entry
    Read,
    /// Searching entries
    Search,
    /// Creating or updating an entry
    Write,
    /// Deleting an entry
    Delete,
    /// Moving an entry
    Rename,
    /// Invoking an executable entry
    Exec,
}

const READ_OPS: [Operation; 3] = [Operation::List, Operation::Read, Operation::Search];
const WRITE_OPS: [Operation; 3] = [Operation::Write, Operation::Delete, Operation::Rename];

impl Operation {
    /// Returns true if this operation never mutates.
    pub fn is_read_only(&self) -> bool {
        READ_OPS.contains(self)
    }

    /// Returns true if this operation mutates.
    pub fn is_write(&self) -> bool {
        WRITE_OPS.contains(self)
    }
}

/// The result of a policy check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The operation is allowed.
    Allow,
    /// The operation is denied with a reason.
    Deny(String),
}

impl PolicyDecision {
    /// Returns true if the operation is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Returns the denial reason if denied, None if allowed.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny(reason) => Some(reason),
        }
    }
}

/// Decides whether an operation on a module-relative path may proceed.
///
/// Checks run on every guarded call and must not block.
pub trait PolicyHandler: Send + Sync {
    /// Check if `operation` on `path` is allowed.
    fn check_access(&self, path: &str, operation: Operation) -> PolicyDecision;
}

impl PolicyHandler for Arc<dyn PolicyHandler> {
    fn check_access(&self, path: &str, operation: Operation) -> PolicyDecision {
        (**self).check_access(path, operation)
    }
}

/// Allows everything.
#[derive(Clone, Debug, Default)]
pub struct AllowAllPolicy;

impl PolicyHandler for AllowAllPolicy {
    fn check_access(&self, _path: &str, _operation: Operation) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Denies everything.
#[derive(Clone, Debug, Default)]
pub struct DenyAllPolicy;

impl PolicyHandler for DenyAllPolicy {
    fn check_access(&self, path: &str, operation: Operation) -> PolicyDecision {
        PolicyDecision::Deny(format!("{operation:?} access to {path} denied by policy"))
    }
}

/// Allows `list`, `read` and `search`; denies the rest.
#[derive(Clone, Debug, Default)]
pub struct ReadOnlyPolicy;

impl PolicyHandler for ReadOnlyPolicy {
    fn check_access(&self, path: &str, operation: Operation) -> PolicyDecision {
        if operation.is_read_only() {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!("{operation:?} on {path}: read-only policy"))
        }
    }
}

#[derive(Clone, Debug)]
struct PolicyRule {
    pattern: glob::Pattern,
    /// `None` matches every operation
    operations: Option<Vec<Operation>>,
    allow: bool,
}

impl PolicyRule {
    fn matches(&self, path: &str, operation: Operation) -> bool {
        self.pattern.matches(path)
            && self
                .operations
                .as_ref()
                .is_none_or(|ops| ops.contains(&operation))
    }
}

/// A policy built from ordered glob rules; the first match decides.
/// Without a match the default applies (deny unless built with
/// [`PolicyBuilder::allow_by_default`]).
#[derive(Clone, Debug)]
pub struct Policy {
    rules: Vec<PolicyRule>,
    default_decision: PolicyDecision,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_decision: PolicyDecision::Deny("no matching policy rule".to_string()),
        }
    }
}

impl Policy {
    /// Empty deny-by-default policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyHandler for Policy {
    fn check_access(&self, path: &str, operation: Operation) -> PolicyDecision {
        match self.rules.iter().find(|rule| rule.matches(path, operation)) {
            Some(rule) if rule.allow => PolicyDecision::Allow,
            Some(_) => PolicyDecision::Deny(format!(
                "{operation:?} access to {path} denied by policy rule"
            )),
            None => self.default_decision.clone(),
        }
    }
}

/// Fluent builder for [`Policy`].
///
/// ```rust,ignore
/// let policy = PolicyBuilder::new()
///     .deny("/private/**")
///     .allow_read("/**")
///     .allow_write("/drafts/**")
///     .build();
/// ```
#[derive(Clone, Debug, Default)]
pub struct PolicyBuilder {
    rules: Vec<PolicyRule>,
    default_allow: bool,
}

impl PolicyBuilder {
    /// Builder with deny-by-default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder with allow-by-default, for policies that only list denials.
    pub fn allow_by_default() -> Self {
        Self {
            rules: Vec::new(),
            default_allow: true,
        }
    }

    /// Allow `list`, `read` and `search` under `pattern`.
    ///
    /// A pattern ending in `/**` also covers its base directory.
    pub fn allow_read(self, pattern: &str) -> Self {
        self.push_with_base(pattern, Some(READ_OPS.to_vec()), true)
    }

    /// Allow `write`, `delete` and `rename` under `pattern`.
    ///
    /// A pattern ending in `/**` also covers its base directory.
    pub fn allow_write(self, pattern: &str) -> Self {
        self.push_with_base(pattern, Some(WRITE_OPS.to_vec()), true)
    }

    /// Allow `exec` under `pattern`.
    pub fn allow_exec(self, pattern: &str) -> Self {
        self.push(pattern, Some(vec![Operation::Exec]), true)
    }

    /// Deny every operation under `pattern`.
    pub fn deny(self, pattern: &str) -> Self {
        self.push_with_base(pattern, None, false)
    }

    /// Deny mutations under `pattern`.
    pub fn deny_write(self, pattern: &str) -> Self {
        self.push_with_base(pattern, Some(WRITE_OPS.to_vec()), false)
    }

    fn push_with_base(
        self,
        pattern: &str,
        operations: Option<Vec<Operation>>,
        allow: bool,
    ) -> Self {
        let this = match pattern.strip_suffix("/**") {
            Some(base) if !base.is_empty() => self.push(base, operations.clone(), allow),
            _ => self,
        };
        this.push(pattern, operations, allow)
    }

    fn push(mut self, pattern: &str, operations: Option<Vec<Operation>>, allow: bool) -> Self {
        match glob::Pattern::new(pattern) {
            Ok(pattern) => self.rules.push(PolicyRule {
                pattern,
                operations,
                allow,
            }),
            Err(err) => {
                tracing::warn!(pattern = %pattern, error = %err, "ignoring invalid policy pattern");
            }
        }
        self
    }

    /// Build the policy.
    pub fn build(self) -> Policy {
        Policy {
            rules: self.rules,
            default_decision: if self.default_allow {
                PolicyDecision::Allow
            } else {
                PolicyDecision::Deny("no matching policy rule".to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_and_deny_all() {
        assert!(AllowAllPolicy.check_access("/x", Operation::Write).is_allowed());
        assert!(!DenyAllPolicy.check_access("/x", Operation::Read).is_allowed());
    }

    #[test]
    fn test_read_only_policy() {
        let policy = ReadOnlyPolicy;
        assert!(policy.check_access("/a", Operation::List).is_allowed());
        assert!(policy.check_access("/a", Operation::Search).is_allowed());
        assert!(!policy.check_access("/a", Operation::Write).is_allowed());
        assert!(!policy.check_access("/a", Operation::Exec).is_allowed());
    }

    #[test]
    fn test_rules_first_match_wins() {
        let policy = PolicyBuilder::new()
            .deny("/private/**")
            .allow_read("/**")
            .allow_write("/drafts/**")
            .build();

        assert!(policy.check_access("/notes/a.md", Operation::Read).is_allowed());
        assert!(!policy.check_access("/private/key", Operation::Read).is_allowed());
        assert!(!policy.check_access("/private", Operation::List).is_allowed());
        assert!(policy.check_access("/drafts/x.md", Operation::Write).is_allowed());
        assert!(policy.check_access("/drafts", Operation::Delete).is_allowed());
        assert!(!policy.check_access("/notes/a.md", Operation::Write).is_allowed());
        let decision = policy.check_access("/notes/a.md", Operation::Exec);
        assert_eq!(decision.denial_reason(), Some("no matching policy rule"));
    }

    #[test]
    fn test_allow_by_default() {
        let policy = PolicyBuilder::allow_by_default()
            .deny_write("/locked/**")
            .build();
        assert!(policy.check_access("/locked/a", Operation::Read).is_allowed());
        assert!(!policy.check_access("/locked/a", Operation::Rename).is_allowed());
        assert!(policy.check_access("/open/a", Operation::Write).is_allowed());
    }

    #[test]
    fn test_operation_classification() {
        assert!(Operation::Search.is_read_only());
        assert!(Operation::Rename.is_write());
        assert!(!Operation::Exec.is_read_only());
        assert!(!Operation::Exec.is_write());
    }
}
