use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValidationError;
use crate::outbox::NewWrite;

/// Synchronous check run before a write is queued. A rejected write never
/// reaches the outbox or the cache.
pub trait WriteGuard: Send + Sync {
    fn check(&self, write: &NewWrite) -> Result<(), ValidationError>;
}

impl<F> WriteGuard for F
where
    F: Fn(&NewWrite) -> Result<(), ValidationError> + Send + Sync,
{
    fn check(&self, write: &NewWrite) -> Result<(), ValidationError> {
        self(write)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl WriteGuard for AllowAll {
    fn check(&self, _write: &NewWrite) -> Result<(), ValidationError> {
        Ok(())
    }
}

fn normalize(status: &str) -> String {
    status.trim().to_lowercase().replace('-', "_")
}

/// Rejects status changes the workflow does not allow.
///
/// Applies to writes whose payload carries `from` and `to` status strings,
/// optionally limited to one resource kind. Statuses are compared after
/// lowercasing and mapping `-` to `_`.
#[derive(Clone, Debug, Default)]
pub struct StatusTransitionGuard {
    kind: Option<String>,
    transitions: BTreeMap<String, BTreeSet<String>>,
}

impl StatusTransitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only check writes whose resource kind is `kind`.
    #[must_use]
    pub fn for_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn allow<I, S>(mut self, from: &str, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: Vec<String> = to.into_iter().map(|s| normalize(s.as_ref())).collect();
        for target in &targets {
            self.transitions.entry(target.clone()).or_default();
        }
        self.transitions
            .entry(normalize(from))
            .or_default()
            .extend(targets);
        self
    }

    /// Declares a status with no way out.
    #[must_use]
    pub fn terminal(mut self, status: &str) -> Self {
        self.transitions.entry(normalize(status)).or_default();
        self
    }

    pub fn is_known(&self, status: &str) -> bool {
        self.transitions.contains_key(&normalize(status))
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.transitions
            .get(&normalize(status))
            .is_some_and(BTreeSet::is_empty)
    }

    pub fn valid_transitions(&self, from: &str) -> Vec<String> {
        self.transitions
            .get(&normalize(from))
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn validate_transition(&self, from: &str, to: &str) -> Result<(), ValidationError> {
        let (from_n, to_n) = (normalize(from), normalize(to));
        for status in [&from_n, &to_n] {
            if !self.transitions.contains_key(status) {
                return Err(ValidationError::UnknownStatus(status.clone()));
            }
        }
        let invalid = || ValidationError::InvalidTransition {
            from: from_n.clone(),
            to: to_n.clone(),
        };
        if from_n == to_n || self.is_terminal(&from_n) {
            return Err(invalid());
        }
        match self.transitions.get(&from_n) {
            Some(targets) if targets.contains(&to_n) => Ok(()),
            _ => Err(invalid()),
        }
    }
}

impl WriteGuard for StatusTransitionGuard {
    fn check(&self, write: &NewWrite) -> Result<(), ValidationError> {
        if self
            .kind
            .as_deref()
            .is_some_and(|kind| kind != write.resource_ref.kind)
        {
            return Ok(());
        }
        let field = |name: &str| write.payload.get(name).and_then(|v| v.as_str());
        match (field("from"), field("to")) {
            (Some(from), Some(to)) => self.validate_transition(from, to),
            (None, None) => Ok(()),
            _ => Err(ValidationError::Rejected(
                "status change needs both `from` and `to`".into(),
            )),
        }
    }
}
