//! Request and probe contexts

use crate::probe::ProbeKey;
use std::time::Duration;
use uuid::Uuid;

/// What a caller passes with a query
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    /// Conversation / session id. Scoped probes cache one entry per scope.
    pub scope: Option<String>,
    /// Best-effort budget for the whole query. Falls back to the configured
    /// query timeout when unset.
    pub deadline: Option<Duration>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// What a probe sees when it is invoked
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub probe: ProbeKey,
    /// Set only for scoped probes
    pub scope: Option<String>,
    /// Id of the query that triggered this invocation, for log correlation
    pub query_id: Uuid,
}

impl ProbeContext {
    pub fn new(probe: ProbeKey) -> Self {
        Self {
            probe,
            scope: None,
            query_id: Uuid::new_v4(),
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }
}
