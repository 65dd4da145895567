//! Per-operator execution context.
//!
//! Every rule operator instance runs with a [`StreamContext`] naming the rule,
//! the operator and the parallel instance, and carrying the cancellation token
//! that a rule stop fires. Tasks spawned on behalf of an operator select on
//! [`StreamContext::cancelled`] in their main loop.

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Clone)]
pub struct StreamContext {
    rule_id: Arc<str>,
    op_id: Arc<str>,
    instance_id: usize,
    token: CancellationToken,
}

impl StreamContext {
    pub fn new(rule_id: impl Into<Arc<str>>, op_id: impl Into<Arc<str>>, instance_id: usize) -> Self {
        Self {
            rule_id: rule_id.into(),
            op_id: op_id.into(),
            instance_id,
            token: CancellationToken::new(),
        }
    }

    /// Context not bound to any rule, used by process-level services.
    pub fn background() -> Self {
        Self::new("", "", 0)
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    /// Identity of this operator instance on shared resources:
    /// `ruleId_opId_instanceId`.
    pub fn subscription_id(&self) -> String {
        format!("{}_{}_{}", self.rule_id, self.op_id, self.instance_id)
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Child context: cancelled when this one is, and cancellable on its own.
    pub fn with_cancel(&self) -> StreamContext {
        Self {
            rule_id: self.rule_id.clone(),
            op_id: self.op_id.clone(),
            instance_id: self.instance_id,
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("rule_id", &self.rule_id)
            .field("op_id", &self.op_id)
            .field("instance_id", &self.instance_id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
