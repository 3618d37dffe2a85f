//! Transaction depth bookkeeping.
//!
//! The coordinator decides which native primitive a begin, commit or
//! rollback maps to at the current depth. It never talks to the engine
//! itself; the runner applies the returned [`NativeAction`] and only then
//! calls [`TransactionCoordinator::settle`].

use sqlrunner_core::{
    Capabilities, Error, IsolationLevel, NativeConnection, NestedTransactions, Result,
    TransactionError, TransactionErrorKind,
};

/// Which transition is being planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Begin,
    Commit,
    Rollback,
}

/// Native primitive a transition maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeAction {
    Begin(Option<IsolationLevel>),
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    /// Depth-only bookkeeping; nothing reaches the engine.
    None,
}

impl NativeAction {
    /// Whether a rollback action really discards engine-side changes.
    pub fn discards_changes(&self) -> bool {
        matches!(
            self,
            NativeAction::Rollback | NativeAction::RollbackToSavepoint(_)
        )
    }

    /// Issue the primitive on a native handle.
    pub fn apply<C: NativeConnection>(&self, conn: &mut C) -> Result<()> {
        match self {
            NativeAction::Begin(isolation) => conn.begin(*isolation),
            NativeAction::Commit => conn.commit(),
            NativeAction::Rollback => conn.rollback(),
            NativeAction::Savepoint(name) => conn.savepoint(name),
            NativeAction::ReleaseSavepoint(name) => conn.release_savepoint(name),
            NativeAction::RollbackToSavepoint(name) => conn.rollback_to_savepoint(name),
            NativeAction::None => Ok(()),
        }
    }
}

/// A planned transition: the primitive to issue and the depth it leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub transition: Transition,
    pub action: NativeAction,
    pub depth_after: u32,
}

/// Savepoint name for the level entered at `depth`.
pub fn savepoint_name(depth: u32) -> String {
    format!("sp_{depth}")
}

/// Depth counter plus the rules mapping depth to native primitives.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    depth: u32,
    capabilities: Capabilities,
    nested: NestedTransactions,
}

impl TransactionCoordinator {
    pub fn new(capabilities: Capabilities, nested: NestedTransactions) -> Self {
        Self {
            depth: 0,
            capabilities,
            nested,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn plan_begin(&self, isolation: Option<IsolationLevel>) -> Result<Plan> {
        let action = if !self.capabilities.supports_native_transactions {
            NativeAction::None
        } else if self.depth == 0 {
            NativeAction::Begin(isolation)
        } else if self.capabilities.supports_savepoints {
            NativeAction::Savepoint(savepoint_name(self.depth))
        } else {
            match self.nested {
                NestedTransactions::Flatten => {
                    tracing::debug!(
                        depth = self.depth,
                        "Nested transaction without savepoints; tracking depth only"
                    );
                    NativeAction::None
                }
                NestedTransactions::Reject => {
                    return Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::NestedNotSupported,
                        message: format!(
                            "nested transaction at depth {} requires savepoint support",
                            self.depth
                        ),
                        source: None,
                    }));
                }
            }
        };

        Ok(Plan {
            transition: Transition::Begin,
            action,
            depth_after: self.depth + 1,
        })
    }

    pub fn plan_commit(&self) -> Result<Plan> {
        let depth_after = self.closing_depth()?;
        let action = if !self.capabilities.supports_native_transactions {
            NativeAction::None
        } else if depth_after == 0 {
            NativeAction::Commit
        } else if self.capabilities.supports_savepoints {
            NativeAction::ReleaseSavepoint(savepoint_name(depth_after))
        } else {
            NativeAction::None
        };

        Ok(Plan {
            transition: Transition::Commit,
            action,
            depth_after,
        })
    }

    pub fn plan_rollback(&self) -> Result<Plan> {
        let depth_after = self.closing_depth()?;
        let action = if !self.capabilities.supports_native_transactions {
            NativeAction::None
        } else if depth_after == 0 {
            NativeAction::Rollback
        } else if self.capabilities.supports_savepoints {
            NativeAction::RollbackToSavepoint(savepoint_name(depth_after))
        } else {
            NativeAction::None
        };

        Ok(Plan {
            transition: Transition::Rollback,
            action,
            depth_after,
        })
    }

    /// Record that a planned transition reached the engine successfully.
    pub fn settle(&mut self, plan: &Plan) {
        self.depth = plan.depth_after;
    }

    /// Drop every open level without issuing anything.
    pub fn reset(&mut self) {
        self.depth = 0;
    }

    fn closing_depth(&self) -> Result<u32> {
        self.depth.checked_sub(1).ok_or(Error::NoActiveTransaction)
    }
}

/// Wrap a native failure of a transition into a transaction error.
pub fn transition_error(transition: Transition, cause: Error) -> Error {
    let kind = match transition {
        Transition::Begin => TransactionErrorKind::Begin,
        Transition::Commit => TransactionErrorKind::Commit,
        Transition::Rollback => TransactionErrorKind::Rollback,
    };
    Error::Transaction(TransactionError {
        kind,
        message: cause.to_string(),
        source: Some(Box::new(cause)),
    })
}
