//! Compensating actions for partially built route tables.
//!
//! Building a custom route table moves subnets away from the tables they
//! were associated with. Each successful move pushes its undo onto a
//! [`CompensationStack`]; when a later step fails, the stack unwinds in
//! reverse order so every subnet lands back where it started before the
//! error propagates.

use tracing::{error, info};

use crate::route_table::RouteTablePort;

/// One recorded undo action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// The subnet had an explicit association before. Move the current
    /// association back to the original table.
    RestoreAssociation {
        /// Association to move.
        association_id: String,
        /// Table the subnet belonged to originally.
        route_table_id: String,
    },
    /// The subnet was on the main table before. Drop the explicit
    /// association that was created.
    Disassociate {
        /// Association to remove.
        association_id: String,
    },
}

/// LIFO stack of undo actions.
#[derive(Debug, Default)]
pub struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the undo for a completed step.
    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether anything has been recorded.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Execute every recorded action in reverse order.
    ///
    /// Undo failures are logged and skipped rather than aborting the
    /// unwind, so one stuck association does not strand the rest.
    /// Returns the number of actions that failed.
    pub async fn unwind(mut self, tables: &dyn RouteTablePort) -> usize {
        let mut failures = 0;
        while let Some(action) = self.actions.pop() {
            let outcome = match &action {
                Compensation::RestoreAssociation {
                    association_id,
                    route_table_id,
                } => tables
                    .replace_association(association_id, route_table_id)
                    .await
                    .map(|_| ()),
                Compensation::Disassociate { association_id } => {
                    tables.disassociate(association_id).await
                }
            };
            match outcome {
                Ok(()) => info!(?action, "rolled back route table association"),
                Err(err) => {
                    failures += 1;
                    error!(?action, error = %err, "rollback step failed");
                }
            }
        }
        failures
    }
}
