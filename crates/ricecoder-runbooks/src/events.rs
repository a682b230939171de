//! Event bus for runbook execution notifications
//!
//! Uses tokio's broadcast channel so any number of observers (UI, audit log,
//! alerting) can follow executions without coupling to the controller.
//!
//! # Example
//!
//! ```rust
//! use ricecoder_runbooks::events::{EventBus, RunbookEvent};
//! use ricecoder_runbooks::models::ExecutionStatus;
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new();
//! let mut subscriber = bus.subscribe();
//!
//! bus.publish(RunbookEvent::ExecutionStateChanged {
//!     execution_id: "exec-1".to_string(),
//!     previous: ExecutionStatus::Pending,
//!     current: ExecutionStatus::Running,
//! });
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.execution_id(), "exec-1");
//! # });
//! ```

use crate::approval::ApprovalRequest;
use crate::models::{ExecutionStatus, RollbackResult};
use tokio::sync::broadcast;

/// Default channel capacity for broadcast events
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Outbound runbook notification
#[derive(Debug, Clone)]
pub enum RunbookEvent {
    /// A gated step is waiting for approval
    ApprovalRequired {
        /// Execution identifier
        execution_id: String,
        /// The request sent to the approval collaborator
        request: ApprovalRequest,
    },
    /// A step reached a final state
    StepCompleted {
        /// Execution identifier
        execution_id: String,
        /// Step identifier
        step_id: String,
        /// Step name
        step_name: String,
        /// Whether the step succeeded
        success: bool,
        /// Captured output
        output: Option<String>,
        /// Captured error
        error: Option<String>,
    },
    /// Execution status changed
    ExecutionStateChanged {
        /// Execution identifier
        execution_id: String,
        /// Status before the change
        previous: ExecutionStatus,
        /// Status after the change
        current: ExecutionStatus,
    },
    /// A compensation rollback finished
    RollbackCompleted {
        /// Execution identifier
        execution_id: String,
        /// Rollback outcome
        result: RollbackResult,
    },
}

impl RunbookEvent {
    /// Execution the event belongs to
    pub fn execution_id(&self) -> &str {
        match self {
            RunbookEvent::ApprovalRequired { execution_id, .. }
            | RunbookEvent::StepCompleted { execution_id, .. }
            | RunbookEvent::ExecutionStateChanged { execution_id, .. }
            | RunbookEvent::RollbackCompleted { execution_id, .. } => execution_id,
        }
    }
}

/// Broadcast bus for runbook events
///
/// Cloning the bus shares the underlying channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<RunbookEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RunbookEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Publish a status transition
    pub fn state_changed(
        &self,
        execution_id: &str,
        previous: ExecutionStatus,
        current: ExecutionStatus,
    ) {
        tracing::debug!(
            execution_id = %execution_id,
            previous = ?previous,
            current = ?current,
            "Execution state changed"
        );
        self.publish(RunbookEvent::ExecutionStateChanged {
            execution_id: execution_id.to_string(),
            previous,
            current,
        });
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<RunbookEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
