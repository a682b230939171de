//! Approval collaborator interface and an in-process approval queue

use crate::error::{RunbookError, RunbookResult};
use crate::models::ApprovalType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Approval request issued for a gated step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    /// Unique request identifier
    pub id: String,
    /// Execution the step belongs to
    pub execution_id: String,
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Why approval is needed
    pub reason: String,
    /// Kind of approval
    pub approval_type: ApprovalType,
    /// Distinct approvers needed
    pub required_approvers: u32,
    /// Explicit approvers; empty means anyone may approve
    pub approvers: Vec<String>,
    /// When the request was issued
    pub requested_at: DateTime<Utc>,
    /// When the request stops being answerable
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Whether the request has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Time left until expiry, zero when already expired
    pub fn remaining(&self) -> std::time::Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Decision returned by the approval collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalResponse {
    /// Whether the step may run
    pub approved: bool,
    /// Who approved (comma separated for multi-person approvals)
    pub approved_by: Option<String>,
    /// Approver's reason, mandatory in spirit for denials
    pub reason: Option<String>,
    /// When the decision was made
    pub approved_at: Option<DateTime<Utc>>,
}

impl ApprovalResponse {
    /// An approval
    pub fn approved(approved_by: impl Into<String>) -> Self {
        Self {
            approved: true,
            approved_by: Some(approved_by.into()),
            reason: None,
            approved_at: Some(Utc::now()),
        }
    }

    /// A denial
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            approved_by: None,
            reason: Some(reason.into()),
            approved_at: Some(Utc::now()),
        }
    }
}

/// Collaborator that obtains approval decisions
#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Wait for a decision on the request
    ///
    /// Implementations should return `RunbookError::Cancelled` when the token
    /// fires before a decision is made.
    async fn wait_for_approval(
        &self,
        request: &ApprovalRequest,
        cancellation: CancellationToken,
    ) -> RunbookResult<ApprovalResponse>;
}

struct PendingApproval {
    request: ApprovalRequest,
    approvals: Vec<String>,
    sender: Option<oneshot::Sender<ApprovalResponse>>,
}

/// In-process approval queue
///
/// Requests wait here until an operator calls [`ApprovalQueue::approve`] or
/// [`ApprovalQueue::deny`]. Multi-person requests resolve once enough distinct
/// approvers have approved.
#[derive(Default)]
pub struct ApprovalQueue {
    pending: DashMap<String, PendingApproval>,
}

impl ApprovalQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Requests still waiting for a decision
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending
            .iter()
            .filter(|entry| !entry.request.is_expired())
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Pending requests for one execution
    pub fn pending_for_execution(&self, execution_id: &str) -> Vec<ApprovalRequest> {
        self.pending_requests()
            .into_iter()
            .filter(|r| r.execution_id == execution_id)
            .collect()
    }

    /// Record an approval
    ///
    /// Returns `true` when the request is now fully approved.
    pub fn approve(&self, request_id: &str, approver: &str) -> RunbookResult<bool> {
        let mut entry = self.pending.get_mut(request_id).ok_or_else(|| {
            RunbookError::NotFound(format!("Approval request not found: {}", request_id))
        })?;

        if entry.request.is_expired() {
            return Err(RunbookError::ApprovalExpired(entry.request.step_id.clone()));
        }
        if !entry.request.approvers.is_empty()
            && !entry.request.approvers.iter().any(|a| a == approver)
        {
            return Err(RunbookError::InvalidTransition(format!(
                "{} is not an approver for request {}",
                approver, request_id
            )));
        }
        if entry.approvals.iter().any(|a| a == approver) {
            return Err(RunbookError::InvalidTransition(format!(
                "{} already approved request {}",
                approver, request_id
            )));
        }

        entry.approvals.push(approver.to_string());
        if (entry.approvals.len() as u32) < entry.request.required_approvers {
            tracing::debug!(
                request_id = %request_id,
                approvals = entry.approvals.len(),
                required = entry.request.required_approvers,
                "Partial approval recorded"
            );
            return Ok(false);
        }

        let response = ApprovalResponse::approved(entry.approvals.join(", "));
        if let Some(sender) = entry.sender.take() {
            let _ = sender.send(response);
        }
        drop(entry);
        self.pending.remove(request_id);

        tracing::info!(request_id = %request_id, "Approval granted");
        Ok(true)
    }

    /// Deny a request
    pub fn deny(&self, request_id: &str, reason: &str) -> RunbookResult<()> {
        let (_, mut pending) = self.pending.remove(request_id).ok_or_else(|| {
            RunbookError::NotFound(format!("Approval request not found: {}", request_id))
        })?;

        if let Some(sender) = pending.sender.take() {
            let _ = sender.send(ApprovalResponse::denied(reason));
        }

        tracing::info!(request_id = %request_id, reason = %reason, "Approval denied");
        Ok(())
    }

    /// Drop expired requests, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| !p.request.is_expired());
        before - self.pending.len()
    }
}

/// Removes a request from the queue when its waiter goes away
///
/// The waiter future may be dropped by an outer timeout or `select!`, so the
/// entry cannot rely on the wait itself reaching a cleanup branch.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingApproval>,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.remove(self.request_id).is_some() {
            tracing::debug!(request_id = %self.request_id, "Approval request withdrawn");
        }
    }
}

#[async_trait]
impl ApprovalService for ApprovalQueue {
    async fn wait_for_approval(
        &self,
        request: &ApprovalRequest,
        cancellation: CancellationToken,
    ) -> RunbookResult<ApprovalResponse> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            request.id.clone(),
            PendingApproval {
                request: request.clone(),
                approvals: Vec::new(),
                sender: Some(sender),
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: &request.id,
        };

        tokio::select! {
            response = receiver => response.map_err(|_| {
                RunbookError::CollaboratorFailure(format!(
                    "Approval request {} was dropped",
                    request.id
                ))
            }),
            _ = cancellation.cancelled() => Err(RunbookError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(approval_type: ApprovalType, approvers: Vec<String>) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: "exec".to_string(),
            step_id: "step".to_string(),
            step_name: "Step".to_string(),
            reason: "because".to_string(),
            approval_type,
            required_approvers: crate::safety::required_approvers(approval_type),
            approvers,
            requested_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    async fn wait_until_pending(queue: &ApprovalQueue, id: &str) {
        while !queue.pending.contains_key(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_single_approval_resolves_waiter() {
        let queue = Arc::new(ApprovalQueue::new());
        let req = request(ApprovalType::Single, vec![]);

        let waiter = {
            let queue = Arc::clone(&queue);
            let req = req.clone();
            tokio::spawn(async move { queue.wait_for_approval(&req, CancellationToken::new()).await })
        };

        wait_until_pending(&queue, &req.id).await;
        assert_eq!(queue.pending_for_execution("exec").len(), 1);
        assert!(queue.approve(&req.id, "alice").unwrap());

        let response = waiter.await.unwrap().unwrap();
        assert!(response.approved);
        assert_eq!(response.approved_by.as_deref(), Some("alice"));
        assert!(queue.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_multi_person_needs_distinct_approvers() {
        let queue = Arc::new(ApprovalQueue::new());
        let req = request(ApprovalType::MultiPerson, vec![]);

        let waiter = {
            let queue = Arc::clone(&queue);
            let req = req.clone();
            tokio::spawn(async move { queue.wait_for_approval(&req, CancellationToken::new()).await })
        };

        wait_until_pending(&queue, &req.id).await;
        assert!(!queue.approve(&req.id, "alice").unwrap());
        assert!(queue.approve(&req.id, "alice").is_err());
        assert!(queue.approve(&req.id, "bob").unwrap());

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.approved_by.as_deref(), Some("alice, bob"));
    }

    #[tokio::test]
    async fn test_explicit_approver_list_is_enforced() {
        let queue = Arc::new(ApprovalQueue::new());
        let req = request(ApprovalType::Single, vec!["carol".to_string()]);

        let waiter = {
            let queue = Arc::clone(&queue);
            let req = req.clone();
            tokio::spawn(async move { queue.wait_for_approval(&req, CancellationToken::new()).await })
        };

        wait_until_pending(&queue, &req.id).await;
        assert!(queue.approve(&req.id, "mallory").is_err());
        assert!(queue.approve(&req.id, "carol").unwrap());
        assert!(waiter.await.unwrap().unwrap().approved);
    }

    #[tokio::test]
    async fn test_deny_resolves_waiter_with_reason() {
        let queue = Arc::new(ApprovalQueue::new());
        let req = request(ApprovalType::Single, vec![]);

        let waiter = {
            let queue = Arc::clone(&queue);
            let req = req.clone();
            tokio::spawn(async move { queue.wait_for_approval(&req, CancellationToken::new()).await })
        };

        wait_until_pending(&queue, &req.id).await;
        queue.deny(&req.id, "change freeze").unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert!(!response.approved);
        assert_eq!(response.reason.as_deref(), Some("change freeze"));
    }

    #[tokio::test]
    async fn test_cancellation_removes_request() {
        let queue = ApprovalQueue::new();
        let req = request(ApprovalType::Single, vec![]);
        let token = CancellationToken::new();
        token.cancel();

        let result = queue.wait_for_approval(&req, token).await;
        assert!(matches!(result, Err(RunbookError::Cancelled)));
        assert!(queue.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_wait_removes_request() {
        let queue = ApprovalQueue::new();
        let req = request(ApprovalType::Single, vec![]);

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            queue.wait_for_approval(&req, CancellationToken::new()),
        )
        .await;

        assert!(outcome.is_err());
        assert!(queue.pending_requests().is_empty());
        assert!(matches!(
            queue.approve(&req.id, "alice"),
            Err(RunbookError::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_request() {
        let queue = ApprovalQueue::new();
        assert!(matches!(
            queue.approve("missing", "alice"),
            Err(RunbookError::NotFound(_))
        ));
        assert!(matches!(
            queue.deny("missing", "no"),
            Err(RunbookError::NotFound(_))
        ));
    }

    #[test]
    fn test_remaining_is_zero_after_expiry() {
        let mut req = request(ApprovalType::Single, vec![]);
        req.expires_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(req.is_expired());
        assert_eq!(req.remaining(), Duration::ZERO);
    }
}
