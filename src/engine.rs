use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::ledger::AccessRecord;
use crate::normalize::CanonicalTransaction;

/// What the orchestrator should do for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    GrantNew,
    StackExisting,
    Skip,
    ManualReview,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::GrantNew => "grant_new",
            ActionType::StackExisting => "stack_existing",
            ActionType::Skip => "skip",
            ActionType::ManualReview => "manual_review",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub action: ActionType,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<&'static str>,
}

impl Action {
    fn new(action: ActionType, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            action,
            expires_at,
            reason: None,
        }
    }

    fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Core decision engine: pure, deterministic, no I/O. Branches are evaluated
/// in order; the first match wins.
///
/// 1. No existing record: grant fresh access until the transaction's expiry.
/// 2. Same transaction id as the record's last one: skip (idempotence).
/// 3. Stacking allowed and access still live at purchase time: extend the
///    current expiry additively. Already lapsed (expiry <= created_at):
///    treat as a fresh grant with the transaction's own expiry.
/// 4. Stacking disabled: manual review, existing expiry untouched.
pub fn derive_action(
    transaction: &CanonicalTransaction,
    existing_record: Option<&AccessRecord>,
) -> Action {
    let Some(existing) = existing_record else {
        return Action::new(ActionType::GrantNew, Some(transaction.computed_expiry));
    };

    if transaction.transaction_id == existing.last_transaction_id {
        return Action::new(ActionType::Skip, Some(existing.expiry))
            .with_reason("duplicate_transaction");
    }

    if transaction.stacking_allowed {
        if existing.expiry > transaction.created_at {
            let extended = existing.expiry + Duration::days(transaction.duration_days);
            return Action::new(ActionType::StackExisting, Some(extended));
        }
        return Action::new(ActionType::StackExisting, Some(transaction.computed_expiry));
    }

    // Never auto-shorten or silently overwrite access the recipient already has.
    Action::new(ActionType::ManualReview, Some(existing.expiry))
        .with_reason("stacking_disabled_existing_access")
}
