//! Account (work item) records and result classification.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, BatchId, WorkerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Processing,
    Completed,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Processing => "processing",
            AccountStatus::Completed => "completed",
        }
    }

    pub fn from_stored(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(AccountStatus::Pending),
            "processing" => Some(AccountStatus::Processing),
            "completed" => Some(AccountStatus::Completed),
            _ => None,
        }
    }
}

/// Closed classification of a check outcome. `Pending` is the neutral value an
/// account carries until it is completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CheckResult {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "bad")]
    Bad,
    #[serde(rename = "invalid")]
    Invalid,
    #[serde(rename = "2fa")]
    TwoFactor,
    #[serde(rename = "passkey")]
    Passkey,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "lock")]
    Lock,
    #[serde(rename = "guard")]
    Guard,
    #[serde(rename = "change-pass")]
    ChangePass,
    #[serde(rename = "mobile-2step")]
    MobileTwoStep,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "server-error")]
    ServerError,
    #[serde(rename = "unknown")]
    Unknown,
}

/// Aggregate bucket a completed classification counts towards on its batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultBucket {
    Good,
    Bad,
    Errors,
}

/// What a reported raw status means for the account it targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal: the account is completed and counted on its batch.
    Completed(CheckResult, ResultBucket),
    /// Ambiguous: the account goes back to pending for another worker.
    Inconclusive(CheckResult),
}

pub const ALL_CHECK_RESULTS: [CheckResult; 14] = [
    CheckResult::Pending,
    CheckResult::Good,
    CheckResult::Bad,
    CheckResult::Invalid,
    CheckResult::TwoFactor,
    CheckResult::Passkey,
    CheckResult::Error,
    CheckResult::Lock,
    CheckResult::Guard,
    CheckResult::ChangePass,
    CheckResult::MobileTwoStep,
    CheckResult::Timeout,
    CheckResult::ServerError,
    CheckResult::Unknown,
];

impl CheckResult {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckResult::Pending => "pending",
            CheckResult::Good => "good",
            CheckResult::Bad => "bad",
            CheckResult::Invalid => "invalid",
            CheckResult::TwoFactor => "2fa",
            CheckResult::Passkey => "passkey",
            CheckResult::Error => "error",
            CheckResult::Lock => "lock",
            CheckResult::Guard => "guard",
            CheckResult::ChangePass => "change-pass",
            CheckResult::MobileTwoStep => "mobile-2step",
            CheckResult::Timeout => "timeout",
            CheckResult::ServerError => "server-error",
            CheckResult::Unknown => "unknown",
        }
    }

    /// Decodes a value written by [`CheckResult::as_str`].
    pub fn from_stored(raw: &str) -> Option<Self> {
        ALL_CHECK_RESULTS
            .iter()
            .copied()
            .find(|result| result.as_str() == raw)
    }

    /// Maps a worker-reported status string onto the closed enum. Workers have
    /// historically sent both `change_pass` and `change-pass`, in any case;
    /// anything unrecognised becomes `Unknown`. `pending` is never a valid
    /// report and is treated as unrecognised too.
    pub fn normalize(raw: &str) -> Self {
        let key = raw.trim().to_ascii_lowercase().replace('_', "-");
        match key.as_str() {
            "good" => CheckResult::Good,
            "bad" => CheckResult::Bad,
            "invalid" => CheckResult::Invalid,
            "2fa" => CheckResult::TwoFactor,
            "passkey" => CheckResult::Passkey,
            "error" => CheckResult::Error,
            "lock" => CheckResult::Lock,
            "guard" => CheckResult::Guard,
            "change-pass" => CheckResult::ChangePass,
            "mobile-2step" => CheckResult::MobileTwoStep,
            "timeout" => CheckResult::Timeout,
            "server-error" => CheckResult::ServerError,
            _ => CheckResult::Unknown,
        }
    }

    pub fn is_inconclusive(self) -> bool {
        matches!(self, CheckResult::ServerError | CheckResult::Unknown)
    }

    /// Many-to-one mapping used for batch aggregates. `None` for the neutral
    /// and inconclusive values, which never count.
    pub fn bucket(self) -> Option<ResultBucket> {
        match self {
            CheckResult::Good => Some(ResultBucket::Good),
            CheckResult::Bad
            | CheckResult::Invalid
            | CheckResult::TwoFactor
            | CheckResult::Passkey
            | CheckResult::Lock
            | CheckResult::Guard
            | CheckResult::ChangePass
            | CheckResult::MobileTwoStep => Some(ResultBucket::Bad),
            CheckResult::Error | CheckResult::Timeout => {
                Some(ResultBucket::Errors)
            }
            CheckResult::Pending
            | CheckResult::ServerError
            | CheckResult::Unknown => None,
        }
    }

    pub fn outcome(self) -> Outcome {
        match self.bucket() {
            Some(bucket) => Outcome::Completed(self, bucket),
            None => Outcome::Inconclusive(self),
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full persisted view of one account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub batch_id: BatchId,
    pub position: i32,
    pub status: AccountStatus,
    pub result: CheckResult,
    pub lease_holder: Option<WorkerId>,
    pub leased_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub result_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub checked_by: Option<WorkerId>,
    pub checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What a worker receives for each leased account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountLease {
    pub id: AccountId,
    pub email: String,
    pub password: String,
    pub batch_id: BatchId,
    pub position: i32,
    /// Attempt number including this lease.
    pub attempts: i32,
}

/// Ingestion input for one account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
}

impl NewAccount {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// One result as reported by a worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResultReport {
    /// Preferred resolution key.
    #[serde(default, alias = "accountId")]
    pub id: Option<AccountId>,
    /// Secondary natural key used when `id` is absent.
    #[serde(default)]
    pub email: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "responseTime")]
    pub response_time_ms: Option<i64>,
}

impl ResultReport {
    pub fn for_account(id: AccountId, status: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn for_email(email: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            status: status.into(),
            ..Self::default()
        }
    }
}

/// How a report identifies its account once normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResultTarget {
    Id(AccountId),
    Email(String),
}

/// A report after normalization, ready to be applied by a repository.
#[derive(Clone, Debug)]
pub struct ClassifiedResult {
    pub target: ResultTarget,
    pub outcome: Outcome,
    pub raw_status: String,
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
}

/// Per-call bookkeeping returned by result submission.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSummary {
    pub completed: usize,
    pub requeued: usize,
    /// Reports whose target could not be resolved (unknown id/email).
    pub unresolved: usize,
    /// Reports against accounts that were already completed, or inconclusive
    /// reports for accounts the worker no longer holds.
    pub stale: usize,
    /// Accounts that were completed by this call.
    pub completed_ids: Vec<AccountId>,
    /// Batches that reached full coverage during this call.
    pub completed_batches: Vec<BatchId>,
}

impl SubmitSummary {
    pub fn absorb(&mut self, applied: AppliedResult) {
        match applied {
            AppliedResult::Completed { account_id, .. } => {
                self.completed += 1;
                self.completed_ids.push(account_id);
            }
            AppliedResult::Requeued { .. } => self.requeued += 1,
            AppliedResult::Unresolved => self.unresolved += 1,
            AppliedResult::AlreadyCompleted { .. }
            | AppliedResult::NotHeld { .. } => self.stale += 1,
        }
    }
}

/// Effect of applying a single classified result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppliedResult {
    Completed {
        account_id: AccountId,
        batch_id: BatchId,
        bucket: ResultBucket,
    },
    Requeued {
        account_id: AccountId,
    },
    Unresolved,
    AlreadyCompleted {
        account_id: AccountId,
    },
    /// Inconclusive report for an account the worker no longer holds.
    NotHeld {
        account_id: AccountId,
    },
}

/// Account counters for dashboards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    /// Completed accounts per classification, keyed by wire name.
    pub by_result: std::collections::BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_both_separator_styles() {
        assert_eq!(CheckResult::normalize("change_pass"), CheckResult::ChangePass);
        assert_eq!(CheckResult::normalize("change-pass"), CheckResult::ChangePass);
        assert_eq!(CheckResult::normalize("MOBILE_2STEP"), CheckResult::MobileTwoStep);
        assert_eq!(CheckResult::normalize(" server_error "), CheckResult::ServerError);
    }

    #[test]
    fn unrecognised_status_maps_to_unknown() {
        assert_eq!(CheckResult::normalize("banana"), CheckResult::Unknown);
        assert_eq!(CheckResult::normalize(""), CheckResult::Unknown);
        assert_eq!(CheckResult::normalize("pending"), CheckResult::Unknown);
    }

    #[test]
    fn inconclusive_results_have_no_bucket() {
        for result in ALL_CHECK_RESULTS {
            let inconclusive = matches!(result.outcome(), Outcome::Inconclusive(_));
            assert_eq!(
                inconclusive,
                result.bucket().is_none(),
                "{result} bucket mismatch"
            );
        }
        assert!(CheckResult::ServerError.is_inconclusive());
        assert!(CheckResult::Unknown.is_inconclusive());
        assert!(!CheckResult::Timeout.is_inconclusive());
    }

    #[test]
    fn buckets_follow_the_aggregate_table() {
        assert_eq!(CheckResult::Good.bucket(), Some(ResultBucket::Good));
        assert_eq!(CheckResult::Lock.bucket(), Some(ResultBucket::Bad));
        assert_eq!(CheckResult::TwoFactor.bucket(), Some(ResultBucket::Bad));
        assert_eq!(CheckResult::Timeout.bucket(), Some(ResultBucket::Errors));
        assert_eq!(CheckResult::Error.bucket(), Some(ResultBucket::Errors));
    }

    #[test]
    fn stored_names_round_trip_through_serde_names() {
        for result in ALL_CHECK_RESULTS {
            let json = serde_json::to_string(&result).unwrap();
            assert_eq!(json, format!("\"{}\"", result.as_str()));
            assert_eq!(CheckResult::from_stored(result.as_str()), Some(result));
        }
    }

    #[test]
    fn report_accepts_legacy_field_names() {
        let report: ResultReport = serde_json::from_str(
            r#"{"accountId": 7, "status": "good", "responseTime": 120}"#,
        )
        .unwrap();
        assert_eq!(report.id, Some(AccountId(7)));
        assert_eq!(report.response_time_ms, Some(120));
    }
}
