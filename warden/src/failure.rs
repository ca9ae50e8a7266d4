use serde::{Deserialize, Serialize};

use crate::job::{JobCategory, JobStatus};
use crate::store::RetryRule;

pub const RATE_LIMIT_EXCEEDED: &str = "RateLimitExceeded";
pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

const RATE_LIMIT_SIGNATURES: [&str; 4] = [
    "exceeded maximum number of attempts",
    "throttlingexception",
    "toomanyrequests",
    "rate exceeded",
];

const DEADLINE_SIGNATURES: [&str; 2] =
    ["context deadline exceeded", "deadline exceeded"];

/// Infer an error code from a worker's error text when it sent none.
pub fn classify_failure(message: &str) -> Option<&'static str> {
    let lowered = message.to_ascii_lowercase();
    if RATE_LIMIT_SIGNATURES.iter().any(|s| lowered.contains(s)) {
        Some(RATE_LIMIT_EXCEEDED)
    } else if DEADLINE_SIGNATURES.iter().any(|s| lowered.contains(s)) {
        Some(DEADLINE_EXCEEDED)
    } else {
        None
    }
}

/// Automatic retry of failed jobs for one category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub cooldown_secs: i64,
    pub statuses: Vec<JobStatus>,
    /// Failures with these codes are not retried; retrying a throttled or
    /// deadline-bound call only repeats the failure.
    pub excluded_error_codes: Vec<String>,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            cooldown_secs: 0,
            statuses: Vec::new(),
            excluded_error_codes: Vec::new(),
        }
    }

    pub fn for_category(category: JobCategory) -> Self {
        let excluded = vec![
            RATE_LIMIT_EXCEEDED.to_string(),
            DEADLINE_EXCEEDED.to_string(),
        ];
        match category {
            JobCategory::Discovery => Self {
                max_retries: 1,
                cooldown_secs: 5 * 60,
                statuses: vec![JobStatus::Failed],
                excluded_error_codes: excluded,
            },
            JobCategory::ComplianceRunner => Self {
                max_retries: 1,
                cooldown_secs: 7 * 60,
                statuses: vec![JobStatus::Failed, JobStatus::Timeout],
                excluded_error_codes: excluded,
            },
            _ => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0 && !self.statuses.is_empty()
    }

    pub fn rule(&self, category: JobCategory) -> RetryRule {
        RetryRule {
            category,
            statuses: self.statuses.clone(),
            cooldown: chrono::Duration::seconds(self.cooldown_secs),
            max_retries: self.max_retries,
            excluded_error_codes: self.excluded_error_codes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_failure(
                "operation error EC2: DescribeInstances, exceeded maximum number of attempts, 3"
            ),
            Some(RATE_LIMIT_EXCEEDED)
        );
        assert_eq!(
            classify_failure("ThrottlingException: Rate exceeded"),
            Some(RATE_LIMIT_EXCEEDED)
        );
    }

    #[test]
    fn test_classify_deadline() {
        assert_eq!(
            classify_failure("Get \"https://api\": context deadline exceeded"),
            Some(DEADLINE_EXCEEDED)
        );
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify_failure("access denied"), None);
    }

    #[test]
    fn test_retry_policy_defaults() {
        assert!(RetryPolicy::for_category(JobCategory::Discovery).is_enabled());
        assert!(
            RetryPolicy::for_category(JobCategory::ComplianceRunner).is_enabled()
        );
        assert!(!RetryPolicy::for_category(JobCategory::QueryRunner).is_enabled());

        let rule = RetryPolicy::for_category(JobCategory::Discovery)
            .rule(JobCategory::Discovery);
        assert_eq!(rule.cooldown, chrono::Duration::minutes(5));
        assert!(rule.excluded_error_codes.contains(&RATE_LIMIT_EXCEEDED.to_string()));
    }
}
