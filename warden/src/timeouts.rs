use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::events::{InProcEventBus, JobEvent};
use crate::job::{JobCategory, JobStatus};
use crate::store::{AgeBasis, JobStore, SweepRule};

/// Age limits per category, in minutes unless noted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub discovery_in_progress_mins: i64,
    pub discovery_queued_mins: i64,
    pub discovery_deletion_mins: i64,
    pub compliance_hours: i64,
    pub runner_in_progress_mins: i64,
    pub runner_queued_hours: i64,
    pub summarizer_hours: i64,
    pub query_in_progress_mins: i64,
    pub query_queued_hours: i64,
    pub audit_in_progress_mins: i64,
    pub audit_queued_hours: i64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            discovery_in_progress_mins: 20,
            discovery_queued_mins: 60,
            discovery_deletion_mins: 30,
            compliance_hours: 24,
            runner_in_progress_mins: 60,
            runner_queued_hours: 12,
            summarizer_hours: 6,
            query_in_progress_mins: 5,
            query_queued_hours: 12,
            audit_in_progress_mins: 10,
            audit_queued_hours: 12,
        }
    }
}

fn rule(
    category: JobCategory,
    statuses: &[JobStatus],
    basis: AgeBasis,
    older_than: Duration,
    to: JobStatus,
    message: &str,
) -> SweepRule {
    SweepRule {
        category,
        statuses: statuses.to_vec(),
        basis,
        older_than,
        to,
        message: message.to_string(),
    }
}

impl TimeoutConfig {
    /// Sweep rules of one category.
    pub fn rules(&self, category: JobCategory) -> Vec<SweepRule> {
        use JobStatus::*;

        let queued_and_running = |running_mins: i64, queued_hours: i64| {
            vec![
                rule(
                    category,
                    &[InProgress],
                    AgeBasis::UpdatedAt,
                    Duration::minutes(running_mins),
                    Timeout,
                    "job timed out while in progress",
                ),
                rule(
                    category,
                    &[Queued],
                    AgeBasis::UpdatedAt,
                    Duration::hours(queued_hours),
                    Timeout,
                    "job timed out in queue",
                ),
            ]
        };

        match category {
            JobCategory::Discovery => vec![
                rule(
                    category,
                    &[InProgress],
                    AgeBasis::UpdatedAt,
                    Duration::minutes(self.discovery_in_progress_mins),
                    Timeout,
                    "discovery timed out while in progress",
                ),
                rule(
                    category,
                    &[Queued],
                    AgeBasis::UpdatedAt,
                    Duration::minutes(self.discovery_queued_mins),
                    Failed,
                    "queued but never started",
                ),
                rule(
                    category,
                    &[OldResourceDeletion],
                    AgeBasis::UpdatedAt,
                    Duration::minutes(self.discovery_deletion_mins),
                    Timeout,
                    "old resource deletion did not finish",
                ),
            ],
            JobCategory::Compliance => vec![rule(
                category,
                &[Created, RunnersInProgress, SummarizerInProgress],
                AgeBasis::UpdatedAt,
                Duration::hours(self.compliance_hours),
                Timeout,
                "compliance job timed out",
            )],
            JobCategory::ComplianceRunner => queued_and_running(
                self.runner_in_progress_mins,
                self.runner_queued_hours,
            ),
            JobCategory::ComplianceSummarizer => vec![rule(
                category,
                &[Created, Queued, InProgress],
                AgeBasis::CreatedAt,
                Duration::hours(self.summarizer_hours),
                Timeout,
                "summarizer did not finish",
            )],
            JobCategory::QueryRunner | JobCategory::QueryValidator => {
                queued_and_running(
                    self.query_in_progress_mins,
                    self.query_queued_hours,
                )
            }
            JobCategory::Audit | JobCategory::ComplianceQuickRun => {
                queued_and_running(
                    self.audit_in_progress_mins,
                    self.audit_queued_hours,
                )
            }
        }
    }
}

/// Moves stale jobs to their timeout status with bulk guarded updates.
#[derive(Clone)]
pub struct TimeoutSweeper {
    store: Arc<dyn JobStore>,
    config: TimeoutConfig,
    events: Option<InProcEventBus>,
}

impl std::fmt::Debug for TimeoutSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TimeoutSweeper {
    pub fn new(store: Arc<dyn JobStore>, config: TimeoutConfig) -> Self {
        Self {
            store,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Apply every rule of a category; returns the number of jobs moved.
    pub async fn sweep(&self, category: JobCategory) -> anyhow::Result<u64> {
        let span = crate::telemetry::sweep_span(category.as_str());
        async {
            let mut total = 0;
            for rule in self.config.rules(category) {
                let moved = self.store.sweep(&rule).await?;
                if moved > 0 {
                    crate::telemetry::record_jobs_swept(category, rule.to, moved);
                    if let Some(events) = &self.events {
                        let _ = events
                            .publish(JobEvent::swept(category, rule.to, moved));
                    }
                }
                total += moved;
            }
            Ok(total)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_rules_match_table() {
        let rules = TimeoutConfig::default().rules(JobCategory::Discovery);
        assert_eq!(rules.len(), 3);

        let queued = rules
            .iter()
            .find(|r| r.statuses == vec![JobStatus::Queued])
            .unwrap();
        assert_eq!(queued.to, JobStatus::Failed);
        assert_eq!(queued.older_than, Duration::hours(1));

        let running = rules
            .iter()
            .find(|r| r.statuses == vec![JobStatus::InProgress])
            .unwrap();
        assert_eq!(running.to, JobStatus::Timeout);
        assert_eq!(running.older_than, Duration::minutes(20));
    }

    #[test]
    fn test_summarizer_measures_from_creation() {
        let rules =
            TimeoutConfig::default().rules(JobCategory::ComplianceSummarizer);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].basis, AgeBasis::CreatedAt);
        assert_eq!(rules[0].older_than, Duration::hours(6));
    }

    #[test]
    fn test_every_rule_targets_a_legal_edge() {
        let config = TimeoutConfig::default();
        for category in JobCategory::ALL {
            for rule in config.rules(category) {
                for from in &rule.statuses {
                    assert!(
                        category.allows(*from, rule.to),
                        "{category}: {from} -> {}",
                        rule.to
                    );
                }
            }
        }
    }
}
