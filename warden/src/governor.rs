use std::collections::HashMap;
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::job::{JobCategory, JobRecord};

/// Caps on active discovery jobs per resource type. Keys match resource
/// type names exactly; anything unlisted gets `default_limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitTable {
    limits: HashMap<String, usize>,
    default_limit: usize,
}

impl RateLimitTable {
    pub fn new(limits: HashMap<String, usize>, default_limit: usize) -> Self {
        Self {
            limits,
            default_limit,
        }
    }

    pub fn with_default(default_limit: usize) -> Self {
        Self {
            limits: HashMap::new(),
            default_limit,
        }
    }

    pub fn with_limit(mut self, workload: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(workload.into(), limit);
        self
    }

    /// Replace the default limit, keeping per-workload entries.
    pub fn with_default_limit(mut self, default_limit: usize) -> Self {
        self.default_limit = default_limit;
        self
    }

    pub fn limit(&self, workload: &str) -> usize {
        self.limits
            .get(workload)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Parse `type=limit,type=limit` overrides on top of this table.
    pub fn merge_overrides(mut self, raw: &str) -> Result<Self, String> {
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (workload, limit) = entry
                .rsplit_once('=')
                .ok_or_else(|| format!("expected type=limit, got {entry:?}"))?;
            let limit = limit
                .trim()
                .parse()
                .map_err(|_| format!("invalid limit in {entry:?}"))?;
            self.limits.insert(workload.trim().to_string(), limit);
        }
        Ok(self)
    }
}

impl Default for RateLimitTable {
    /// Expensive or rate-limited upstream APIs get a handful of concurrent
    /// discovery jobs; everything else gets 25.
    fn default() -> Self {
        Self::with_default(25)
            .with_limit("AWS::CostExplorer::ByServiceDaily", 1)
            .with_limit("AWS::CostExplorer::ByAccountDaily", 1)
            .with_limit("Azure::CostManagement::CostByResourceType", 1)
            .with_limit("AWS::Inspector2::Finding", 2)
            .with_limit("AWS::Health::Event", 3)
            .with_limit("Microsoft.Security/assessments", 5)
    }
}

/// Ceilings that can block publishing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    MaxQueued,
    MaxInWindow,
}

impl Ceiling {
    pub const ALL: [Ceiling; 2] = [Ceiling::MaxQueued, Ceiling::MaxInWindow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ceiling::MaxQueued => "max_queued",
            Ceiling::MaxInWindow => "max_in_window",
        }
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Upper bound on jobs sitting in `queued`.
    pub max_queued: u64,
    /// Upper bound on jobs handed to the queue within `window`.
    pub max_in_window: u64,
    /// Length of the sliding window, in seconds.
    pub window_secs: i64,
    /// Per-resource-type limits on queued plus running discovery jobs.
    pub rate_limits: RateLimitTable,
}

impl GovernorConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs)
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_queued: 5000,
            max_in_window: 5000,
            window_secs: 600,
            rate_limits: RateLimitTable::default(),
        }
    }
}

/// Counters the governor decides from, read once per cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GovernorSnapshot {
    pub queued: u64,
    pub queued_in_window: u64,
    /// Active jobs per workload key.
    pub running: HashMap<String, u64>,
}

#[derive(Debug, PartialEq)]
pub enum GovernorDecision {
    /// Nothing may be published this cycle.
    Blocked {
        ceiling: Ceiling,
        current: u64,
        limit: u64,
    },
    Admit {
        admitted: Vec<JobRecord>,
        /// Left in `created` for a later cycle.
        deferred: Vec<JobRecord>,
        /// Set when a global ceiling, rather than a per-type cap, cut the
        /// batch short.
        throttled_by: Option<Ceiling>,
    },
}

impl GovernorDecision {
    pub fn blocked_by(&self) -> Option<Ceiling> {
        match self {
            GovernorDecision::Blocked { ceiling, .. } => Some(*ceiling),
            GovernorDecision::Admit { throttled_by, .. } => *throttled_by,
        }
    }
}

/// Admission control for a dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct Governor {
    config: GovernorConfig,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Decide which candidates may be published.
    ///
    /// `workload_key` maps a job to its per-type bucket; jobs without a key
    /// are only subject to the global ceilings. Candidate order is kept, so
    /// callers that shuffle get a shuffled admission.
    pub fn plan<F>(
        &self,
        category: JobCategory,
        candidates: Vec<JobRecord>,
        snapshot: &GovernorSnapshot,
        workload_key: F,
    ) -> GovernorDecision
    where
        F: Fn(&JobRecord) -> Option<String>,
    {
        if snapshot.queued >= self.config.max_queued {
            tracing::warn!(
                category = %category,
                queued = snapshot.queued,
                limit = self.config.max_queued,
                "publishing blocked: queued ceiling reached"
            );
            return GovernorDecision::Blocked {
                ceiling: Ceiling::MaxQueued,
                current: snapshot.queued,
                limit: self.config.max_queued,
            };
        }
        if snapshot.queued_in_window >= self.config.max_in_window {
            tracing::warn!(
                category = %category,
                queued_in_window = snapshot.queued_in_window,
                limit = self.config.max_in_window,
                "publishing blocked: window ceiling reached"
            );
            return GovernorDecision::Blocked {
                ceiling: Ceiling::MaxInWindow,
                current: snapshot.queued_in_window,
                limit: self.config.max_in_window,
            };
        }

        let queued_room = self.config.max_queued - snapshot.queued;
        let window_room = self.config.max_in_window - snapshot.queued_in_window;
        let (headroom, tighter) = if window_room < queued_room {
            (window_room, Ceiling::MaxInWindow)
        } else {
            (queued_room, Ceiling::MaxQueued)
        };

        let mut admitted = Vec::new();
        let mut deferred = Vec::new();
        let mut throttled_by = None;
        let mut in_cycle: HashMap<String, u64> = HashMap::new();

        for job in candidates {
            if admitted.len() as u64 >= headroom {
                throttled_by = Some(tighter);
                deferred.push(job);
                continue;
            }
            if let Some(key) = workload_key(&job) {
                let limit = self.config.rate_limits.limit(&key) as u64;
                let running = snapshot.running.get(&key).copied().unwrap_or(0);
                let taken = in_cycle.entry(key).or_insert(0);
                if running + *taken >= limit {
                    deferred.push(job);
                    continue;
                }
                *taken += 1;
            }
            admitted.push(job);
        }

        if throttled_by.is_some() {
            tracing::info!(
                category = %category,
                admitted = admitted.len(),
                deferred = deferred.len(),
                "dispatch batch truncated by governor"
            );
        }

        GovernorDecision::Admit {
            admitted,
            deferred,
            throttled_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        DiscoverySpec, JobId, JobSpec, JobStatus, QueryRunSpec, TriggerType,
    };
    use chrono::Utc;

    fn discovery(id: i64, resource_type: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: JobId(id),
            category: JobCategory::Discovery,
            status: JobStatus::Created,
            trigger_type: TriggerType::Scheduled,
            created_by: "system".into(),
            created_at: now,
            updated_at: now,
            queued_at: None,
            retry_count: 0,
            failure_message: None,
            error_code: None,
            queue_sequence: None,
            parent_id: None,
            spec: JobSpec::Discovery(DiscoverySpec {
                integration_id: format!("i-{id}"),
                integration_type: "aws_cloud_account".into(),
                resource_type: resource_type.into(),
                ..Default::default()
            }),
        }
    }

    fn query(id: i64) -> JobRecord {
        let mut job = discovery(id, "-");
        job.category = JobCategory::QueryRunner;
        job.spec = JobSpec::QueryRunner(QueryRunSpec::default());
        job
    }

    fn by_type(job: &JobRecord) -> Option<String> {
        job.spec.resource_type().map(str::to_string)
    }

    fn ids(jobs: &[JobRecord]) -> Vec<i64> {
        jobs.iter().map(|j| j.id.0).collect()
    }

    #[test]
    fn test_rate_limit_table_default_and_overrides() {
        let table = RateLimitTable::default();
        assert_eq!(table.limit("AWS::EC2::Instance"), 25);
        assert_eq!(table.limit("AWS::CostExplorer::ByServiceDaily"), 1);

        let table = table
            .merge_overrides("AWS::EC2::Instance=3, AWS::Health::Event=1")
            .unwrap();
        assert_eq!(table.limit("AWS::EC2::Instance"), 3);
        assert_eq!(table.limit("AWS::Health::Event"), 1);

        assert!(RateLimitTable::default().merge_overrides("oops").is_err());
        assert!(RateLimitTable::default().merge_overrides("a=b").is_err());
    }

    #[test]
    fn test_blocked_when_queued_at_ceiling() {
        let governor = Governor::new(GovernorConfig {
            max_queued: 10,
            ..Default::default()
        });
        let snapshot = GovernorSnapshot {
            queued: 10,
            ..Default::default()
        };

        let decision = governor.plan(
            JobCategory::QueryRunner,
            vec![query(1)],
            &snapshot,
            |_| None,
        );
        assert_eq!(decision.blocked_by(), Some(Ceiling::MaxQueued));
        assert!(matches!(decision, GovernorDecision::Blocked { .. }));
    }

    #[test]
    fn test_headroom_truncates_batch() {
        let governor = Governor::new(GovernorConfig {
            max_queued: 3,
            ..Default::default()
        });

        let decision = governor.plan(
            JobCategory::QueryRunner,
            (1..=5).map(query).collect(),
            &GovernorSnapshot {
                queued: 1,
                ..Default::default()
            },
            |_| None,
        );

        let GovernorDecision::Admit {
            admitted,
            deferred,
            throttled_by,
        } = decision
        else {
            panic!("expected admission");
        };
        assert_eq!(ids(&admitted), vec![1, 2]);
        assert_eq!(ids(&deferred), vec![3, 4, 5]);
        assert_eq!(throttled_by, Some(Ceiling::MaxQueued));
    }

    #[test]
    fn test_window_ceiling_is_tighter() {
        let governor = Governor::new(GovernorConfig {
            max_queued: 100,
            max_in_window: 4,
            ..Default::default()
        });
        let decision = governor.plan(
            JobCategory::QueryRunner,
            (1..=5).map(query).collect(),
            &GovernorSnapshot {
                queued: 0,
                queued_in_window: 2,
                ..Default::default()
            },
            |_| None,
        );
        assert_eq!(decision.blocked_by(), Some(Ceiling::MaxInWindow));
    }

    #[test]
    fn test_per_type_cap_counts_running_and_admitted() {
        let governor = Governor::new(GovernorConfig {
            rate_limits: RateLimitTable::with_default(25)
                .with_limit("AWS::Health::Event", 2),
            ..Default::default()
        });
        let snapshot = GovernorSnapshot {
            running: HashMap::from([("AWS::Health::Event".to_string(), 1)]),
            ..Default::default()
        };
        let candidates = vec![
            discovery(1, "AWS::Health::Event"),
            discovery(2, "AWS::Health::Event"),
            discovery(3, "AWS::S3::Bucket"),
            discovery(4, "AWS::Health::Event"),
        ];

        let GovernorDecision::Admit {
            admitted,
            deferred,
            throttled_by,
        } = governor.plan(JobCategory::Discovery, candidates, &snapshot, by_type)
        else {
            panic!("expected admission");
        };

        assert_eq!(ids(&admitted), vec![1, 3]);
        assert_eq!(ids(&deferred), vec![2, 4]);
        assert_eq!(throttled_by, None);
    }
}
