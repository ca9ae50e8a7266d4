use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::job::{JobCategory, JobId, JobRecord, JobSpec, JobStatus, NewJob};
use crate::store::{
    AgeBasis, DiscoveryCreate, IntegrationDiscovery, JobFilter, JobPage,
    JobPatch, JobSequencer, JobStore, NewQuickScan, NewSequencer,
    QuickScanPatch, QuickScanSequence, QuickScanStatus, RetryRule, SortField,
    SortOrder, SequencerStatus, SweepRule, Transition, WorkflowStore,
};

const UNIQUE_VIOLATION: &str = "23505";

const JOB_COLUMNS: &str = "id, category, status, trigger_type, created_by, \
    parent_id, retry_count, failure_message, error_code, queue_sequence, \
    queued_at, spec, created_at, updated_at";

/// PostgreSQL-backed job and workflow store.
///
/// Every status change is a single `UPDATE ... WHERE status = ANY(...)`,
/// so the row count tells the caller whether it won.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn statuses(statuses: &[JobStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }

    fn ids(ids: &[JobId]) -> Vec<i64> {
        ids.iter().map(|id| id.0).collect()
    }

    fn job_from_row(row: &PgRow) -> anyhow::Result<JobRecord> {
        let category: String = row.try_get("category")?;
        let status: String = row.try_get("status")?;
        let trigger_type: String = row.try_get("trigger_type")?;
        let spec: serde_json::Value = row.try_get("spec")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let queue_sequence: Option<i64> = row.try_get("queue_sequence")?;
        let parent_id: Option<i64> = row.try_get("parent_id")?;

        Ok(JobRecord {
            id: JobId(row.try_get("id")?),
            category: category.parse()?,
            status: status.parse()?,
            trigger_type: trigger_type.parse()?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            queued_at: row.try_get("queued_at")?,
            retry_count: u32::try_from(retry_count).unwrap_or_default(),
            failure_message: row.try_get("failure_message")?,
            error_code: row.try_get("error_code")?,
            queue_sequence: queue_sequence.map(|seq| seq as u64),
            parent_id: parent_id.map(JobId),
            spec: serde_json::from_value::<JobSpec>(spec)
                .context("decoding job spec")?,
        })
    }

    fn sequencer_from_row(row: &PgRow) -> anyhow::Result<JobSequencer> {
        let dependency_source: String = row.try_get("dependency_source")?;
        let next_job: String = row.try_get("next_job")?;
        let status: String = row.try_get("status")?;
        let dependency_list: Vec<i64> = row.try_get("dependency_list")?;
        let next_job_ids: Vec<i64> = row.try_get("next_job_ids")?;

        Ok(JobSequencer {
            id: row.try_get("id")?,
            dependency_source: dependency_source.parse()?,
            dependency_list: dependency_list.into_iter().map(JobId).collect(),
            next_job: next_job.parse()?,
            next_job_parameters: row.try_get("next_job_parameters")?,
            next_job_ids: next_job_ids.into_iter().map(JobId).collect(),
            status: status.parse()?,
            failure_message: row.try_get("failure_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn quick_scan_from_row(row: &PgRow) -> anyhow::Result<QuickScanSequence> {
        let status: String = row.try_get("status")?;
        let discovery_job_ids: Vec<i64> = row.try_get("discovery_job_ids")?;
        let compliance_job_ids: Vec<i64> = row.try_get("compliance_job_ids")?;

        Ok(QuickScanSequence {
            id: row.try_get("id")?,
            framework_id: row.try_get("framework_id")?,
            integration_ids: row.try_get("integration_ids")?,
            include_results: row.try_get("include_results")?,
            status: status.parse()?,
            failure_message: row.try_get("failure_message")?,
            discovery_job_ids: discovery_job_ids.into_iter().map(JobId).collect(),
            compliance_job_ids: compliance_job_ids
                .into_iter()
                .map(JobId)
                .collect(),
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn insert_job<'e, E>(executor: E, job: &NewJob) -> Result<JobRecord, InsertError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let spec = serde_json::to_value(&job.spec).map_err(anyhow::Error::from)?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO warden_jobs (
                category, status, trigger_type, created_by, parent_id,
                integration_id, resource_type, benchmark_id, spec
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.category().as_str())
        .bind(job.status.as_str())
        .bind(job.trigger_type.as_str())
        .bind(&job.created_by)
        .bind(job.parent_id.map(|id| id.0))
        .bind(job.spec.integration_id())
        .bind(job.spec.resource_type())
        .bind(job.spec.benchmark_id())
        .bind(&spec)
        .fetch_one(executor)
        .await;

        match row {
            Ok(row) => Ok(Self::job_from_row(&row)?),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(InsertError::Conflict)
            }
            Err(err) => Err(InsertError::Other(err.into())),
        }
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
        builder.push(" WHERE TRUE");
        if !filter.categories.is_empty() {
            let categories: Vec<String> = filter
                .categories
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();
            builder.push(" AND category = ANY(").push_bind(categories).push(")");
        }
        if !filter.statuses.is_empty() {
            builder
                .push(" AND status = ANY(")
                .push_bind(Self::statuses(&filter.statuses))
                .push(")");
        }
        if !filter.trigger_types.is_empty() {
            let triggers: Vec<String> = filter
                .trigger_types
                .iter()
                .map(|t| t.as_str().to_string())
                .collect();
            builder.push(" AND trigger_type = ANY(").push_bind(triggers).push(")");
        }
        if let Some(integration_id) = &filter.integration_id {
            builder.push(" AND integration_id = ").push_bind(integration_id.clone());
        }
        if let Some(resource_type) = &filter.resource_type {
            builder.push(" AND resource_type = ").push_bind(resource_type.clone());
        }
        if let Some(benchmark_id) = &filter.benchmark_id {
            builder.push(" AND benchmark_id = ").push_bind(benchmark_id.clone());
        }
        if let Some(parent_id) = filter.parent_id {
            builder.push(" AND parent_id = ").push_bind(parent_id.0);
        }
        if let Some(created_by) = &filter.created_by {
            builder.push(" AND created_by = ").push_bind(created_by.clone());
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at < ").push_bind(before);
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum InsertError {
    #[error("job conflicts with an active job")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<JobRecord> {
        Ok(Self::insert_job(&self.pool, &job).await?)
    }

    async fn create_jobs(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<JobRecord>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in &jobs {
            out.push(Self::insert_job(&mut *tx, job).await?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn create_discovery_job(&self, job: NewJob) -> anyhow::Result<DiscoveryCreate> {
        match Self::insert_job(&self.pool, &job).await {
            Ok(record) => Ok(DiscoveryCreate::Created(record)),
            Err(InsertError::Conflict) => {
                let row = sqlx::query(&format!(
                    r#"
                    SELECT {JOB_COLUMNS}
                    FROM warden_jobs
                    WHERE category = 'discovery'
                      AND integration_id = $1
                      AND resource_type = $2
                      AND status = ANY($3)
                    ORDER BY id DESC
                    LIMIT 1
                    "#
                ))
                .bind(job.spec.integration_id())
                .bind(job.spec.resource_type())
                .bind(Self::statuses(&JobStatus::ACTIVE))
                .fetch_one(&self.pool)
                .await?;
                Ok(DiscoveryCreate::AlreadyActive(Self::job_from_row(&row)?))
            }
            Err(InsertError::Other(err)) => Err(err),
        }
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM warden_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn get_jobs(&self, ids: &[JobId]) -> anyhow::Result<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM warden_jobs WHERE id = ANY($1) ORDER BY id"
        ))
        .bind(Self::ids(ids))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<JobPage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM warden_jobs");
        Self::push_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut select =
            QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM warden_jobs"));
        Self::push_filter(&mut select, filter);
        let column = match filter.sort_by {
            SortField::Id => "id",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Status => "status",
        };
        let order = match filter.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        select.push(format!(" ORDER BY {column} {order}, id {order}"));
        if let Some(limit) = filter.limit {
            select.push(" LIMIT ").push_bind(limit as i64);
        }
        select.push(" OFFSET ").push_bind(filter.offset as i64);

        let rows = select.build().fetch_all(&self.pool).await?;
        Ok(JobPage {
            total: total as u64,
            jobs: rows.iter().map(Self::job_from_row).collect::<anyhow::Result<_>>()?,
        })
    }

    async fn fetch_created(
        &self,
        category: JobCategory,
        limit: usize,
        randomize: bool,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let order = if randomize { "random()" } else { "id ASC" };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM warden_jobs
            WHERE category = $1 AND status = 'created'
            ORDER BY {order}
            LIMIT $2
            "#
        ))
        .bind(category.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn transition(&self, id: JobId, transition: &Transition) -> anyhow::Result<bool> {
        if transition.from.is_empty() {
            return Ok(false);
        }
        let patch = &transition.patch;
        let result = sqlx::query(
            r#"
            UPDATE warden_jobs
            SET status = $4,
                failure_message = COALESCE($5, failure_message),
                error_code = COALESCE($6, error_code),
                spec = spec || $7::jsonb,
                updated_at = NOW()
            WHERE id = $1
              AND category = $2
              AND status = ANY($3)
            "#,
        )
        .bind(id.0)
        .bind(transition.category.as_str())
        .bind(Self::statuses(&transition.from))
        .bind(transition.to.as_str())
        .bind(&patch.failure_message)
        .bind(&patch.error_code)
        .bind(serde_json::Value::Object(patch.spec_fields.clone()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn patch_job(
        &self,
        id: JobId,
        statuses: &[JobStatus],
        patch: &JobPatch,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE warden_jobs
            SET failure_message = COALESCE($3, failure_message),
                error_code = COALESCE($4, error_code),
                spec = spec || $5::jsonb,
                updated_at = NOW()
            WHERE id = $1
              AND status = ANY($2)
            "#,
        )
        .bind(id.0)
        .bind(Self::statuses(statuses))
        .bind(&patch.failure_message)
        .bind(&patch.error_code)
        .bind(serde_json::Value::Object(patch.spec_fields.clone()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_queued(&self, id: JobId, sequence: u64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE warden_jobs
            SET status = 'queued',
                queue_sequence = $2,
                queued_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'created'
            "#,
        )
        .bind(id.0)
        .bind(sequence as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_in_status(
        &self,
        category: JobCategory,
        statuses: &[JobStatus],
    ) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warden_jobs WHERE category = $1 AND status = ANY($2)",
        )
        .bind(category.as_str())
        .bind(Self::statuses(statuses))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_queued_since(
        &self,
        category: JobCategory,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warden_jobs WHERE category = $1 AND queued_at >= $2",
        )
        .bind(category.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn running_by_resource_type(&self) -> anyhow::Result<HashMap<String, u64>> {
        let rows = sqlx::query(
            r#"
            SELECT resource_type, COUNT(*) AS running
            FROM warden_jobs
            WHERE category = 'discovery'
              AND status IN ('queued', 'in_progress')
              AND resource_type IS NOT NULL
            GROUP BY resource_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let resource_type: String = row.try_get("resource_type")?;
            let running: i64 = row.try_get("running")?;
            out.insert(resource_type, running as u64);
        }
        Ok(out)
    }

    async fn sweep(&self, rule: &SweepRule) -> anyhow::Result<u64> {
        let column = match rule.basis {
            AgeBasis::CreatedAt => "created_at",
            AgeBasis::UpdatedAt => "updated_at",
        };
        let result = sqlx::query(&format!(
            r#"
            UPDATE warden_jobs
            SET status = $3,
                failure_message = $4,
                updated_at = NOW()
            WHERE category = $1
              AND status = ANY($2)
              AND {column} < $5
            "#
        ))
        .bind(rule.category.as_str())
        .bind(Self::statuses(&rule.statuses))
        .bind(rule.to.as_str())
        .bind(&rule.message)
        .bind(rule.cutoff(Utc::now()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            debug!(
                category = %rule.category,
                to = %rule.to,
                count = result.rows_affected(),
                "swept jobs"
            );
        }
        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, rule: &RetryRule) -> anyhow::Result<u64> {
        // A discovery is only retried while it is the newest row for its
        // (integration, resource type) and nothing else is active for it.
        // A runner only while its parent still collects runners.
        let result = sqlx::query(
            r#"
            UPDATE warden_jobs j
            SET status = 'created',
                retry_count = retry_count + 1,
                failure_message = NULL,
                error_code = NULL,
                queue_sequence = NULL,
                queued_at = NULL,
                updated_at = NOW()
            WHERE j.category = $1
              AND j.status = ANY($2)
              AND j.updated_at < $3
              AND j.retry_count < $4
              AND (j.error_code IS NULL OR NOT (j.error_code = ANY($5)))
              AND (
                  j.category <> 'discovery'
                  OR NOT EXISTS (
                      SELECT 1
                      FROM warden_jobs s
                      WHERE s.category = 'discovery'
                        AND s.id <> j.id
                        AND s.integration_id = j.integration_id
                        AND s.resource_type = j.resource_type
                        AND (s.status = ANY($6) OR s.id > j.id)
                  )
              )
              AND (
                  j.category <> 'compliance_runner'
                  OR j.parent_id IS NULL
                  OR EXISTS (
                      SELECT 1
                      FROM warden_jobs p
                      WHERE p.id = j.parent_id
                        AND p.status = 'runners_in_progress'
                  )
              )
            "#,
        )
        .bind(rule.category.as_str())
        .bind(Self::statuses(&rule.statuses))
        .bind(Utc::now() - rule.cooldown)
        .bind(rule.max_retries as i32)
        .bind(&rule.excluded_error_codes)
        .bind(Self::statuses(&JobStatus::ACTIVE))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_pending_children(
        &self,
        parent: JobId,
        category: JobCategory,
    ) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM warden_jobs
            WHERE parent_id = $1
              AND category = $2
              AND NOT (status = ANY($3))
            "#,
        )
        .bind(parent.0)
        .bind(category.as_str())
        .bind(Self::statuses(&JobStatus::TERMINAL))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    async fn create_sequencer(&self, sequencer: NewSequencer) -> anyhow::Result<JobSequencer> {
        let row = sqlx::query(
            r#"
            INSERT INTO warden_job_sequencers (
                dependency_source, dependency_list, next_job, next_job_parameters
            )
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(sequencer.dependency_source.as_str())
        .bind(Self::ids(&sequencer.dependency_list))
        .bind(sequencer.next_job.as_str())
        .bind(&sequencer.next_job_parameters)
        .fetch_one(&self.pool)
        .await?;
        Self::sequencer_from_row(&row)
    }

    async fn get_sequencer(&self, id: i64) -> anyhow::Result<Option<JobSequencer>> {
        let row = sqlx::query("SELECT * FROM warden_job_sequencers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::sequencer_from_row).transpose()
    }

    async fn list_waiting_sequencers(&self, limit: usize) -> anyhow::Result<Vec<JobSequencer>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM warden_job_sequencers
            WHERE status = $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(SequencerStatus::WaitingForDependencies.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::sequencer_from_row).collect()
    }

    async fn finish_sequencer(&self, id: i64, next_job_ids: &[JobId]) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE warden_job_sequencers
            SET status = 'finished', next_job_ids = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'waiting_for_dependencies'
            "#,
        )
        .bind(id)
        .bind(Self::ids(next_job_ids))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_sequencer(&self, id: i64, message: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE warden_job_sequencers
            SET status = 'failed', failure_message = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'waiting_for_dependencies'
            "#,
        )
        .bind(id)
        .bind(crate::job::sanitize_failure_message(message))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_quick_scan(&self, scan: NewQuickScan) -> anyhow::Result<QuickScanSequence> {
        let row = sqlx::query(
            r#"
            INSERT INTO warden_quick_scans (
                framework_id, integration_ids, include_results, created_by
            )
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&scan.framework_id)
        .bind(&scan.integration_ids)
        .bind(scan.include_results)
        .bind(&scan.created_by)
        .fetch_one(&self.pool)
        .await?;
        Self::quick_scan_from_row(&row)
    }

    async fn get_quick_scan(&self, id: i64) -> anyhow::Result<Option<QuickScanSequence>> {
        let row = sqlx::query("SELECT * FROM warden_quick_scans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::quick_scan_from_row).transpose()
    }

    async fn list_quick_scans(
        &self,
        status: QuickScanStatus,
        limit: usize,
    ) -> anyhow::Result<Vec<QuickScanSequence>> {
        let rows = sqlx::query(
            "SELECT * FROM warden_quick_scans WHERE status = $1 ORDER BY id LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::quick_scan_from_row).collect()
    }

    async fn advance_quick_scan(
        &self,
        id: i64,
        from: QuickScanStatus,
        to: QuickScanStatus,
        patch: &QuickScanPatch,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE warden_quick_scans
            SET status = $3,
                failure_message = COALESCE($4, failure_message),
                discovery_job_ids = COALESCE($5, discovery_job_ids),
                compliance_job_ids = COALESCE($6, compliance_job_ids),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(
            patch
                .failure_message
                .as_deref()
                .map(crate::job::sanitize_failure_message),
        )
        .bind(patch.discovery_job_ids.as_deref().map(Self::ids))
        .bind(patch.compliance_job_ids.as_deref().map(Self::ids))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_integration_discovery(
        &self,
        discovery: IntegrationDiscovery,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO warden_integration_discoveries (
                trigger_id, integration_id, resource_types, job_ids,
                triggered_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (trigger_id, integration_id) DO UPDATE
            SET resource_types = EXCLUDED.resource_types,
                job_ids = EXCLUDED.job_ids
            "#,
        )
        .bind(&discovery.trigger_id)
        .bind(&discovery.integration_id)
        .bind(&discovery.resource_types)
        .bind(Self::ids(&discovery.job_ids))
        .bind(&discovery.triggered_by)
        .bind(discovery.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_integration_discoveries(
        &self,
        trigger_id: &str,
    ) -> anyhow::Result<Vec<IntegrationDiscovery>> {
        let rows = sqlx::query(
            r#"
            SELECT trigger_id, integration_id, resource_types, job_ids,
                   triggered_by, created_at
            FROM warden_integration_discoveries
            WHERE trigger_id = $1
            ORDER BY integration_id
            "#,
        )
        .bind(trigger_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let job_ids: Vec<i64> = row.try_get("job_ids")?;
                Ok(IntegrationDiscovery {
                    trigger_id: row.try_get("trigger_id")?,
                    integration_id: row.try_get("integration_id")?,
                    resource_types: row.try_get("resource_types")?,
                    job_ids: job_ids.into_iter().map(JobId).collect(),
                    triggered_by: row.try_get("triggered_by")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DiscoverySpec, TriggerType};

    async fn store() -> PostgresStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        PostgresStore::new(pool)
    }

    fn discovery(integration_id: &str) -> NewJob {
        NewJob::new(
            JobSpec::Discovery(DiscoverySpec {
                integration_id: integration_id.to_string(),
                integration_type: "aws_cloud_account".into(),
                resource_type: "AWS::S3::Bucket".into(),
                ..Default::default()
            }),
            TriggerType::Manual,
        )
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_active_discovery_conflict_returns_existing() {
        let store = store().await;
        let integration = uuid::Uuid::new_v4().to_string();

        let DiscoveryCreate::Created(first) =
            store.create_discovery_job(discovery(&integration)).await.unwrap()
        else {
            panic!("first job should be created");
        };
        let second = store.create_discovery_job(discovery(&integration)).await.unwrap();
        assert_eq!(second, DiscoveryCreate::AlreadyActive(first));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_guarded_transition_has_one_winner() {
        let store = store().await;
        let job = store
            .create_job(discovery(&uuid::Uuid::new_v4().to_string()))
            .await
            .unwrap();
        assert!(store.mark_queued(job.id, 42).await.unwrap());
        assert!(!store.mark_queued(job.id, 43).await.unwrap());

        let finish = Transition::new(
            JobCategory::Discovery,
            &[JobStatus::Queued, JobStatus::InProgress],
            JobStatus::Succeeded,
        )
        .with_patch(JobPatch::default().field("described_resource_count", 3u64));
        assert!(store.transition(job.id, &finish).await.unwrap());
        assert!(!store.transition(job.id, &finish).await.unwrap());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.queue_sequence, Some(42));
        assert_eq!(
            stored.spec.as_discovery().unwrap().described_resource_count,
            Some(3)
        );
    }
}
