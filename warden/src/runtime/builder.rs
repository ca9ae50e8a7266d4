use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::catalog::{ControlCatalog, IntegrationDirectory};
use crate::compliance::ComplianceCoordinator;
use crate::config::WardenConfig;
use crate::describe_service::DescribeService;
use crate::dispatch::JobContext;
use crate::events::InProcEventBus;
use crate::handlers::{
    AuditHandler, DiscoveryHandler, QueryRunHandler, QueryValidateHandler,
    RunnerHandler, SummarizerHandler,
};
use crate::index::ResourceIndex;
use crate::queue::WorkQueue;
use crate::quickscan::QuickScanWorkflow;
use crate::sequencer::JobSequencerService;
use crate::settings::{MetadataRefresher, MetadataSource, fixed_intervals};
use crate::store::{JobStore, WorkflowStore};
use crate::timeouts::TimeoutSweeper;
use crate::triggers::{JobScheduler, ScheduledTriggers};

use super::ShutdownToken;
use super::supervisor::{Handlers, WardenRuntime};

/// Builder for a [`WardenRuntime`] with explicit collaborators.
///
/// Store, workflow store, queue, integration directory and catalog are
/// required. Without an index, stale resources are never deleted and the
/// sequencer skips its consistency check. Without a metadata source the
/// configured intervals never change.
///
/// # Example
///
/// ```ignore
/// let runtime = WardenRuntimeBuilder::new(config)
///     .with_store(store.clone())
///     .with_workflows(store)
///     .with_queue(queue)
///     .with_integrations(catalog.clone())
///     .with_catalog(catalog)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct WardenRuntimeBuilder {
    config: WardenConfig,
    store: Option<Arc<dyn JobStore>>,
    workflows: Option<Arc<dyn WorkflowStore>>,
    queue: Option<Arc<dyn WorkQueue>>,
    integrations: Option<Arc<dyn IntegrationDirectory>>,
    catalog: Option<Arc<dyn ControlCatalog>>,
    index: Option<Arc<dyn ResourceIndex>>,
    metadata: Option<Box<dyn MetadataSource>>,
    events: Option<InProcEventBus>,
}

impl fmt::Debug for WardenRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WardenRuntimeBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("workflows_set", &self.workflows.is_some())
            .field("queue_set", &self.queue.is_some())
            .field("integrations_set", &self.integrations.is_some())
            .field("catalog_set", &self.catalog.is_some())
            .field("index_set", &self.index.is_some())
            .field("metadata_set", &self.metadata.is_some())
            .field("events", &self.events)
            .finish()
    }
}

impl WardenRuntimeBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            store: None,
            workflows: None,
            queue: None,
            integrations: None,
            catalog: None,
            index: None,
            metadata: None,
            events: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_workflows(mut self, workflows: Arc<dyn WorkflowStore>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_integrations(
        mut self,
        integrations: Arc<dyn IntegrationDirectory>,
    ) -> Self {
        self.integrations = Some(integrations);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ControlCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn ResourceIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_metadata_source(mut self, source: Box<dyn MetadataSource>) -> Self {
        self.metadata = Some(source);
        self
    }

    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Wire every component.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<WardenRuntime> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let workflows = self
            .workflows
            .ok_or_else(|| anyhow::anyhow!("workflows dependency missing"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let integrations = self
            .integrations
            .ok_or_else(|| anyhow::anyhow!("integrations dependency missing"))?;
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("catalog dependency missing"))?;
        let config = self.config;
        let events = self.events.unwrap_or_default();

        let ctx = JobContext::new(Arc::clone(&store)).with_events(events.clone());
        let sweeper = TimeoutSweeper::new(Arc::clone(&store), config.timeouts.clone())
            .with_events(events.clone());

        let mut discovery = DiscoveryHandler::new(Arc::clone(&integrations));
        if let Some(index) = &self.index {
            discovery = discovery
                .with_index(Arc::clone(index), config.consumer.delete_old_resources);
        }
        let handlers = Handlers {
            discovery: Arc::new(discovery),
            runner: Arc::new(RunnerHandler::new(Arc::clone(&catalog))),
            summarizer: Arc::new(SummarizerHandler::new()),
            query_run: Arc::new(QueryRunHandler::new(Arc::clone(&catalog))),
            query_validate: Arc::new(QueryValidateHandler::new(Arc::clone(&catalog))),
            audit: Arc::new(AuditHandler::audit(Arc::clone(&catalog))),
            quick_run: Arc::new(AuditHandler::quick_run(Arc::clone(&catalog))),
        };

        let coordinator = ComplianceCoordinator::new(
            ctx.clone(),
            Arc::clone(&catalog),
            config.compliance.clone(),
        )
        .with_sweeper(sweeper.clone());

        let mut sequencer = JobSequencerService::new(
            ctx.clone(),
            Arc::clone(&workflows),
            config.sequencer.clone(),
        )
        .with_coordinator(coordinator.clone());
        if let Some(index) = &self.index {
            sequencer = sequencer.with_index(Arc::clone(index));
        }

        let quick_scan = QuickScanWorkflow::new(
            ctx.clone(),
            Arc::clone(&workflows),
            Arc::clone(&integrations),
            Arc::clone(&catalog),
            config.quick_scan.clone(),
        );

        let (refresher, intervals) = match self.metadata {
            Some(source) => {
                let refresher = MetadataRefresher::new(source, config.intervals);
                let intervals = refresher.subscribe();
                (Some(refresher), intervals)
            }
            None => (None, fixed_intervals(config.intervals)),
        };
        let triggers = ScheduledTriggers::new(
            ctx.clone(),
            Arc::clone(&integrations),
            Arc::clone(&catalog),
            intervals,
        );

        let scheduler = JobScheduler::new(
            ctx.clone(),
            workflows,
            Arc::clone(&queue),
            integrations,
            catalog,
            sequencer.clone(),
            quick_scan.clone(),
            coordinator.clone(),
        );
        let describe = DescribeService::new(Arc::clone(&handlers.discovery), ctx.clone());

        Ok(WardenRuntime {
            config,
            ctx,
            events,
            queue,
            sweeper,
            handlers,
            coordinator,
            sequencer,
            quick_scan,
            triggers,
            scheduler,
            describe,
            refresher: Mutex::new(refresher),
            shutdown_token: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }
}
