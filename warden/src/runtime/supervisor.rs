use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::compliance::ComplianceCoordinator;
use crate::config::WardenConfig;
use crate::consumer::ResultConsumer;
use crate::describe_service::DescribeService;
use crate::dispatch::{DispatchLoop, Dispatchable, JobContext};
use crate::events::InProcEventBus;
use crate::governor::Governor;
use crate::handlers::{
    AuditHandler, DiscoveryHandler, QueryRunHandler, QueryValidateHandler,
    RunnerHandler, SummarizerHandler,
};
use crate::queue::WorkQueue;
use crate::quickscan::QuickScanWorkflow;
use crate::sequencer::JobSequencerService;
use crate::settings::MetadataRefresher;
use crate::timeouts::TimeoutSweeper;
use crate::triggers::{JobScheduler, ScheduledTriggers};

use super::{ShutdownToken, spawn_periodic};

/// One handler per dispatched category.
pub(crate) struct Handlers {
    pub discovery: Arc<DiscoveryHandler>,
    pub runner: Arc<RunnerHandler>,
    pub summarizer: Arc<SummarizerHandler>,
    pub query_run: Arc<QueryRunHandler>,
    pub query_validate: Arc<QueryValidateHandler>,
    pub audit: Arc<AuditHandler>,
    pub quick_run: Arc<AuditHandler>,
}

/// Every loop of the scheduler, hosted until shutdown.
pub struct WardenRuntime {
    pub(crate) config: WardenConfig,
    pub(crate) ctx: JobContext,
    pub(crate) events: InProcEventBus,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) sweeper: TimeoutSweeper,
    pub(crate) handlers: Handlers,
    pub(crate) coordinator: ComplianceCoordinator,
    pub(crate) sequencer: JobSequencerService,
    pub(crate) quick_scan: QuickScanWorkflow,
    pub(crate) triggers: ScheduledTriggers,
    pub(crate) scheduler: JobScheduler,
    pub(crate) describe: DescribeService,
    pub(crate) refresher: Mutex<Option<MetadataRefresher>>,
    pub(crate) shutdown_token: ShutdownToken,
    pub(crate) handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WardenRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WardenRuntime")
            .field("http_addr", &self.config.http_addr)
            .field("events", &self.events)
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WardenRuntime {
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn describe_service(&self) -> &DescribeService {
        &self.describe
    }

    pub fn events(&self) -> &InProcEventBus {
        &self.events
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Provision streams and spawn every loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut handles = Vec::new();

        self.spawn_category(Arc::clone(&self.handlers.discovery), &mut handles)
            .await?;
        self.spawn_category(Arc::clone(&self.handlers.runner), &mut handles)
            .await?;
        self.spawn_category(Arc::clone(&self.handlers.summarizer), &mut handles)
            .await?;
        self.spawn_category(Arc::clone(&self.handlers.query_run), &mut handles)
            .await?;
        self.spawn_category(Arc::clone(&self.handlers.query_validate), &mut handles)
            .await?;
        self.spawn_category(Arc::clone(&self.handlers.audit), &mut handles)
            .await?;
        self.spawn_category(Arc::clone(&self.handlers.quick_run), &mut handles)
            .await?;

        let coordinator = self.coordinator.clone();
        handles.push(spawn_periodic(
            "compliance",
            coordinator.config().poll_interval(),
            self.shutdown_token.clone(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    if let Err(err) = coordinator.run_cycle().await {
                        warn!(error = %err, "compliance cycle failed");
                    }
                }
            },
        ));
        handles.push(tokio::spawn(
            self.coordinator
                .clone()
                .observe(self.events.clone(), self.shutdown_token.clone()),
        ));

        let sequencer = self.sequencer.clone();
        handles.push(spawn_periodic(
            "sequencer",
            sequencer.config().poll_interval(),
            self.shutdown_token.clone(),
            move || {
                let sequencer = sequencer.clone();
                async move {
                    if let Err(err) = sequencer.run_cycle().await {
                        warn!(error = %err, "sequencer cycle failed");
                    }
                }
            },
        ));

        let quick_scan = self.quick_scan.clone();
        handles.push(spawn_periodic(
            "quick_scan",
            quick_scan.config().interval(),
            self.shutdown_token.clone(),
            move || {
                let quick_scan = quick_scan.clone();
                async move {
                    if let Err(err) = quick_scan.run_cycle().await {
                        warn!(error = %err, "quick scan cycle failed");
                    }
                }
            },
        ));

        let triggers = self.triggers.clone();
        handles.push(spawn_periodic(
            "triggers",
            Duration::from_secs(self.config.trigger_interval_secs),
            self.shutdown_token.clone(),
            move || {
                let triggers = triggers.clone();
                async move {
                    if let Err(err) = triggers.run_cycle().await {
                        warn!(error = %err, "scheduled trigger cycle failed");
                    }
                }
            },
        ));

        if let Some(refresher) = self.refresher.lock().await.take() {
            handles.push(tokio::spawn(refresher.run(
                Duration::from_secs(self.config.trigger_interval_secs),
                self.shutdown_token.clone(),
            )));
        }

        info!(tasks = handles.len(), "warden runtime started");
        self.handles.lock().await.extend(handles);
        Ok(())
    }

    async fn spawn_category<D>(
        &self,
        handler: Arc<D>,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> anyhow::Result<()>
    where
        D: Dispatchable + 'static,
    {
        let category = handler.category();
        let dispatch = Arc::new(DispatchLoop::new(
            Arc::clone(&handler),
            self.ctx.clone(),
            Arc::clone(&self.queue),
            Governor::new(self.config.governor.clone()),
            self.sweeper.clone(),
            self.config.dispatch.clone(),
        ));
        if let Err(err) = dispatch.provision().await {
            warn!(category = %category, error = %err, "stream provisioning failed; retrying on publish");
        }

        handles.push(spawn_periodic(
            "dispatch",
            self.config.dispatch.interval(),
            self.shutdown_token.clone(),
            move || {
                let dispatch = Arc::clone(&dispatch);
                async move {
                    match dispatch.run_cycle().await {
                        Ok(report) => debug!(category = %category, ?report, "dispatch cycle"),
                        Err(err) => warn!(category = %category, error = %err, "dispatch cycle failed"),
                    }
                }
            },
        ));

        let consumer = ResultConsumer::new(
            handler,
            self.ctx.clone(),
            Arc::clone(&self.queue),
            self.config.consumer.clone(),
        );
        let shutdown = self.shutdown_token.clone();
        let idle = self.config.consumer.idle_poll();
        let span = tracing::info_span!("warden.consumer", category = %category);
        handles.push(tokio::spawn(
            async move {
                loop {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let seen = match consumer.poll_once().await {
                        Ok(seen) => seen,
                        Err(err) => {
                            warn!(topic = consumer.topic(), error = %err, "result fetch failed");
                            0
                        }
                    };
                    if seen > 0 {
                        continue;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                info!("result consumer shutting down");
            }
            .instrument(span),
        ));
        Ok(())
    }

    /// Cancel every loop and wait for in-flight work to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("initiating graceful shutdown of warden runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = ?err, "runtime task failed"),
                Err(_) => warn!("runtime task timed out during shutdown"),
            }
        }

        info!("warden runtime shutdown complete");
        Ok(())
    }
}
