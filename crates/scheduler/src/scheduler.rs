use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use common::Id;
use dashmap::DashMap;
use models::{RunStatus, StrategyRequest};
use parking_lot::{Mutex, RwLock};
use streams::{MessageStream, StreamMessage};
use tokio_util::sync::CancellationToken;

use crate::node_manager::NodeManager;
use crate::strategy::StrategyChain;

/// Runtime-tunable fallback-loop knobs (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stale_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Outcome of one `schedule_run_by_id` call, surfaced for logging and
/// for tests asserting on scenario behavior (SPEC_FULL.md §8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Assigned { node_id: Id, reason: &'static str },
    Skipped(&'static str),
}

/// Owns the primary (blocking-consume) and fallback (periodic-scan)
/// loops that drive `queued` Runs to `assigned` (SPEC_FULL.md §4.1).
pub struct Scheduler {
    node_id: String,
    consumer_group: String,
    store: Arc<dyn store::Store>,
    scheduler_stream: Arc<dyn MessageStream>,
    node_stream_factory: Box<dyn Fn(Id) -> Arc<dyn MessageStream> + Send + Sync>,
    node_streams: DashMap<Id, Arc<dyn MessageStream>>,
    node_manager: Arc<NodeManager>,
    strategy_chain: RwLock<Arc<StrategyChain>>,
    fallback: RwLock<FallbackConfig>,
    read_batch_size: usize,
    read_timeout: Duration,
    offline_requeue_threshold: Duration,
    running: Mutex<bool>,
    stop_token: Mutex<Option<CancellationToken>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        consumer_group: String,
        store: Arc<dyn store::Store>,
        scheduler_stream: Arc<dyn MessageStream>,
        node_stream_factory: Box<dyn Fn(Id) -> Arc<dyn MessageStream> + Send + Sync>,
        node_manager: Arc<NodeManager>,
        strategy_chain: StrategyChain,
        fallback: FallbackConfig,
        read_batch_size: usize,
        read_timeout: Duration,
        offline_requeue_threshold: Duration,
    ) -> Self {
        Self {
            node_id,
            consumer_group,
            store,
            scheduler_stream,
            node_stream_factory,
            node_streams: DashMap::new(),
            node_manager,
            strategy_chain: RwLock::new(Arc::new(strategy_chain)),
            fallback: RwLock::new(fallback),
            read_batch_size,
            read_timeout,
            offline_requeue_threshold,
            running: Mutex::new(false),
            stop_token: Mutex::new(None),
        }
    }

    /// Idempotent: starting while already running is a no-op. Blocks
    /// until `ctx` is cancelled or `stop` is called.
    pub async fn start(self: &Arc<Self>, ctx: CancellationToken) -> Result<()> {
        {
            let mut running = self.running.lock();
            if *running {
                return Ok(());
            }
            *running = true;
        }

        if let Err(e) = self.scheduler_stream.ensure_consumer_group(&self.consumer_group).await {
            tracing::warn!(error = %e, "failed to create scheduler stream consumer group");
        }

        let stop_token = ctx.child_token();
        *self.stop_token.lock() = Some(stop_token.clone());

        let primary = tokio::spawn({
            let this = Arc::clone(self);
            let token = stop_token.clone();
            async move { this.run_primary_loop(token).await }
        });
        let fallback = tokio::spawn({
            let this = Arc::clone(self);
            let token = stop_token.clone();
            async move { this.run_fallback_loop(token).await }
        });

        let _ = tokio::join!(primary, fallback);
        *self.running.lock() = false;
        Ok(())
    }

    /// Signals both loops. Safe to call concurrently; a second call is
    /// a no-op.
    pub fn stop(&self) {
        if let Some(token) = self.stop_token.lock().take() {
            token.cancel();
        }
    }

    /// Zero values leave the current value unchanged.
    pub fn set_fallback_config(&self, interval: Duration, stale_threshold: Duration) {
        let mut cfg = self.fallback.write();
        if !interval.is_zero() {
            cfg.interval = interval;
        }
        if !stale_threshold.is_zero() {
            cfg.stale_threshold = stale_threshold;
        }
    }

    /// Hot-swaps the strategy chain. Each in-flight scheduling
    /// iteration observes a single snapshot of the chain for the
    /// duration of that iteration (SPEC_FULL.md §5).
    pub fn set_strategy_chain(&self, chain: StrategyChain) {
        *self.strategy_chain.write() = Arc::new(chain);
    }

    /// The algorithm both loops funnel into. Idempotent with respect to
    /// already-assigned or terminal Runs (SPEC_FULL.md §4.1).
    pub async fn schedule_run_by_id(&self, run_id: Id) -> Result<ScheduleOutcome> {
        let span = tracing::info_span!("schedule_run", run_id = %run_id);
        let _enter = span.enter();
        let started = Instant::now();

        let Some(run) = self.store.get_run(run_id).await? else {
            tracing::debug!("run not found, treating as success");
            return Ok(ScheduleOutcome::Skipped("run_not_found"));
        };

        if run.status != RunStatus::Queued {
            tracing::debug!(status = %run.status, "run not queued, skipping");
            return Ok(ScheduleOutcome::Skipped("not_queued"));
        }

        let candidates = self.node_manager.list_online_nodes().await;
        if candidates.is_empty() {
            tracing::debug!("no online candidates, run stays queued");
            return Ok(ScheduleOutcome::Skipped("no_candidates"));
        }

        let online_ids: HashSet<Id> = candidates.iter().map(|n| n.id).collect();

        match self
            .node_manager
            .requeue_runs_assigned_to_offline_nodes(&online_ids, self.offline_requeue_threshold)
            .await
        {
            Ok(0) => {}
            Ok(reclaimed) => tracing::info!(reclaimed, "requeue pass reclaimed stranded runs"),
            Err(e) => tracing::warn!(error = %e, "requeue pass failed"),
        }

        self.node_manager.refresh_running_count(&candidates).await;
        let running_counts = self.node_manager.get_node_running();

        let preferred_node_id = self.node_manager.resolve_preferred_node_id(&run).await;

        let task = match run.task_id {
            Some(task_id) => match self.store.get_task(task_id).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load task, treating as absent");
                    None
                }
            },
            None => None,
        };

        let request = StrategyRequest {
            run: run.clone(),
            task,
            candidate_nodes: candidates,
            running_counts,
            preferred_node_id,
        };

        let chain = self.strategy_chain.read().clone();
        let (selected, reason) = chain.select_node(&request);

        let Some(node) = selected else {
            tracing::info!(reason, "no strategy matched, run stays queued");
            return Ok(ScheduleOutcome::Skipped(reason));
        };

        let applied = self
            .store
            .update_run_status(run_id, RunStatus::Queued, RunStatus::Assigned, Some(node.id))
            .await?;
        if !applied {
            tracing::debug!("run changed status before commit, another scheduler won the race");
            return Ok(ScheduleOutcome::Skipped("lost_race"));
        }

        let message = StreamMessage {
            message_id: Id::new().to_string(),
            run_id,
            task_id: run.task_id,
            created_at: Utc::now(),
        };
        if let Err(e) = self.node_stream(node.id).publish(message).await {
            tracing::warn!(node_id = %node.id, error = %e, "failed to publish dispatch message; requeue path is the safety net");
        }

        self.node_manager.increment_running(node.id);

        tracing::info!(
            node_id = %node.id,
            reason,
            duration_ms = started.elapsed().as_millis() as u64,
            "run assigned"
        );
        Ok(ScheduleOutcome::Assigned { node_id: node.id, reason })
    }

    fn node_stream(&self, node_id: Id) -> Arc<dyn MessageStream> {
        self.node_streams
            .entry(node_id)
            .or_insert_with(|| (self.node_stream_factory)(node_id))
            .clone()
    }

    async fn run_primary_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                result = self.scheduler_stream.blocking_pop(
                    &self.consumer_group,
                    &self.node_id,
                    self.read_batch_size,
                    self.read_timeout,
                ) => result,
            };

            match batch {
                Ok(messages) => {
                    for (delivery_id, message) in messages {
                        let delay_ms = Utc::now()
                            .signed_duration_since(message.created_at)
                            .num_milliseconds()
                            .max(0);
                        let started = Instant::now();
                        match self.schedule_run_by_id(message.run_id).await {
                            Ok(outcome) => tracing::info!(
                                run_id = %message.run_id,
                                delay_ms,
                                duration_ms = started.elapsed().as_millis() as u64,
                                outcome = ?outcome,
                                "processed scheduling message"
                            ),
                            Err(e) => tracing::warn!(run_id = %message.run_id, error = %e, "schedule_run_by_id failed"),
                        }
                        if let Err(e) = self.scheduler_stream.ack(&self.consumer_group, &delivery_id).await {
                            tracing::warn!(delivery_id, error = %e, "failed to ack message");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "scheduler stream read failed, retrying in 1s");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    async fn run_fallback_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let stale_threshold = self.fallback.read().stale_threshold;
            match self.store.list_stale_queued_runs(stale_threshold).await {
                Ok(runs) => {
                    for run in runs {
                        if token.is_cancelled() {
                            break;
                        }
                        if let Err(e) = self.schedule_run_by_id(run.id).await {
                            tracing::warn!(run_id = %run.id, error = %e, "fallback scheduling failed");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "fallback scan failed"),
            }

            let interval = self.fallback.read().interval;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
