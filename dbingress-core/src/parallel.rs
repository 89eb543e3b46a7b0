//! Parallel execution pool.
//!
//! One feeder task reads the root table into a bounded queue, a fixed number
//! of workers each expand whole root rows with their own [`StepExecutor`], and
//! a collector task forwards finished rows to the exporter. Errors travel on a
//! third queue and are aggregated once every task has completed.
//!
//! Rows are exported in completion order, not in root read order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PullerConfig;
use crate::error::{IngressError, Result};
use crate::plan::Plan;
use crate::puller::{PullStats, Puller, StepExecutor, check_filter};
use crate::row::{Filter, Row};
use crate::source::{DataSource, RowExporter, SourceFeature};

/// Puller fanning root rows across a pool of workers.
///
/// The data source is opened once and shared by every worker, so it must
/// accept concurrent queries.
pub struct ParallelPuller {
    plan: Arc<Plan>,
    source: Arc<dyn DataSource>,
    exporter: Option<Box<dyn RowExporter>>,
    config: PullerConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ParallelPuller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelPuller")
            .field("start_table", &self.plan.start_table)
            .field("source", &self.source.kind())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ParallelPuller {
    /// Creates a pool pulling `plan` from `source` into `exporter`.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        plan: Arc<Plan>,
        source: Arc<dyn DataSource>,
        exporter: Box<dyn RowExporter>,
        config: PullerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if config.workers > 1 && !source.supports_feature(SourceFeature::ConcurrentQueries) {
            warn!(
                "{} does not advertise concurrent queries, {} workers may serialize on it",
                source.kind(),
                config.workers
            );
        }

        Ok(Self {
            plan,
            source,
            exporter: Some(exporter),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token stopping every running pull of this puller when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pool configuration
    pub fn config(&self) -> &PullerConfig {
        &self.config
    }
}

struct Outcome {
    stats: PullStats,
    errors: Vec<IngressError>,
    exporter: Option<Box<dyn RowExporter>>,
}

async fn run(
    plan: Arc<Plan>,
    source: Arc<dyn DataSource>,
    config: PullerConfig,
    filter: Filter,
    exporter: Box<dyn RowExporter>,
    cancel: CancellationToken,
) -> Outcome {
    let (row_tx, row_rx) = mpsc::channel::<Row>(config.channel_capacity);
    let (out_tx, out_rx) = mpsc::channel::<Row>(config.channel_capacity);
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<IngressError>();

    let feeder = tokio::spawn(feed(
        Arc::clone(&plan),
        Arc::clone(&source),
        filter,
        row_tx,
        err_tx.clone(),
        cancel.clone(),
    ));

    let row_rx = Arc::new(Mutex::new(row_rx));
    let mut workers = JoinSet::new();
    for id in 0..config.workers {
        workers.spawn(work(
            id,
            Arc::clone(&plan),
            Arc::clone(&source),
            Arc::clone(&row_rx),
            out_tx.clone(),
            err_tx.clone(),
            cancel.clone(),
            config.fail_fast,
        ));
    }
    drop(out_tx);

    let collector = tokio::spawn(collect(
        exporter,
        out_rx,
        err_tx.clone(),
        cancel.clone(),
        config.fail_fast,
    ));
    drop(err_tx);

    let mut stats = PullStats::new();
    let mut errors = Vec::new();

    match feeder.await {
        Ok(feeder_stats) => stats.merge(&feeder_stats),
        Err(e) => errors.push(IngressError::data_source("Feeder task terminated abnormally", e)),
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(worker_stats) => stats.merge(&worker_stats),
            Err(e) => errors.push(IngressError::data_source("Worker task terminated abnormally", e)),
        }
    }

    let exporter = match collector.await {
        Ok((exporter, exported)) => {
            stats.rows_exported = exported;
            Some(exporter)
        }
        Err(e) => {
            errors.push(IngressError::data_source("Collector task terminated abnormally", e));
            None
        }
    };

    while let Some(error) = err_rx.recv().await {
        errors.push(error);
    }

    Outcome {
        stats,
        errors,
        exporter,
    }
}

#[async_trait]
impl Puller for ParallelPuller {
    async fn pull(&mut self, filter: &Filter) -> Result<PullStats> {
        check_filter(filter, self.source.as_ref())?;
        let exporter = self
            .exporter
            .take()
            .ok_or_else(|| IngressError::configuration("exporter lost by a previous pull"))?;

        info!(
            "Pulling '{}' with {} step(s) from {} using {} worker(s)",
            self.plan.start_table,
            self.plan.len(),
            self.source.kind(),
            self.config.workers
        );

        if let Err(error) = self.source.open().await {
            self.exporter = Some(exporter);
            return Err(error);
        }

        // A child token so a fail-fast stop does not poison later pulls.
        let cancel = self.cancel.child_token();
        let Outcome {
            mut stats,
            errors,
            exporter,
        } = run(
            Arc::clone(&self.plan),
            Arc::clone(&self.source),
            self.config.clone(),
            filter.clone(),
            exporter,
            cancel.clone(),
        )
        .await;
        self.exporter = exporter;

        let closed = self.source.close().await;
        stats.finish();

        if !errors.is_empty() {
            warn!("Parallel pull failed with {} error(s)", errors.len());
            return Err(IngressError::Workers { errors });
        }
        if cancel.is_cancelled() {
            return Err(IngressError::Cancelled {
                reason: "pull cancelled before completion".to_string(),
            });
        }
        closed?;

        info!(
            "Parallel pull finished: {} row(s) exported, {} row(s) read in {} quer(ies), {} ms",
            stats.rows_exported, stats.rows_read, stats.queries, stats.duration_ms
        );
        Ok(stats)
    }
}

async fn feed(
    plan: Arc<Plan>,
    source: Arc<dyn DataSource>,
    filter: Filter,
    row_tx: mpsc::Sender<Row>,
    err_tx: mpsc::UnboundedSender<IngressError>,
    cancel: CancellationToken,
) -> PullStats {
    let executor = StepExecutor::new(&plan, source.as_ref());
    let mut stats = PullStats::new();

    let rows = match executor.read_root(&filter, &mut stats).await {
        Ok(rows) => rows,
        Err(error) => {
            let _ = err_tx.send(error);
            cancel.cancel();
            return stats;
        }
    };

    debug!("Feeding {} root row(s)", rows.len());
    for row in rows {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = row_tx.send(row) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    stats
}

#[allow(clippy::too_many_arguments)]
async fn work(
    id: usize,
    plan: Arc<Plan>,
    source: Arc<dyn DataSource>,
    row_rx: Arc<Mutex<mpsc::Receiver<Row>>>,
    out_tx: mpsc::Sender<Row>,
    err_tx: mpsc::UnboundedSender<IngressError>,
    cancel: CancellationToken,
    fail_fast: bool,
) -> PullStats {
    let executor = StepExecutor::new(&plan, source.as_ref());
    let mut stats = PullStats::new();
    let mut expanded = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            row = async { row_rx.lock().await.recv().await } => row,
        };
        let Some(row) = next else {
            break;
        };

        // A row already taken is finished even if a sibling fails meanwhile.
        match executor.expand_root(row, &mut stats).await {
            Ok(row) => {
                expanded += 1;
                if out_tx.send(row).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!("Worker {} failed: {}", id, error);
                let _ = err_tx.send(error);
                if fail_fast {
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    debug!("Worker {} done after {} row(s)", id, expanded);
    stats
}

async fn collect(
    mut exporter: Box<dyn RowExporter>,
    mut out_rx: mpsc::Receiver<Row>,
    err_tx: mpsc::UnboundedSender<IngressError>,
    cancel: CancellationToken,
    fail_fast: bool,
) -> (Box<dyn RowExporter>, u64) {
    let mut exported = 0;
    let mut failed = false;

    // Keep draining after a failure so no worker blocks on a full queue.
    while let Some(row) = out_rx.recv().await {
        if failed && fail_fast {
            continue;
        }
        match exporter.export(row).await {
            Ok(()) => exported += 1,
            Err(error) => {
                let _ = err_tx.send(error);
                failed = true;
                if fail_fast {
                    cancel.cancel();
                }
            }
        }
    }

    if let Err(error) = exporter.finish().await {
        let _ = err_tx.send(error);
    }
    (exporter, exported)
}
