//! Asynchronous ingestion processor.
//!
//! Requests enter through one bounded intake channel. A dispatcher task sorts
//! them into three FIFOs by [`Priority`] and, on every tick, moves up to
//! `batch_size` requests from each FIFO (high first, then normal, then low)
//! to a fixed pool of workers. Each worker runs one request at a time
//! through the [`LoadManagedService`].
//!
//! A request that leaves the intake always runs: when the worker pool's
//! queue is full the dispatcher runs it inline.
//!
//! # Shutdown
//!
//! [`AsyncProcessor::shutdown`] stops intake, dispatches everything already
//! accepted, then waits for the workers to finish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestionConfig;
use crate::error::IngestError;
use crate::load::LoadManagedService;
use crate::models::{IngestionRequest, Priority};

const PRIORITIES: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

fn slot(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

/// Counters for the processor. Queue depths are gauges.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    submitted: AtomicU64,
    queue_full: AtomicU64,
    dispatched: AtomicU64,
    executed_inline: AtomicU64,
    completed: AtomicU64,
    queued: [AtomicU64; 3],
    completed_by_priority: [AtomicU64; 3],
    latency_ms_by_priority: [AtomicU64; 3],
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityStats {
    pub priority: Priority,
    pub queued: u64,
    pub completed: u64,
    /// Mean time from submission to completion.
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorSnapshot {
    pub submitted: u64,
    pub queue_full: u64,
    pub dispatched: u64,
    pub executed_inline: u64,
    pub completed: u64,
    pub priorities: Vec<PriorityStats>,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorSnapshot {
        let priorities = PRIORITIES
            .iter()
            .map(|p| {
                let i = slot(*p);
                let completed = self.completed_by_priority[i].load(Ordering::Relaxed);
                let latency = self.latency_ms_by_priority[i].load(Ordering::Relaxed);
                PriorityStats {
                    priority: *p,
                    queued: self.queued[i].load(Ordering::Relaxed),
                    completed,
                    avg_latency_ms: if completed > 0 {
                        latency as f64 / completed as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        ProcessorSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            executed_inline: self.executed_inline.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            priorities,
        }
    }
}

/// Three FIFOs, one per priority.
#[derive(Default)]
struct PriorityQueues {
    queues: [VecDeque<IngestionRequest>; 3],
}

impl PriorityQueues {
    fn push(&mut self, request: IngestionRequest, stats: &ProcessorStats) {
        let i = slot(request.priority);
        self.queues[i].push_back(request);
        stats.queued[i].fetch_add(1, Ordering::Relaxed);
    }

    /// Up to `batch_size` requests from each queue, high first.
    fn take_batch(&mut self, batch_size: usize, stats: &ProcessorStats) -> Vec<IngestionRequest> {
        let mut batch = Vec::new();
        for (i, queue) in self.queues.iter_mut().enumerate() {
            let n = batch_size.min(queue.len());
            batch.extend(queue.drain(..n));
            stats.queued[i].fetch_sub(n as u64, Ordering::Relaxed);
        }
        batch
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

pub struct AsyncProcessor {
    intake: mpsc::Sender<IngestionRequest>,
    load: Arc<LoadManagedService>,
    stats: Arc<ProcessorStats>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncProcessor {
    /// Spawn the dispatcher and `max_concurrent_hosts` workers on the
    /// current runtime.
    pub fn start(load: Arc<LoadManagedService>, config: &IngestionConfig) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.async_queue_size);
        let (work_tx, work_rx) = mpsc::channel(config.max_concurrent_hosts);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let stats = Arc::new(ProcessorStats::default());
        let shutdown = CancellationToken::new();

        let mut tasks = Vec::with_capacity(config.max_concurrent_hosts + 1);
        for id in 0..config.max_concurrent_hosts {
            tasks.push(tokio::spawn(worker(
                id,
                work_rx.clone(),
                load.clone(),
                stats.clone(),
            )));
        }

        let dispatcher = Dispatcher {
            intake: intake_rx,
            work: work_tx,
            queues: PriorityQueues::default(),
            load: load.clone(),
            stats: stats.clone(),
            batch_size: config.batch_size,
        };
        tasks.push(tokio::spawn(dispatcher.run(
            config.dispatch_interval(),
            shutdown.clone(),
        )));

        info!(
            workers = config.max_concurrent_hosts,
            queue_size = config.async_queue_size,
            "ingestion processor started"
        );

        Self {
            intake: intake_tx,
            load,
            stats,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn load(&self) -> &Arc<LoadManagedService> {
        &self.load
    }

    pub fn stats(&self) -> ProcessorSnapshot {
        self.stats.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Enqueue without waiting for the result.
    ///
    /// A full intake fails with [`IngestError::QueueFull`]; the error is
    /// also delivered on the request's result channel if it has one.
    pub fn submit_async(&self, mut request: IngestionRequest) -> Result<(), IngestError> {
        if self.shutdown.is_cancelled() {
            request.complete(Err(IngestError::ShuttingDown));
            return Err(IngestError::ShuttingDown);
        }

        match self.intake.try_send(request) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(mut request)) => {
                self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                debug!(host_id = request.host_id, "ingestion intake full, dropping request");
                request.complete(Err(IngestError::QueueFull));
                Err(IngestError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(mut request)) => {
                request.complete(Err(IngestError::ShuttingDown));
                Err(IngestError::ShuttingDown)
            }
        }
    }

    /// Enqueue at high priority and wait for the worker's result or the
    /// request's cancellation.
    pub async fn submit_sync(&self, mut request: IngestionRequest) -> Result<(), IngestError> {
        let (tx, rx) = oneshot::channel();
        request.priority = Priority::High;
        request.result_tx = Some(tx);
        let cancel = request.cancel.clone();

        self.submit_async(request)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            result = rx => result.unwrap_or(Err(IngestError::ShuttingDown)),
        }
    }

    /// Stop accepting requests, run everything already accepted and wait
    /// for the workers. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "ingestion task ended abnormally");
            }
        }
        info!("ingestion processor stopped");
    }
}

struct Dispatcher {
    intake: mpsc::Receiver<IngestionRequest>,
    work: mpsc::Sender<IngestionRequest>,
    queues: PriorityQueues,
    load: Arc<LoadManagedService>,
    stats: Arc<ProcessorStats>,
    batch_size: usize,
}

impl Dispatcher {
    async fn run(mut self, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.intake.recv() => match msg {
                    Some(request) => self.queues.push(request, &self.stats),
                    None => break,
                },
                _ = ticker.tick() => self.dispatch_batch().await,
            }
        }

        // Drain: nothing accepted is left behind.
        self.intake.close();
        while let Some(request) = self.intake.recv().await {
            self.queues.push(request, &self.stats);
        }
        while !self.queues.is_empty() {
            self.dispatch_batch().await;
        }
        debug!("ingestion dispatcher drained");
    }

    async fn dispatch_batch(&mut self) {
        let batch = self.queues.take_batch(self.batch_size, &self.stats);
        for request in batch {
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            match self.work.try_send(request) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(request))
                | Err(mpsc::error::TrySendError::Closed(request)) => {
                    // Let idle workers claim what is already queued so this
                    // request does not overtake it at the semaphore.
                    tokio::task::yield_now().await;
                    self.stats.executed_inline.fetch_add(1, Ordering::Relaxed);
                    run_request(&self.load, &self.stats, request).await;
                }
            }
        }
    }
}

async fn worker(
    id: usize,
    work: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestionRequest>>>,
    load: Arc<LoadManagedService>,
    stats: Arc<ProcessorStats>,
) {
    loop {
        let next = work.lock().await.recv().await;
        let Some(request) = next else { break };
        run_request(&load, &stats, request).await;
    }
    debug!(worker = id, "ingestion worker exiting");
}

async fn run_request(load: &LoadManagedService, stats: &ProcessorStats, mut request: IngestionRequest) {
    let result = load.handle_request(&request).await.map(|_| ());

    let i = slot(request.priority);
    let latency = (Utc::now() - request.enqueued_at).num_milliseconds().max(0) as u64;
    stats.completed.fetch_add(1, Ordering::Relaxed);
    stats.completed_by_priority[i].fetch_add(1, Ordering::Relaxed);
    stats.latency_ms_by_priority[i].fetch_add(latency, Ordering::Relaxed);

    request.complete(result);
}
