//! Gradient reduction on a dedicated communication thread.
//!
//! The compute thread hands every ready gradient to a [`ReduceWorker`] and returns to backward at
//! once. The worker owns the bucketer and issues the reduce-scatters, so communication for one
//! gradient overlaps with the computation of the next. [`ReduceWorker::wait`] is the only
//! synchronization point: it drains the queue and hands back every finished shard.
//!
//! Between the first submission and `wait` the worker is the only user of the backend's
//! channels, so the compute thread must not issue collectives of its own in that window.

use super::reduce_scatter::{ReduceScatterBucketer, Reduced};
use super::sharded_param::chunk_and_pad;
use super::{Result, ZeroError};
use crate::distributed::{CollectiveBackend, ProcessGroup};
use crate::tensor::{ComputeElem, Tensor};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A reduced gradient shard, in fp32, keyed by whatever the caller submitted it under.
pub type ReducedShard<K> = (K, Tensor<f32, 1>);

/// Reduces in fp32 or in the compute precision.
#[derive(Debug)]
enum Reducer<K, C: ComputeElem> {
    Fp32(ReduceScatterBucketer<K, f32>),
    Compute(ReduceScatterBucketer<K, C>),
}

fn widen<K, T: ComputeElem>(done: Vec<Reduced<K, T>>) -> Vec<ReducedShard<K>> {
    done.into_iter()
        .map(|r| (r.key, r.shard.cast::<f32>()))
        .collect()
}

impl<K, C: ComputeElem> Reducer<K, C> {
    fn reduce<B: CollectiveBackend>(
        &mut self,
        key: K,
        grad: Tensor<C, 1>,
        predivide: f32,
        group: &ProcessGroup,
        backend: &B,
    ) -> Result<Vec<ReducedShard<K>>> {
        match self {
            Reducer::Fp32(bucketer) => {
                let mut grad = grad.cast::<f32>();
                if predivide > 1.0 {
                    grad.scale(1.0 / predivide);
                }
                let chunks = chunk_and_pad(&grad, group.size())?;
                Ok(widen(bucketer.reduce_scatter(key, chunks, group, backend)?))
            }
            Reducer::Compute(bucketer) => {
                let mut grad = grad;
                if predivide > 1.0 {
                    grad.scale(C::from_master(1.0 / predivide));
                }
                let chunks = chunk_and_pad(&grad, group.size())?;
                Ok(widen(bucketer.reduce_scatter(key, chunks, group, backend)?))
            }
        }
    }

    fn flush<B: CollectiveBackend>(&mut self, backend: &B) -> Result<Vec<ReducedShard<K>>> {
        let done = match self {
            Reducer::Fp32(bucketer) => widen(bucketer.flush(backend)?),
            Reducer::Compute(bucketer) => widen(bucketer.flush(backend)?),
        };
        match self {
            Reducer::Fp32(bucketer) => bucketer.free(),
            Reducer::Compute(bucketer) => bucketer.free(),
        }
        Ok(done)
    }
}

enum Job<K, C: ComputeElem> {
    Reduce { key: K, grad: Tensor<C, 1> },
    /// Flush every bucket and report back once everything before it has finished.
    Drain,
}

enum Event<K> {
    Reduced(Result<Vec<ReducedShard<K>>>),
    Drained(Result<Vec<ReducedShard<K>>>),
}

/// Handle to the thread that reduce-scatters gradients for one model.
///
/// Dropping the handle closes the queue and joins the thread.
#[derive(Debug)]
pub struct ReduceWorker<K, C: ComputeElem> {
    jobs: Option<Sender<Job<K, C>>>,
    events: Receiver<Event<K>>,
    handle: Option<JoinHandle<()>>,
    /// Submitted inputs whose reduced shard has not been handed back yet.
    in_flight: usize,
    /// Set by `submit`, cleared by `wait`. Unlike `in_flight` it does not depend on how fast
    /// the worker runs, so every rank agrees on it.
    submitted_since_drain: bool,
}

impl<K, C> ReduceWorker<K, C>
where
    K: Send + 'static,
    C: ComputeElem,
{
    /// Starts the worker. Gradients are pre-divided by `predivide` before reduction and, when
    /// `fp32` is set, widened to fp32 first.
    pub fn spawn<B: CollectiveBackend + 'static>(
        backend: Arc<B>,
        group: ProcessGroup,
        bucket_bytes: usize,
        fp32: bool,
        predivide: f32,
    ) -> Result<Self> {
        let (jobs, job_rx) = unbounded::<Job<K, C>>();
        let (event_tx, events) = unbounded();
        let mut reducer = if fp32 {
            Reducer::Fp32(ReduceScatterBucketer::new(bucket_bytes))
        } else {
            Reducer::Compute(ReduceScatterBucketer::new(bucket_bytes))
        };

        let rank = backend.rank();
        let handle = thread::Builder::new()
            .name(format!("reduce-scatter-{rank}"))
            .spawn(move || {
                for job in job_rx {
                    let event = match job {
                        Job::Reduce { key, grad } => Event::Reduced(reducer.reduce(
                            key,
                            grad,
                            predivide,
                            &group,
                            backend.as_ref(),
                        )),
                        Job::Drain => Event::Drained(reducer.flush(backend.as_ref())),
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
                debug!(rank, "reduce-scatter worker stopped");
            })
            .map_err(|e| ZeroError::Worker(e.to_string()))?;

        Ok(Self {
            jobs: Some(jobs),
            events,
            handle: Some(handle),
            in_flight: 0,
            submitted_since_drain: false,
        })
    }

    /// Queues `grad` for reduction and returns without waiting for it.
    pub fn submit(&mut self, key: K, grad: Tensor<C, 1>) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| ZeroError::Worker("queue closed".into()))?
            .send(Job::Reduce { key, grad })
            .map_err(|_| ZeroError::Worker("reduce-scatter worker exited".into()))?;
        self.in_flight += 1;
        self.submitted_since_drain = true;
        Ok(())
    }

    /// Shards that finished since the last call, without blocking.
    pub fn try_collect(&mut self) -> Result<Vec<ReducedShard<K>>> {
        let mut ready = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::Reduced(done) => ready.extend(self.account(done)?),
                Event::Drained(_) => {
                    return Err(ZeroError::Worker("drain reported without a request".into()));
                }
            }
        }
        Ok(ready)
    }

    /// Blocks until every submitted gradient is reduced, including those still sitting in a
    /// bucket, and returns the shards not collected before.
    pub fn wait(&mut self) -> Result<Vec<ReducedShard<K>>> {
        self.jobs
            .as_ref()
            .ok_or_else(|| ZeroError::Worker("queue closed".into()))?
            .send(Job::Drain)
            .map_err(|_| ZeroError::Worker("reduce-scatter worker exited".into()))?;

        // keep reading up to the drain marker even after a failure so the next pass starts clean
        let mut ready = Vec::new();
        let mut first_error = None;
        loop {
            let event = self
                .events
                .recv()
                .map_err(|_| ZeroError::Worker("reduce-scatter worker exited".into()))?;
            let (done, drained) = match event {
                Event::Reduced(done) => (done, false),
                Event::Drained(done) => (done, true),
            };
            match self.account(done) {
                Ok(done) => ready.extend(done),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
            if drained {
                break;
            }
        }
        if self.in_flight != 0 {
            warn!(in_flight = self.in_flight, "drained with unreported reductions");
            self.in_flight = 0;
        }
        self.submitted_since_drain = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(ready),
        }
    }

    /// Submitted gradients whose shard has not been collected yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether anything was submitted since the last [`wait`](Self::wait).
    pub fn has_submissions(&self) -> bool {
        self.submitted_since_drain
    }

    fn account(&mut self, done: Result<Vec<ReducedShard<K>>>) -> Result<Vec<ReducedShard<K>>> {
        let done = done?;
        self.in_flight = self.in_flight.saturating_sub(done.len());
        Ok(done)
    }
}

impl<K, C: ComputeElem> Drop for ReduceWorker<K, C> {
    fn drop(&mut self) {
        // closing the queue ends the worker's loop
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("reduce-scatter worker panicked");
            }
        }
    }
}
