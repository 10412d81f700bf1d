//! Worker group context and cross-worker aggregation
//!
//! Sampling runs SPMD: every worker executes the same pipeline with its own
//! rank. The only synchronisation points are `all_gather` and `barrier`.
//! A failure on any worker poisons the group, so peers blocked in (or later
//! entering) a collective observe a `Distributed` error instead of hanging
//! or continuing with a partial corpus.

use std::sync::Arc;

use candle_core::Tensor;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SampleError};

/// Explicit distributed context: who am I, and how many of us are there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cluster {
    rank: usize,
    world_size: usize,
}

impl Cluster {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(SampleError::distributed(rank, "world size must be positive"));
        }
        if rank >= world_size {
            return Err(SampleError::distributed(
                rank,
                format!("rank outside world of size {world_size}"),
            ));
        }
        Ok(Self { rank, world_size })
    }

    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank 0 owns side effects such as writing output files
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

/// Collective operations over a fixed worker group
pub trait Communicator: Send {
    fn cluster(&self) -> Cluster;

    /// Every worker's tensor, indexed by rank. Blocks until all contributed.
    fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>>;

    /// Blocks until every worker reached the barrier
    fn barrier(&self) -> Result<()>;

    /// Poison the group so every peer fails its next (or current) collective
    fn abort(&self, reason: &str);
}

/// Degenerate group of one worker
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn cluster(&self) -> Cluster {
        Cluster::single()
    }

    fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![local.clone()])
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self, reason: &str) {
        tracing::error!("Aborting single-process run: {}", reason);
    }
}

struct GroupState {
    gather_slots: Vec<Option<Tensor>>,
    gather_arrived: usize,
    gather_generation: u64,
    gathered: Option<Arc<Vec<Tensor>>>,
    barrier_arrived: usize,
    barrier_generation: u64,
    failure: Option<String>,
}

struct Shared {
    world_size: usize,
    state: Mutex<GroupState>,
    cond: Condvar,
}

impl Shared {
    fn poison(&self, reason: String) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(reason);
        }
        self.cond.notify_all();
    }
}

/// In-process worker group; one endpoint per rank, one thread per endpoint
pub struct LocalGroup;

impl LocalGroup {
    /// Create the endpoints of a fresh group, in rank order
    pub fn endpoints(world_size: usize) -> Result<Vec<LocalEndpoint>> {
        if world_size == 0 {
            return Err(SampleError::distributed(0, "world size must be positive"));
        }
        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(GroupState {
                gather_slots: vec![None; world_size],
                gather_arrived: 0,
                gather_generation: 0,
                gathered: None,
                barrier_arrived: 0,
                barrier_generation: 0,
                failure: None,
            }),
            cond: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| {
                Ok(LocalEndpoint {
                    cluster: Cluster::new(rank, world_size)?,
                    shared: shared.clone(),
                })
            })
            .collect()
    }

    /// Run `worker` once per rank on scoped threads and collect the results
    /// in rank order. A panicking worker poisons the group like an error.
    pub fn launch<T, F>(world_size: usize, worker: F) -> Result<Vec<Result<T>>>
    where
        T: Send,
        F: Fn(LocalEndpoint) -> Result<T> + Sync,
    {
        let endpoints = Self::endpoints(world_size)?;
        let worker = &worker;
        let results: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    let rank = endpoint.cluster.rank();
                    (rank, scope.spawn(move || worker(endpoint)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(SampleError::distributed(rank, "worker panicked")))
                })
                .collect()
        });
        Ok(results)
    }
}

/// One rank's handle on a [`LocalGroup`]. Dropping it removes the worker
/// from the group, which fails any collective still waiting for it.
pub struct LocalEndpoint {
    cluster: Cluster,
    shared: Arc<Shared>,
}

impl LocalEndpoint {
    fn failure(&self, reason: &str) -> SampleError {
        SampleError::distributed(self.cluster.rank(), reason)
    }
}

impl Communicator for LocalEndpoint {
    fn cluster(&self) -> Cluster {
        self.cluster
    }

    fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>> {
        let rank = self.cluster.rank();
        let mut state = self.shared.state.lock();
        if let Some(reason) = &state.failure {
            return Err(self.failure(reason));
        }
        if state.gather_slots[rank].is_some() {
            let reason = format!("rank {rank} contributed twice to one gather");
            state.failure = Some(reason.clone());
            self.shared.cond.notify_all();
            return Err(self.failure(&reason));
        }

        state.gather_slots[rank] = Some(local.clone());
        state.gather_arrived += 1;
        let generation = state.gather_generation;

        if state.gather_arrived == self.shared.world_size {
            let parts: Option<Vec<Tensor>> =
                state.gather_slots.iter_mut().map(Option::take).collect();
            let parts = match parts {
                Some(parts) => parts,
                None => {
                    let reason = "gather completed with a missing rank".to_string();
                    state.failure = Some(reason.clone());
                    self.shared.cond.notify_all();
                    return Err(self.failure(&reason));
                }
            };
            state.gathered = Some(Arc::new(parts));
            state.gather_arrived = 0;
            state.gather_generation += 1;
            self.shared.cond.notify_all();
        } else {
            while state.gather_generation == generation && state.failure.is_none() {
                self.shared.cond.wait(&mut state);
            }
            // A completed round wins over a failure raised after it
            if state.gather_generation == generation {
                let reason = state.failure.clone().unwrap_or_default();
                return Err(self.failure(&reason));
            }
        }

        match &state.gathered {
            Some(parts) => Ok(parts.as_ref().clone()),
            None => Err(self.failure("gather finished without a result")),
        }
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(reason) = &state.failure {
            return Err(self.failure(reason));
        }
        state.barrier_arrived += 1;
        let generation = state.barrier_generation;

        if state.barrier_arrived == self.shared.world_size {
            state.barrier_arrived = 0;
            state.barrier_generation += 1;
            self.shared.cond.notify_all();
            return Ok(());
        }
        while state.barrier_generation == generation && state.failure.is_none() {
            self.shared.cond.wait(&mut state);
        }
        if state.barrier_generation == generation {
            let reason = state.failure.clone().unwrap_or_default();
            return Err(self.failure(&reason));
        }
        Ok(())
    }

    fn abort(&self, reason: &str) {
        tracing::error!("Rank {} aborting group: {}", self.cluster.rank(), reason);
        self.shared
            .poison(format!("rank {} failed: {}", self.cluster.rank(), reason));
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.shared
            .poison(format!("rank {} left the group", self.cluster.rank()));
    }
}

/// Gathers per-worker batches into one rank-ordered corpus
pub struct DistributedAggregator<C: Communicator> {
    comm: C,
}

impl<C: Communicator> DistributedAggregator<C> {
    pub fn new(comm: C) -> Self {
        Self { comm }
    }

    pub fn cluster(&self) -> Cluster {
        self.comm.cluster()
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// Concatenate every worker's batch along dim 0 in ascending rank order.
    ///
    /// Identical on every worker; returns only after a barrier so nobody
    /// moves on before all workers hold the same corpus.
    pub fn gather(&self, local: &Tensor) -> Result<Tensor> {
        let cluster = self.comm.cluster();
        let parts = self.comm.all_gather(local)?;

        if parts.len() != cluster.world_size() {
            let reason = format!(
                "expected {} contributions, got {}",
                cluster.world_size(),
                parts.len()
            );
            self.comm.abort(&reason);
            return Err(SampleError::distributed(cluster.rank(), reason));
        }
        let expected = parts[0].dims().to_vec();
        if let Some((rank, part)) = parts
            .iter()
            .enumerate()
            .find(|(_, p)| p.dims() != expected.as_slice())
        {
            // Every worker sees the same parts, so all of them fail here
            return Err(SampleError::distributed(
                cluster.rank(),
                format!(
                    "rank {} contributed shape {:?}, rank 0 contributed {:?}",
                    rank,
                    part.dims(),
                    expected
                ),
            ));
        }

        let corpus = Tensor::cat(&parts, 0)?;
        self.comm.barrier()?;

        tracing::debug!(
            "Rank {} gathered {:?} from {} workers",
            cluster.rank(),
            corpus.dims(),
            cluster.world_size()
        );
        Ok(corpus)
    }

    /// Barrier without data, e.g. before shared side effects
    pub fn barrier(&self) -> Result<()> {
        self.comm.barrier()
    }

    pub fn abort(&self, reason: &str) {
        self.comm.abort(reason)
    }
}
