//! Bounded-parallelism execution of opaque per-item jobs, isolated from the
//! coordinating component's execution context.
//!
//! Each worker is a dedicated `tokio` task reading from an `flume` MPMC
//! channel, handing the actual `perform()` call off to
//! `tokio::task::spawn_blocking` so a CPU-bound workload can't starve the
//! async runtime's worker threads. A panicking workload unwinds only that
//! blocking task (`spawn_blocking` turns a panic into a `JoinError` rather
//! than crashing the process), which is what stands in here for the
//! "isolated workers" requirement without needing separate OS processes.

use std::{collections::HashMap, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::bail};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

/// The result of one item's transformation: the paths it produced (keyed
/// by output name, same shape a [`crate::node::NodeOutput`] carries) plus
/// any dependency paths discovered while producing them (e.g. a
/// transitive `xsl:import`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub outputs: Vec<(String, Utf8PathBuf)>,
    pub discovered_deps: Vec<Utf8PathBuf>,
}

/// An isolated, CPU- or I/O-heavy per-item transformation.
///
/// Concrete workloads are registered under a string tag (e.g. "compile
/// xslt", "run xslt transform") and looked up dynamically per job —
/// mirroring the `ConfigValue::Hook` identifier-resolution pattern used
/// elsewhere in this crate. A workload's own state is expected to be
/// self-contained per call: the original motivation for isolating jobs
/// into workers was a shared mutable "platform" in the XSLT engine this
/// seam stands in for, and a worker processes one job at a time.
pub trait Workload: Send + Sync {
    fn perform(&self, item: &Utf8Path) -> Result<JobOutcome>;
}

/// A job submitted to the pool: which registered workload to invoke, and
/// the item to hand it.
#[derive(Clone, Debug)]
pub struct Job {
    pub workload_tag: String,
    pub item: Utf8PathBuf,
}

struct Task {
    job: Job,
    reply: oneshot::Sender<Result<JobOutcome>>,
}

/// A small registry of named [`Workload`]s, shared by every worker.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    workloads: Arc<DashMap<String, Arc<dyn Workload>>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: impl Into<String>, workload: Arc<dyn Workload>) {
        self.workloads.insert(tag.into(), workload);
    }

    fn resolve(&self, tag: &str) -> Result<Arc<dyn Workload>> {
        self.workloads
            .get(tag)
            .map(|w| Arc::clone(&w))
            .ok_or_else(|| color_eyre::eyre::eyre!("no workload registered under tag {tag:?}"))
    }
}

/// A fixed-size pool of workers executing jobs from a shared queue,
/// process-wide and shared across all nodes and workloads.
pub struct WorkerPool {
    sender: flume::Sender<Task>,
    size: usize,
    active: Arc<DashMap<usize, Utf8PathBuf>>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing `registry`.
    pub fn new(size: usize, registry: WorkloadRegistry) -> Self {
        let size = size.max(1);
        let (sender, receiver) = flume::unbounded::<Task>();
        let active = Arc::new(DashMap::new());

        let workers = (0..size)
            .map(|id| {
                let receiver = receiver.clone();
                let registry = registry.clone();
                let active = Arc::clone(&active);
                tokio::spawn(async move {
                    while let Ok(task) = receiver.recv_async().await {
                        active.insert(id, task.job.item.clone());
                        let result = match registry.resolve(&task.job.workload_tag) {
                            Ok(workload) => {
                                let item = task.job.item.clone();
                                match tokio::task::spawn_blocking(move || workload.perform(&item)).await {
                                    Ok(outcome) => outcome,
                                    Err(join_err) => {
                                        Err(color_eyre::eyre::eyre!("workload task panicked: {join_err}"))
                                    }
                                }
                            }
                            Err(err) => Err(err),
                        };
                        active.remove(&id);
                        if task.reply.send(result).is_err() {
                            trace!(worker = id, "job result dropped: receiver gone");
                        }
                    }
                    trace!(worker = id, "worker shut down: queue closed");
                })
            })
            .collect();

        Self {
            sender,
            size,
            active,
            workers,
        }
    }

    /// Submit a job, returning a future that resolves once some worker has
    /// executed it (immediately, if idle; otherwise queued FIFO).
    #[instrument(skip(self))]
    pub async fn execute(&self, job: Job) -> Result<JobOutcome> {
        let (reply, recv) = oneshot::channel();
        self.sender
            .send_async(Task { job, reply })
            .await
            .map_err(|_| color_eyre::eyre::eyre!("worker pool is shut down"))?;
        match recv.await {
            Ok(result) => result,
            Err(_) => bail!("worker dropped the job without replying (it may have panicked)"),
        }
    }

    /// The number of configured workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// A snapshot of which workers currently have a job in flight, keyed
    /// by worker id, for supervisor reporting.
    pub fn active_jobs(&self) -> HashMap<usize, Utf8PathBuf> {
        self.active.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    /// Stop all workers. Any job already queued but not yet picked up is
    /// dropped, failing its caller's `execute` future.
    #[instrument(skip(self))]
    pub async fn terminate(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(%err, "worker task did not shut down cleanly");
            }
        }
        debug!("worker pool terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;
    impl Workload for Double {
        fn perform(&self, item: &Utf8Path) -> Result<JobOutcome> {
            Ok(JobOutcome {
                outputs: vec![("out".to_string(), item.join("doubled"))],
                discovered_deps: vec![],
            })
        }
    }

    struct AlwaysFails;
    impl Workload for AlwaysFails {
        fn perform(&self, _item: &Utf8Path) -> Result<JobOutcome> {
            bail!("always fails")
        }
    }

    fn pool_with(tag: &str, workload: Arc<dyn Workload>, size: usize) -> WorkerPool {
        let registry = WorkloadRegistry::new();
        registry.register(tag, workload);
        WorkerPool::new(size, registry)
    }

    #[tokio::test]
    async fn executes_jobs_across_workers() {
        let pool = pool_with("double", Arc::new(Double), 4);
        let mut handles = Vec::new();
        for i in 0..10 {
            let job = Job {
                workload_tag: "double".to_string(),
                item: Utf8PathBuf::from(format!("item-{i}")),
            };
            handles.push(pool.execute(job));
        }
        let results: Vec<_> = futures::future::join_all(handles).await;
        for result in results {
            assert!(result.unwrap().outputs[0].1.ends_with("doubled"));
        }
        pool.terminate().await;
    }

    #[tokio::test]
    async fn workload_error_rejects_only_that_job() {
        let pool = pool_with("fails", Arc::new(AlwaysFails), 2);
        let job = || Job {
            workload_tag: "fails".to_string(),
            item: Utf8PathBuf::from("a"),
        };
        assert!(pool.execute(job()).await.is_err());
        // The pool is still usable afterwards.
        assert!(pool.execute(job()).await.is_err());
        pool.terminate().await;
    }

    #[tokio::test]
    async fn unknown_workload_tag_rejects_the_job() {
        let pool = pool_with("double", Arc::new(Double), 1);
        let job = Job {
            workload_tag: "missing".to_string(),
            item: Utf8PathBuf::from("a"),
        };
        assert!(pool.execute(job).await.is_err());
        pool.terminate().await;
    }

    #[tokio::test]
    async fn active_jobs_starts_empty() {
        let pool = pool_with("double", Arc::new(Double), 2);
        assert!(pool.active_jobs().is_empty());
        pool.terminate().await;
    }
}
