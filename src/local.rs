//! In-process dispatching.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::Yield;
use tracing::{Level, debug, info};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::Context;
use crate::dispatcher::{Dispatch, Dispatcher, DispatcherConfig, JobSettings};
use crate::error::DispatchError;
use crate::node::ExecutableNode;
use crate::plug::Plugs;
use crate::task::Task;
use crate::unique::{TaskDescriptions, unique_tasks};

type Finished = (usize, Result<(), DispatchError>, Duration);

/// How long a waiting pool thread sleeps on the result channel once it ran
/// out of local work.
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Per-node slot: how many contexts of that node may be executed in a single
/// call.
pub const BATCH_SIZE: &str = "batchSize";

/// Executes everything in the current process.
///
/// In sequential mode records run one after another in dependency order, and
/// consecutive records of the same node are batched into a single
/// [`ExecutableNode::execute`] call, up to the node's [`BATCH_SIZE`].
///
/// In parallel mode every record is spawned on the rayon thread pool as soon
/// as all of its requirements completed, one context per call.
///
/// Either way the first failure stops scheduling and is returned.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    job: JobSettings,
    parallel: bool,
}

impl LocalDispatcher {
    pub fn new(job: JobSettings) -> Self {
        Self {
            job,
            parallel: false,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            job: config.job.clone(),
            parallel: config.parallel,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn run_sequential(
        &self,
        name: &str,
        descriptions: &TaskDescriptions,
        span: &tracing::Span,
    ) -> Result<(), DispatchError> {
        let mut batch: Vec<usize> = Vec::new();

        for (index, record) in descriptions.iter().enumerate() {
            if let Some(&first) = batch.first() {
                let head = &descriptions[first].task;
                let full = batch.len() >= batch_size(name, head);
                let requires_batch = record.requirements.iter().any(|r| batch.contains(r));

                if full || requires_batch || !same_node(head.node(), record.task.node()) {
                    execute_batch(descriptions, &batch)?;
                    span.pb_inc(batch.len() as u64);
                    batch.clear();
                }
            }

            batch.push(index);
        }

        if !batch.is_empty() {
            execute_batch(descriptions, &batch)?;
            span.pb_inc(batch.len() as u64);
        }

        Ok(())
    }

    /// Same scheduling as a parallel build: a pool of workers picks up records
    /// as their requirement counts drop to zero, while the calling thread
    /// collects results and unlocks dependents.
    fn run_parallel(
        &self,
        descriptions: &TaskDescriptions,
        span: &tracing::Span,
    ) -> Result<(), DispatchError> {
        let total = descriptions.len();
        if total == 0 {
            return Ok(());
        }

        let graph = descriptions.graph();
        let mut pending: Vec<usize> = descriptions.iter().map(|r| r.requirements.len()).collect();
        let mut completed = 0;

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.blue} {msg}")
            .map_err(anyhow::Error::from)?;

        rayon::in_place_scope(|s| -> Result<(), DispatchError> {
            let (sender, receiver) = channel::<Finished>();

            let spawn_task = |index: usize| {
                let task = &descriptions[index].task;
                let sender = sender.clone();
                let style = style.clone();

                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "task", name = task.name());
                    span.pb_set_style(&style);
                    span.pb_set_message(&format!("Executing {}", task.name()));
                    let _enter = span.enter();

                    let start = Instant::now();
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        execute(task, std::slice::from_ref(task.context()))
                    }))
                    .unwrap_or_else(|panic| {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("Task panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("Task panicked: {s}")
                        } else {
                            String::from("Task panicked with unknown payload")
                        };

                        Err(DispatchError::Execute(task.name().to_string(), anyhow::anyhow!(msg)))
                    });

                    // the receiver is gone once an earlier task failed
                    let _ = sender.send((index, result, start.elapsed()));
                });
            };

            for (index, count) in pending.iter().enumerate() {
                if *count == 0 {
                    spawn_task(index);
                }
            }

            while completed < total {
                let (index, result, duration) = next_finished(&receiver)?;
                result?;

                debug!(task = descriptions[index].task.name(), ?duration, "task finished");
                completed += 1;
                span.pb_inc(1);

                for dependent in graph.neighbors_directed(NodeIndex::new(index), Direction::Outgoing) {
                    let dependent = dependent.index();
                    pending[dependent] -= 1;
                    if pending[dependent] == 0 {
                        spawn_task(dependent);
                    }
                }
            }

            Ok(())
        })
    }
}

impl Dispatcher for LocalDispatcher {
    fn job(&self) -> &JobSettings {
        &self.job
    }

    fn setup_plugs(&self, plugs: &mut Plugs) {
        plugs.ensure(BATCH_SIZE, 1);
    }

    fn do_dispatch(&self, request: &Dispatch) -> Result<(), DispatchError> {
        let roots: Vec<Task> = request
            .nodes
            .iter()
            .map(|node| Task::new(node.clone(), request.context.clone()))
            .collect();

        let descriptions = unique_tasks(&roots)?;
        let directory = self.job_directory(request.context)?;

        info!(
            dispatcher = request.name,
            tasks = descriptions.len(),
            %directory,
            "executing tasks"
        );

        let span = tracing::span!(Level::INFO, "dispatch", dispatcher = request.name);
        span.pb_set_length(descriptions.len() as u64);
        span.pb_set_style(
            &ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map_err(anyhow::Error::from)?
                .progress_chars("=>-"),
        );
        span.pb_set_message("Executing tasks...");
        let _enter = span.enter();

        if self.parallel {
            self.run_parallel(&descriptions, &span)
        } else {
            self.run_sequential(request.name, &descriptions, &span)
        }
    }
}

/// Waits for the next finished task.
///
/// On a pool thread the spawned tasks may be queued behind the caller itself,
/// so instead of blocking it keeps running pending pool work in between.
fn next_finished(receiver: &Receiver<Finished>) -> Result<Finished, DispatchError> {
    if rayon::current_thread_index().is_none() {
        return Ok(receiver.recv().map_err(anyhow::Error::from)?);
    }

    loop {
        match receiver.try_recv() {
            Ok(finished) => return Ok(finished),
            Err(TryRecvError::Disconnected) => return Err(anyhow::Error::from(TryRecvError::Disconnected).into()),
            Err(TryRecvError::Empty) => {}
        }

        if !matches!(rayon::yield_now(), Some(Yield::Executed)) {
            match receiver.recv_timeout(IDLE_WAIT) {
                Ok(finished) => return Ok(finished),
                Err(RecvTimeoutError::Timeout) => {}
                Err(err @ RecvTimeoutError::Disconnected) => return Err(anyhow::Error::from(err).into()),
            }
        }
    }
}

fn same_node(a: &Arc<dyn ExecutableNode>, b: &Arc<dyn ExecutableNode>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn batch_size(name: &str, task: &Task) -> usize {
    task.node()
        .base()
        .dispatcher_plugs(name)
        .and_then(|plugs| plugs.value(BATCH_SIZE))
        .and_then(|value| value.as_i64())
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(1)
        .max(1)
}

fn execute_batch(descriptions: &TaskDescriptions, batch: &[usize]) -> Result<(), DispatchError> {
    let head = &descriptions[batch[0]].task;
    let contexts: Vec<Context> = batch
        .iter()
        .map(|&index| descriptions[index].task.context().clone())
        .collect();

    execute(head, &contexts)
}

/// Executes `task`'s node for `contexts`, the first one made current.
fn execute(task: &Task, contexts: &[Context]) -> Result<(), DispatchError> {
    let _scope = contexts.first().map(Context::scope);
    debug!(task = task.name(), contexts = contexts.len(), "executing");

    task.node()
        .execute(contexts)
        .map_err(|err| DispatchError::Execute(task.name().to_string(), err))
}
