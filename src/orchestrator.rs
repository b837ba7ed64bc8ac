use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::Level;

use crate::core::{Dynamic, Firing, TaskId, TaskType};
use crate::diagnostics::{Diagnostics, TaskExecution};
use crate::engine::{
    Binding, Call, CallInstance, Dispatcher, Invocation, NodeInfo, ParamRef, Slot,
};
use crate::error::{EngineError, InvocationError};
use crate::utils::thread_name;
use crate::work::{TaskHandle, Work};

/// Worker pool settings.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Number of worker threads, defaults to the number of CPUs.
    pub threads: Option<usize>,
    /// Prefix for worker thread names.
    pub thread_name: Option<String>,
}

/// One registered unit and everything it has produced so far.
pub(crate) struct Node {
    pub name: Cow<'static, str>,
    pub task: TaskType,
    pub calls: Vec<Arc<CallInstance>>,
    /// Every completed invocation of this unit, in completion order.
    pub firings: Vec<Firing>,
    pub stats: TaskExecution,
}

/// A producer feeding a consumer parameter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub target: ParamRef,
}

/// A parameter waiting for producers of one type.
#[derive(Clone)]
struct Consumer {
    node: NodeIndex,
    instance: Arc<CallInstance>,
    target: ParamRef,
    /// Explicit wiring: only these producers are bound.
    only: Option<Vec<NodeIndex>>,
}

impl Consumer {
    fn accepts(&self, producer: NodeIndex) -> bool {
        producer != self.node
            && self
                .only
                .as_ref()
                .is_none_or(|only| only.contains(&producer))
    }

    fn binding(&self, firing: Firing) -> Binding {
        match self.target {
            ParamRef::Arg(index) => Binding::Arg(index, firing),
            ParamRef::Hidden(id) => Binding::Hidden(id, firing),
        }
    }
}

type Job = (Arc<CallInstance>, Binding);

struct Graph {
    nodes: DiGraph<Node, Edge>,
    producers: HashMap<TaskType, Vec<NodeIndex>>,
    consumers: HashMap<TaskType, Vec<Consumer>>,
    /// Bindings collected while no execution is running.
    deferred: Vec<Job>,
    executing: bool,
}

impl Graph {
    /// Adds the edge and raises list thresholds by the producer's call count.
    fn connect(&mut self, producer: NodeIndex, consumer: &Consumer) {
        for _ in 0..self.nodes[producer].calls.len() {
            consumer.instance.bump_threshold(consumer.target);
        }
        self.nodes.add_edge(
            producer,
            consumer.node,
            Edge {
                target: consumer.target,
            },
        );
    }
}

#[derive(Default)]
struct Progress {
    /// Invocations and registrations in flight.
    active: usize,
    caller: Option<ThreadId>,
    errors: Vec<InvocationError>,
}

/// In-flight accounting. Worker jobs hold it on their own so they can signal
/// completion after letting go of the orchestrator.
#[derive(Default)]
struct Tracker {
    progress: Mutex<Progress>,
    idle: Condvar,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        self.lock().active += 1;
    }

    fn end(&self) {
        let mut progress = self.lock();
        progress.active -= 1;
        if progress.active == 0 {
            self.idle.notify_all();
        }
    }
}

struct Inner {
    pool: rayon::ThreadPool,
    graph: Mutex<Graph>,
    tracker: Arc<Tracker>,
}

/// Owns the dependency graph of registered units and runs their methods as
/// the results they depend on become available.
///
/// Units are matched by type: a method declaring a parameter of type `A`
/// receives every unit of type `A` added to the same orchestrator, whether
/// it was added before or after the consumer. Units may keep being added
/// while an execution is running, including from inside their methods.
///
/// Cloning is cheap and yields a handle to the same orchestrator. A unit
/// that adds work from its methods should hold a [`WeakOrchestrator`]
/// instead: the graph owns its units, so a strong handle inside one keeps the
/// orchestrator and its worker pool alive forever.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`Orchestrator`], see [`Orchestrator::downgrade`].
#[derive(Clone)]
pub struct WeakOrchestrator {
    inner: Weak<Inner>,
}

impl WeakOrchestrator {
    /// Returns `None` once every [`Orchestrator`] handle has been dropped.
    pub fn upgrade(&self) -> Option<Orchestrator> {
        self.inner.upgrade().map(|inner| Orchestrator { inner })
    }
}

impl Orchestrator {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, EngineError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let prefix = config.thread_name.unwrap_or_else(|| "crossbind".into());
        let pool = builder.thread_name(move |i| thread_name(&prefix, i)).build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                graph: Mutex::new(Graph {
                    nodes: DiGraph::new(),
                    producers: HashMap::new(),
                    consumers: HashMap::new(),
                    deferred: Vec::new(),
                    executing: false,
                }),
                tracker: Arc::new(Tracker::default()),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.inner.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.inner.tracker.lock()
    }

    /// Adds a unit to the graph and wires it to every existing producer and
    /// consumer of matching types.
    ///
    /// Results already produced by upstream units are replayed into the new
    /// unit. Outside of [`execute`](Self::execute) nothing runs until the next
    /// execution; during one, the new unit takes part immediately.
    pub fn add<T>(&self, work: Work<T>) -> TaskHandle<T>
    where
        T: Send + Sync + 'static,
    {
        let Work {
            unit,
            name,
            calls,
            wires,
            after,
            no_wait,
            fork,
        } = work;

        let task = TaskType::of::<T>();
        let dynamic: Dynamic = unit.clone();
        let name = name.unwrap_or_else(|| Cow::Owned(task.short_name().to_owned()));
        let calls = if calls.is_empty() {
            vec![Arc::new(Call::empty(task))]
        } else {
            calls
        };

        let mut graph = self.graph();
        let index = NodeIndex::new(graph.nodes.node_count());
        let id = TaskId(index.index());

        let node = NodeInfo {
            id,
            name: name.clone(),
            no_wait,
            fork,
        };
        let instances: Vec<_> = calls
            .into_iter()
            .map(|call| CallInstance::new(call, dynamic.clone(), node.clone()))
            .collect();

        let added = graph.nodes.add_node(Node {
            name: name.clone(),
            task,
            calls: instances.clone(),
            firings: Vec::new(),
            stats: TaskExecution::new(name.clone()),
        });
        debug_assert_eq!(added, index);

        let mut jobs = Vec::new();

        // Upstream: this unit's parameters against existing producers.
        for instance in &instances {
            let mut targets = Vec::new();
            let mut has_scalar = false;

            for param in instance.call().params() {
                if let Slot::Arg(position) = param.slot() {
                    has_scalar |= !param.is_list();
                    targets.push((param.target(), ParamRef::Arg(position)));
                }
            }
            for &target in &after {
                let hidden = instance.add_hidden_param(target);
                targets.push((target, ParamRef::Hidden(hidden)));
            }

            let mut connected = 0;
            for (target, param) in targets {
                let wired: Vec<NodeIndex> = wires
                    .iter()
                    .filter(|(ty, _)| *ty == target)
                    .map(|(_, id)| NodeIndex::new(id.index()))
                    .collect();
                let only = (!wired.is_empty()).then_some(wired);

                if let (Some(_), ParamRef::Arg(position)) = (&only, param) {
                    instance.set_explicitly_wired(position);
                }

                let consumer = Consumer {
                    node: index,
                    instance: instance.clone(),
                    target: param,
                    only,
                };

                let producers = graph.producers.get(&target).cloned().unwrap_or_default();
                for producer in producers {
                    if !consumer.accepts(producer) {
                        continue;
                    }
                    graph.connect(producer, &consumer);
                    connected += 1;
                    for firing in &graph.nodes[producer].firings {
                        jobs.push((instance.clone(), consumer.binding(firing.clone())));
                    }
                }

                graph.consumers.entry(target).or_default().push(consumer);
            }

            // Nothing upstream will ever trigger this call.
            if !has_scalar && connected == 0 {
                jobs.push((instance.clone(), Binding::Root));
            }
        }

        // Downstream: existing consumers of this unit's type.
        let consumers = graph.consumers.get(&task).cloned().unwrap_or_default();
        for consumer in consumers {
            if consumer.accepts(index) {
                graph.connect(index, &consumer);
            }
        }

        graph.producers.entry(task).or_default().push(index);

        tracing::debug!(
            "added {name} as {id:?} with {} call(s), {} binding(s) pending",
            instances.len(),
            jobs.len()
        );

        if graph.executing {
            self.begin();
            drop(graph);
            self.run_jobs(jobs);
            self.end();
        } else {
            graph.deferred.extend(jobs);
        }

        TaskHandle { id, unit }
    }

    /// Runs every pending invocation and waits until no work is left in
    /// flight, including work started by units added along the way.
    ///
    /// # Errors
    /// Returns the first invocation error; the others are logged. Also fails
    /// if an execution is already running.
    pub fn execute(&self) -> Result<Diagnostics, EngineError> {
        let jobs = {
            let mut graph = self.graph();
            if graph.executing {
                return Err(EngineError::AlreadyExecuting);
            }
            graph.executing = true;
            self.progress().caller = Some(thread::current().id());
            std::mem::take(&mut graph.deferred)
        };

        let span = tracing::span!(Level::INFO, "execute");
        let _enter = span.enter();
        tracing::info!("executing {} pending binding(s)", jobs.len());

        self.begin();
        self.run_jobs(jobs);
        self.end();

        let errors = loop {
            let progress = self.progress();
            let progress = self
                .inner
                .tracker
                .idle
                .wait_while(progress, |progress| progress.active > 0)
                .unwrap_or_else(PoisonError::into_inner);
            drop(progress);

            // A registration may have slipped in between the wait and this lock.
            let mut graph = self.graph();
            let mut progress = self.progress();
            if progress.active == 0 {
                graph.executing = false;
                progress.caller = None;
                break std::mem::take(&mut progress.errors);
            }
        };

        let diagnostics = self.diagnostics();
        tracing::info!(
            "execution finished, {} invocation(s)",
            diagnostics.invocations()
        );

        let mut errors = errors.into_iter();
        match errors.next() {
            Some(first) => {
                for error in errors {
                    tracing::error!("{error}");
                }
                Err(first.into())
            }
            None => Ok(diagnostics),
        }
    }

    /// Per-unit statistics accumulated since the orchestrator was created.
    pub fn diagnostics(&self) -> Diagnostics {
        let graph = self.graph();
        let execution_times = graph
            .nodes
            .node_indices()
            .map(|index| (TaskId(index.index()), graph.nodes[index].stats.clone()))
            .collect();

        Diagnostics { execution_times }
    }

    pub(crate) fn with_nodes<R>(&self, f: impl FnOnce(&DiGraph<Node, Edge>) -> R) -> R {
        f(&self.graph().nodes)
    }

    /// Results produced so far by the unit, in completion order.
    pub fn firings(&self, id: TaskId) -> Vec<Firing> {
        self.graph()
            .nodes
            .node_weight(NodeIndex::new(id.index()))
            .map(|node| node.firings.clone())
            .unwrap_or_default()
    }

    pub fn task_count(&self) -> usize {
        self.graph().nodes.node_count()
    }

    fn begin(&self) {
        self.inner.tracker.begin();
    }

    fn end(&self) {
        self.inner.tracker.end();
    }

    fn run_jobs(&self, jobs: Vec<Job>) {
        let mut pending = None;
        for (instance, binding) in jobs {
            pending = instance.bind(binding, pending, self);
        }
        self.drive(pending);
    }

    /// Runs an invocation and then, on the same thread, whatever its result
    /// made runnable.
    fn drive(&self, mut next: Option<Invocation>) {
        while let Some(invocation) = next.take() {
            let context = if !invocation.fire() {
                "skipped"
            } else if invocation.holds_reservation() {
                "sequential"
            } else if invocation.call().is_light() {
                "light"
            } else if self.inner.pool.current_thread_index().is_some() {
                "worker"
            } else {
                "inline"
            };

            let result = invocation.run(context);
            let task = invocation.instance().task();
            let follow = invocation.complete();

            next = match result {
                Ok(firing) => self.complete(task, firing),
                Err(error) => {
                    self.fail(task, error);
                    None
                }
            };

            // The sequential successor stays on this thread.
            if let Some(follow) = follow
                && let Some(previous) = next.replace(follow)
            {
                self.spawn(previous);
            }
        }
    }

    /// Records a result and propagates it to every consumer of its type.
    fn complete(&self, task: TaskId, firing: Firing) -> Option<Invocation> {
        let index = NodeIndex::new(task.index());

        let consumers: Vec<Consumer> = {
            let mut graph = self.graph();
            let node = &mut graph.nodes[index];
            node.stats.record(firing.fired(), firing.duration());
            node.firings.push(firing.clone());
            let ty = node.task;

            graph
                .consumers
                .get(&ty)
                .map(|consumers| {
                    consumers
                        .iter()
                        .filter(|consumer| consumer.accepts(index))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut pending = None;
        for consumer in consumers {
            pending = consumer
                .instance
                .bind(consumer.binding(firing.clone()), pending, self);
        }
        pending
    }

    fn fail(&self, task: TaskId, error: InvocationError) {
        tracing::error!("{error}");
        {
            let mut graph = self.graph();
            graph.nodes[NodeIndex::new(task.index())]
                .stats
                .record(false, error.duration);
        }
        self.progress().errors.push(error);
    }
}

impl Dispatcher for Orchestrator {
    fn run_inline(&self, invocation: Invocation) {
        self.drive(Some(invocation));
    }

    fn spawn(&self, invocation: Invocation) {
        self.begin();
        let this = self.clone();
        let tracker = self.inner.tracker.clone();
        self.inner.pool.spawn(move || {
            this.drive(Some(invocation));
            drop(this);
            tracker.end();
        });
    }

    fn is_calling_thread(&self) -> bool {
        self.progress().caller == Some(thread::current().id())
    }
}
