use std::any::Any;
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{Dynamic, Firing, TaskId, TaskType};
use crate::engine::call::{Call, Scope};
use crate::engine::dispatch::Dispatcher;
use crate::engine::invocation::{Arg, Invocation};
use crate::engine::param::{Param, ParamState, Snapshot};

/// Handle to a hidden (ordering-only) parameter of a call instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HiddenId(usize);

/// Addresses one parameter of a call instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRef {
    Arg(usize),
    Hidden(HiddenId),
}

/// An upstream event delivered to [`CallInstance::bind`].
#[derive(Debug)]
pub enum Binding {
    /// No new result: the call fires if every parameter is already ready.
    /// Used for calls without scalar parameters, which no producer triggers.
    Root,
    /// A result for the declared parameter at this position.
    Arg(usize, Firing),
    /// A result for a hidden parameter.
    Hidden(HiddenId, Firing),
}

/// Identity and scheduling flags of the unit owning a call instance.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub(crate) id: TaskId,
    pub(crate) name: Cow<'static, str>,
    /// The external caller does not wait for this unit.
    pub(crate) no_wait: bool,
    /// Every invocation goes to a worker.
    pub(crate) fork: bool,
}

impl NodeInfo {
    pub fn new(id: TaskId, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id,
            name: name.into(),
            no_wait: false,
            fork: false,
        }
    }

    /// Invocations made ready on the dispatcher's calling thread are spawned.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Every firing invocation is spawned.
    pub fn fork(mut self) -> Self {
        self.fork = true;
        self
    }
}

/// Parameter bookkeeping, guarded by the call instance lock. The lock is
/// never held while a user method runs.
#[derive(Debug)]
struct State {
    params: Vec<ParamState>,
    hidden: Vec<ParamState>,
    hidden_index: HashMap<TaskType, HiddenId>,
    /// An invocation of a sequential call is executing.
    reserved: bool,
    /// Argument tuples of sequential invocations waiting for the reservation.
    queue: VecDeque<Vec<Arg>>,
}

impl State {
    fn param_mut(&mut self, target: ParamRef) -> &mut ParamState {
        match target {
            ParamRef::Arg(index) => {
                let len = self.params.len();
                self.params
                    .get_mut(index)
                    .unwrap_or_else(|| panic!("parameter {index} out of range for {len} parameters"))
            }
            ParamRef::Hidden(HiddenId(index)) => {
                let len = self.hidden.len();
                self.hidden
                    .get_mut(index)
                    .unwrap_or_else(|| panic!("hidden parameter {index} out of range for {len}"))
            }
        }
    }

    fn all_ready(&self) -> bool {
        self.params.iter().chain(self.hidden.iter()).all(ParamState::ready)
    }

    /// Freeze snapshot of the declared parameters. Bindings recorded after
    /// this point are not part of the current enumeration.
    fn freeze(&self) -> Vec<Frozen> {
        self.params
            .iter()
            .map(|state| Frozen {
                is_list: state.param().is_list,
                ready: state.ready(),
                bindings: state.frozen(state.snapshot_binding_count()),
            })
            .collect()
    }

    fn pop_sequential(&mut self) -> Option<Vec<Arg>> {
        self.queue.pop_front()
    }
}

/// Frozen view of one declared parameter.
struct Frozen {
    is_list: bool,
    ready: bool,
    bindings: Snapshot,
}

/// The parameter that triggered an enumeration, and the ordinal of its new
/// binding.
#[derive(Clone, Copy)]
struct FiringParam {
    index: usize,
    ordinal: usize,
}

/// Live bookkeeping for one occurrence of a [`Call`] in the graph.
///
/// Results arriving from upstream producers are recorded per parameter; once
/// every parameter is ready, each new result is combined with the previously
/// recorded values of the other parameters into fresh invocations.
pub struct CallInstance {
    call: Arc<Call>,
    unit: Dynamic,
    node: NodeInfo,
    state: Mutex<State>,
}

impl CallInstance {
    /// Creates the instance of `call` on `unit`. Bindings are then delivered
    /// through [`CallInstance::bind`] by whatever drives the graph.
    ///
    /// ```
    /// use std::sync::{Arc, Mutex};
    ///
    /// use crossbind::engine::{
    ///     Binding, Call, CallInstance, Dispatcher, Invocation, NodeInfo, Param, method,
    /// };
    /// use crossbind::{CallOptions, Firing, TaskId, TaskType};
    ///
    /// struct Total;
    /// struct Value(u32);
    ///
    /// #[derive(Default)]
    /// struct Collect(Mutex<Vec<Invocation>>);
    ///
    /// impl Dispatcher for Collect {
    ///     fn run_inline(&self, invocation: Invocation) {
    ///         self.0.lock().unwrap().push(invocation);
    ///     }
    ///
    ///     fn spawn(&self, invocation: Invocation) {
    ///         self.0.lock().unwrap().push(invocation);
    ///     }
    ///
    ///     fn is_calling_thread(&self) -> bool {
    ///         false
    ///     }
    /// }
    ///
    /// let call = Call::new(
    ///     TaskType::of::<Total>(),
    ///     method(|_, args| Ok(args[0].one::<Value>().is_some_and(|v| v.0 > 0))),
    ///     CallOptions::new(),
    ///     vec![Param::new(TaskType::of::<Value>(), 0, false)],
    /// );
    /// let instance = CallInstance::new(
    ///     Arc::new(call),
    ///     Arc::new(Total),
    ///     NodeInfo::new(TaskId::new(0), "total").fork(),
    /// );
    ///
    /// let dispatcher = Collect::default();
    /// let value = Firing::completed(Arc::new(Value(3)), true);
    /// assert!(instance.bind(Binding::Arg(0, value), None, &dispatcher).is_none());
    ///
    /// let spawned = dispatcher.0.lock().unwrap().pop().unwrap();
    /// assert!(spawned.run("worker").unwrap().fired());
    /// ```
    pub fn new(call: Arc<Call>, unit: Arc<dyn Any + Send + Sync>, node: NodeInfo) -> Arc<Self> {
        let params = call.params().iter().copied().map(ParamState::new).collect();

        Arc::new(Self {
            call,
            unit,
            node,
            state: Mutex::new(State {
                params,
                hidden: Vec::new(),
                hidden_index: HashMap::new(),
                reserved: false,
                queue: VecDeque::new(),
            }),
        })
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn task(&self) -> TaskId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub(crate) fn unit(&self) -> &Dynamic {
        &self.unit
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an ordering-only parameter targeting `target`, or returns the
    /// existing one for that type. It gates firing like a list parameter but
    /// contributes no argument.
    pub fn add_hidden_param(&self, target: TaskType) -> HiddenId {
        let mut state = self.state();
        if let Some(&id) = state.hidden_index.get(&target) {
            return id;
        }

        let id = HiddenId(state.hidden.len());
        state.hidden.push(ParamState::new(Param::hidden(target)));
        state.hidden_index.insert(target, id);
        tracing::trace!("{} gained hidden parameter {}", self.name(), target);
        id
    }

    /// A new producer for a list or hidden parameter was added to the graph.
    pub fn bump_threshold(&self, target: ParamRef) {
        let mut state = self.state();
        let param = state.param_mut(target);
        if param.param().is_list {
            param.bump_threshold();
        }
    }

    pub fn threshold(&self, target: ParamRef) -> usize {
        self.state().param_mut(target).threshold()
    }

    pub fn set_explicitly_wired(&self, index: usize) {
        self.state().param_mut(ParamRef::Arg(index)).set_explicitly_wired();
    }

    pub fn is_explicitly_wired(&self, index: usize) -> bool {
        self.state().param_mut(ParamRef::Arg(index)).is_explicitly_wired()
    }

    /// Number of sequential invocations waiting for the reservation.
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Records a result and launches every invocation it makes possible.
    ///
    /// At most one invocation is returned for the calling thread to run. If
    /// the caller already holds `pending` and a new invocation is produced,
    /// `pending` is handed to a worker and the new one is returned instead.
    ///
    /// # Panics
    /// If the binding addresses a parameter this call does not have.
    pub fn bind(
        self: &Arc<Self>,
        binding: Binding,
        pending: Option<Invocation>,
        dispatcher: &dyn Dispatcher,
    ) -> Option<Invocation> {
        let (frozen, firing) = match binding {
            Binding::Root => {
                let state = self.state();
                if !state.all_ready() {
                    tracing::trace!("{} not ready at registration", self.display(&state));
                    return pending;
                }

                (state.freeze(), None)
            }
            Binding::Arg(index, result) => {
                let mut state = self.state();
                let ordinal = state.param_mut(ParamRef::Arg(index)).record_binding(result);

                if !state.all_ready() {
                    tracing::trace!("{} not ready after binding {index}", self.display(&state));
                    return pending;
                }

                (state.freeze(), Some(FiringParam { index, ordinal }))
            }
            Binding::Hidden(id, result) => {
                let mut state = self.state();
                state.param_mut(ParamRef::Hidden(id)).record_binding(result);

                if !state.all_ready() {
                    tracing::trace!("{} not ready after hidden binding", self.display(&state));
                    return pending;
                }

                (state.freeze(), None)
            }
        };

        self.cross_invoke(&frozen, firing, pending, dispatcher)
    }

    fn cross_invoke(
        self: &Arc<Self>,
        frozen: &[Frozen],
        firing: Option<FiringParam>,
        pending: Option<Invocation>,
        dispatcher: &dyn Dispatcher,
    ) -> Option<Invocation> {
        let mut args = Vec::with_capacity(frozen.len());
        self.cross_invoke_at(0, &mut args, true, frozen, firing, pending, dispatcher)
    }

    /// Fills the argument at position `px` and recurses to the right. Scalar
    /// parameters other than the firing one branch over every frozen binding;
    /// the firing parameter is fixed to its new binding; list parameters
    /// contribute one aggregate argument.
    #[allow(clippy::too_many_arguments)]
    fn cross_invoke_at(
        self: &Arc<Self>,
        px: usize,
        args: &mut Vec<Arg>,
        fire: bool,
        frozen: &[Frozen],
        firing: Option<FiringParam>,
        mut pending: Option<Invocation>,
        dispatcher: &dyn Dispatcher,
    ) -> Option<Invocation> {
        if px == self.call.params().len() {
            return self.launch(args.clone(), fire, pending, dispatcher);
        }

        assert!(
            px < frozen.len(),
            "{}: parameter position {px} beyond freeze snapshot of {}",
            self.call.signature(),
            frozen.len()
        );

        let param = &frozen[px];

        if param.is_list {
            if !param.ready {
                return pending;
            }
            // Only fired values are listed, and they do not affect `fire`.
            args.push(Arg::Many(param.bindings.list_arg()));
            pending = self.cross_invoke_at(px + 1, args, fire, frozen, firing, pending, dispatcher);
            args.pop();
        } else if let Some(firing) = firing.filter(|firing| firing.index == px) {
            pending = self.cross_invoke_next(
                px,
                firing.ordinal,
                args,
                fire,
                frozen,
                Some(firing),
                pending,
                dispatcher,
            );
        } else {
            for ordinal in 0..param.bindings.len() {
                pending = self.cross_invoke_next(
                    px, ordinal, args, fire, frozen, firing, pending, dispatcher,
                );
            }
        }

        pending
    }

    #[allow(clippy::too_many_arguments)]
    fn cross_invoke_next(
        self: &Arc<Self>,
        px: usize,
        ordinal: usize,
        args: &mut Vec<Arg>,
        fire: bool,
        frozen: &[Frozen],
        firing: Option<FiringParam>,
        pending: Option<Invocation>,
        dispatcher: &dyn Dispatcher,
    ) -> Option<Invocation> {
        let bindings = &frozen[px].bindings;
        let binding = bindings.get(ordinal).unwrap_or_else(|| {
            panic!(
                "{}: binding {ordinal} of parameter {px} beyond freeze bound {}",
                self.call.signature(),
                bindings.len()
            )
        });

        let fire = fire && binding.fired;
        args.push(Arg::One(binding.unit));
        let pending = self.cross_invoke_at(px + 1, args, fire, frozen, firing, pending, dispatcher);
        args.pop();
        pending
    }

    /// Decides where a complete candidate invocation runs.
    fn launch(
        self: &Arc<Self>,
        args: Vec<Arg>,
        fire: bool,
        pending: Option<Invocation>,
        dispatcher: &dyn Dispatcher,
    ) -> Option<Invocation> {
        let invocation = Invocation::new(self.clone(), args, fire);

        if !fire {
            // Nothing but bookkeeping runs for a skipped method.
            dispatcher.run_inline(invocation);
        } else if self.call.is_light() {
            dispatcher.run_inline(invocation);
        } else if self.node.no_wait && dispatcher.is_calling_thread() {
            dispatcher.spawn(invocation);
        } else if self.node.fork {
            dispatcher.spawn(invocation);
        } else if let Some(invocation) = self.admit(invocation) {
            if let Some(previous) = pending {
                dispatcher.spawn(previous);
            }
            return Some(invocation);
        }

        pending
    }

    /// Sequential-scope admission. Returns `None` when the invocation was
    /// queued behind the one currently executing.
    fn admit(&self, invocation: Invocation) -> Option<Invocation> {
        if self.call.scope() != Scope::Sequential {
            return Some(invocation);
        }

        let mut state = self.state();
        if state.reserved {
            state.queue.push_back(invocation.into_args());
            tracing::trace!("{} queued ({} waiting)", self.name(), state.queue.len());
            None
        } else {
            state.reserved = true;
            Some(invocation.reserved())
        }
    }

    /// Releases the sequential reservation, or passes it straight to the next
    /// queued argument tuple if there is one.
    pub(crate) fn finish_sequential(self: &Arc<Self>) -> Option<Invocation> {
        let mut state = self.state();
        match state.pop_sequential() {
            Some(args) => {
                tracing::trace!("{} drained ({} waiting)", self.name(), state.queue.len());
                Some(Invocation::new(self.clone(), args, true).reserved())
            }
            None => {
                state.reserved = false;
                None
            }
        }
    }

    fn display(&self, state: &State) -> String {
        let params: Vec<_> = state.params.iter().map(ToString::to_string).collect();
        format!("{}.{}({})", self.node.name, self.call.name(), params.join(","))
    }
}

impl Display for CallInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display(&self.state()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::call::{CallOptions, Method, method};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct A(u32);
    #[derive(Debug)]
    struct B(u32);
    struct C;

    #[derive(Default)]
    struct Recorder {
        calling: bool,
        inline: Mutex<Vec<Invocation>>,
        spawned: Mutex<Vec<Invocation>>,
    }

    impl Recorder {
        fn calling() -> Self {
            Self {
                calling: true,
                ..Default::default()
            }
        }

        fn inline(&self) -> Vec<Invocation> {
            std::mem::take(&mut *self.inline.lock().unwrap())
        }

        fn spawned(&self) -> Vec<Invocation> {
            std::mem::take(&mut *self.spawned.lock().unwrap())
        }
    }

    impl Dispatcher for Recorder {
        fn run_inline(&self, invocation: Invocation) {
            self.inline.lock().unwrap().push(invocation);
        }

        fn spawn(&self, invocation: Invocation) {
            self.spawned.lock().unwrap().push(invocation);
        }

        fn is_calling_thread(&self) -> bool {
            self.calling
        }
    }

    fn node() -> NodeInfo {
        NodeInfo::new(TaskId(0), "c")
    }

    fn instance_with(
        params: Vec<Param>,
        options: CallOptions,
        node: NodeInfo,
        method: Method,
    ) -> Arc<CallInstance> {
        let call = Call::new(TaskType::of::<C>(), method, options, params);
        CallInstance::new(Arc::new(call), Arc::new(C), node)
    }

    fn instance(params: Vec<Param>, options: CallOptions, node: NodeInfo) -> Arc<CallInstance> {
        instance_with(params, options, node, method(|_, _| Ok(true)))
    }

    fn scalar<T: 'static>(position: usize) -> Param {
        Param::new(TaskType::of::<T>(), position, false)
    }

    fn list<T: 'static>(position: usize) -> Param {
        Param::new(TaskType::of::<T>(), position, true)
    }

    fn result<T: Send + Sync + 'static>(value: T, fired: bool) -> Firing {
        Firing::completed(Arc::new(value), fired)
    }

    fn pair(invocation: &Invocation) -> (u32, u32) {
        let a = invocation.args()[0].one::<A>().unwrap().0;
        let b = invocation.args()[1].one::<B>().unwrap().0;
        (a, b)
    }

    #[test]
    fn test_single_scalar_fires_once() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new(), node());

        let invocation = instance
            .bind(Binding::Arg(0, result(A(1), true)), None, &recorder)
            .unwrap();

        assert_eq!(invocation.args().len(), 1);
        assert_eq!(invocation.args()[0].one::<A>().unwrap().0, 1);
        assert!(invocation.fire());
        assert!(recorder.inline().is_empty());
        assert!(recorder.spawned().is_empty());
    }

    #[test]
    fn test_not_ready_returns_pending() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0), scalar::<B>(1)], CallOptions::new(), node());
        let other = self::instance(vec![], CallOptions::new(), node());
        let pending = other.bind(Binding::Root, None, &recorder);

        let returned = instance.bind(Binding::Arg(0, result(A(1), true)), pending, &recorder);

        // The caller keeps its own pending invocation untouched.
        assert_eq!(returned.unwrap().args().len(), 0);
        assert!(recorder.spawned().is_empty());
    }

    #[test]
    fn test_list_threshold_and_filtering() {
        let recorder = Recorder::default();
        let instance = instance(vec![list::<B>(0)], CallOptions::new(), node());
        for _ in 0..3 {
            instance.bump_threshold(ParamRef::Arg(0));
        }

        assert!(instance.bind(Binding::Arg(0, result(B(2), false)), None, &recorder).is_none());
        assert!(instance.bind(Binding::Arg(0, result(B(1), true)), None, &recorder).is_none());
        let invocation = instance
            .bind(Binding::Arg(0, result(B(3), true)), None, &recorder)
            .unwrap();

        let items = invocation.args()[0].many::<B>().unwrap();
        let values: Vec<u32> = items.iter().map(|b| b.0).collect();
        assert_eq!(values, vec![1, 3]);
        // A non-firing producer in a list does not skip the consumer.
        assert!(invocation.fire());
    }

    #[test]
    fn test_no_duplicate_combinations() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0), scalar::<B>(1)], CallOptions::new(), node());

        let mut seen = Vec::new();
        let mut collect = |returned: Option<Invocation>, recorder: &Recorder| {
            seen.extend(returned.as_ref().map(pair));
            seen.extend(recorder.spawned().iter().map(pair));
        };

        let r = instance.bind(Binding::Arg(1, result(B(1), true)), None, &recorder);
        assert!(r.is_none());
        let r = instance.bind(Binding::Arg(0, result(A(1), true)), None, &recorder);
        collect(r, &recorder);
        let r = instance.bind(Binding::Arg(1, result(B(2), true)), None, &recorder);
        collect(r, &recorder);
        let r = instance.bind(Binding::Arg(0, result(A(2), true)), None, &recorder);
        collect(r, &recorder);

        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "combination repeated: {seen:?}");
        assert_eq!(unique, HashSet::from([(1, 1), (1, 2), (2, 1), (2, 2)]));
    }

    #[test]
    fn test_concurrent_arrivals_cover_every_combination_once() {
        const THREADS: u32 = 8;
        const PER_THREAD: u32 = 10;

        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0), scalar::<B>(1)], CallOptions::new(), node());
        let returned = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for t in 0..THREADS {
                let (instance, recorder, returned) = (&instance, &recorder, &returned);
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        let value = t * 100 + i;
                        let bindings = [
                            Binding::Arg(0, result(A(value), true)),
                            Binding::Arg(1, result(B(value), true)),
                        ];
                        for binding in bindings {
                            if let Some(invocation) = instance.bind(binding, None, recorder) {
                                returned.lock().unwrap().push(pair(&invocation));
                            }
                        }
                    }
                });
            }
        });

        let mut seen = returned.into_inner().unwrap();
        seen.extend(recorder.spawned().iter().map(pair));
        assert!(recorder.inline().is_empty());

        let total = (THREADS * PER_THREAD) as usize;
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "combination repeated");
        assert_eq!(unique.len(), total * total);
    }

    #[test]
    fn test_newest_value_fixed_for_firing_parameter() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0), scalar::<B>(1)], CallOptions::new(), node());

        instance.bind(Binding::Arg(0, result(A(1), true)), None, &recorder);
        instance.bind(Binding::Arg(0, result(A(2), true)), None, &recorder);
        let returned = instance.bind(Binding::Arg(1, result(B(1), true)), None, &recorder);

        // Both earlier values of A pair with the new B: one returned, one spawned.
        let mut pairs = vec![pair(&returned.unwrap())];
        pairs.extend(recorder.spawned().iter().map(pair));
        pairs.sort();
        assert_eq!(pairs, vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn test_non_firing_scalar_runs_inline_and_skips() {
        let recorder = Recorder::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let instance = instance_with(
            vec![scalar::<A>(0)],
            CallOptions::new(),
            node(),
            method(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        );

        let returned = instance.bind(Binding::Arg(0, result(A(1), false)), None, &recorder);
        assert!(returned.is_none());

        let inline = recorder.inline();
        assert_eq!(inline.len(), 1);
        assert!(!inline[0].fire());

        let firing = inline[0].run("non-fire").unwrap();
        assert!(!firing.fired());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_light_bypasses_every_other_rule() {
        let recorder = Recorder::calling();
        let node = NodeInfo {
            no_wait: true,
            fork: true,
            ..node()
        };
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new().light(), node);

        let returned = instance.bind(Binding::Arg(0, result(A(1), true)), None, &recorder);

        assert!(returned.is_none());
        assert_eq!(recorder.inline().len(), 1);
        assert!(recorder.spawned().is_empty());
    }

    #[test]
    fn test_no_wait_spawns_only_from_calling_thread() {
        let node = NodeInfo {
            no_wait: true,
            ..node()
        };

        let caller = Recorder::calling();
        let instance = self::instance(vec![scalar::<A>(0)], CallOptions::new(), node.clone());
        assert!(instance.bind(Binding::Arg(0, result(A(1), true)), None, &caller).is_none());
        assert_eq!(caller.spawned().len(), 1);

        let worker = Recorder::default();
        let instance = self::instance(vec![scalar::<A>(0)], CallOptions::new(), node);
        assert!(instance.bind(Binding::Arg(0, result(A(1), true)), None, &worker).is_some());
        assert!(worker.spawned().is_empty());
    }

    #[test]
    fn test_node_info_builder() {
        let node = NodeInfo::new(TaskId::new(4), "unit").no_wait().fork();
        assert_eq!(node.id.index(), 4);
        assert_eq!(node.name, "unit");
        assert!(node.no_wait && node.fork);

        let plain = NodeInfo::new(TaskId::new(0), String::from("plain"));
        assert!(!plain.no_wait && !plain.fork);
    }

    #[test]
    fn test_fork_always_spawns() {
        let recorder = Recorder::default();
        let node = NodeInfo { fork: true, ..node() };
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new(), node);

        assert!(instance.bind(Binding::Arg(0, result(A(1), true)), None, &recorder).is_none());
        assert_eq!(recorder.spawned().len(), 1);
    }

    #[test]
    fn test_pending_is_spawned_when_replaced() {
        let recorder = Recorder::default();
        let first = instance(vec![scalar::<A>(0)], CallOptions::new(), node());
        let second = instance(vec![scalar::<A>(0)], CallOptions::new(), node());

        let pending = first.bind(Binding::Arg(0, result(A(1), true)), None, &recorder);
        let returned = second.bind(Binding::Arg(0, result(A(2), true)), pending, &recorder);

        assert_eq!(returned.unwrap().args()[0].one::<A>().unwrap().0, 2);
        let spawned = recorder.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].args()[0].one::<A>().unwrap().0, 1);
    }

    #[test]
    fn test_sequential_queue_is_fifo() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new().sequential(), node());

        let first = instance
            .bind(Binding::Arg(0, result(A(1), true)), None, &recorder)
            .unwrap();
        assert!(instance.bind(Binding::Arg(0, result(A(2), true)), None, &recorder).is_none());
        assert!(instance.bind(Binding::Arg(0, result(A(3), true)), None, &recorder).is_none());
        assert_eq!(instance.queued(), 2);
        assert!(recorder.spawned().is_empty());

        let second = first.complete().unwrap();
        assert_eq!(second.args()[0].one::<A>().unwrap().0, 2);
        let third = second.complete().unwrap();
        assert_eq!(third.args()[0].one::<A>().unwrap().0, 3);
        assert!(third.complete().is_none());
        assert_eq!(instance.queued(), 0);

        // Idle again: the next invocation is admitted directly.
        let next = instance.bind(Binding::Arg(0, result(A(4), true)), None, &recorder);
        assert!(next.is_some());
    }

    #[test]
    fn test_hidden_param_gates_without_argument() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new(), node());
        let hidden = instance.add_hidden_param(TaskType::of::<B>());
        assert_eq!(instance.add_hidden_param(TaskType::of::<B>()), hidden);
        instance.bump_threshold(ParamRef::Hidden(hidden));

        assert!(instance.bind(Binding::Arg(0, result(A(1), true)), None, &recorder).is_none());

        let invocation = instance
            .bind(Binding::Hidden(hidden, result(B(1), true)), None, &recorder)
            .unwrap();
        assert_eq!(invocation.args().len(), 1);
        assert_eq!(invocation.args()[0].one::<A>().unwrap().0, 1);
    }

    #[test]
    fn test_list_refires_with_frozen_scalar() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0), list::<B>(1)], CallOptions::new(), node());

        instance.bump_threshold(ParamRef::Arg(1));
        assert!(instance.bind(Binding::Arg(1, result(B(1), true)), None, &recorder).is_none());

        let first = instance
            .bind(Binding::Arg(0, result(A(1), true)), None, &recorder)
            .unwrap();
        assert_eq!(first.args()[0].one::<A>().unwrap().0, 1);
        assert_eq!(first.args()[1].many::<B>().unwrap().len(), 1);

        instance.bump_threshold(ParamRef::Arg(1));
        assert_eq!(instance.threshold(ParamRef::Arg(1)), 2);
        let second = instance
            .bind(Binding::Arg(1, result(B(2), false)), None, &recorder)
            .unwrap();
        assert_eq!(second.args()[0].one::<A>().unwrap().0, 1);
        let items = second.args()[1].many::<B>().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, 1);
        assert!(second.fire());
    }

    #[test]
    fn test_explicit_wiring_flag() {
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new(), node());
        assert!(!instance.is_explicitly_wired(0));
        instance.set_explicitly_wired(0);
        assert!(instance.is_explicitly_wired(0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bind_unknown_parameter() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new(), node());
        instance.bind(Binding::Arg(3, result(A(1), true)), None, &recorder);
    }

    #[test]
    fn test_root_binding_waits_for_scalars() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0)], CallOptions::new(), node());
        assert!(instance.bind(Binding::Root, None, &recorder).is_none());
        assert!(recorder.inline().is_empty());
    }

    #[test]
    fn test_root_binding_with_unproduced_list() {
        let recorder = Recorder::default();
        let instance = instance(vec![list::<B>(0)], CallOptions::new(), node());

        let invocation = instance.bind(Binding::Root, None, &recorder).unwrap();
        assert!(invocation.args()[0].is_empty());
        assert!(invocation.fire());
    }

    #[test]
    fn test_run_boolean_false_does_not_fire() {
        let recorder = Recorder::default();
        let instance = instance_with(vec![], CallOptions::new(), node(), method(|_, _| Ok(false)));

        let invocation = instance.bind(Binding::Root, None, &recorder).unwrap();
        let firing = invocation.run("inline").unwrap();
        assert!(!firing.fired());
        assert!(firing.unit::<C>().is_some());
    }

    #[test]
    fn test_run_wraps_errors() {
        let recorder = Recorder::default();
        let instance = instance_with(
            vec![],
            CallOptions::new().name("explode"),
            node(),
            method(|_, _| {
                thread::sleep(Duration::from_millis(2));
                Err(anyhow::anyhow!("boom"))
            }),
        );

        let invocation = instance.bind(Binding::Root, None, &recorder).unwrap();
        let error = invocation.run("inline").unwrap_err();
        assert_eq!(error.call, "C.explode()");
        assert!(error.duration >= Duration::from_millis(2));
        assert_eq!(error.context, "inline");
        assert!(error.to_string().contains("boom"));
    }

    #[test]
    fn test_run_wraps_panics() {
        let recorder = Recorder::default();
        let instance = instance_with(
            vec![],
            CallOptions::new(),
            node(),
            method(|_, _| panic!("bad state")),
        );

        let invocation = instance.bind(Binding::Root, None, &recorder).unwrap();
        let error = invocation.run("worker").unwrap_err();
        assert!(error.source.to_string().contains("Task panicked: bad state"));
    }

    #[test]
    fn test_display_state() {
        let recorder = Recorder::default();
        let instance = instance(vec![scalar::<A>(0), list::<B>(1)], CallOptions::new(), node());
        instance.bump_threshold(ParamRef::Arg(1));
        instance.bind(Binding::Arg(0, result(A(1), true)), None, &recorder);
        assert_eq!(instance.to_string(), "c.exec(A:1/0,B:0/1)");
    }
}
