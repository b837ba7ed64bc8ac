use std::any::type_name;
use std::borrow::Cow;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::core::{Dynamic, TaskId, TaskType};
use crate::engine::{Arg, Call, CallOptions, Many, One, Params, method};

/// Return values a unit method may produce.
///
/// `()` always fires. `bool` fires only when `true`; returning `false` keeps
/// the unit out of downstream list arguments and skips dependent scalar
/// calls, while still completing it.
pub trait Fired {
    fn fired(self) -> bool;
}

impl Fired for () {
    fn fired(self) -> bool {
        true
    }
}

impl Fired for bool {
    fn fired(self) -> bool {
        self
    }
}

/// Declares a scalar parameter of type `T`.
pub fn one<T>() -> One<T> {
    One(PhantomData)
}

/// Declares a list parameter of type `T`.
pub fn many<T>() -> Many<T> {
    Many(PhantomData)
}

/// A unit of work waiting to be added to an
/// [`Orchestrator`](crate::Orchestrator).
///
/// `Work` wraps a plain value together with the methods the engine should
/// call on it. Each method declares its parameters by type; the orchestrator
/// invokes it once all producers of those types have delivered.
///
/// # Example
///
/// ```rust,no_run
/// use crossbind::{Orchestrator, Work, one};
///
/// struct Fetch(u32);
/// struct Render;
///
/// let orchestrator = Orchestrator::new().unwrap();
/// orchestrator.add(Work::new(Fetch(7)));
/// orchestrator.add(Work::new(Render).call(one::<Fetch>(), |_, fetch| {
///     println!("rendering {}", fetch.0);
///     Ok(())
/// }));
/// orchestrator.execute().unwrap();
/// ```
pub struct Work<T> {
    pub(crate) unit: Arc<T>,
    pub(crate) name: Option<Cow<'static, str>>,
    pub(crate) calls: Vec<Arc<Call>>,
    pub(crate) wires: Vec<(TaskType, TaskId)>,
    pub(crate) after: Vec<TaskType>,
    pub(crate) no_wait: bool,
    pub(crate) fork: bool,
}

impl<T> Work<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(unit: T) -> Self {
        Self::from_arc(Arc::new(unit))
    }

    pub fn from_arc(unit: Arc<T>) -> Self {
        Self {
            unit,
            name: None,
            calls: Vec::new(),
            wires: Vec::new(),
            after: Vec::new(),
            no_wait: false,
            fork: false,
        }
    }

    /// Name used in logs and diagnostics, defaults to the type name.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a method with default options.
    pub fn call<P, R, F>(self, params: P, callback: F) -> Self
    where
        P: Params,
        R: Fired,
        F: for<'a> Fn(&T, P::Output<'a>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.call_with(CallOptions::default(), params, callback)
    }

    /// Adds a method with explicit options.
    pub fn call_with<P, R, F>(mut self, options: CallOptions, _: P, callback: F) -> Self
    where
        P: Params,
        R: Fired,
        F: for<'a> Fn(&T, P::Output<'a>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let method = method(move |unit: &Dynamic, args: &[Arg]| {
            let unit = unit.downcast_ref::<T>().unwrap_or_else(|| {
                panic!("Expected {} but got something else", type_name::<T>())
            });
            let output = callback(unit, P::resolve(args))?;
            Ok(output.fired())
        });

        let call = Call::new(TaskType::of::<T>(), method, options, P::params());
        self.calls.push(Arc::new(call));
        self
    }

    /// Restricts every parameter of type `U` to the given producer, instead
    /// of every producer of `U` in the graph. May be repeated.
    pub fn wire<U: 'static>(mut self, producer: &TaskHandle<U>) -> Self {
        self.wires.push((TaskType::of::<U>(), producer.id));
        self
    }

    /// Runs after every producer of type `U` has completed, without taking
    /// any of them as an argument.
    pub fn after<U: 'static>(mut self) -> Self {
        let target = TaskType::of::<U>();
        if !self.after.contains(&target) {
            self.after.push(target);
        }
        self
    }

    /// The caller of [`execute`](crate::Orchestrator::execute) never runs this
    /// unit's methods on its own thread.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Every invocation of this unit's methods is handed to a worker.
    pub fn fork(mut self) -> Self {
        self.fork = true;
        self
    }
}

/// Reference to a unit added to an orchestrator.
pub struct TaskHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) unit: Arc<T>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn unit(&self) -> &Arc<T> {
        &self.unit
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            unit: self.unit.clone(),
        }
    }
}

impl<T> Deref for TaskHandle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.unit
    }
}
