use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use crate::core::{Dynamic, Firing};
use crate::engine::call::Call;
use crate::engine::instance::CallInstance;
use crate::error::InvocationError;

/// One actual argument of an invocation.
#[derive(Clone)]
pub enum Arg {
    /// Value for a scalar parameter.
    One(Dynamic),
    /// Values for a list parameter, only producers that fired.
    Many(Vec<Dynamic>),
}

impl Arg {
    pub fn len(&self) -> usize {
        match self {
            Arg::One(_) => 1,
            Arg::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the scalar value if it is of type `T`.
    pub fn one<T: 'static>(&self) -> Option<&T> {
        match self {
            Arg::One(item) => item.downcast_ref::<T>(),
            Arg::Many(_) => None,
        }
    }

    /// Returns the list values if this is a list argument of type `T`.
    pub fn many<T: 'static>(&self) -> Option<Vec<&T>> {
        match self {
            Arg::One(_) => None,
            Arg::Many(items) => items.iter().map(|item| item.downcast_ref::<T>()).collect(),
        }
    }
}

impl Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::One(_) => f.write_str("One(..)"),
            Arg::Many(items) => write!(f, "Many({})", items.len()),
        }
    }
}

/// A call instance paired with a frozen argument tuple, ready to be executed
/// now or handed to a worker.
pub struct Invocation {
    instance: Arc<CallInstance>,
    args: Vec<Arg>,
    fire: bool,
    /// Holds the sequential-scope reservation of its call instance.
    reserved: bool,
}

impl Invocation {
    pub(crate) fn new(instance: Arc<CallInstance>, args: Vec<Arg>, fire: bool) -> Self {
        Self {
            instance,
            args,
            fire,
            reserved: false,
        }
    }

    pub(crate) fn reserved(mut self) -> Self {
        self.reserved = true;
        self
    }

    pub fn call(&self) -> &Call {
        self.instance.call()
    }

    pub fn instance(&self) -> &Arc<CallInstance> {
        &self.instance
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// False when an upstream scalar result did not fire: the method body is
    /// skipped and the result is recorded as non-firing.
    pub fn fire(&self) -> bool {
        self.fire
    }

    pub(crate) fn into_args(self) -> Vec<Arg> {
        self.args
    }

    pub(crate) fn holds_reservation(&self) -> bool {
        self.reserved
    }

    /// Executes the call's method with the frozen arguments.
    ///
    /// `context` describes how the invocation was scheduled and is only used
    /// for logs and error messages.
    ///
    /// # Errors
    /// Any error returned by the method, or a panic raised inside it, is
    /// wrapped into an [`InvocationError`] naming the call.
    pub fn run(&self, context: &'static str) -> Result<Firing, InvocationError> {
        let call = self.instance.call();
        let unit = self.instance.unit();

        let span = tracing::debug_span!("invoke", call = %call.signature(), context);
        let _enter = span.enter();

        let start = Instant::now();

        let result = match call.method() {
            None => Ok(self.fire),
            Some(_) if !self.fire => {
                tracing::debug!("skipping {}", self.instance);
                Ok(false)
            }
            Some(method) => {
                tracing::debug!("invoking {}", self.instance);
                // The unit and arguments are shared immutably; a panic inside
                // the method cannot leave engine state half-updated.
                match catch_unwind(AssertUnwindSafe(|| method(unit, &self.args))) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("Task panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("Task panicked: {s}")
                        } else {
                            String::from("Task panicked with unknown payload")
                        };

                        Err(anyhow::anyhow!(msg))
                    }
                }
            }
        };

        let duration = start.elapsed();

        match result {
            Ok(fired) => {
                tracing::debug!(?duration, fired, "completed {}", self.instance);
                Ok(Firing::new(unit.clone(), fired, duration))
            }
            Err(source) => {
                tracing::debug!(?duration, "failed {}: {source}", self.instance);
                Err(InvocationError {
                    call: call.signature(),
                    context,
                    duration,
                    source,
                })
            }
        }
    }

    /// Finishes the invocation. If it held the sequential reservation, the
    /// next queued invocation of the same call instance is returned, already
    /// holding the reservation.
    pub fn complete(self) -> Option<Invocation> {
        if self.reserved {
            self.instance.finish_sequential()
        } else {
            None
        }
    }
}

impl Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("call", &self.instance.call().signature())
            .field("args", &self.args)
            .field("fire", &self.fire)
            .field("reserved", &self.reserved)
            .finish()
    }
}
