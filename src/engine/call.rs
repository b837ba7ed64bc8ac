use std::borrow::Cow;
use std::fmt::{Debug, Display, Write};
use std::sync::Arc;

use crate::core::{Dynamic, TaskType};
use crate::engine::invocation::Arg;
use crate::engine::param::Param;

/// Type-erased method of a work unit.
///
/// Receives the unit itself and the frozen argument tuple; returns whether the
/// invocation fired.
pub type Method = Arc<dyn Fn(&Dynamic, &[Arg]) -> anyhow::Result<bool> + Send + Sync>;

/// Wraps a closure as a [`Method`].
pub fn method<F>(f: F) -> Method
where
    F: Fn(&Dynamic, &[Arg]) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Governs how overlapping invocations of the same call instance behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    /// Invocations may run concurrently.
    #[default]
    Default,
    /// At most one invocation runs at a time; the rest queue in arrival order.
    Sequential,
}

/// Per-call policies chosen at registration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub(crate) name: Option<Cow<'static, str>>,
    pub(crate) light: bool,
    pub(crate) scope: Scope,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in signatures and logs, defaults to `exec`.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the call as cheap: it always runs inline on the thread that made
    /// it ready instead of being handed to a worker.
    pub fn light(mut self) -> Self {
        self.light = true;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.scope = Scope::Sequential;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Binds a dependency type to a method, its parameters and its policies.
/// Never mutated after registration.
pub struct Call {
    task: TaskType,
    name: Cow<'static, str>,
    method: Option<Method>,
    light: bool,
    scope: Scope,
    params: Vec<Param>,
}

impl Call {
    pub fn new(task: TaskType, method: Method, options: CallOptions, params: Vec<Param>) -> Self {
        Self {
            task,
            name: options.name.unwrap_or(Cow::Borrowed("exec")),
            method: Some(method),
            light: options.light,
            scope: options.scope,
            params,
        }
    }

    /// Call for a type without behaviour. It takes no parameters and only
    /// publishes the unit downstream.
    pub fn empty(task: TaskType) -> Self {
        Self {
            task,
            name: Cow::Borrowed("<no-method>"),
            method: None,
            light: true,
            scope: Scope::Default,
            params: Vec::new(),
        }
    }

    pub fn task(&self) -> TaskType {
        self.task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn is_light(&self) -> bool {
        self.light
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// `Task.method(A,[B])`, list parameters in brackets.
    pub fn signature(&self) -> String {
        let mut acc = String::new();
        let _ = write!(acc, "{}.{}(", self.task, self.name);
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                acc.push(',');
            }
            if param.is_list {
                let _ = write!(acc, "[{}]", param.target);
            } else {
                let _ = write!(acc, "{}", param.target);
            }
        }
        acc.push(')');
        acc
    }
}

impl Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("signature", &self.signature())
            .field("light", &self.light)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Call {}", self.signature())
    }
}
