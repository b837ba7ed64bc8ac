use std::any::{Any, TypeId, type_name};
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

/// Type-erased work unit. Every unit registered with the engine is stored
/// behind this pointer, and downstream calls receive it back as an argument.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Identity of a dependency type.
///
/// Parameters are matched to producers by this identity, so two units of the
/// same Rust type are interchangeable producers for any parameter of that type.
#[derive(Clone, Copy)]
pub struct TaskType {
    id: TypeId,
    name: &'static str,
}

impl TaskType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without the module path, used in signatures and logs.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        match base.rfind("::") {
            Some(pos) => &self.name[pos + 2..],
            None => self.name,
        }
    }
}

impl PartialEq for TaskType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskType {}

impl Hash for TaskType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskType({})", self.short_name())
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Index of a registered unit within its orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Record of one completed invocation.
///
/// Even when `fired` is false the record is still delivered downstream, so
/// completion can propagate through the graph; it is only excluded from list
/// arguments and forces dependent scalar invocations to skip their method.
#[derive(Clone)]
pub struct Firing {
    pub(crate) unit: Dynamic,
    pub(crate) fired: bool,
    pub(crate) duration: Duration,
}

impl Firing {
    pub(crate) fn new(unit: Dynamic, fired: bool, duration: Duration) -> Self {
        Self {
            unit,
            fired,
            duration,
        }
    }

    /// Builds a record for a unit that was never invoked through a call, such
    /// as a value handed to the engine by an external producer.
    pub fn completed<T: Send + Sync + 'static>(unit: Arc<T>, fired: bool) -> Self {
        Self::new(unit, fired, Duration::ZERO)
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn duration_micros(&self) -> u128 {
        self.duration.as_micros()
    }

    /// Returns the producer instance if it is of type `T`.
    pub fn unit<T: 'static>(&self) -> Option<&T> {
        self.unit.downcast_ref::<T>()
    }
}

impl Debug for Firing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firing")
            .field("fired", &self.fired)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}
