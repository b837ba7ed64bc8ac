use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::{Dynamic, Firing, TaskType};

/// Position of a parameter within its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// A declared formal parameter, at this ordinal position.
    Arg(usize),
    /// An ordering-only parameter; gates the call but supplies no argument.
    Hidden,
}

/// Formal parameter of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub(crate) target: TaskType,
    pub(crate) slot: Slot,
    pub(crate) is_list: bool,
}

impl Param {
    pub fn new(target: TaskType, position: usize, is_list: bool) -> Self {
        Self {
            target,
            slot: Slot::Arg(position),
            is_list,
        }
    }

    /// Hidden parameters behave like lists: they become ready once every
    /// expected producer has delivered.
    pub fn hidden(target: TaskType) -> Self {
        Self {
            target,
            slot: Slot::Hidden,
            is_list: true,
        }
    }

    pub fn target(&self) -> TaskType {
        self.target
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn is_list(&self) -> bool {
        self.is_list
    }
}

/// Append-only log of the results bound to one parameter. Snapshots share
/// the storage and see only the entries below their count.
#[derive(Debug, Clone, Default)]
pub(crate) struct BindingLog(Arc<RwLock<Vec<Firing>>>);

impl BindingLog {
    fn push(&self, firing: Firing) -> usize {
        let mut entries = self.0.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(firing);
        entries.len() - 1
    }
}

/// The first `count` entries of a binding log, fixed at freeze time.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    log: BindingLog,
    count: usize,
}

impl Snapshot {
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn get(&self, ordinal: usize) -> Option<Firing> {
        if ordinal >= self.count {
            return None;
        }
        let entries = self.log.0.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(ordinal).cloned()
    }

    /// Values of a list argument taken from this snapshot.
    pub(crate) fn list_arg(&self) -> Vec<Dynamic> {
        let entries = self.log.0.read().unwrap_or_else(PoisonError::into_inner);
        list_arg(&entries[..self.count])
    }
}

/// Bindings received so far by one parameter of one call instance.
///
/// The binding log is append-only and the threshold only grows, so an ordinal
/// returned by [`ParamState::record_binding`] stays valid forever and can be
/// used as a snapshot bound.
#[derive(Debug)]
pub(crate) struct ParamState {
    param: Param,
    bindings: BindingLog,
    recorded: usize,
    threshold: usize,
    explicitly_wired: bool,
}

impl ParamState {
    pub(crate) fn new(param: Param) -> Self {
        Self {
            param,
            bindings: BindingLog::default(),
            recorded: 0,
            threshold: 0,
            explicitly_wired: false,
        }
    }

    pub(crate) fn param(&self) -> &Param {
        &self.param
    }

    /// Appends a result and returns its ordinal.
    pub(crate) fn record_binding(&mut self, firing: Firing) -> usize {
        let ordinal = self.bindings.push(firing);
        self.recorded = ordinal + 1;
        ordinal
    }

    pub(crate) fn ready(&self) -> bool {
        if self.param.is_list {
            self.recorded >= self.threshold
        } else {
            self.recorded > 0
        }
    }

    /// One more producer of the target type exists structurally.
    pub(crate) fn bump_threshold(&mut self) {
        self.threshold += 1;
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    pub(crate) fn snapshot_binding_count(&self) -> usize {
        self.recorded
    }

    /// View of the bindings below `count`, for enumeration outside the lock.
    /// Nothing is copied.
    pub(crate) fn frozen(&self, count: usize) -> Snapshot {
        assert!(
            count <= self.recorded,
            "freeze bound {count} beyond {} recorded bindings",
            self.recorded
        );
        Snapshot {
            log: self.bindings.clone(),
            count,
        }
    }

    pub(crate) fn set_explicitly_wired(&mut self) {
        self.explicitly_wired = true;
    }

    pub(crate) fn is_explicitly_wired(&self) -> bool {
        self.explicitly_wired
    }
}

impl Display for ParamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.param.target, self.recorded, self.threshold)
    }
}

/// Values of a list argument: only producers that fired are included.
pub(crate) fn list_arg(bindings: &[Firing]) -> Vec<Dynamic> {
    bindings
        .iter()
        .filter(|firing| firing.fired)
        .map(|firing| firing.unit.clone())
        .collect()
}
