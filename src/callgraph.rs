//! Collaborators the engine consumes but does not compute
//!
//! - [`CallGraph`]: resolved callee sets per call site and the inverse caller sets.
//!   Indirect targets are supplied by an external type-analysis layer; a call whose
//!   targets were only resolved coarsely is marked and excluded from learning.
//! - [`AliasOracle`]: the yes/no may-alias query.
//!
//! Purity comes from [`FnAttrs::pure`](crate::ir::FnAttrs) and debug metadata from
//! the IR itself.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::ir::{Callee, FuncId, InstId, InstKind, Program, Value};

/// Candidate targets of one call site
pub type CalleeSet = BTreeSet<FuncId>;

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    callees: HashMap<InstId, CalleeSet>,
    callers: HashMap<FuncId, BTreeSet<InstId>>,
    coarse_only: HashSet<InstId>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call graph with every direct, non-intrinsic call resolved
    ///
    /// Indirect calls start without targets; register them with
    /// [`add_indirect_targets`](Self::add_indirect_targets).
    pub fn from_direct_calls(program: &Program) -> Self {
        let mut graph = Self::new();
        for func in program.functions() {
            for call in program.calls_in(func.id) {
                if let InstKind::Call {
                    callee: Callee::Direct(target),
                    ..
                } = program.kind(call)
                    && !program.function(*target).attrs.intrinsic
                {
                    graph.add_target(call, *target);
                }
            }
        }
        graph
    }

    pub fn add_target(&mut self, call: InstId, target: FuncId) {
        self.callees.entry(call).or_default().insert(target);
        self.callers.entry(target).or_default().insert(call);
    }

    /// Register resolved targets of an indirect call
    ///
    /// `coarse_only` marks targets that come from the coarse, sound resolution layer.
    pub fn add_indirect_targets(
        &mut self,
        call: InstId,
        targets: impl IntoIterator<Item = FuncId>,
        coarse_only: bool,
    ) {
        for target in targets {
            self.add_target(call, target);
        }
        if coarse_only {
            self.coarse_only.insert(call);
        }
    }

    pub fn callees(&self, call: InstId) -> Option<&CalleeSet> {
        self.callees.get(&call)
    }

    /// Callees of the call behind `value`, if it is a resolved call
    pub fn callees_of_value(&self, value: Value) -> Option<&CalleeSet> {
        value.as_inst().and_then(|call| self.callees(call))
    }

    /// Call sites that may invoke `func`, in instruction order
    pub fn callers(&self, func: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.callers.get(&func).into_iter().flatten().copied()
    }

    pub fn is_coarse_only(&self, call: InstId) -> bool {
        self.coarse_only.contains(&call)
    }
}

/// May-alias query over pointer values
pub trait AliasOracle: Send + Sync {
    fn may_alias(&self, program: &Program, a: Value, b: Value) -> bool;
}

/// Syntactic alias oracle
///
/// Pointers alias when they share a base object and accumulated constant offset.
/// Distinct identified objects (stack slots, globals, functions, null) never alias.
/// Anything else may alias.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAliasOracle;

impl AliasOracle for BasicAliasOracle {
    fn may_alias(&self, program: &Program, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        let (base_a, offset_a) = program.strip_constant_offsets(a);
        let (base_b, offset_b) = program.strip_constant_offsets(b);
        if base_a == base_b {
            return offset_a == offset_b;
        }
        !(is_identified_object(program, base_a) && is_identified_object(program, base_b))
    }
}

fn is_identified_object(program: &Program, value: Value) -> bool {
    match value {
        Value::Null | Value::Func(_) | Value::Global(_) => true,
        Value::Inst(_) => matches!(program.kind_of(value), Some(InstKind::Alloca)),
        _ => false,
    }
}
