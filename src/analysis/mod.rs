//! Per-method worklist engines.
//!
//! Each analysis walks CFG states depth-first with an explicit pending
//! stack, folding at loop headers once a revisited frame is no more
//! precise than a recorded one, and memoizing fully processed states per
//! instruction index. Native recursion is never used; method bodies can
//! be adversarially deep.

pub mod combined;
pub mod in_out;
pub mod in_throw;
pub mod negation;
pub mod params;
pub mod purity;

use crate::cfg::RichControlFlow;
use crate::config::{AnalysisConfig, CANCEL_POLL_INTERVAL};
use crate::descriptor::{TypeShape, method_arg_shapes};
use crate::errors::AnalysisError;
use crate::frame::Frame;
use crate::ir::{IfCond, MethodIr};
use crate::keys::ParamConstraint;
use crate::values::BasicValue;

/// Configuration of one instruction: index plus abstract frame.
#[derive(Clone, Debug)]
pub struct Conf {
    pub insn_index: usize,
    pub frame: Frame<BasicValue>,
}

fn slots_equiv(a: &[BasicValue], b: &[BasicValue]) -> bool {
    let len = a.len().max(b.len());
    (0..len).all(|slot| {
        let left = a.get(slot).unwrap_or(&BasicValue::Uninit);
        let right = b.get(slot).unwrap_or(&BasicValue::Uninit);
        left.equiv(right)
    })
}

fn slots_instance_of(a: &[BasicValue], b: &[BasicValue]) -> bool {
    let len = a.len().max(b.len());
    (0..len).all(|slot| {
        let left = a.get(slot).unwrap_or(&BasicValue::Uninit);
        let right = b.get(slot).unwrap_or(&BasicValue::Uninit);
        left.is_instance_of(right)
    })
}

impl Conf {
    pub fn equiv(&self, other: &Conf) -> bool {
        self.insn_index == other.insn_index
            && slots_equiv(&self.frame.locals, &other.frame.locals)
            && slots_equiv(&self.frame.stack, &other.frame.stack)
    }

    /// Widening order: every slot of `self` is at least as specific as the
    /// corresponding slot of `base`.
    pub fn is_instance_of(&self, base: &Conf) -> bool {
        self.insn_index == base.insn_index
            && slots_instance_of(&self.frame.locals, &base.frame.locals)
            && slots_instance_of(&self.frame.stack, &base.frame.stack)
    }
}

/// One worklist state: a conf, the loop-header history it grew through,
/// whether a tracked-value branch was already taken, and whether the path
/// crossed an exceptional edge.
#[derive(Clone, Debug)]
pub struct State {
    pub conf: Conf,
    pub history: Vec<Conf>,
    pub taken: bool,
    pub unsure: bool,
}

impl State {
    pub fn start(frame: Frame<BasicValue>) -> State {
        State {
            conf: Conf {
                insn_index: 0,
                frame,
            },
            history: Vec::new(),
            taken: false,
            unsure: false,
        }
    }

    pub fn equiv(&self, other: &State) -> bool {
        self.taken == other.taken
            && self.unsure == other.unsure
            && self.conf.equiv(&other.conf)
            && self.history.len() == other.history.len()
            && self
                .history
                .iter()
                .zip(&other.history)
                .all(|(a, b)| a.equiv(b))
    }
}

/// Tagged work item: either advance a state or fold a finished path's
/// result into the accumulator.
pub enum PendingAction<R> {
    ProceedState(State),
    MakeResult { unsure: bool, result: R },
}

/// Shared engine plumbing: the pending stack, per-instruction memoization,
/// the step budget, and cancellation polling.
pub struct Chassis<'a, R> {
    pub flow: &'a RichControlFlow,
    pub method: &'a MethodIr,
    pub config: &'a AnalysisConfig,
    pending: Vec<PendingAction<R>>,
    computed: Vec<Vec<State>>,
    steps: usize,
}

impl<'a, R> Chassis<'a, R> {
    pub fn new(flow: &'a RichControlFlow, method: &'a MethodIr, config: &'a AnalysisConfig) -> Chassis<'a, R> {
        Chassis {
            flow,
            method,
            config,
            pending: Vec::new(),
            computed: vec![Vec::new(); flow.graph.instruction_count()],
            steps: 0,
        }
    }

    pub fn push_proceed(&mut self, state: State) {
        self.pending.push(PendingAction::ProceedState(state));
    }

    pub fn push_result(&mut self, unsure: bool, result: R) {
        self.pending.push(PendingAction::MakeResult { unsure, result });
    }

    pub fn pop(&mut self) -> Result<Option<PendingAction<R>>, AnalysisError> {
        let Some(action) = self.pending.pop() else {
            return Ok(None);
        };
        self.steps += 1;
        if self.steps % CANCEL_POLL_INTERVAL == 0 && self.config.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if self.steps > self.config.steps_limit {
            return Err(AnalysisError::TooComplex);
        }
        Ok(Some(action))
    }

    /// Fold-or-memoize gate. Returns false when the state needs no further
    /// processing: it is covered by loop history or was already computed.
    pub fn admit(&mut self, state: &State) -> bool {
        let index = state.conf.insn_index;
        if self.flow.dfs.loop_enters[index]
            && state
                .history
                .iter()
                .any(|prev| state.conf.is_instance_of(prev))
        {
            return false;
        }
        if self.computed[index].iter().any(|prev| state.equiv(prev)) {
            return false;
        }
        self.computed[index].push(state.clone());
        true
    }

    /// History for a successor of `state`: grows by the current conf when
    /// the current instruction heads a loop.
    pub fn successor_history(&self, state: &State) -> Vec<Conf> {
        let mut history = state.history.clone();
        if self.flow.dfs.loop_enters[state.conf.insn_index] {
            history.push(state.conf.clone());
        }
        history
    }

    /// Frame seen by an exception handler: locals survive, the stack is
    /// replaced by the thrown reference.
    pub fn handler_frame(&self, frame: &Frame<BasicValue>) -> Frame<BasicValue> {
        Frame {
            locals: frame.locals.clone(),
            stack: vec![BasicValue::NotNull],
        }
    }
}

/// Start frame: non-null receiver for instance methods, then one seeded
/// value per declared parameter at its local slot.
pub fn start_frame(
    method: &MethodIr,
    mut seed: impl FnMut(u16, TypeShape) -> BasicValue,
) -> Result<Frame<BasicValue>, AnalysisError> {
    let shapes = method_arg_shapes(&method.descriptor)
        .map_err(|err| AnalysisError::Malformed(format!("{err:#}")))?;
    let mut frame = Frame::new();
    let mut slot = 0u16;
    if !method.access.is_static {
        frame.set_local(0, BasicValue::NotNull);
        slot = 1;
    }
    for (param, shape) in shapes.into_iter().enumerate() {
        frame.set_local(slot, seed(param as u16, shape));
        slot += shape.slots();
    }
    Ok(frame)
}

/// The abstract value a parameter holds under an input assumption.
pub fn constraint_value(constraint: ParamConstraint) -> BasicValue {
    match constraint {
        ParamConstraint::NotNull => BasicValue::NotNull,
        ParamConstraint::Null => BasicValue::Null,
        ParamConstraint::True => BasicValue::True,
        ParamConstraint::False => BasicValue::False,
    }
}

/// Which successors of a conditional jump are consistent with the
/// condition operand: `(fallthrough, jump)`.
pub fn feasible(cond: IfCond, value: &BasicValue) -> (bool, bool) {
    match cond {
        IfCond::Null => match value {
            BasicValue::Null => (false, true),
            BasicValue::NotNull => (true, false),
            _ => (true, true),
        },
        IfCond::NonNull => match value {
            BasicValue::Null => (true, false),
            BasicValue::NotNull => (false, true),
            _ => (true, true),
        },
        // ifeq jumps when the int is zero, i.e. the boolean is false.
        IfCond::Eq => match value {
            BasicValue::False => (false, true),
            BasicValue::True => (true, false),
            _ => (true, true),
        },
        IfCond::Ne => match value {
            BasicValue::False => (true, false),
            BasicValue::True => (false, true),
            _ => (true, true),
        },
        _ => (true, true),
    }
}
