//! Parameter nullability analyses for the `In` directions.
//!
//! The not-null analysis asks whether passing null for one parameter is
//! guaranteed to fail; every path must fail for the claim to hold, so
//! path verdicts are combined conjunctively. The nullable analysis asks
//! whether null is handled safely on every path; any hazard (dereference,
//! escape to a field or array, monitor) refutes the claim outright.

use std::collections::BTreeSet;

use crate::analysis::{Conf, State, start_frame};
use crate::cfg::RichControlFlow;
use crate::config::{AnalysisConfig, CANCEL_POLL_INTERVAL};
use crate::errors::AnalysisError;
use crate::frame::{Frame, Interpreter, execute};
use crate::ir::{CallKind, Const, IfCond, Insn, Member, MethodIr};
use crate::keys::{Direction, EKey};
use crate::lattice::{Component, Pending, Rhs, STANDARD, Value};
use crate::values::BasicValue;

/// Verdict of one finished path in the not-null analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
enum PathVerdict {
    /// The path throws for any input; it cannot refute the claim.
    Identity,
    /// The path returns without touching the parameter; null is tolerated.
    Return,
    /// The path dereferences the parameter.
    Npe,
    /// The path fails iff one of these callee parameters rejects null.
    Conditional(BTreeSet<BTreeSet<EKey>>),
}

fn combine_verdicts(a: PathVerdict, b: PathVerdict, size_limit: usize) -> PathVerdict {
    use PathVerdict::*;
    match (a, b) {
        (Return, _) | (_, Return) => Return,
        (Identity, other) | (other, Identity) => other,
        (Npe, other) | (other, Npe) => other,
        (Conditional(left), Conditional(right)) => {
            // Conjunction of two sums of products, distributed back into
            // a sum of products by pairwise union.
            let mut sop = BTreeSet::new();
            for l in &left {
                for r in &right {
                    let mut product = l.clone();
                    product.extend(r.iter().cloned());
                    sop.insert(product);
                }
            }
            let literals: usize = sop.iter().map(|product| 1 + product.len()).sum();
            if literals > size_limit {
                Return
            } else {
                Conditional(sop)
            }
        }
    }
}

/// Tracks what one instruction did to the watched parameter value.
struct ParamInterpreter {
    nullable: bool,
    /// The watched parameter was dereferenced.
    dereferenced: bool,
    /// An unrelated definite null was dereferenced; the path fails anyway.
    failed: bool,
    /// Nullable mode only: the parameter escaped or was locked on.
    hazard: bool,
    /// Callee parameters the watched value was passed to.
    passed: BTreeSet<EKey>,
}

impl ParamInterpreter {
    fn new(nullable: bool) -> ParamInterpreter {
        ParamInterpreter {
            nullable,
            dereferenced: false,
            failed: false,
            hazard: false,
            passed: BTreeSet::new(),
        }
    }

    fn deref(&mut self, value: &BasicValue) {
        match value {
            BasicValue::Param => self.dereferenced = true,
            BasicValue::Null => self.failed = true,
            _ => {}
        }
    }

    fn escape(&mut self, value: &BasicValue) {
        if self.nullable && matches!(value, BasicValue::Param) {
            self.hazard = true;
        }
    }
}

impl Interpreter for ParamInterpreter {
    type Value = BasicValue;

    fn untracked(&self, wide: bool) -> BasicValue {
        BasicValue::untracked(wide)
    }

    fn is_wide(&self, value: &BasicValue) -> bool {
        value.wide()
    }

    fn constant(&mut self, constant: &Const) -> BasicValue {
        match constant {
            Const::Null => BasicValue::Null,
            other => BasicValue::untracked(other.wide()),
        }
    }

    fn unary(&mut self, insn: &Insn, value: &BasicValue, wide: bool) -> BasicValue {
        match insn {
            Insn::CheckCast { .. } => value.clone(),
            Insn::InstanceOf { .. } if matches!(value, BasicValue::Param) => {
                BasicValue::InstanceOfCheck
            }
            Insn::ArrayLength => {
                self.deref(value);
                BasicValue::untracked(false)
            }
            _ => BasicValue::untracked(wide),
        }
    }

    fn binary(&mut self, insn: &Insn, left: &BasicValue, _right: &BasicValue, wide: bool) -> BasicValue {
        if matches!(insn, Insn::ArrayLoad { .. }) {
            self.deref(left);
        }
        BasicValue::untracked(wide)
    }

    fn ternary(&mut self, _insn: &Insn, array: &BasicValue, _index: &BasicValue, value: &BasicValue) {
        self.deref(array);
        self.escape(value);
    }

    fn call(
        &mut self,
        kind: CallKind,
        method: &Member,
        args: Vec<BasicValue>,
        result: crate::descriptor::ReturnShape,
    ) -> Result<Option<BasicValue>, AnalysisError> {
        let stable = matches!(kind, CallKind::Static | CallKind::Special);
        let declared = if kind == CallKind::Static {
            &args[..]
        } else {
            if let Some(receiver) = args.first() {
                self.deref(receiver);
            }
            &args[1..]
        };
        for (param, arg) in declared.iter().enumerate() {
            if matches!(arg, BasicValue::Param) {
                self.passed.insert(EKey::new(
                    method.clone().into(),
                    Direction::In {
                        param: param as u16,
                        nullable: self.nullable,
                    },
                    stable,
                ));
            }
        }
        Ok(match result {
            crate::descriptor::ReturnShape::Void => None,
            crate::descriptor::ReturnShape::Value(shape) => Some(BasicValue::untracked(
                shape == crate::descriptor::TypeShape::Wide,
            )),
        })
    }

    fn get_field(&mut self, _field: &Member, receiver: Option<&BasicValue>, wide: bool) -> BasicValue {
        if let Some(receiver) = receiver {
            self.deref(receiver);
        }
        BasicValue::untracked(wide)
    }

    fn put_field(&mut self, _field: &Member, receiver: Option<&BasicValue>, value: &BasicValue) {
        if let Some(receiver) = receiver {
            self.deref(receiver);
        }
        self.escape(value);
    }

    fn new_object(&mut self, _class: &str) -> BasicValue {
        BasicValue::NotNull
    }

    fn new_array(&mut self) -> BasicValue {
        BasicValue::NotNull
    }

    fn sink(&mut self, insn: &Insn, value: &BasicValue) {
        match insn {
            Insn::MonitorEnter | Insn::MonitorExit => self.deref(value),
            Insn::Throw if self.nullable => self.escape(value),
            _ => {}
        }
    }
}

/// Conditionals that test the watched parameter for null, directly or
/// through `instanceof` (null is an instance of nothing). Returns whether
/// the jump edge is the may-be-null world.
fn null_on_jump(cond: IfCond, condition: &BasicValue) -> Option<bool> {
    match (condition, cond) {
        (BasicValue::Param, IfCond::Null) => Some(true),
        (BasicValue::Param, IfCond::NonNull) => Some(false),
        (BasicValue::InstanceOfCheck, IfCond::Eq) => Some(true),
        (BasicValue::InstanceOfCheck, IfCond::Ne) => Some(false),
        _ => None,
    }
}

fn scrub_param(frame: &mut Frame<BasicValue>) {
    for value in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
        if matches!(value, BasicValue::Param) {
            *value = BasicValue::NotNull;
        }
    }
}

#[derive(Clone, Debug)]
struct ParamState {
    state: State,
    passed: BTreeSet<EKey>,
}

enum Action {
    Proceed(ParamState),
    Leaf(PathVerdict),
}

struct ParamEngine<'a> {
    flow: &'a RichControlFlow,
    method: &'a MethodIr,
    config: &'a AnalysisConfig,
    param: u16,
    nullable: bool,
    pending: Vec<Action>,
    computed: Vec<Vec<ParamState>>,
    steps: usize,
}

/// Runs the parameter nullability analysis for an `In` direction.
pub fn analyze(
    flow: &RichControlFlow,
    method: &MethodIr,
    config: &AnalysisConfig,
    direction: Direction,
) -> Result<Rhs, AnalysisError> {
    let (param, nullable) = match direction {
        Direction::In { param, nullable } => (param, nullable),
        other => {
            return Err(AnalysisError::Malformed(format!(
                "direction {other:?} is not a parameter direction"
            )));
        }
    };
    let engine = ParamEngine {
        flow,
        method,
        config,
        param,
        nullable,
        pending: Vec::new(),
        computed: vec![Vec::new(); flow.graph.instruction_count()],
        steps: 0,
    };
    if nullable {
        engine.run_nullable()
    } else {
        engine.run_not_null()
    }
}

impl ParamEngine<'_> {
    fn seed(&self) -> Result<Frame<BasicValue>, AnalysisError> {
        let tracked = self.param;
        start_frame(self.method, |param, _| {
            if param == tracked {
                BasicValue::Param
            } else {
                BasicValue::untracked(false)
            }
        })
    }

    fn run_not_null(mut self) -> Result<Rhs, AnalysisError> {
        let frame = self.seed()?;
        self.pending.push(Action::Proceed(ParamState {
            state: State::start(frame),
            passed: BTreeSet::new(),
        }));

        let mut acc: Option<PathVerdict> = None;
        while let Some(action) = self.pending.pop() {
            self.step()?;
            match action {
                Action::Proceed(item) => {
                    if self.admit(&item) {
                        self.process_not_null(item)?;
                    }
                }
                Action::Leaf(verdict) => {
                    acc = Some(match acc {
                        None => verdict,
                        Some(prev) => {
                            combine_verdicts(prev, verdict, self.config.equation_size_limit)
                        }
                    });
                    if acc == Some(PathVerdict::Return) {
                        break;
                    }
                }
            }
        }

        Ok(match acc {
            None | Some(PathVerdict::Identity) | Some(PathVerdict::Return) => Rhs::Value(Value::Top),
            Some(PathVerdict::Npe) => Rhs::Value(Value::NotNull),
            Some(PathVerdict::Conditional(sop)) => Rhs::Pending(Pending::new(
                sop.into_iter()
                    .map(|product| Component::new(STANDARD.top, product))
                    .collect(),
            )),
        })
    }

    fn run_nullable(mut self) -> Result<Rhs, AnalysisError> {
        let frame = self.seed()?;
        self.pending.push(Action::Proceed(ParamState {
            state: State::start(frame),
            passed: BTreeSet::new(),
        }));

        let mut keys = BTreeSet::new();
        while let Some(action) = self.pending.pop() {
            self.step()?;
            match action {
                Action::Proceed(item) => {
                    if self.admit(&item) {
                        if !self.process_nullable(item, &mut keys)? {
                            return Ok(Rhs::Value(Value::Top));
                        }
                    }
                }
                Action::Leaf(_) => {}
            }
        }

        Ok(if keys.is_empty() {
            Rhs::Value(Value::Null)
        } else {
            Rhs::Pending(Pending::single(Component::new(STANDARD.top, keys)))
        })
    }

    fn step(&mut self) -> Result<(), AnalysisError> {
        self.steps += 1;
        if self.steps % CANCEL_POLL_INTERVAL == 0 && self.config.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if self.steps > self.config.steps_limit {
            return Err(AnalysisError::TooComplex);
        }
        Ok(())
    }

    fn admit(&mut self, item: &ParamState) -> bool {
        let index = item.state.conf.insn_index;
        if self.flow.dfs.loop_enters[index]
            && item
                .state
                .history
                .iter()
                .any(|past| item.state.conf.is_instance_of(past))
        {
            return false;
        }
        if self.computed[index]
            .iter()
            .any(|seen| seen.state.equiv(&item.state) && seen.passed == item.passed)
        {
            return false;
        }
        self.computed[index].push(item.clone());
        true
    }

    fn successor_history(&self, state: &State) -> Vec<Conf> {
        let mut history = state.history.clone();
        if self.flow.dfs.loop_enters[state.conf.insn_index] {
            history.push(state.conf.clone());
        }
        history
    }

    fn handler_frame(&self, frame: &Frame<BasicValue>) -> Frame<BasicValue> {
        Frame {
            locals: frame.locals.clone(),
            stack: vec![BasicValue::NotNull],
        }
    }

    fn push_successor(
        &mut self,
        item: &ParamState,
        history: &[Conf],
        index: usize,
        frame: Frame<BasicValue>,
        passed: BTreeSet<EKey>,
        exceptional: bool,
        taken: bool,
    ) {
        self.pending.push(Action::Proceed(ParamState {
            state: State {
                conf: Conf {
                    insn_index: index,
                    frame,
                },
                history: history.to_vec(),
                taken,
                unsure: item.state.unsure || exceptional,
            },
            passed,
        }));
    }

    fn push_all_successors(
        &mut self,
        item: &ParamState,
        history: &[Conf],
        frame: &Frame<BasicValue>,
        passed: &BTreeSet<EKey>,
        pruned: Option<(bool, bool)>,
    ) {
        let index = item.state.conf.insn_index;
        let taken = item.state.taken || pruned.map_or(false, |(f, j)| f != j);
        let successors: Vec<(usize, bool)> = self
            .flow
            .graph
            .successors(index)
            .iter()
            .map(|&succ| (succ, self.flow.graph.is_exceptional(index, succ)))
            .collect();
        for (succ, exceptional) in successors {
            if let Some((fallthrough, jump)) = pruned {
                if !exceptional {
                    let is_fallthrough = succ == index + 1;
                    if is_fallthrough && !fallthrough {
                        continue;
                    }
                    if !is_fallthrough && !jump {
                        continue;
                    }
                }
            }
            let frame = if exceptional {
                self.handler_frame(frame)
            } else {
                frame.clone()
            };
            self.push_successor(item, history, succ, frame, passed.clone(), exceptional, taken);
        }
    }

    // In not-null mode the watched parameter is hypothetically null, so
    // null checks on it are decided rather than forked.
    fn prune(&self, cond: IfCond, condition: &BasicValue) -> Option<(bool, bool)> {
        if self.nullable {
            return None;
        }
        null_on_jump(cond, condition).map(|jump_is_null| (!jump_is_null, jump_is_null))
    }

    fn process_not_null(&mut self, item: ParamState) -> Result<(), AnalysisError> {
        let index = item.state.conf.insn_index;
        let insn = &self.method.instructions[index];
        let history = self.successor_history(&item.state);

        match insn {
            Insn::Return { .. } => {
                let verdict = if item.passed.is_empty() {
                    PathVerdict::Return
                } else {
                    PathVerdict::Conditional(
                        item.passed
                            .iter()
                            .map(|key| BTreeSet::from([key.clone()]))
                            .collect(),
                    )
                };
                self.pending.push(Action::Leaf(verdict));
            }
            Insn::Throw => {
                // An explicit throw counts against the parameter only when
                // a null check on it was decided on this path.
                let verdict = if item.state.taken {
                    PathVerdict::Npe
                } else {
                    PathVerdict::Identity
                };
                self.pending.push(Action::Leaf(verdict));
            }
            _ => {
                let pruned = if let Insn::If { cond, .. } = insn {
                    self.prune(*cond, item.state.conf.frame.top()?)
                } else {
                    None
                };
                let mut interp = ParamInterpreter::new(false);
                let mut frame = item.state.conf.frame.clone();
                execute(&mut frame, insn, &mut interp)?;
                if interp.dereferenced {
                    self.pending.push(Action::Leaf(PathVerdict::Npe));
                    return Ok(());
                }
                if interp.failed {
                    self.pending.push(Action::Leaf(PathVerdict::Identity));
                    return Ok(());
                }
                let mut passed = item.passed.clone();
                passed.extend(interp.passed);
                self.push_all_successors(&item, &history, &frame, &passed, pruned);
            }
        }
        Ok(())
    }

    /// Returns false when a hazard refutes the nullable claim.
    fn process_nullable(
        &mut self,
        item: ParamState,
        keys: &mut BTreeSet<EKey>,
    ) -> Result<bool, AnalysisError> {
        let index = item.state.conf.insn_index;
        let insn = &self.method.instructions[index];
        let history = self.successor_history(&item.state);

        match insn {
            Insn::Return { .. } | Insn::Throw => {}
            Insn::If { cond, target }
                if null_on_jump(*cond, item.state.conf.frame.top()?).is_some() =>
            {
                // A null check splits the worlds: on the not-null edge the
                // parameter can no longer cause a hazard.
                let null_jump =
                    null_on_jump(*cond, item.state.conf.frame.top()?) == Some(true);
                let mut frame = item.state.conf.frame.clone();
                let mut interp = ParamInterpreter::new(true);
                execute(&mut frame, insn, &mut interp)?;
                let mut checked = frame.clone();
                scrub_param(&mut checked);
                let (fallthrough_frame, jump_frame) = if null_jump {
                    (checked, frame)
                } else {
                    (frame, checked)
                };
                let passed = item.passed.clone();
                self.push_successor(
                    &item,
                    &history,
                    index + 1,
                    fallthrough_frame,
                    passed.clone(),
                    false,
                    item.state.taken,
                );
                self.push_successor(
                    &item,
                    &history,
                    *target,
                    jump_frame,
                    passed,
                    false,
                    item.state.taken,
                );
            }
            _ => {
                let mut interp = ParamInterpreter::new(true);
                let mut frame = item.state.conf.frame.clone();
                execute(&mut frame, insn, &mut interp)?;
                if interp.dereferenced || interp.hazard {
                    return Ok(false);
                }
                if interp.failed {
                    return Ok(true);
                }
                keys.extend(interp.passed);
                let passed = item.passed.clone();
                self.push_all_successors(&item, &history, &frame, &passed, None);
            }
        }
        Ok(true)
    }
}
