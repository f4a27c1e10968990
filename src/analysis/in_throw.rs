//! Guaranteed-throw analysis under an optional input assumption, covering
//! the `Throw` and `InThrow` directions.
//!
//! Each returning path records the set of calls it executed. A returning
//! path fails only if one of those calls fails, so the sets are
//! intersected across paths and only causes common to every path survive.

use std::collections::BTreeSet;

use crate::analysis::{Conf, State, constraint_value, feasible, start_frame};
use crate::cfg::RichControlFlow;
use crate::config::{AnalysisConfig, CANCEL_POLL_INTERVAL};
use crate::errors::AnalysisError;
use crate::frame::{Frame, Interpreter, execute};
use crate::ir::{CallKind, Const, Insn, Member, MethodIr};
use crate::keys::{Direction, EKey, ParamConstraint};
use crate::lattice::{Component, Pending, Rhs, STANDARD, Value};
use crate::values::BasicValue;

/// What one finished path says about failure.
#[derive(Clone, Debug, Eq, PartialEq)]
enum PathCause {
    /// The path itself throws.
    Fail,
    /// The path returns; it fails only if one of these calls fails.
    Calls(BTreeSet<EKey>),
}

impl PathCause {
    fn merge(self, other: PathCause) -> PathCause {
        match (self, other) {
            (PathCause::Fail, other) => other,
            (cause, PathCause::Fail) => cause,
            (PathCause::Calls(a), PathCause::Calls(b)) => {
                PathCause::Calls(a.intersection(&b).cloned().collect())
            }
        }
    }
}

fn throw_call_keys(kind: CallKind, method: &Member, args: &[BasicValue]) -> BTreeSet<EKey> {
    let stable = matches!(kind, CallKind::Static | CallKind::Special);
    let mut keys = BTreeSet::new();
    keys.insert(EKey::new(method.clone().into(), Direction::Throw, stable));
    let declared = if kind == CallKind::Static {
        args
    } else {
        &args[1..]
    };
    for (param, arg) in declared.iter().enumerate() {
        let constraint = match arg {
            BasicValue::Null => Some(ParamConstraint::Null),
            BasicValue::NotNull => Some(ParamConstraint::NotNull),
            BasicValue::True => Some(ParamConstraint::True),
            BasicValue::False => Some(ParamConstraint::False),
            _ => None,
        };
        if let Some(constraint) = constraint {
            keys.insert(EKey::new(
                method.clone().into(),
                Direction::InThrow {
                    param: param as u16,
                    constraint,
                },
                stable,
            ));
        }
    }
    keys
}

/// Tracks null dereferences and executed calls for one instruction.
struct ThrowInterpreter {
    npe: bool,
    calls: BTreeSet<EKey>,
}

impl ThrowInterpreter {
    fn new() -> ThrowInterpreter {
        ThrowInterpreter {
            npe: false,
            calls: BTreeSet::new(),
        }
    }

    fn deref(&mut self, value: &BasicValue) {
        if matches!(value, BasicValue::Null) {
            self.npe = true;
        }
    }
}

impl Interpreter for ThrowInterpreter {
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
            Const::Int(0) => BasicValue::False,
            Const::Int(1) => BasicValue::True,
            Const::Str(_) | Const::ClassRef(_) => BasicValue::NotNull,
            other => BasicValue::untracked(other.wide()),
        }
    }

    fn unary(&mut self, insn: &Insn, value: &BasicValue, wide: bool) -> BasicValue {
        match insn {
            Insn::CheckCast { .. } => value.clone(),
            Insn::NewArray => BasicValue::NotNull,
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

    fn ternary(&mut self, _insn: &Insn, array: &BasicValue, _index: &BasicValue, _value: &BasicValue) {
        self.deref(array);
    }

    fn call(
        &mut self,
        kind: CallKind,
        method: &Member,
        args: Vec<BasicValue>,
        result: crate::descriptor::ReturnShape,
    ) -> Result<Option<BasicValue>, AnalysisError> {
        if kind != CallKind::Static {
            if let Some(receiver) = args.first() {
                self.deref(receiver);
            }
        }
        self.calls.extend(throw_call_keys(kind, method, &args));
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

    fn put_field(&mut self, _field: &Member, receiver: Option<&BasicValue>, _value: &BasicValue) {
        if let Some(receiver) = receiver {
            self.deref(receiver);
        }
    }

    fn new_object(&mut self, _class: &str) -> BasicValue {
        BasicValue::NotNull
    }

    fn new_array(&mut self) -> BasicValue {
        BasicValue::NotNull
    }

    fn sink(&mut self, insn: &Insn, value: &BasicValue) {
        if matches!(insn, Insn::Throw | Insn::MonitorEnter | Insn::MonitorExit) {
            self.deref(value);
        }
    }
}

#[derive(Clone, Debug)]
struct ThrowState {
    state: State,
    calls: BTreeSet<EKey>,
}

enum Action {
    Proceed(ThrowState),
    Leaf { unsure: bool, cause: PathCause },
}

pub struct InThrowAnalysis<'a> {
    flow: &'a RichControlFlow,
    method: &'a MethodIr,
    config: &'a AnalysisConfig,
    seed: Option<(u16, ParamConstraint)>,
    pending: Vec<Action>,
    computed: Vec<Vec<ThrowState>>,
    steps: usize,
}

/// Runs a guaranteed-throw analysis for `Throw` or `InThrow`.
pub fn analyze(
    flow: &RichControlFlow,
    method: &MethodIr,
    config: &AnalysisConfig,
    direction: Direction,
) -> Result<Rhs, AnalysisError> {
    let seed = match direction {
        Direction::Throw => None,
        Direction::InThrow { param, constraint } => Some((param, constraint)),
        other => {
            return Err(AnalysisError::Malformed(format!(
                "direction {other:?} is not a throw direction"
            )));
        }
    };
    let analysis = InThrowAnalysis {
        flow,
        method,
        config,
        seed,
        pending: Vec::new(),
        computed: vec![Vec::new(); flow.graph.instruction_count()],
        steps: 0,
    };
    analysis.run()
}

impl InThrowAnalysis<'_> {
    fn run(mut self) -> Result<Rhs, AnalysisError> {
        let seed = self.seed;
        let frame = start_frame(self.method, |param, _| match seed {
            Some((tracked, constraint)) if tracked == param => constraint_value(constraint),
            _ => BasicValue::untracked(false),
        })?;
        self.pending.push(Action::Proceed(ThrowState {
            state: State::start(frame),
            calls: BTreeSet::new(),
        }));

        let mut acc: Option<PathCause> = None;
        while let Some(action) = self.pending.pop() {
            self.steps += 1;
            if self.steps % CANCEL_POLL_INTERVAL == 0 && self.config.cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            if self.steps > self.config.steps_limit {
                return Err(AnalysisError::TooComplex);
            }
            match action {
                Action::Proceed(item) => {
                    if self.admit(&item) {
                        self.process(item)?;
                    }
                }
                Action::Leaf { unsure, cause } => {
                    acc = Some(match acc {
                        None => cause,
                        Some(prev) => prev.merge(cause),
                    });
                    if !unsure && acc == Some(PathCause::Calls(BTreeSet::new())) {
                        break;
                    }
                }
            }
        }

        Ok(match acc {
            None => Rhs::Value(Value::Bot),
            Some(PathCause::Fail) => Rhs::Value(Value::Fail),
            Some(PathCause::Calls(keys)) if keys.is_empty() => Rhs::Value(Value::Top),
            Some(PathCause::Calls(keys)) => Rhs::Pending(Pending::new(
                keys.into_iter()
                    .map(|key| Component::new(STANDARD.top, BTreeSet::from([key])))
                    .collect(),
            )),
        })
    }

    // Loop folding plus memoization; the memo also compares the call set,
    // since two equal frames with different histories of calls are not
    // interchangeable here.
    fn admit(&mut self, item: &ThrowState) -> bool {
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
            .any(|seen| seen.state.equiv(&item.state) && seen.calls == item.calls)
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
        item: &ThrowState,
        history: &[Conf],
        index: usize,
        frame: Frame<BasicValue>,
        calls: BTreeSet<EKey>,
        exceptional: bool,
        taken: bool,
    ) {
        self.pending.push(Action::Proceed(ThrowState {
            state: State {
                conf: Conf {
                    insn_index: index,
                    frame,
                },
                history: history.to_vec(),
                taken,
                unsure: item.state.unsure || exceptional,
            },
            calls,
        }));
    }

    fn push_exceptional_successors(&mut self, item: &ThrowState, history: &[Conf]) {
        let index = item.state.conf.insn_index;
        let handlers: Vec<usize> = self
            .flow
            .graph
            .successors(index)
            .iter()
            .copied()
            .filter(|&succ| self.flow.graph.is_exceptional(index, succ))
            .collect();
        for handler in handlers {
            let frame = self.handler_frame(&item.state.conf.frame);
            self.push_successor(
                item,
                history,
                handler,
                frame,
                item.calls.clone(),
                true,
                item.state.taken,
            );
        }
    }

    fn process(&mut self, item: ThrowState) -> Result<(), AnalysisError> {
        let index = item.state.conf.insn_index;
        let insn = &self.method.instructions[index];
        let history = self.successor_history(&item.state);

        match insn {
            Insn::Return { .. } => {
                self.pending.push(Action::Leaf {
                    unsure: item.state.unsure,
                    cause: PathCause::Calls(item.calls),
                });
            }
            Insn::Throw => {
                self.pending.push(Action::Leaf {
                    unsure: item.state.unsure,
                    cause: PathCause::Fail,
                });
            }
            Insn::If { cond, target } => {
                let condition = item.state.conf.frame.top()?.clone();
                let mut interp = ThrowInterpreter::new();
                let mut frame = item.state.conf.frame.clone();
                execute(&mut frame, insn, &mut interp)?;
                let (fallthrough, jump) = feasible(*cond, &condition);
                let taken = item.state.taken || fallthrough != jump;
                if fallthrough {
                    self.push_successor(
                        &item,
                        &history,
                        index + 1,
                        frame.clone(),
                        item.calls.clone(),
                        false,
                        taken,
                    );
                }
                if jump {
                    self.push_successor(
                        &item,
                        &history,
                        *target,
                        frame,
                        item.calls.clone(),
                        false,
                        taken,
                    );
                }
                self.push_exceptional_successors(&item, &history);
            }
            _ => {
                let mut interp = ThrowInterpreter::new();
                let mut frame = item.state.conf.frame.clone();
                execute(&mut frame, insn, &mut interp)?;
                if interp.npe {
                    self.pending.push(Action::Leaf {
                        unsure: item.state.unsure,
                        cause: PathCause::Fail,
                    });
                    return Ok(());
                }
                let mut calls = item.calls.clone();
                calls.extend(interp.calls);
                let successors: Vec<usize> = self
                    .flow
                    .graph
                    .successors(index)
                    .iter()
                    .copied()
                    .filter(|&succ| !self.flow.graph.is_exceptional(index, succ))
                    .collect();
                for succ in successors {
                    self.push_successor(
                        &item,
                        &history,
                        succ,
                        frame.clone(),
                        calls.clone(),
                        false,
                        item.state.taken,
                    );
                }
                self.push_exceptional_successors(&item, &history);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::analyze;
    use crate::cfg::{ControlFlowGraph, RichControlFlow};
    use crate::config::AnalysisConfig;
    use crate::ir::{CallKind, Const, IfCond, Insn, Member, MethodIr, ReturnKind};
    use crate::keys::{Direction, EKey, ParamConstraint};
    use crate::lattice::{Rhs, Value};

    fn static_method(descriptor: &str, instructions: Vec<Insn>) -> MethodIr {
        let mut method = MethodIr {
            name: "body".to_string(),
            descriptor: descriptor.to_string(),
            access: Default::default(),
            instructions,
            handlers: Vec::new(),
        };
        method.access.is_static = true;
        method
    }

    fn flow_for(method: &MethodIr) -> RichControlFlow {
        RichControlFlow::new(ControlFlowGraph::build(method).expect("cfg"))
    }

    #[test]
    fn guarded_throw_fails_only_under_the_null_assumption() {
        // if (o != null) return; throw new NPE();
        let method = static_method(
            "(Ljava/lang/Object;)V",
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::If {
                    cond: IfCond::Null,
                    target: 3,
                },
                Insn::Return {
                    kind: ReturnKind::Void,
                },
                Insn::New {
                    class: "java/lang/NullPointerException".to_string(),
                },
                Insn::Dup,
                Insn::Invoke {
                    kind: CallKind::Special,
                    method: Member::new("java/lang/NullPointerException", "<init>", "()V"),
                },
                Insn::Throw,
            ],
        );
        let flow = flow_for(&method);
        let config = AnalysisConfig::default();

        let rhs = analyze(
            &flow,
            &method,
            &config,
            Direction::InThrow {
                param: 0,
                constraint: ParamConstraint::Null,
            },
        )
        .expect("analysis");
        assert_eq!(rhs, Rhs::Value(Value::Fail));

        let rhs = analyze(&flow, &method, &config, Direction::Throw).expect("analysis");
        assert_eq!(rhs, Rhs::Value(Value::Top));
    }

    #[test]
    fn unconditional_throw_is_definite() {
        let method = static_method(
            "()V",
            vec![
                Insn::New {
                    class: "java/lang/IllegalStateException".to_string(),
                },
                Insn::Dup,
                Insn::Invoke {
                    kind: CallKind::Special,
                    method: Member::new("java/lang/IllegalStateException", "<init>", "()V"),
                },
                Insn::Throw,
            ],
        );
        let flow = flow_for(&method);
        let config = AnalysisConfig::default();
        let rhs = analyze(&flow, &method, &config, Direction::Throw).expect("analysis");
        assert_eq!(rhs, Rhs::Value(Value::Fail));
    }

    #[test]
    fn calls_on_the_only_path_become_dependencies() {
        let callee = Member::new("com/acme/Checks", "verify", "()V");
        let method = static_method(
            "()V",
            vec![
                Insn::Invoke {
                    kind: CallKind::Static,
                    method: callee.clone(),
                },
                Insn::Return {
                    kind: ReturnKind::Void,
                },
            ],
        );
        let flow = flow_for(&method);
        let config = AnalysisConfig::default();
        let rhs = analyze(&flow, &method, &config, Direction::Throw).expect("analysis");
        match rhs {
            Rhs::Pending(pending) => {
                assert_eq!(pending.sum.len(), 1);
                let expected = EKey::new(callee.into(), Direction::Throw, true);
                assert!(pending.sum[0].ids.contains(&expected));
            }
            other => panic!("expected pending, got {other:?}"),
        }
    }

    #[test]
    fn causes_missing_from_one_path_are_intersected_away() {
        // if (b) f(); return;
        let callee = Member::new("com/acme/Checks", "verify", "()V");
        let method = static_method(
            "(Z)V",
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::If {
                    cond: IfCond::Eq,
                    target: 3,
                },
                Insn::Invoke {
                    kind: CallKind::Static,
                    method: callee,
                },
                Insn::Return {
                    kind: ReturnKind::Void,
                },
            ],
        );
        let flow = flow_for(&method);
        let config = AnalysisConfig::default();
        let rhs = analyze(&flow, &method, &config, Direction::Throw).expect("analysis");
        assert_eq!(rhs, Rhs::Value(Value::Top));
    }

    #[test]
    fn constant_arguments_refine_the_callee_key() {
        let callee = Member::new("com/acme/Checks", "require", "(Ljava/lang/Object;)V");
        let method = static_method(
            "()V",
            vec![
                Insn::Push(Const::Null),
                Insn::Invoke {
                    kind: CallKind::Static,
                    method: callee.clone(),
                },
                Insn::Return {
                    kind: ReturnKind::Void,
                },
            ],
        );
        let flow = flow_for(&method);
        let config = AnalysisConfig::default();
        let rhs = analyze(&flow, &method, &config, Direction::Throw).expect("analysis");
        match rhs {
            Rhs::Pending(pending) => {
                let refined = EKey::new(
                    callee.into(),
                    Direction::InThrow {
                        param: 0,
                        constraint: ParamConstraint::Null,
                    },
                    true,
                );
                assert!(pending.sum.iter().any(|c| c.ids.contains(&refined)));
            }
            other => panic!("expected pending, got {other:?}"),
        }
    }
}
