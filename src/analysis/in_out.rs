//! Return-value analysis under an optional input assumption, covering the
//! `Out`, `InOut` and `NullableOut` directions.

use std::collections::BTreeSet;

use crate::analysis::{Chassis, Conf, PendingAction, State, constraint_value, feasible, start_frame};
use crate::cfg::RichControlFlow;
use crate::config::AnalysisConfig;
use crate::errors::AnalysisError;
use crate::frame::{Interpreter, execute};
use crate::ir::{CallKind, Const, Insn, Member, MethodIr, ReturnKind};
use crate::keys::{Direction, EKey, ParamConstraint};
use crate::lattice::{Component, Lattice, NULLABLE, Pending, ResultJoiner, Rhs, STANDARD, Value};
use crate::values::BasicValue;

/// Call-aware interpreter shared by the in/out flavors. Raises `npe` when
/// a definitely-null value is dereferenced mid-instruction.
pub(crate) struct CallInterpreter {
    nullable: bool,
    pub npe: bool,
}

impl CallInterpreter {
    pub(crate) fn new(nullable: bool) -> CallInterpreter {
        CallInterpreter {
            nullable,
            npe: false,
        }
    }

    fn deref(&mut self, value: &BasicValue) {
        if matches!(value, BasicValue::Null) {
            self.npe = true;
        }
    }

    fn base_direction(&self) -> Direction {
        if self.nullable {
            Direction::NullableOut
        } else {
            Direction::Out
        }
    }
}

pub(crate) fn call_keys(
    kind: CallKind,
    method: &Member,
    args: &[BasicValue],
    base: Direction,
    refine: bool,
) -> BTreeSet<EKey> {
    let stable = matches!(kind, CallKind::Static | CallKind::Special);
    let mut keys = BTreeSet::new();
    keys.insert(EKey::new(method.clone().into(), base, stable));
    if refine {
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
                    Direction::InOut {
                        param: param as u16,
                        constraint,
                    },
                    stable,
                ));
            }
        }
    }
    keys
}

impl Interpreter for CallInterpreter {
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
        let keys = call_keys(kind, method, &args, self.base_direction(), !self.nullable);
        Ok(match result {
            crate::descriptor::ReturnShape::Void => None,
            crate::descriptor::ReturnShape::Value(shape) => Some(BasicValue::call(
                keys,
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

pub struct InOutAnalysis<'a> {
    chassis: Chassis<'a, Rhs>,
    lattice: Lattice,
    joiner: ResultJoiner,
    nullable: bool,
    seed: Option<(u16, ParamConstraint)>,
    result: Rhs,
}

/// Runs an in/out analysis for one of `Out`, `InOut`, `NullableOut`.
pub fn analyze(
    flow: &RichControlFlow,
    method: &MethodIr,
    config: &AnalysisConfig,
    direction: Direction,
) -> Result<Rhs, AnalysisError> {
    let (nullable, seed) = match direction {
        Direction::Out => (false, None),
        Direction::NullableOut => (true, None),
        Direction::InOut { param, constraint } => (false, Some((param, constraint))),
        other => {
            return Err(AnalysisError::Malformed(format!(
                "direction {other:?} is not an in/out direction"
            )));
        }
    };
    let lattice = if nullable { NULLABLE } else { STANDARD };
    let analysis = InOutAnalysis {
        chassis: Chassis::new(flow, method, config),
        lattice,
        joiner: ResultJoiner::new(lattice, config.equation_size_limit),
        nullable,
        seed,
        result: Rhs::Value(lattice.bot),
    };
    analysis.run()
}

impl InOutAnalysis<'_> {
    fn run(mut self) -> Result<Rhs, AnalysisError> {
        let seed = self.seed;
        let frame = start_frame(self.chassis.method, |param, _| match seed {
            Some((tracked, constraint)) if tracked == param => constraint_value(constraint),
            _ => BasicValue::untracked(false),
        })?;
        self.chassis.push_proceed(State::start(frame));

        while let Some(action) = self.chassis.pop()? {
            match action {
                PendingAction::ProceedState(state) => {
                    if self.chassis.admit(&state) {
                        self.process(state)?;
                    }
                }
                PendingAction::MakeResult { unsure, result } => {
                    self.result = self.joiner.join(self.result.clone(), result);
                    if !unsure && self.result == Rhs::Value(self.lattice.top) {
                        break;
                    }
                }
            }
        }
        Ok(self.result)
    }

    fn throw_leaf(&self) -> Rhs {
        if self.nullable {
            Rhs::Value(self.lattice.bot)
        } else {
            Rhs::Value(Value::Fail)
        }
    }

    fn return_leaf(&self, returned: Option<&BasicValue>) -> Rhs {
        if self.nullable {
            return match returned {
                Some(BasicValue::Null) => Rhs::Value(Value::Null),
                Some(BasicValue::Call { keys, .. }) => Rhs::Pending(Pending::single(
                    Component::new(self.lattice.top, keys.clone()),
                )),
                _ => Rhs::Value(Value::NotNull),
            };
        }
        match returned {
            Some(BasicValue::True) => Rhs::Value(Value::True),
            Some(BasicValue::False) => Rhs::Value(Value::False),
            Some(BasicValue::Null) => Rhs::Value(Value::Null),
            Some(BasicValue::NotNull) => Rhs::Value(Value::NotNull),
            Some(BasicValue::Call { keys, .. }) => Rhs::Pending(Pending::single(Component::new(
                self.lattice.top,
                keys.clone(),
            ))),
            _ => Rhs::Value(self.lattice.top),
        }
    }

    fn push_successor(&mut self, state: &State, history: &[Conf], index: usize, frame: crate::frame::Frame<BasicValue>, exceptional: bool, taken: bool) {
        self.chassis.push_proceed(State {
            conf: Conf {
                insn_index: index,
                frame,
            },
            history: history.to_vec(),
            taken,
            unsure: state.unsure || exceptional,
        });
    }

    fn push_exceptional_successors(&mut self, state: &State, history: &[Conf]) {
        let index = state.conf.insn_index;
        let handlers: Vec<usize> = self
            .chassis
            .flow
            .graph
            .successors(index)
            .iter()
            .copied()
            .filter(|&succ| self.chassis.flow.graph.is_exceptional(index, succ))
            .collect();
        for handler in handlers {
            let frame = self.chassis.handler_frame(&state.conf.frame);
            self.push_successor(state, history, handler, frame, true, state.taken);
        }
    }

    fn process(&mut self, state: State) -> Result<(), AnalysisError> {
        let index = state.conf.insn_index;
        let insn = &self.chassis.method.instructions[index];
        let history = self.chassis.successor_history(&state);

        match insn {
            Insn::Return { kind } => {
                let returned = if matches!(kind, ReturnKind::Void) {
                    None
                } else {
                    Some(state.conf.frame.top()?.clone())
                };
                let leaf = self.return_leaf(returned.as_ref());
                self.chassis.push_result(state.unsure, leaf);
            }
            Insn::Throw => {
                let leaf = self.throw_leaf();
                self.chassis.push_result(state.unsure, leaf);
            }
            Insn::If { cond, target } => {
                let condition = state.conf.frame.top()?.clone();
                let mut interp = CallInterpreter::new(self.nullable);
                let mut frame = state.conf.frame.clone();
                execute(&mut frame, insn, &mut interp)?;
                let (fallthrough, jump) = feasible(*cond, &condition);
                let taken = state.taken || fallthrough != jump;
                if fallthrough {
                    self.push_successor(&state, &history, index + 1, frame.clone(), false, taken);
                }
                if jump {
                    self.push_successor(&state, &history, *target, frame, false, taken);
                }
                self.push_exceptional_successors(&state, &history);
            }
            _ => {
                let mut interp = CallInterpreter::new(self.nullable);
                let mut frame = state.conf.frame.clone();
                execute(&mut frame, insn, &mut interp)?;
                if interp.npe {
                    let leaf = self.throw_leaf();
                    self.chassis.push_result(state.unsure, leaf);
                    return Ok(());
                }
                let successors: Vec<usize> = self
                    .chassis
                    .flow
                    .graph
                    .successors(index)
                    .iter()
                    .copied()
                    .filter(|&succ| !self.chassis.flow.graph.is_exceptional(index, succ))
                    .collect();
                for succ in successors {
                    self.push_successor(&state, &history, succ, frame.clone(), false, state.taken);
                }
                self.push_exceptional_successors(&state, &history);
            }
        }
        Ok(())
    }
}
