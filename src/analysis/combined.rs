//! Single-pass analysis for methods without branches or handlers.
//!
//! One linear walk records everything every direction needs: the returned
//! symbolic value, per-parameter dereference and escape flags, and the
//! calls executed on the path. Each direction's equation is then derived
//! from that one summary instead of re-walking the body.

use std::collections::BTreeSet;

use crate::cfg::RichControlFlow;
use crate::config::AnalysisConfig;
use crate::errors::AnalysisError;
use crate::frame::{Frame, Interpreter, execute};
use crate::ir::{CallKind, Const, Insn, Member, MethodIr, ReturnKind};
use crate::keys::{Direction, EKey, ParamConstraint};
use crate::lattice::{Component, NULLABLE, Pending, Rhs, STANDARD, Value};

/// Symbolic value for the linear walk. Unlike the branching analyses it
/// remembers full call shapes, so one walk can serve every direction.
#[derive(Clone, Debug, PartialEq)]
pub enum CValue {
    Uninit,
    Scalar { wide: bool },
    NthParam(u16),
    True,
    False,
    Null,
    NotNull,
    Call {
        method: Member,
        stable: bool,
        statik: bool,
        args: Vec<CValue>,
        wide: bool,
    },
}

impl Default for CValue {
    fn default() -> CValue {
        CValue::Uninit
    }
}

impl CValue {
    fn wide(&self) -> bool {
        matches!(
            self,
            CValue::Scalar { wide: true } | CValue::Call { wide: true, .. }
        )
    }
}

#[derive(Clone, Debug)]
struct CallRecord {
    method: Member,
    stable: bool,
    statik: bool,
    args: Vec<CValue>,
}

#[derive(Clone, Debug, PartialEq)]
enum Terminal {
    Return(Option<CValue>),
    Throw,
    /// A definite null was dereferenced; the path always fails.
    Npe,
}

/// Everything one linear walk learned about the method body.
pub struct CombinedSummary {
    terminal: Terminal,
    calls: Vec<CallRecord>,
    derefed: BTreeSet<u16>,
    escaped: BTreeSet<u16>,
}

struct CombinedInterpreter {
    derefed: BTreeSet<u16>,
    escaped: BTreeSet<u16>,
    calls: Vec<CallRecord>,
    failed: bool,
}

impl CombinedInterpreter {
    fn deref(&mut self, value: &CValue) {
        match value {
            CValue::NthParam(param) => {
                self.derefed.insert(*param);
            }
            CValue::Null => self.failed = true,
            _ => {}
        }
    }

    fn escape(&mut self, value: &CValue) {
        if let CValue::NthParam(param) = value {
            self.escaped.insert(*param);
        }
    }
}

impl Interpreter for CombinedInterpreter {
    type Value = CValue;

    fn untracked(&self, wide: bool) -> CValue {
        CValue::Scalar { wide }
    }

    fn is_wide(&self, value: &CValue) -> bool {
        value.wide()
    }

    fn constant(&mut self, constant: &Const) -> CValue {
        match constant {
            Const::Null => CValue::Null,
            Const::Int(0) => CValue::False,
            Const::Int(1) => CValue::True,
            Const::Str(_) | Const::ClassRef(_) => CValue::NotNull,
            other => CValue::Scalar {
                wide: other.wide(),
            },
        }
    }

    fn unary(&mut self, insn: &Insn, value: &CValue, wide: bool) -> CValue {
        match insn {
            Insn::CheckCast { .. } => value.clone(),
            Insn::NewArray => CValue::NotNull,
            Insn::ArrayLength => {
                self.deref(value);
                CValue::Scalar { wide: false }
            }
            _ => CValue::Scalar { wide },
        }
    }

    fn binary(&mut self, insn: &Insn, left: &CValue, _right: &CValue, wide: bool) -> CValue {
        if matches!(insn, Insn::ArrayLoad { .. }) {
            self.deref(left);
        }
        CValue::Scalar { wide }
    }

    fn ternary(&mut self, _insn: &Insn, array: &CValue, _index: &CValue, value: &CValue) {
        self.deref(array);
        self.escape(value);
    }

    fn call(
        &mut self,
        kind: CallKind,
        method: &Member,
        args: Vec<CValue>,
        result: crate::descriptor::ReturnShape,
    ) -> Result<Option<CValue>, AnalysisError> {
        let statik = kind == CallKind::Static;
        let stable = matches!(kind, CallKind::Static | CallKind::Special);
        let declared: Vec<CValue> = if statik {
            args
        } else {
            if let Some(receiver) = args.first() {
                self.deref(receiver);
            }
            args.into_iter().skip(1).collect()
        };
        self.calls.push(CallRecord {
            method: method.clone(),
            stable,
            statik,
            args: declared.clone(),
        });
        Ok(match result {
            crate::descriptor::ReturnShape::Void => None,
            crate::descriptor::ReturnShape::Value(shape) => Some(CValue::Call {
                method: method.clone(),
                stable,
                statik,
                args: declared,
                wide: shape == crate::descriptor::TypeShape::Wide,
            }),
        })
    }

    fn get_field(&mut self, _field: &Member, receiver: Option<&CValue>, wide: bool) -> CValue {
        if let Some(receiver) = receiver {
            self.deref(receiver);
        }
        CValue::Scalar { wide }
    }

    fn put_field(&mut self, _field: &Member, receiver: Option<&CValue>, value: &CValue) {
        if let Some(receiver) = receiver {
            self.deref(receiver);
        }
        self.escape(value);
    }

    fn new_object(&mut self, _class: &str) -> CValue {
        CValue::NotNull
    }

    fn new_array(&mut self) -> CValue {
        CValue::NotNull
    }

    fn sink(&mut self, insn: &Insn, value: &CValue) {
        match insn {
            Insn::MonitorEnter | Insn::MonitorExit => self.deref(value),
            Insn::Throw => self.escape(value),
            _ => {}
        }
    }
}

/// Walks a non-branching method once. Returns `None` when the body is not
/// actually linear (branches, handlers, or a straight-line cycle), in
/// which case the caller falls back to the per-direction engines.
pub fn analyze(
    flow: &RichControlFlow,
    method: &MethodIr,
) -> Result<Option<CombinedSummary>, AnalysisError> {
    if flow.graph.branching() || !flow.graph.exceptional.is_empty() {
        return Ok(None);
    }

    let mut frame = crate::analysis::start_frame(method, |param, _| {
        crate::values::BasicValue::NthParam(param)
    })
    .map(convert_start_frame)?;

    let mut interp = CombinedInterpreter {
        derefed: BTreeSet::new(),
        escaped: BTreeSet::new(),
        calls: Vec::new(),
        failed: false,
    };

    let mut visited = vec![false; method.instructions.len()];
    let mut index = 0usize;
    loop {
        if visited[index] {
            return Ok(None);
        }
        visited[index] = true;
        let insn = &method.instructions[index];
        match insn {
            Insn::Return { kind } => {
                let returned = if matches!(kind, ReturnKind::Void) {
                    None
                } else {
                    Some(frame.top()?.clone())
                };
                return Ok(Some(CombinedSummary {
                    terminal: Terminal::Return(returned),
                    calls: interp.calls,
                    derefed: interp.derefed,
                    escaped: interp.escaped,
                }));
            }
            Insn::Throw => {
                let thrown = frame.top()?.clone();
                interp.sink(insn, &thrown);
                return Ok(Some(CombinedSummary {
                    terminal: Terminal::Throw,
                    calls: interp.calls,
                    derefed: interp.derefed,
                    escaped: interp.escaped,
                }));
            }
            _ => {
                execute(&mut frame, insn, &mut interp)?;
                if interp.failed {
                    return Ok(Some(CombinedSummary {
                        terminal: Terminal::Npe,
                        calls: interp.calls,
                        derefed: interp.derefed,
                        escaped: interp.escaped,
                    }));
                }
                match flow.graph.successors(index) {
                    [next] => index = *next,
                    _ => return Ok(None),
                }
            }
        }
    }
}

// The shared start-frame seeder speaks BasicValue; remap its tracked
// parameter markers into the richer combined domain.
fn convert_start_frame(frame: Frame<crate::values::BasicValue>) -> Frame<CValue> {
    let convert = |value: &crate::values::BasicValue| match value {
        crate::values::BasicValue::NthParam(param) => CValue::NthParam(*param),
        crate::values::BasicValue::NotNull => CValue::NotNull,
        _ => CValue::Uninit,
    };
    Frame {
        locals: frame.locals.iter().map(convert).collect(),
        stack: frame.stack.iter().map(convert).collect(),
    }
}

fn constraint_constant(constraint: ParamConstraint) -> Value {
    match constraint {
        ParamConstraint::NotNull => Value::NotNull,
        ParamConstraint::Null => Value::Null,
        ParamConstraint::True => Value::True,
        ParamConstraint::False => Value::False,
    }
}

fn arg_constraint(arg: &CValue) -> Option<ParamConstraint> {
    match arg {
        CValue::Null => Some(ParamConstraint::Null),
        CValue::NotNull => Some(ParamConstraint::NotNull),
        CValue::True => Some(ParamConstraint::True),
        CValue::False => Some(ParamConstraint::False),
        _ => None,
    }
}

impl CombinedSummary {
    /// Derives one direction's equation from the walk summary. Effect and
    /// access directions are not value questions and yield `None`; the
    /// caller routes those to their own engines.
    pub fn equation(&self, direction: Direction, config: &AnalysisConfig) -> Option<Rhs> {
        let rhs = match direction {
            Direction::Out => self.out_rhs(None),
            Direction::NullableOut => self.nullable_out_rhs(),
            Direction::InOut { param, constraint } => self.out_rhs(Some((param, constraint))),
            Direction::Throw => self.throw_rhs(None),
            Direction::InThrow { param, constraint } => {
                self.throw_rhs(Some((param, constraint)))
            }
            Direction::In {
                param,
                nullable: false,
            } => self.not_null_rhs(param),
            Direction::In {
                param,
                nullable: true,
            } => self.nullable_rhs(param),
            Direction::Pure | Direction::Volatile | Direction::Access => return None,
        };
        Some(match rhs {
            Rhs::Pending(pending) if pending.literal_count() > config.equation_size_limit => {
                Rhs::Value(STANDARD.top)
            }
            other => other,
        })
    }

    fn out_rhs(&self, assumption: Option<(u16, ParamConstraint)>) -> Rhs {
        match &self.terminal {
            Terminal::Throw | Terminal::Npe => Rhs::Value(Value::Fail),
            Terminal::Return(returned) => match returned {
                Some(CValue::True) => Rhs::Value(Value::True),
                Some(CValue::False) => Rhs::Value(Value::False),
                Some(CValue::Null) => Rhs::Value(Value::Null),
                Some(CValue::NotNull) => Rhs::Value(Value::NotNull),
                Some(CValue::NthParam(param)) => match assumption {
                    Some((tracked, constraint)) if tracked == *param => {
                        Rhs::Value(constraint_constant(constraint))
                    }
                    _ => Rhs::Value(Value::Top),
                },
                Some(CValue::Call {
                    method,
                    stable,
                    args,
                    ..
                }) => {
                    let mut ids = BTreeSet::new();
                    ids.insert(EKey::new(method.clone().into(), Direction::Out, *stable));
                    for (position, arg) in args.iter().enumerate() {
                        let constraint = match (arg, assumption) {
                            (CValue::NthParam(param), Some((tracked, constraint)))
                                if tracked == *param =>
                            {
                                Some(constraint)
                            }
                            _ => arg_constraint(arg),
                        };
                        if let Some(constraint) = constraint {
                            ids.insert(EKey::new(
                                method.clone().into(),
                                Direction::InOut {
                                    param: position as u16,
                                    constraint,
                                },
                                *stable,
                            ));
                        }
                    }
                    Rhs::Pending(Pending::single(Component::new(STANDARD.top, ids)))
                }
                _ => Rhs::Value(Value::Top),
            },
        }
    }

    fn nullable_out_rhs(&self) -> Rhs {
        match &self.terminal {
            Terminal::Throw | Terminal::Npe => Rhs::Value(NULLABLE.bot),
            Terminal::Return(returned) => match returned {
                Some(CValue::Null) => Rhs::Value(Value::Null),
                Some(CValue::Call { method, stable, .. }) => {
                    Rhs::Pending(Pending::single(Component::new(
                        NULLABLE.top,
                        BTreeSet::from([EKey::new(
                            method.clone().into(),
                            Direction::NullableOut,
                            *stable,
                        )]),
                    )))
                }
                _ => Rhs::Value(Value::NotNull),
            },
        }
    }

    fn throw_rhs(&self, assumption: Option<(u16, ParamConstraint)>) -> Rhs {
        match &self.terminal {
            Terminal::Throw | Terminal::Npe => Rhs::Value(Value::Fail),
            Terminal::Return(_) => {
                if let Some((param, ParamConstraint::Null)) = assumption {
                    if self.derefed.contains(&param) {
                        return Rhs::Value(Value::Fail);
                    }
                }
                let mut components = Vec::new();
                for call in &self.calls {
                    let mut ids = BTreeSet::new();
                    ids.insert(EKey::new(
                        call.method.clone().into(),
                        Direction::Throw,
                        call.stable,
                    ));
                    for (position, arg) in call.args.iter().enumerate() {
                        let constraint = match (arg, assumption) {
                            (CValue::NthParam(param), Some((tracked, constraint)))
                                if tracked == *param =>
                            {
                                Some(constraint)
                            }
                            _ => arg_constraint(arg),
                        };
                        if let Some(constraint) = constraint {
                            ids.insert(EKey::new(
                                call.method.clone().into(),
                                Direction::InThrow {
                                    param: position as u16,
                                    constraint,
                                },
                                call.stable,
                            ));
                        }
                    }
                    for id in ids {
                        components.push(Component::new(STANDARD.top, BTreeSet::from([id])));
                    }
                }
                if components.is_empty() {
                    Rhs::Value(Value::Top)
                } else {
                    Rhs::Pending(Pending::new(components))
                }
            }
        }
    }

    fn not_null_rhs(&self, param: u16) -> Rhs {
        if self.derefed.contains(&param) {
            return Rhs::Value(Value::NotNull);
        }
        if matches!(self.terminal, Terminal::Throw | Terminal::Npe) {
            return Rhs::Value(Value::Top);
        }
        let mut components = Vec::new();
        for call in &self.calls {
            for (position, arg) in call.args.iter().enumerate() {
                if matches!(arg, CValue::NthParam(p) if *p == param) {
                    components.push(Component::new(
                        STANDARD.top,
                        BTreeSet::from([EKey::new(
                            call.method.clone().into(),
                            Direction::In {
                                param: position as u16,
                                nullable: false,
                            },
                            call.stable,
                        )]),
                    ));
                }
            }
        }
        if components.is_empty() {
            Rhs::Value(Value::Top)
        } else {
            Rhs::Pending(Pending::new(components))
        }
    }

    fn nullable_rhs(&self, param: u16) -> Rhs {
        if self.derefed.contains(&param) || self.escaped.contains(&param) {
            return Rhs::Value(Value::Top);
        }
        let mut ids = BTreeSet::new();
        for call in &self.calls {
            for (position, arg) in call.args.iter().enumerate() {
                if matches!(arg, CValue::NthParam(p) if *p == param) {
                    ids.insert(EKey::new(
                        call.method.clone().into(),
                        Direction::In {
                            param: position as u16,
                            nullable: true,
                        },
                        call.stable,
                    ));
                }
            }
        }
        if ids.is_empty() {
            Rhs::Value(Value::Null)
        } else {
            Rhs::Pending(Pending::single(Component::new(STANDARD.top, ids)))
        }
    }
}
