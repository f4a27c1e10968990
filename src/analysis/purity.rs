//! Purity and side-effect inference for the `Pure` direction.
//!
//! Unlike the decision-machine analyses this is a plain forward dataflow
//! pass: per-instruction frames over `DataValue` are joined at merge
//! points until a fixed point, while effect quanta accumulate in one
//! global set. Fresh allocations are classified `Local`, so mutating an
//! object the method itself created does not count as a side effect.

use std::collections::BTreeSet;

use crate::cfg::RichControlFlow;
use crate::config::AnalysisConfig;
use crate::descriptor::{ReturnShape, TypeShape, method_arg_shapes};
use crate::effects::{DataValue, EffectQuantum, Effects};
use crate::errors::AnalysisError;
use crate::frame::{Frame, Interpreter, execute};
use crate::ir::{CallKind, Const, Insn, Member, MethodIr, ReturnKind};
use crate::keys::{Direction, EKey};

struct EffectInterpreter {
    quanta: BTreeSet<EffectQuantum>,
}

impl EffectInterpreter {
    fn mutate(&mut self, target: &DataValue) {
        let quantum = match target {
            DataValue::This => Some(EffectQuantum::ThisChange),
            DataValue::Parameter(param) => Some(EffectQuantum::ParamChange(*param)),
            DataValue::Return(key) => Some(EffectQuantum::ReturnChange(key.clone())),
            DataValue::Local => None,
            DataValue::Unknown { .. } => Some(EffectQuantum::Top),
        };
        if let Some(quantum) = quantum {
            self.quanta.insert(quantum);
        }
    }
}

impl Interpreter for EffectInterpreter {
    type Value = DataValue;

    fn untracked(&self, wide: bool) -> DataValue {
        DataValue::unknown(wide)
    }

    fn is_wide(&self, value: &DataValue) -> bool {
        value.is_wide()
    }

    fn constant(&mut self, constant: &Const) -> DataValue {
        DataValue::unknown(constant.wide())
    }

    fn unary(&mut self, insn: &Insn, value: &DataValue, wide: bool) -> DataValue {
        match insn {
            Insn::CheckCast { .. } => value.clone(),
            Insn::NewArray => DataValue::Local,
            _ => DataValue::unknown(wide),
        }
    }

    fn call(
        &mut self,
        kind: CallKind,
        method: &Member,
        args: Vec<DataValue>,
        result: ReturnShape,
    ) -> Result<Option<DataValue>, AnalysisError> {
        let is_static = kind == CallKind::Static;
        let stable = matches!(kind, CallKind::Static | CallKind::Special);
        let key = EKey::new(method.clone().into(), Direction::Pure, stable);
        self.quanta.insert(EffectQuantum::Call {
            key: key.clone(),
            is_static,
            args,
        });
        Ok(match result {
            ReturnShape::Void => None,
            ReturnShape::Value(TypeShape::Wide) => Some(DataValue::unknown(true)),
            ReturnShape::Value(_) => Some(DataValue::Return(key)),
        })
    }

    fn invoke_dynamic(&mut self, _descriptor: &str, _args: Vec<DataValue>, result: ReturnShape) -> Option<DataValue> {
        self.quanta.insert(EffectQuantum::Top);
        match result {
            ReturnShape::Void => None,
            ReturnShape::Value(shape) => Some(DataValue::unknown(shape == TypeShape::Wide)),
        }
    }

    fn get_field(&mut self, field: &Member, _receiver: Option<&DataValue>, wide: bool) -> DataValue {
        self.quanta.insert(EffectQuantum::FieldRead(EKey::new(
            field.clone().into(),
            Direction::Volatile,
            true,
        )));
        DataValue::unknown(wide)
    }

    fn put_field(&mut self, _field: &Member, receiver: Option<&DataValue>, _value: &DataValue) {
        match receiver {
            Some(receiver) => self.mutate(receiver),
            // Static fields are reachable by everyone.
            None => {
                self.quanta.insert(EffectQuantum::Top);
            }
        }
    }

    fn ternary(&mut self, _insn: &Insn, array: &DataValue, _index: &DataValue, _value: &DataValue) {
        self.mutate(array);
    }

    fn new_object(&mut self, _class: &str) -> DataValue {
        DataValue::Local
    }

    fn new_array(&mut self) -> DataValue {
        DataValue::Local
    }

    fn sink(&mut self, insn: &Insn, _value: &DataValue) {
        if matches!(insn, Insn::MonitorEnter | Insn::MonitorExit) {
            self.quanta.insert(EffectQuantum::Top);
        }
    }
}

fn join_value(a: &DataValue, b: &DataValue) -> DataValue {
    if a == b {
        a.clone()
    } else {
        DataValue::unknown(a.is_wide() || b.is_wide())
    }
}

fn join_frames(a: &Frame<DataValue>, b: &Frame<DataValue>) -> Frame<DataValue> {
    let locals = (0..a.locals.len().max(b.locals.len()))
        .map(|slot| {
            join_value(
                a.locals.get(slot).unwrap_or(&DataValue::default()),
                b.locals.get(slot).unwrap_or(&DataValue::default()),
            )
        })
        .collect();
    // Merging stacks of different depths means broken bytecode upstream;
    // degrade the tail instead of failing the whole method.
    let depth = a.stack.len().min(b.stack.len());
    let stack = (0..depth)
        .map(|i| join_value(&a.stack[i], &b.stack[i]))
        .collect();
    Frame { locals, stack }
}

fn seed_frame(method: &MethodIr) -> Result<Frame<DataValue>, AnalysisError> {
    let shapes = method_arg_shapes(&method.descriptor)
        .map_err(|err| AnalysisError::Malformed(format!("{err:#}")))?;
    let mut frame = Frame::new();
    let mut slot = 0u16;
    if !method.access.is_static {
        frame.set_local(0, DataValue::This);
        slot = 1;
    }
    for (param, shape) in shapes.into_iter().enumerate() {
        let value = if shape == TypeShape::Wide {
            DataValue::unknown(true)
        } else {
            DataValue::Parameter(param as u16)
        };
        frame.set_local(slot, value);
        slot += shape.slots();
    }
    Ok(frame)
}

/// Infers the method's effects by forward dataflow to a fixed point.
pub fn analyze(
    flow: &RichControlFlow,
    method: &MethodIr,
    config: &AnalysisConfig,
) -> Result<Effects, AnalysisError> {
    let count = method.instructions.len();
    let mut interp = EffectInterpreter {
        quanta: BTreeSet::new(),
    };
    let mut inbound: Vec<Option<Frame<DataValue>>> = vec![None; count];
    inbound[0] = Some(seed_frame(method)?);
    let mut worklist = vec![0usize];
    let mut returned: Option<DataValue> = None;
    let mut steps = 0usize;

    while let Some(index) = worklist.pop() {
        steps += 1;
        if steps % crate::config::CANCEL_POLL_INTERVAL == 0 && config.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if steps > config.steps_limit {
            return Err(AnalysisError::TooComplex);
        }
        let frame = match &inbound[index] {
            Some(frame) => frame.clone(),
            None => continue,
        };
        let insn = &method.instructions[index];
        match insn {
            Insn::Return { kind } => {
                if !matches!(kind, ReturnKind::Void) {
                    let top = frame.top()?.clone();
                    returned = Some(match returned {
                        None => top,
                        Some(prev) => join_value(&prev, &top),
                    });
                }
                continue;
            }
            Insn::Throw => continue,
            _ => {}
        }
        let mut out = frame.clone();
        execute(&mut out, insn, &mut interp)?;
        for &succ in flow.graph.successors(index) {
            let succ_frame = if flow.graph.is_exceptional(index, succ) {
                Frame {
                    locals: out.locals.clone(),
                    stack: vec![DataValue::unknown(false)],
                }
            } else {
                out.clone()
            };
            let merged = match &inbound[succ] {
                None => succ_frame,
                Some(existing) => {
                    let merged = join_frames(existing, &succ_frame);
                    if merged == *existing {
                        continue;
                    }
                    merged
                }
            };
            inbound[succ] = Some(merged);
            worklist.push(succ);
        }
    }

    let return_value = returned.unwrap_or_else(|| DataValue::unknown(false));
    Ok(Effects::new(return_value, interp.quanta))
}

#[cfg(test)]
mod tests {
    use super::analyze;
    use crate::cfg::{ControlFlowGraph, RichControlFlow};
    use crate::config::AnalysisConfig;
    use crate::effects::{DataValue, EffectQuantum};
    use crate::ir::{CallKind, Insn, Member, MethodIr, ReturnKind};
    use crate::keys::{Direction, EKey};

    fn method(descriptor: &str, is_static: bool, instructions: Vec<Insn>) -> MethodIr {
        let mut method = MethodIr {
            name: "body".to_string(),
            descriptor: descriptor.to_string(),
            access: Default::default(),
            instructions,
            handlers: Vec::new(),
        };
        method.access.is_static = is_static;
        method
    }

    fn run(method: &MethodIr) -> crate::effects::Effects {
        let flow = RichControlFlow::new(ControlFlowGraph::build(method).expect("cfg"));
        analyze(&flow, method, &AnalysisConfig::default()).expect("analysis")
    }

    #[test]
    fn identity_is_pure_and_returns_its_parameter() {
        let body = method(
            "(I)I",
            true,
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
        );
        let effects = run(&body);
        assert!(effects.is_pure());
        assert_eq!(effects.return_value, DataValue::Parameter(0));
    }

    #[test]
    fn setter_changes_this() {
        let body = method(
            "(I)V",
            false,
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Load {
                    slot: 1,
                    wide: false,
                },
                Insn::PutField {
                    field: Member::new("com/acme/Widget", "size", "I"),
                    is_static: false,
                },
                Insn::Return {
                    kind: ReturnKind::Void,
                },
            ],
        );
        let effects = run(&body);
        assert!(effects.quanta.contains(&EffectQuantum::ThisChange));
        assert!(!effects.is_top());
    }

    #[test]
    fn static_field_write_is_top() {
        let body = method(
            "(I)V",
            true,
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::PutField {
                    field: Member::new("com/acme/Widget", "count", "I"),
                    is_static: true,
                },
                Insn::Return {
                    kind: ReturnKind::Void,
                },
            ],
        );
        assert!(run(&body).is_top());
    }

    #[test]
    fn mutating_a_fresh_allocation_stays_pure() {
        // Widget w = new Widget(); w.size = n; return w;
        let body = method(
            "(I)Lcom/acme/Widget;",
            true,
            vec![
                Insn::New {
                    class: "com/acme/Widget".to_string(),
                },
                Insn::Dup,
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::PutField {
                    field: Member::new("com/acme/Widget", "size", "I"),
                    is_static: false,
                },
                Insn::Return {
                    kind: ReturnKind::Reference,
                },
            ],
        );
        let effects = run(&body);
        assert!(effects.is_pure());
        assert_eq!(effects.return_value, DataValue::Local);
    }

    #[test]
    fn delegation_records_a_call_quantum_with_arguments() {
        let callee = Member::new("com/acme/Widget", "compute", "(I)I");
        let body = method(
            "(I)I",
            true,
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Invoke {
                    kind: CallKind::Static,
                    method: callee.clone(),
                },
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
        );
        let effects = run(&body);
        let key = EKey::new(callee.into(), Direction::Pure, true);
        assert_eq!(effects.return_value, DataValue::Return(key.clone()));
        assert!(effects.quanta.contains(&EffectQuantum::Call {
            key,
            is_static: true,
            args: vec![DataValue::Parameter(0)],
        }));
    }

    #[test]
    fn field_read_defers_to_the_volatility_equation() {
        let field = Member::new("com/acme/Widget", "size", "I");
        let body = method(
            "()I",
            false,
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::GetField {
                    field: field.clone(),
                    is_static: false,
                },
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
        );
        let effects = run(&body);
        let key = EKey::new(field.into(), Direction::Volatile, true);
        assert!(effects.quanta.contains(&EffectQuantum::FieldRead(key)));
    }

    #[test]
    fn branches_join_disagreeing_returns_to_unknown() {
        use crate::ir::{Const, IfCond};
        let body = method(
            "(Z)I",
            true,
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::If {
                    cond: IfCond::Eq,
                    target: 4,
                },
                Insn::Push(Const::Int(1)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
                Insn::Push(Const::Int(0)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
        );
        let effects = run(&body);
        assert!(effects.is_pure());
        assert_eq!(effects.return_value, DataValue::unknown(false));
    }
}
