//! Recognizes the `return !delegate(...)` compilation pattern and emits
//! negated dependency keys instead of losing the correlation.
//!
//! javac compiles boolean negation into a conditional jump that
//! re-materializes constants, so the plain in/out analysis sees two
//! unrelated constant returns and joins them to Top. Matching the shape
//! here keeps the contract composable through the solver's negate map.

use crate::analysis::in_out::CallInterpreter;
use crate::analysis::{constraint_value, start_frame};
use crate::cfg::RichControlFlow;
use crate::errors::AnalysisError;
use crate::frame::execute;
use crate::ir::{Const, IfCond, Insn, MethodIr, ReturnKind};
use crate::keys::Direction;
use crate::lattice::{Component, Pending, Rhs, STANDARD};
use crate::values::BasicValue;

/// Attempts the negation pattern for `Out` or `InOut`. Returns `None`
/// when the body is not a negated delegation.
pub fn analyze(
    flow: &RichControlFlow,
    method: &MethodIr,
    direction: Direction,
) -> Result<Option<Rhs>, AnalysisError> {
    let seed = match direction {
        Direction::Out => None,
        Direction::InOut { param, constraint } => Some((param, constraint)),
        _ => return Ok(None),
    };

    let mut frame = start_frame(method, |param, _| match seed {
        Some((tracked, constraint)) if tracked == param => constraint_value(constraint),
        _ => BasicValue::untracked(false),
    })?;

    // Linear prefix up to the conditional jump on the call result.
    let mut index = 0usize;
    let mut visited = vec![false; method.instructions.len()];
    let (cond, target) = loop {
        if visited[index] {
            return Ok(None);
        }
        visited[index] = true;
        match &method.instructions[index] {
            Insn::If {
                cond: cond @ (IfCond::Eq | IfCond::Ne),
                target,
            } => break (*cond, *target),
            insn @ (Insn::Load { .. }
            | Insn::Push(_)
            | Insn::Invoke { .. }
            | Insn::GetField { .. }
            | Insn::CheckCast { .. }
            | Insn::Goto { .. }) => {
                let mut interp = CallInterpreter::new(false);
                execute(&mut frame, insn, &mut interp)?;
                if interp.npe {
                    return Ok(None);
                }
                match flow.graph.successors(index) {
                    [next] => index = *next,
                    _ => return Ok(None),
                }
            }
            _ => return Ok(None),
        }
    };

    let keys = match frame.top()? {
        BasicValue::Call { keys, .. } => keys.clone(),
        _ => return Ok(None),
    };

    let fallthrough = returned_bool(method, index + 1)?;
    let jump = returned_bool(method, target)?;
    let (Some(fallthrough), Some(jump)) = (fallthrough, jump) else {
        return Ok(None);
    };

    // ifeq jumps when the callee returned false; the pattern is a
    // negation when the jump branch materializes true.
    let negated = match cond {
        IfCond::Eq => jump && !fallthrough,
        IfCond::Ne => !jump && fallthrough,
        _ => false,
    };
    if !negated {
        return Ok(None);
    }

    let ids = keys.into_iter().map(|key| key.negate()).collect();
    Ok(Some(Rhs::Pending(Pending::single(Component::new(
        STANDARD.top,
        ids,
    )))))
}

// A branch arm must be `iconst_0/1; ireturn`, possibly behind gotos.
fn returned_bool(method: &MethodIr, start: usize) -> Result<Option<bool>, AnalysisError> {
    let mut index = start;
    let mut hops = 0usize;
    loop {
        hops += 1;
        if hops > method.instructions.len() {
            return Ok(None);
        }
        match &method.instructions[index] {
            Insn::Goto { target } => index = *target,
            Insn::Push(Const::Int(value @ (0 | 1))) => {
                return Ok(match method.instructions.get(index + 1) {
                    Some(Insn::Return {
                        kind: ReturnKind::Word,
                    }) => Some(*value == 1),
                    _ => None,
                });
            }
            _ => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::analyze;
    use crate::cfg::{ControlFlowGraph, RichControlFlow};
    use crate::ir::{CallKind, Const, IfCond, Insn, Member, MethodIr, ReturnKind};
    use crate::keys::{Direction, EKey, ParamConstraint};
    use crate::lattice::Rhs;

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

    // return !isEmpty(o);
    fn negated_delegation() -> (Member, MethodIr) {
        let callee = Member::new("com/acme/Checks", "isEmpty", "(Ljava/lang/Object;)Z");
        let method = static_method(
            "(Ljava/lang/Object;)Z",
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Invoke {
                    kind: CallKind::Static,
                    method: callee.clone(),
                },
                Insn::If {
                    cond: IfCond::Eq,
                    target: 5,
                },
                Insn::Push(Const::Int(0)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
                Insn::Push(Const::Int(1)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
        );
        (callee, method)
    }

    #[test]
    fn negated_delegation_emits_negated_keys() {
        let (callee, method) = negated_delegation();
        let flow = flow_for(&method);
        let rhs = analyze(&flow, &method, Direction::Out)
            .expect("analysis")
            .expect("pattern");
        match rhs {
            Rhs::Pending(pending) => {
                let expected = EKey::new(callee.into(), Direction::Out, true).negate();
                assert!(pending.sum[0].ids.contains(&expected));
            }
            other => panic!("expected pending, got {other:?}"),
        }
    }

    #[test]
    fn assumption_refines_the_negated_callee() {
        let (callee, method) = negated_delegation();
        let flow = flow_for(&method);
        let rhs = analyze(
            &flow,
            &method,
            Direction::InOut {
                param: 0,
                constraint: ParamConstraint::Null,
            },
        )
        .expect("analysis")
        .expect("pattern");
        match rhs {
            Rhs::Pending(pending) => {
                let refined = EKey::new(
                    callee.into(),
                    Direction::InOut {
                        param: 0,
                        constraint: ParamConstraint::Null,
                    },
                    true,
                )
                .negate();
                assert!(pending.sum[0].ids.contains(&refined));
            }
            other => panic!("expected pending, got {other:?}"),
        }
    }

    #[test]
    fn plain_delegation_is_not_a_negation() {
        let callee = Member::new("com/acme/Checks", "isEmpty", "(Ljava/lang/Object;)Z");
        let method = static_method(
            "(Ljava/lang/Object;)Z",
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Invoke {
                    kind: CallKind::Static,
                    method: callee,
                },
                Insn::If {
                    cond: IfCond::Eq,
                    target: 5,
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
        let flow = flow_for(&method);
        assert!(
            analyze(&flow, &method, Direction::Out)
                .expect("analysis")
                .is_none()
        );
    }

    #[test]
    fn non_call_condition_is_rejected() {
        let method = static_method(
            "(Z)Z",
            vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::If {
                    cond: IfCond::Eq,
                    target: 4,
                },
                Insn::Push(Const::Int(0)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
                Insn::Push(Const::Int(1)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
        );
        let flow = flow_for(&method);
        assert!(
            analyze(&flow, &method, Direction::Out)
                .expect("analysis")
                .is_none()
        );
    }
}
