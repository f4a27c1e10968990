//! Per-class equation inference.
//!
//! For each method the driver enumerates the directions its descriptor
//! supports, picks an engine per direction and records one equation per
//! direction. Analyses that blow their step or size budget degrade that
//! single direction to a no-fact result instead of failing the class.

use tracing::{debug, warn};

use crate::analysis::{combined, in_out, in_throw, negation, params, purity};
use crate::cfg::{ControlFlowGraph, RichControlFlow};
use crate::config::AnalysisConfig;
use crate::descriptor::{ReturnShape, TypeShape, method_arg_shapes, method_return_shape, type_shape};
use crate::effects::{DataValue, Effects};
use crate::errors::AnalysisError;
use crate::ir::{ClassIr, Insn, MethodIr, ReturnKind};
use crate::keys::{Direction, Member, MemberId, ParamConstraint};
use crate::lattice::{Equations, NULLABLE, Rhs, STANDARD};

/// Infers equations for every method and field of one class.
///
/// A structurally broken class contributes nothing; cancellation is the
/// only error surfaced to the caller.
pub fn infer_class(
    class: &ClassIr,
    config: &AnalysisConfig,
) -> Result<Vec<Equations>, AnalysisError> {
    let mut records = Vec::with_capacity(class.methods.len() + class.fields.len());
    for field in &class.fields {
        records.push(field_equations(class, field)?);
    }
    for method in &class.methods {
        match method_equations(class, method, config) {
            Ok(record) => records.push(record),
            Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
            Err(err) => {
                warn!(class = %class.name, method = %method.name, %err, "skipping class");
                return Ok(Vec::new());
            }
        }
    }
    Ok(records)
}

/// Field volatility travels as an effects row so that `FieldRead` quanta
/// resolve against it in the purity solver.
fn field_equations(
    class: &ClassIr,
    field: &crate::ir::FieldIr,
) -> Result<Equations, AnalysisError> {
    let member = Member::new(&class.name, &field.name, &field.descriptor);
    let wide = type_shape(&field.descriptor).map_err(malformed)? == TypeShape::Wide;
    let effects = if field.access.is_volatile {
        Effects::top()
    } else {
        Effects::pure(DataValue::unknown(wide))
    };
    Ok(Equations {
        member: MemberId::from(member),
        stable: true,
        results: vec![(Direction::Volatile.as_int(), Rhs::Effects(effects))],
    })
}

fn method_equations(
    class: &ClassIr,
    method: &MethodIr,
    config: &AnalysisConfig,
) -> Result<Equations, AnalysisError> {
    let member = MemberId::from(Member::new(&class.name, &method.name, &method.descriptor));
    let stable = method.access.is_final
        || method.access.is_private
        || method.access.is_static
        || method.name == "<init>"
        || class.is_final;
    let directions = enumerate_directions(method)?;

    let mut results = Vec::with_capacity(directions.len() + 1);
    if method.access.is_native || method.access.is_abstract || method.instructions.is_empty() {
        for direction in directions {
            results.push((direction.as_int(), unknown_rhs(direction)));
        }
        return Ok(Equations {
            member,
            stable,
            results,
        });
    }

    let flow = RichControlFlow::new(ControlFlowGraph::build(method)?);
    if !flow.reducible() {
        debug!(member = %display_of(&member), "irreducible flow, no facts");
        for direction in directions {
            results.push((direction.as_int(), unknown_rhs(direction)));
        }
        return Ok(Equations {
            member,
            stable,
            results,
        });
    }

    let summary = combined::analyze(&flow, method)?;
    for direction in directions {
        let outcome = match direction {
            Direction::Pure => purity::analyze(&flow, method, config).map(Rhs::Effects),
            _ => match summary
                .as_ref()
                .and_then(|summary| summary.equation(direction, config))
            {
                Some(rhs) => Ok(rhs),
                None => dispatch(&flow, method, config, direction),
            },
        };
        let rhs = match outcome {
            Ok(rhs) => rhs,
            Err(err) if err.degrades_single_direction() => {
                debug!(member = %display_of(&member), ?direction, "budget exceeded");
                unknown_rhs(direction)
            }
            Err(err) => return Err(err),
        };
        results.push((direction.as_int(), rhs));
    }

    if let Some(field) = accessed_field(class, method) {
        results.push((Direction::Access.as_int(), Rhs::FieldAccess(field)));
    }

    Ok(Equations {
        member,
        stable,
        results,
    })
}

fn dispatch(
    flow: &RichControlFlow,
    method: &MethodIr,
    config: &AnalysisConfig,
    direction: Direction,
) -> Result<Rhs, AnalysisError> {
    match direction {
        Direction::Out | Direction::InOut { .. } => {
            if boolean_return(method)?
                && let Some(rhs) = negation::analyze(flow, method, direction)?
            {
                return Ok(rhs);
            }
            in_out::analyze(flow, method, config, direction)
        }
        Direction::NullableOut => in_out::analyze(flow, method, config, direction),
        Direction::Throw | Direction::InThrow { .. } => {
            in_throw::analyze(flow, method, config, direction)
        }
        Direction::In { .. } => params::analyze(flow, method, config, direction),
        other => Err(AnalysisError::Malformed(format!(
            "no engine for direction {other:?}"
        ))),
    }
}

fn enumerate_directions(method: &MethodIr) -> Result<Vec<Direction>, AnalysisError> {
    let ret = method_return_shape(&method.descriptor).map_err(malformed)?;
    let args = method_arg_shapes(&method.descriptor).map_err(malformed)?;
    let has_result = ret != ReturnShape::Void;

    let mut directions = Vec::new();
    if has_result {
        directions.push(Direction::Out);
    }
    if ret == ReturnShape::Value(TypeShape::Reference) {
        directions.push(Direction::NullableOut);
    }
    directions.push(Direction::Pure);
    directions.push(Direction::Throw);

    for (index, shape) in args.iter().enumerate() {
        let param = index as u16;
        match shape {
            TypeShape::Reference => {
                directions.push(Direction::In {
                    param,
                    nullable: false,
                });
                directions.push(Direction::In {
                    param,
                    nullable: true,
                });
                for constraint in [ParamConstraint::Null, ParamConstraint::NotNull] {
                    if has_result {
                        directions.push(Direction::InOut { param, constraint });
                    }
                    directions.push(Direction::InThrow { param, constraint });
                }
            }
            TypeShape::Boolean => {
                for constraint in [ParamConstraint::True, ParamConstraint::False] {
                    if has_result {
                        directions.push(Direction::InOut { param, constraint });
                    }
                    directions.push(Direction::InThrow { param, constraint });
                }
            }
            _ => {}
        }
    }
    Ok(directions)
}

/// No-fact result for a direction: the lattice top, except for effects
/// where the saturated set plays that role, and the nullable direction
/// where the absence of a fact is `NotNull`.
fn unknown_rhs(direction: Direction) -> Rhs {
    match direction {
        Direction::NullableOut => Rhs::Value(NULLABLE.bot),
        Direction::Pure | Direction::Volatile => Rhs::Effects(Effects::top()),
        _ => Rhs::Value(STANDARD.top),
    }
}

/// Recognizes trivial accessors so callers can chase field values through
/// them. Getter bodies read one field of this class and return it; setter
/// bodies store the first parameter into one field.
fn accessed_field(class: &ClassIr, method: &MethodIr) -> Option<String> {
    match method.instructions.as_slice() {
        [
            Insn::Load { slot: 0, .. },
            Insn::GetField {
                field,
                is_static: false,
            },
            Insn::Return { kind },
        ] if !method.access.is_static
            && *kind != ReturnKind::Void
            && field.owner == class.name =>
        {
            Some(field.name.clone())
        }
        [
            Insn::GetField {
                field,
                is_static: true,
            },
            Insn::Return { kind },
        ] if method.access.is_static && *kind != ReturnKind::Void && field.owner == class.name => {
            Some(field.name.clone())
        }
        [
            Insn::Load { slot: 0, .. },
            Insn::Load { slot: 1, .. },
            Insn::PutField {
                field,
                is_static: false,
            },
            Insn::Return {
                kind: ReturnKind::Void,
            },
        ] if !method.access.is_static && field.owner == class.name => Some(field.name.clone()),
        _ => None,
    }
}

fn boolean_return(method: &MethodIr) -> Result<bool, AnalysisError> {
    Ok(method_return_shape(&method.descriptor).map_err(malformed)?
        == ReturnShape::Value(TypeShape::Boolean))
}

fn display_of(member: &MemberId) -> String {
    match member {
        MemberId::Full(member) => member.to_string(),
        MemberId::Hashed(hash) => format!("{hash:?}"),
    }
}

fn malformed(err: anyhow::Error) -> AnalysisError {
    AnalysisError::Malformed(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::infer_class;
    use crate::config::AnalysisConfig;
    use crate::effects::Effects;
    use crate::errors::AnalysisError;
    use crate::ir::{
        ClassIr, Const, FieldAccessFlags, FieldIr, IfCond, Insn, MethodAccessFlags, MethodIr,
        ReturnKind,
    };
    use crate::keys::{Direction, Member, MemberId};
    use crate::lattice::{Equations, Rhs, Value};

    fn class(methods: Vec<MethodIr>, fields: Vec<FieldIr>) -> ClassIr {
        ClassIr {
            name: "com/acme/Widget".to_string(),
            is_final: false,
            is_interface: false,
            fields,
            methods,
        }
    }

    fn find(records: &[Equations], name: &str) -> Equations {
        let member = MemberId::from(Member::new(
            "com/acme/Widget",
            name,
            &records
                .iter()
                .filter_map(|record| match &record.member {
                    MemberId::Full(member) if member.name == name => {
                        Some(member.descriptor.clone())
                    }
                    _ => None,
                })
                .next()
                .expect("member present"),
        ));
        records
            .iter()
            .find(|record| record.member == member)
            .expect("record present")
            .clone()
    }

    #[test]
    fn static_null_returning_method_gets_out_and_nullable_facts() {
        let method = MethodIr {
            name: "nothing".to_string(),
            descriptor: "()Ljava/lang/Object;".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions: vec![
                Insn::Push(Const::Null),
                Insn::Return {
                    kind: ReturnKind::Reference,
                },
            ],
            handlers: Vec::new(),
        };
        let records = infer_class(&class(vec![method], Vec::new()), &AnalysisConfig::default())
            .expect("infer");
        let record = find(&records, "nothing");
        assert!(record.stable);
        assert_eq!(
            record.find(Direction::Out.as_int()),
            Some(&Rhs::Value(Value::Null))
        );
        assert_eq!(
            record.find(Direction::NullableOut.as_int()),
            Some(&Rhs::Value(Value::Null))
        );
    }

    #[test]
    fn abstract_method_gets_no_facts() {
        let method = MethodIr {
            name: "describe".to_string(),
            descriptor: "(Ljava/lang/Object;)Ljava/lang/Object;".to_string(),
            access: MethodAccessFlags {
                is_abstract: true,
                ..Default::default()
            },
            instructions: Vec::new(),
            handlers: Vec::new(),
        };
        let records = infer_class(&class(vec![method], Vec::new()), &AnalysisConfig::default())
            .expect("infer");
        let record = find(&records, "describe");
        assert!(!record.stable);
        assert_eq!(
            record.find(Direction::Out.as_int()),
            Some(&Rhs::Value(Value::Top))
        );
        assert_eq!(
            record.find(Direction::NullableOut.as_int()),
            Some(&Rhs::Value(Value::NotNull))
        );
        assert_eq!(
            record.find(Direction::Pure.as_int()),
            Some(&Rhs::Effects(Effects::top()))
        );
        assert!(
            record
                .find(
                    Direction::In {
                        param: 0,
                        nullable: false
                    }
                    .as_int()
                )
                .is_some()
        );
    }

    #[test]
    fn trivial_getter_is_flagged_as_an_accessor() {
        let field = Member::new("com/acme/Widget", "size", "I");
        let method = MethodIr {
            name: "size".to_string(),
            descriptor: "()I".to_string(),
            access: MethodAccessFlags::default(),
            instructions: vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::GetField {
                    field,
                    is_static: false,
                },
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
            handlers: Vec::new(),
        };
        let records = infer_class(&class(vec![method], Vec::new()), &AnalysisConfig::default())
            .expect("infer");
        let record = find(&records, "size");
        assert_eq!(
            record.find(Direction::Access.as_int()),
            Some(&Rhs::FieldAccess("size".to_string()))
        );
    }

    #[test]
    fn volatile_field_carries_saturated_effects() {
        let fields = vec![
            FieldIr {
                name: "flag".to_string(),
                descriptor: "Z".to_string(),
                access: FieldAccessFlags {
                    is_volatile: true,
                    ..Default::default()
                },
            },
            FieldIr {
                name: "count".to_string(),
                descriptor: "J".to_string(),
                access: FieldAccessFlags::default(),
            },
        ];
        let records =
            infer_class(&class(Vec::new(), fields), &AnalysisConfig::default()).expect("infer");
        let flag = find(&records, "flag");
        assert_eq!(
            flag.find(Direction::Volatile.as_int()),
            Some(&Rhs::Effects(Effects::top()))
        );
        let count = find(&records, "count");
        match count.find(Direction::Volatile.as_int()) {
            Some(Rhs::Effects(effects)) => assert!(effects.is_pure()),
            other => panic!("unexpected row {other:?}"),
        }
    }

    #[test]
    fn boolean_complement_pattern_emits_negated_keys() {
        // isAbsent(o) = !delegate(o)
        let delegate = Member::new("com/acme/Widget", "delegate", "(Ljava/lang/Object;)Z");
        let method = MethodIr {
            name: "isAbsent".to_string(),
            descriptor: "(Ljava/lang/Object;)Z".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions: vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Invoke {
                    kind: crate::ir::CallKind::Static,
                    method: delegate,
                },
                Insn::If {
                    cond: crate::ir::IfCond::Ne,
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
            handlers: Vec::new(),
        };
        let records = infer_class(&class(vec![method], Vec::new()), &AnalysisConfig::default())
            .expect("infer");
        let record = find(&records, "isAbsent");
        match record.find(Direction::Out.as_int()) {
            Some(Rhs::Pending(pending)) => {
                let component = &pending.sum[0];
                assert!(component.ids.iter().all(|key| key.negated));
            }
            other => panic!("expected a negated dependency, got {other:?}"),
        }
    }

    #[test]
    fn malformed_descriptor_drops_the_whole_class() {
        let good = MethodIr {
            name: "ok".to_string(),
            descriptor: "()V".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions: vec![Insn::Return {
                kind: ReturnKind::Void,
            }],
            handlers: Vec::new(),
        };
        let bad = MethodIr {
            name: "broken".to_string(),
            descriptor: "(((".to_string(),
            access: MethodAccessFlags::default(),
            instructions: Vec::new(),
            handlers: Vec::new(),
        };
        let records = infer_class(
            &class(vec![good, bad], Vec::new()),
            &AnalysisConfig::default(),
        )
        .expect("infer");
        assert!(records.is_empty());
    }

    fn long_boolean_method(name: &str) -> MethodIr {
        let mut instructions = vec![Insn::Nop; 30];
        instructions.push(Insn::Push(Const::Int(1)));
        instructions.push(Insn::Return {
            kind: ReturnKind::Word,
        });
        MethodIr {
            name: name.to_string(),
            descriptor: "()Z".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions,
            handlers: Vec::new(),
        }
    }

    #[test]
    fn step_budget_exhaustion_degrades_the_direction_not_the_method() {
        let method = long_boolean_method("churn");

        // Under the default budget the body is plainly pure.
        let records = infer_class(
            &class(vec![method.clone()], Vec::new()),
            &AnalysisConfig::default(),
        )
        .expect("infer");
        match find(&records, "churn").find(Direction::Pure.as_int()) {
            Some(Rhs::Effects(effects)) => assert!(effects.is_pure()),
            other => panic!("unexpected row {other:?}"),
        }

        // A budget smaller than the body exhausts the purity walk; the
        // linear value walk is unaffected, so Out keeps its fact.
        let mut config = AnalysisConfig::default();
        config.steps_limit = 8;
        let records = infer_class(&class(vec![method], Vec::new()), &config).expect("infer");
        let record = find(&records, "churn");
        assert_eq!(
            record.find(Direction::Out.as_int()),
            Some(&Rhs::Value(Value::True))
        );
        assert_eq!(
            record.find(Direction::Pure.as_int()),
            Some(&Rhs::Effects(Effects::top()))
        );
    }

    #[test]
    fn exhausted_step_budget_leaves_sibling_methods_intact() {
        // while (i != 0) {} return true;
        let spin = MethodIr {
            name: "spin".to_string(),
            descriptor: "(I)Z".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions: vec![
                Insn::Load {
                    slot: 0,
                    wide: false,
                },
                Insn::Nop,
                Insn::Nop,
                Insn::If {
                    cond: IfCond::Ne,
                    target: 0,
                },
                Insn::Push(Const::Int(1)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
            handlers: Vec::new(),
        };
        let trivial = MethodIr {
            name: "yes".to_string(),
            descriptor: "()Z".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions: vec![
                Insn::Push(Const::Int(1)),
                Insn::Return {
                    kind: ReturnKind::Word,
                },
            ],
            handlers: Vec::new(),
        };

        let mut config = AnalysisConfig::default();
        config.steps_limit = 5;
        let records =
            infer_class(&class(vec![spin, trivial], Vec::new()), &config).expect("infer");
        let spin = find(&records, "spin");
        assert_eq!(
            spin.find(Direction::Out.as_int()),
            Some(&Rhs::Value(Value::Top))
        );
        let trivial = find(&records, "yes");
        assert_eq!(
            trivial.find(Direction::Out.as_int()),
            Some(&Rhs::Value(Value::True))
        );
    }

    #[test]
    fn cancellation_aborts_inference() {
        let mut instructions = vec![
            Insn::Load {
                slot: 0,
                wide: false,
            },
            Insn::If {
                cond: IfCond::Eq,
                target: 142,
            },
        ];
        instructions.extend(vec![Insn::Nop; 140]);
        instructions.push(Insn::Push(Const::Int(1)));
        instructions.push(Insn::Return {
            kind: ReturnKind::Word,
        });
        let method = MethodIr {
            name: "drag".to_string(),
            descriptor: "(I)Z".to_string(),
            access: MethodAccessFlags {
                is_static: true,
                ..Default::default()
            },
            instructions,
            handlers: Vec::new(),
        };

        let config = AnalysisConfig::default();
        config.cancel.cancel();
        let outcome = infer_class(&class(vec![method], Vec::new()), &config);
        assert!(matches!(outcome, Err(AnalysisError::Cancelled)));
    }
}
