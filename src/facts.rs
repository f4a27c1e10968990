//! Rendering of solved facts into a per-method report.
//!
//! The report mirrors the annotations a consumer would place on the
//! source: parameter and return nullability, purity, guaranteed throws
//! and contract clauses of the form `null, _ -> false`.

use serde::Serialize;

use crate::descriptor::{ReturnShape, TypeShape, method_arg_shapes, method_return_shape};
use crate::effects::EffectQuantum;
use crate::errors::AnalysisError;
use crate::keys::{Direction, EKey, Member, MemberId, ParamConstraint};
use crate::lattice::Value;
use crate::solve::Solution;

/// Facts inferred for one method. Empty collections and false flags mean
/// nothing was inferred, not that the opposite holds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MethodFacts {
    pub member: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub returns_not_null: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub returns_nullable: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub always_throws: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pure: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub mutates_this: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mutated_params: Vec<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_null_params: Vec<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nullable_params: Vec<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contracts: Vec<String>,
}

impl MethodFacts {
    pub fn is_empty(&self) -> bool {
        !self.returns_not_null
            && !self.returns_nullable
            && !self.always_throws
            && !self.pure
            && !self.mutates_this
            && self.mutated_params.is_empty()
            && self.not_null_params.is_empty()
            && self.nullable_params.is_empty()
            && self.contracts.is_empty()
    }
}

/// Whole-query report; one entry per method that produced any fact.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FactsReport {
    pub methods: Vec<MethodFacts>,
}

impl FactsReport {
    pub fn build<'a>(
        members: impl IntoIterator<Item = &'a Member>,
        solution: &Solution,
    ) -> Result<FactsReport, AnalysisError> {
        let mut methods = Vec::new();
        for member in members {
            let facts = method_facts(member, solution)?;
            if !facts.is_empty() {
                methods.push(facts);
            }
        }
        Ok(FactsReport { methods })
    }
}

/// Reads the solved maps for one method. The solution stores hashed keys
/// and both stability variants of every solved fact, so a lookup by the
/// stable hashed key suffices.
pub fn method_facts(member: &Member, solution: &Solution) -> Result<MethodFacts, AnalysisError> {
    let ret = method_return_shape(&member.descriptor)
        .map_err(|err| AnalysisError::Malformed(format!("{err:#}")))?;
    let args = method_arg_shapes(&member.descriptor)
        .map_err(|err| AnalysisError::Malformed(format!("{err:#}")))?;
    let id = MemberId::Hashed(member.hashed());
    let lookup = |direction: Direction| -> Option<Value> {
        let key = EKey::new(id.clone(), direction, true);
        solution
            .values
            .get(&key)
            .or_else(|| solution.values.get(&key.mk_unstable()))
            .copied()
    };

    let mut facts = MethodFacts {
        member: member.to_string(),
        ..MethodFacts::default()
    };

    if ret != ReturnShape::Void {
        let out = lookup(Direction::Out);
        facts.returns_not_null =
            ret == ReturnShape::Value(TypeShape::Reference) && out == Some(Value::NotNull);
    }
    if ret == ReturnShape::Value(TypeShape::Reference) {
        let key = EKey::new(id.clone(), Direction::NullableOut, true);
        let nullable = solution
            .nullable
            .get(&key)
            .or_else(|| solution.nullable.get(&key.mk_unstable()));
        facts.returns_nullable = nullable == Some(&Value::Null);
    }
    facts.always_throws = lookup(Direction::Throw) == Some(Value::Fail);

    let purity_key = EKey::new(id.clone(), Direction::Pure, true);
    let effects = solution
        .effects
        .get(&purity_key)
        .or_else(|| solution.effects.get(&purity_key.mk_unstable()));
    if let Some(effects) = effects {
        facts.pure = effects.is_pure();
        for quantum in &effects.quanta {
            match quantum {
                EffectQuantum::ThisChange => facts.mutates_this = true,
                EffectQuantum::ParamChange(param) => facts.mutated_params.push(*param),
                _ => {}
            }
        }
    }

    for (index, shape) in args.iter().enumerate() {
        let param = index as u16;
        match shape {
            TypeShape::Reference => {
                // Not-null wins: a parameter that is rejected when null is
                // not nullable even if null never reaches a dereference.
                if lookup(Direction::In {
                    param,
                    nullable: false,
                }) == Some(Value::NotNull)
                {
                    facts.not_null_params.push(param);
                } else if lookup(Direction::In {
                    param,
                    nullable: true,
                }) == Some(Value::Null)
                {
                    facts.nullable_params.push(param);
                }
                for constraint in [ParamConstraint::Null, ParamConstraint::NotNull] {
                    push_contracts(&mut facts, &lookup, ret, param, constraint, args.len());
                }
            }
            TypeShape::Boolean => {
                for constraint in [ParamConstraint::True, ParamConstraint::False] {
                    push_contracts(&mut facts, &lookup, ret, param, constraint, args.len());
                }
            }
            _ => {}
        }
    }

    Ok(facts)
}

fn push_contracts(
    facts: &mut MethodFacts,
    lookup: &impl Fn(Direction) -> Option<Value>,
    ret: ReturnShape,
    param: u16,
    constraint: ParamConstraint,
    arity: usize,
) {
    if lookup(Direction::InThrow { param, constraint }) == Some(Value::Fail) {
        facts
            .contracts
            .push(clause(param, constraint, arity, "fail"));
        return;
    }
    if ret == ReturnShape::Void {
        return;
    }
    if let Some(value) = lookup(Direction::InOut { param, constraint }) {
        let result = match value {
            Value::True => "true",
            Value::False => "false",
            Value::Null => "null",
            Value::NotNull => "!null",
            Value::Fail => "fail",
            _ => return,
        };
        facts
            .contracts
            .push(clause(param, constraint, arity, result));
    }
}

fn clause(param: u16, constraint: ParamConstraint, arity: usize, result: &str) -> String {
    let trigger = match constraint {
        ParamConstraint::Null => "null",
        ParamConstraint::NotNull => "!null",
        ParamConstraint::True => "true",
        ParamConstraint::False => "false",
    };
    let mut slots = vec!["_"; arity];
    slots[param as usize] = trigger;
    format!("{} -> {result}", slots.join(", "))
}
