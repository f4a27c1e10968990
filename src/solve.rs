//! Query session: expands the dependency frontier for a set of root
//! members, routes their equations to the right solver, and returns the
//! solved fact maps.
//!
//! Value directions solve over the standard lattice, nullable returns
//! over the nullable lattice, purity and field volatility over effects.
//! All keys are normalized to hashed member form before solving so that
//! records from a persisted index and freshly inferred ones meet on equal
//! keys.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::AnalysisConfig;
use crate::effects::{DataValue, EffectQuantum, Effects};
use crate::errors::AnalysisError;
use crate::index::EquationProvider;
use crate::keys::{Direction, EKey, MemberId};
use crate::lattice::{Component, Equation, NULLABLE, Pending, Rhs, STANDARD, Value};
use crate::purity_solver::PuritySolver;
use crate::solver::Solver;

/// Solved facts for one query's transitive dependency set. Absent keys
/// mean "no information" and must be read as top by consumers.
#[derive(Debug, Default)]
pub struct Solution {
    pub values: BTreeMap<EKey, Value>,
    pub nullable: BTreeMap<EKey, Value>,
    pub effects: BTreeMap<EKey, Effects>,
    pub field_access: BTreeMap<EKey, String>,
}

pub struct QuerySession<'a, P: EquationProvider> {
    provider: &'a P,
    config: &'a AnalysisConfig,
}

impl<'a, P: EquationProvider> QuerySession<'a, P> {
    pub fn new(provider: &'a P, config: &'a AnalysisConfig) -> QuerySession<'a, P> {
        QuerySession { provider, config }
    }

    /// Pulls every equation transitively reachable from the roots and
    /// solves them. Gives up with `TooManyEquations` when the frontier
    /// outgrows the per-query budget.
    pub fn resolve(
        &self,
        roots: impl IntoIterator<Item = MemberId>,
    ) -> Result<Solution, AnalysisError> {
        let mut standard = Solver::new(STANDARD);
        let mut nullable = Solver::new(NULLABLE);
        let mut purity = PuritySolver::new();
        let mut field_access = BTreeMap::new();

        let mut queue: Vec<MemberId> = roots.into_iter().collect();
        let mut visited: BTreeSet<MemberId> = BTreeSet::new();
        let mut pulled = 0usize;

        while let Some(member) = queue.pop() {
            if self.config.cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            if !visited.insert(member.clone()) {
                continue;
            }
            for record in self.provider.equations(&member) {
                pulled += 1;
                if pulled > self.config.equations_per_query_limit {
                    return Err(AnalysisError::TooManyEquations);
                }
                for (encoded, rhs) in &record.results {
                    let direction = match Direction::from_int(*encoded) {
                        Some(direction) => direction,
                        None => continue,
                    };
                    let key = EKey::new(record.member.clone(), direction, record.stable).hashed();
                    for dependency in rhs_dependencies(rhs) {
                        queue.push(dependency.member.clone());
                    }
                    match (direction, rhs) {
                        (Direction::Pure | Direction::Volatile, Rhs::Effects(effects)) => {
                            purity.add_equation(key, hash_effects(effects));
                        }
                        (Direction::Pure | Direction::Volatile, _) => {}
                        (Direction::Access, Rhs::FieldAccess(field)) => {
                            field_access.insert(key, field.clone());
                        }
                        (Direction::Access, _) => {}
                        (Direction::NullableOut, rhs) => nullable.add_equation(Equation {
                            key,
                            rhs: hash_rhs(rhs),
                        }),
                        (_, rhs) => standard.add_equation(Equation {
                            key,
                            rhs: hash_rhs(rhs),
                        }),
                    }
                }
            }
        }

        Ok(Solution {
            values: standard.solve(),
            nullable: nullable.solve(),
            effects: purity.solve(),
            field_access,
        })
    }
}

fn rhs_dependencies(rhs: &Rhs) -> Vec<EKey> {
    match rhs {
        Rhs::Value(_) | Rhs::FieldAccess(_) => Vec::new(),
        Rhs::Pending(pending) => pending.dependencies().cloned().collect(),
        Rhs::Effects(effects) => effects.dependencies(),
    }
}

pub(crate) fn hash_rhs(rhs: &Rhs) -> Rhs {
    match rhs {
        Rhs::Pending(pending) => Rhs::Pending(Pending::new(
            pending
                .sum
                .iter()
                .map(|component| {
                    Component::new(
                        component.value,
                        component.ids.iter().map(|id| id.hashed()).collect(),
                    )
                })
                .collect(),
        )),
        other => other.clone(),
    }
}

pub(crate) fn hash_effects(effects: &Effects) -> Effects {
    let quanta = effects
        .quanta
        .iter()
        .map(|quantum| match quantum {
            EffectQuantum::Call {
                key,
                is_static,
                args,
            } => EffectQuantum::Call {
                key: key.hashed(),
                is_static: *is_static,
                args: args.iter().map(hash_data_value).collect(),
            },
            EffectQuantum::ReturnChange(key) => EffectQuantum::ReturnChange(key.hashed()),
            EffectQuantum::FieldRead(key) => EffectQuantum::FieldRead(key.hashed()),
            other => other.clone(),
        })
        .collect();
    Effects::new(hash_data_value(&effects.return_value), quanta)
}

fn hash_data_value(value: &DataValue) -> DataValue {
    match value {
        DataValue::Return(key) => DataValue::Return(key.hashed()),
        other => other.clone(),
    }
}
