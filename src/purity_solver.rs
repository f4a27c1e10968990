//! Effects solver for the `Pure` and `Volatile` directions.
//!
//! Same fixed-point shape as the value solver, but substitution rewrites
//! effect quanta: a call quantum expands into the callee's solved quanta
//! remapped through the recorded argument positions, and return-change or
//! field-read quanta collapse according to what the callee's effects say.
//! Keys whose dependency cycles never resolve simply stay absent, which
//! consumers read as the unknown (impure) answer.

use std::collections::{BTreeMap, BTreeSet};

use crate::effects::{DataValue, EffectQuantum, Effects};
use crate::keys::EKey;

pub struct PuritySolver {
    raw: BTreeMap<EKey, Effects>,
    solved: BTreeMap<EKey, Effects>,
    pending: BTreeMap<EKey, Effects>,
    dependencies: BTreeMap<EKey, BTreeSet<EKey>>,
    moving: Vec<(EKey, Effects)>,
}

impl PuritySolver {
    pub fn new() -> PuritySolver {
        PuritySolver {
            raw: BTreeMap::new(),
            solved: BTreeMap::new(),
            pending: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            moving: Vec::new(),
        }
    }

    /// Queues one effects equation; duplicates for a key are combined.
    pub fn add_equation(&mut self, key: EKey, effects: Effects) {
        let combined = match self.raw.remove(&key) {
            None => effects,
            Some(existing) => existing.combine(&effects),
        };
        self.raw.insert(key, combined);
    }

    pub fn solve(mut self) -> BTreeMap<EKey, Effects> {
        let equations = std::mem::take(&mut self.raw);
        for (key, effects) in equations {
            if effects.dependencies().is_empty() {
                self.moving.push((key, effects));
            } else {
                self.insert_pending(key, effects);
            }
        }

        while let Some((key, effects)) = self.moving.pop() {
            if self.solved.contains_key(&key) {
                continue;
            }
            self.solved.insert(key.clone(), effects.clone());

            let pairs = if key.stable {
                [
                    (key.clone(), effects.clone()),
                    (key.mk_unstable(), effects),
                ]
            } else {
                [(key.mk_stable(), effects), (key.clone(), Effects::top())]
            };
            for (trigger, trigger_effects) in pairs {
                if trigger != key {
                    self.solved
                        .entry(trigger.clone())
                        .or_insert_with(|| trigger_effects.clone());
                }
                self.substitute(&trigger, &trigger_effects);
            }
        }

        self.solved
    }

    fn insert_pending(&mut self, key: EKey, effects: Effects) {
        for dependency in effects.dependencies() {
            self.dependencies
                .entry(dependency)
                .or_default()
                .insert(key.clone());
        }
        self.pending.insert(key, effects);
    }

    fn substitute(&mut self, trigger: &EKey, solved: &Effects) {
        let dependents = match self.dependencies.remove(trigger) {
            Some(dependents) => dependents,
            None => return,
        };
        for dependent in dependents {
            let effects = match self.pending.remove(&dependent) {
                Some(effects) => effects,
                None => continue,
            };
            let rewritten = apply(&effects, trigger, solved);
            if rewritten.dependencies().is_empty() {
                self.moving.push((dependent, rewritten));
            } else {
                self.insert_pending(dependent, rewritten);
            }
        }
    }
}

impl Default for PuritySolver {
    fn default() -> PuritySolver {
        PuritySolver::new()
    }
}

// Which quantum a mutation of this argument position becomes in the
// caller's frame of reference.
fn classify(arg: Option<&DataValue>) -> Option<EffectQuantum> {
    match arg {
        Some(DataValue::This) => Some(EffectQuantum::ThisChange),
        Some(DataValue::Parameter(param)) => Some(EffectQuantum::ParamChange(*param)),
        Some(DataValue::Local) => None,
        Some(DataValue::Return(key)) => Some(EffectQuantum::ReturnChange(key.clone())),
        Some(DataValue::Unknown { .. }) | None => Some(EffectQuantum::Top),
    }
}

fn apply(effects: &Effects, trigger: &EKey, solved: &Effects) -> Effects {
    let mut quanta = BTreeSet::new();
    for quantum in &effects.quanta {
        match quantum {
            EffectQuantum::Call {
                key,
                is_static,
                args,
            } if key == trigger => {
                if solved.is_top() {
                    quanta.insert(EffectQuantum::Top);
                    continue;
                }
                let offset = if *is_static { 0 } else { 1 };
                for callee_quantum in &solved.quanta {
                    let mapped = match callee_quantum {
                        EffectQuantum::Top => Some(EffectQuantum::Top),
                        EffectQuantum::ThisChange => classify(args.first()),
                        EffectQuantum::ParamChange(param) => {
                            classify(args.get(offset + *param as usize))
                        }
                        // A solved callee has no dependent quanta left.
                        _ => Some(EffectQuantum::Top),
                    };
                    if let Some(mapped) = mapped {
                        quanta.insert(mapped);
                    }
                }
            }
            EffectQuantum::ReturnChange(key) if key == trigger => {
                // Mutating an object the callee allocated itself is local
                // to this caller too; anything else is untracked.
                if !matches!(solved.return_value, DataValue::Local) {
                    quanta.insert(EffectQuantum::Top);
                }
            }
            EffectQuantum::FieldRead(key) if key == trigger => {
                if solved.is_top() {
                    quanta.insert(EffectQuantum::Top);
                }
            }
            other => {
                quanta.insert(other.clone());
            }
        }
    }
    let return_value = match &effects.return_value {
        DataValue::Return(key) if key == trigger => match solved.return_value {
            DataValue::Local => DataValue::Local,
            _ => DataValue::unknown(false),
        },
        other => other.clone(),
    };
    Effects::new(return_value, quanta)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::PuritySolver;
    use crate::effects::{DataValue, EffectQuantum, Effects};
    use crate::keys::{Direction, EKey, Member};

    fn pure_key(name: &str) -> EKey {
        EKey::new(
            Member::new("com/acme/Widget", name, "(I)I").into(),
            Direction::Pure,
            true,
        )
    }

    fn call_on(callee: &EKey, args: Vec<DataValue>) -> Effects {
        Effects::new(
            DataValue::unknown(false),
            BTreeSet::from([EffectQuantum::Call {
                key: callee.clone(),
                is_static: true,
                args,
            }]),
        )
    }

    #[test]
    fn pure_callee_leaves_the_caller_pure() {
        let mut solver = PuritySolver::new();
        solver.add_equation(pure_key("f"), Effects::pure(DataValue::Parameter(0)));
        solver.add_equation(
            pure_key("g"),
            call_on(&pure_key("f"), vec![DataValue::Parameter(0)]),
        );
        let solved = solver.solve();
        assert!(solved.get(&pure_key("g")).expect("solved").is_pure());
    }

    #[test]
    fn callee_parameter_mutation_is_remapped_to_caller_arguments() {
        // f mutates its parameter 0; g passes its own parameter 1 there.
        let mut solver = PuritySolver::new();
        solver.add_equation(
            pure_key("f"),
            Effects::new(
                DataValue::unknown(false),
                BTreeSet::from([EffectQuantum::ParamChange(0)]),
            ),
        );
        solver.add_equation(
            pure_key("g"),
            call_on(&pure_key("f"), vec![DataValue::Parameter(1)]),
        );
        let solved = solver.solve();
        let effects = solved.get(&pure_key("g")).expect("solved");
        assert!(effects.quanta.contains(&EffectQuantum::ParamChange(1)));
        assert!(!effects.is_top());
    }

    #[test]
    fn mutation_of_a_locally_allocated_argument_disappears() {
        let mut solver = PuritySolver::new();
        solver.add_equation(
            pure_key("f"),
            Effects::new(
                DataValue::unknown(false),
                BTreeSet::from([EffectQuantum::ParamChange(0)]),
            ),
        );
        solver.add_equation(
            pure_key("g"),
            call_on(&pure_key("f"), vec![DataValue::Local]),
        );
        let solved = solver.solve();
        assert!(solved.get(&pure_key("g")).expect("solved").is_pure());
    }

    #[test]
    fn impure_callee_spoils_the_caller() {
        let mut solver = PuritySolver::new();
        solver.add_equation(pure_key("f"), Effects::top());
        solver.add_equation(
            pure_key("g"),
            call_on(&pure_key("f"), vec![DataValue::Parameter(0)]),
        );
        let solved = solver.solve();
        assert!(solved.get(&pure_key("g")).expect("solved").is_top());
    }

    #[test]
    fn recursion_terminates_and_stays_unsolved() {
        let mut solver = PuritySolver::new();
        solver.add_equation(
            pure_key("f"),
            call_on(&pure_key("g"), vec![DataValue::Parameter(0)]),
        );
        solver.add_equation(
            pure_key("g"),
            call_on(&pure_key("f"), vec![DataValue::Parameter(0)]),
        );
        let solved = solver.solve();
        assert_eq!(solved.get(&pure_key("f")), None);
        assert_eq!(solved.get(&pure_key("g")), None);
    }

    #[test]
    fn unstable_callee_degrades_virtual_call_sites() {
        let unstable = EKey::new(
            Member::new("com/acme/Widget", "f", "(I)I").into(),
            Direction::Pure,
            false,
        );
        let mut solver = PuritySolver::new();
        solver.add_equation(unstable.clone(), Effects::pure(DataValue::unknown(false)));
        solver.add_equation(
            pure_key("g"),
            call_on(&unstable, vec![DataValue::Parameter(0)]),
        );
        let solved = solver.solve();
        assert!(solved.get(&pure_key("g")).expect("solved").is_top());
    }

    #[test]
    fn volatile_field_reads_poison_purity() {
        let field = EKey::new(
            Member::new("com/acme/Widget", "size", "I").into(),
            Direction::Volatile,
            true,
        );
        let mut solver = PuritySolver::new();
        solver.add_equation(field.clone(), Effects::top());
        solver.add_equation(
            pure_key("g"),
            Effects::new(
                DataValue::unknown(false),
                BTreeSet::from([EffectQuantum::FieldRead(field.clone())]),
            ),
        );
        let solved = solver.solve();
        assert!(solved.get(&pure_key("g")).expect("solved").is_top());
    }
}
