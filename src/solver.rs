//! Generic equation solver over the `Value` lattice.
//!
//! Equations arrive as concrete values or sums of products of dependency
//! keys. Solving repeatedly pops a newly solved key and substitutes its
//! value into every pending equation that mentions it: the dependency is
//! removed, the component's tentative value is met with the substituted
//! value, and a component with no remaining dependencies joins the
//! equation's accumulator. Stability and negation are handled by
//! propagating each solved key through its sibling variants.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::EQUATION_SIZE_LIMIT;
use crate::keys::EKey;
use crate::lattice::{Component, Equation, Lattice, Pending, ResultJoiner, Rhs, Value};

#[derive(Clone, Debug)]
struct PendingEntry {
    acc: Value,
    components: Vec<Component>,
}

pub struct Solver {
    lattice: Lattice,
    raw: BTreeMap<EKey, Rhs>,
    solved: BTreeMap<EKey, Value>,
    pending: BTreeMap<EKey, PendingEntry>,
    dependencies: BTreeMap<EKey, BTreeSet<EKey>>,
    moving: Vec<(EKey, Value)>,
}

impl Solver {
    pub fn new(lattice: Lattice) -> Solver {
        Solver {
            lattice,
            raw: BTreeMap::new(),
            solved: BTreeMap::new(),
            pending: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            moving: Vec::new(),
        }
    }

    /// Queues one equation. Duplicates for the same key are joined; effect
    /// and field-access results are not value equations and are ignored.
    pub fn add_equation(&mut self, equation: Equation) {
        let rhs = match equation.rhs {
            rhs @ (Rhs::Value(_) | Rhs::Pending(_)) => rhs,
            Rhs::Effects(_) | Rhs::FieldAccess(_) => return,
        };
        let joined = match self.raw.remove(&equation.key) {
            None => rhs,
            Some(existing) => {
                ResultJoiner::new(self.lattice, EQUATION_SIZE_LIMIT).join(existing, rhs)
            }
        };
        self.raw.insert(equation.key, joined);
    }

    pub fn solve(mut self) -> BTreeMap<EKey, Value> {
        let equations = std::mem::take(&mut self.raw);
        for (key, rhs) in equations {
            match rhs {
                Rhs::Value(value) => self.moving.push((key, value)),
                Rhs::Pending(pending) => self.insert_pending(key, pending),
                Rhs::Effects(_) | Rhs::FieldAccess(_) => {}
            }
        }

        while let Some((key, value)) = self.moving.pop() {
            // The first resolution of a key wins; processing order is
            // canonical, so this keeps solving deterministic.
            if self.solved.contains_key(&key) {
                continue;
            }
            self.solved.insert(key.clone(), value);

            // A stable fact is the exact method's answer and serves both
            // reference kinds; an unstable fact still answers exact
            // (special/static) references but degrades virtual ones.
            let pairs = if key.stable {
                [
                    (key.clone(), value),
                    (key.mk_unstable(), value),
                ]
            } else {
                [
                    (key.mk_stable(), value),
                    (key.clone(), self.lattice.top),
                ]
            };
            for (trigger, trigger_value) in pairs {
                if trigger != key {
                    self.solved.entry(trigger.clone()).or_insert(trigger_value);
                }
                self.substitute(&trigger, trigger_value);
                self.substitute(&trigger.negate(), trigger_value.negate());
            }
        }

        self.solved
    }

    fn insert_pending(&mut self, key: EKey, pending: Pending) {
        let entry = PendingEntry {
            acc: self.lattice.bot,
            components: pending.sum,
        };
        match self.normalize(entry) {
            Ok(value) => self.moving.push((key, value)),
            Err(entry) => {
                for component in &entry.components {
                    for id in &component.ids {
                        self.dependencies
                            .entry(id.clone())
                            .or_default()
                            .insert(key.clone());
                    }
                }
                self.pending.insert(key, entry);
            }
        }
    }

    fn substitute(&mut self, trigger: &EKey, value: Value) {
        let dependents = match self.dependencies.remove(trigger) {
            Some(dependents) => dependents,
            None => return,
        };
        for dependent in dependents {
            let mut entry = match self.pending.remove(&dependent) {
                Some(entry) => entry,
                None => continue,
            };
            for component in &mut entry.components {
                if component.ids.remove(trigger) {
                    component.value = self.lattice.meet(component.value, value);
                }
            }
            match self.normalize(entry) {
                Ok(resolved) => self.moving.push((dependent, resolved)),
                Err(entry) => {
                    self.pending.insert(dependent, entry);
                }
            }
        }
    }

    // Fold exhausted components into the accumulator; `Ok` means the
    // whole equation is decided.
    fn normalize(&self, mut entry: PendingEntry) -> Result<Value, PendingEntry> {
        let lattice = self.lattice;
        let mut acc = entry.acc;
        entry.components.retain(|component| {
            if component.ids.is_empty() || component.value == lattice.bot {
                acc = lattice.join(acc, component.value);
                false
            } else {
                true
            }
        });
        entry.acc = acc;
        if acc == lattice.top || entry.components.is_empty() {
            Ok(acc)
        } else {
            Err(entry)
        }
    }
}
