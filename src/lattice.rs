use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::effects::Effects;
use crate::keys::{EKey, MemberId};

/// Final values of the equation lattice.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Value {
    Bot,
    NotNull,
    Null,
    True,
    False,
    Fail,
    Pure,
    Top,
}

impl Value {
    pub const ALL: [Value; 8] = [
        Value::Bot,
        Value::NotNull,
        Value::Null,
        Value::True,
        Value::False,
        Value::Fail,
        Value::Pure,
        Value::Top,
    ];

    pub fn ordinal(self) -> u32 {
        Value::ALL.iter().position(|&v| v == self).unwrap_or(0) as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Value> {
        Value::ALL.get(ordinal as usize).copied()
    }

    /// Boolean complement; everything non-boolean is its own negation.
    pub fn negate(self) -> Value {
        match self {
            Value::True => Value::False,
            Value::False => Value::True,
            other => other,
        }
    }
}

/// A two-point sublattice of [`Value`]: everything other than `bot` and
/// `top` joins to `top` and meets to `bot`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Lattice {
    pub bot: Value,
    pub top: Value,
}

/// Lattice of most directions.
pub const STANDARD: Lattice = Lattice {
    bot: Value::Bot,
    top: Value::Top,
};

/// Lattice of the nullable-return direction, where any chance of null
/// drives the result to `Null`.
pub const NULLABLE: Lattice = Lattice {
    bot: Value::NotNull,
    top: Value::Null,
};

impl Lattice {
    pub fn join(self, a: Value, b: Value) -> Value {
        if a == self.bot || a == b {
            b
        } else if b == self.bot {
            a
        } else {
            self.top
        }
    }

    pub fn meet(self, a: Value, b: Value) -> Value {
        if a == self.top || a == b {
            b
        } else if b == self.top {
            a
        } else {
            self.bot
        }
    }
}

/// One conjunct of a pending sum: `value` AND all the keys in `ids`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Component {
    pub value: Value,
    pub ids: BTreeSet<EKey>,
}

impl Component {
    pub fn new(value: Value, ids: BTreeSet<EKey>) -> Component {
        Component { value, ids }
    }

    pub fn remove(&mut self, key: &EKey) {
        self.ids.remove(key);
    }

    /// `other` makes the same contribution under fewer assumptions.
    pub fn dominated_by(&self, other: &Component) -> bool {
        self != other && self.value == other.value && other.ids.is_subset(&self.ids)
    }
}

/// Disjunction of components: the equation's value is the join over all
/// components of (component value meet its resolved keys).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Pending {
    pub sum: Vec<Component>,
}

impl Pending {
    pub fn new(sum: Vec<Component>) -> Pending {
        let mut pending = Pending { sum };
        pending.reduce();
        pending
    }

    pub fn single(component: Component) -> Pending {
        Pending {
            sum: vec![component],
        }
    }

    /// Size measure capped by the equation size limit.
    pub fn literal_count(&self) -> usize {
        self.sum
            .iter()
            .map(|component| 1 + component.ids.len())
            .sum()
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &EKey> {
        self.sum.iter().flat_map(|component| component.ids.iter())
    }

    /// Canonical form: sorted, deduplicated, dominated components dropped.
    fn reduce(&mut self) {
        self.sum.sort();
        self.sum.dedup();
        let snapshot = self.sum.clone();
        self.sum
            .retain(|component| !snapshot.iter().any(|other| component.dominated_by(other)));
    }
}

/// Right-hand side of an equation.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Rhs {
    Value(Value),
    Pending(Pending),
    Effects(Effects),
    FieldAccess(String),
}

impl Rhs {
    pub fn dependencies(&self) -> Vec<EKey> {
        match self {
            Rhs::Value(_) | Rhs::FieldAccess(_) => Vec::new(),
            Rhs::Pending(pending) => {
                let keys: BTreeSet<&EKey> = pending.dependencies().collect();
                keys.into_iter().cloned().collect()
            }
            Rhs::Effects(effects) => effects.dependencies(),
        }
    }
}

/// A single key's equation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Equation {
    pub key: EKey,
    pub rhs: Rhs,
}

/// All equations inferred for one member, keyed by encoded direction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Equations {
    pub member: MemberId,
    pub stable: bool,
    pub results: Vec<(u32, Rhs)>,
}

impl Equations {
    /// Sentinel stored when two distinct members collide on one hash;
    /// lookups then find no per-direction result and fall back to top.
    pub fn empty(member: MemberId) -> Equations {
        Equations {
            member,
            stable: false,
            results: Vec::new(),
        }
    }

    pub fn find(&self, direction: u32) -> Option<&Rhs> {
        self.results
            .iter()
            .find(|(encoded, _)| *encoded == direction)
            .map(|(_, rhs)| rhs)
    }
}

/// Joins partial results as an analysis merges paths, degrading to the
/// lattice top once the pending sum outgrows the size limit.
#[derive(Clone, Copy, Debug)]
pub struct ResultJoiner {
    pub lattice: Lattice,
    pub size_limit: usize,
}

impl ResultJoiner {
    pub fn new(lattice: Lattice, size_limit: usize) -> ResultJoiner {
        ResultJoiner {
            lattice,
            size_limit,
        }
    }

    pub fn join(&self, a: Rhs, b: Rhs) -> Rhs {
        self.check_limit(self.do_join(a, b))
    }

    fn do_join(&self, a: Rhs, b: Rhs) -> Rhs {
        match (a, b) {
            (Rhs::Value(a), Rhs::Value(b)) => Rhs::Value(self.lattice.join(a, b)),
            (Rhs::Value(value), Rhs::Pending(pending))
            | (Rhs::Pending(pending), Rhs::Value(value)) => {
                if value == self.lattice.bot {
                    Rhs::Pending(pending)
                } else if value == self.lattice.top {
                    Rhs::Value(self.lattice.top)
                } else {
                    let mut sum = pending.sum;
                    sum.push(Component::new(value, BTreeSet::new()));
                    Rhs::Pending(Pending::new(sum))
                }
            }
            (Rhs::Pending(a), Rhs::Pending(b)) => {
                let mut sum = a.sum;
                sum.extend(b.sum);
                Rhs::Pending(Pending::new(sum))
            }
            (Rhs::Effects(a), Rhs::Effects(b)) => Rhs::Effects(a.combine(&b)),
            (Rhs::FieldAccess(a), Rhs::FieldAccess(b)) if a == b => Rhs::FieldAccess(a),
            _ => Rhs::Value(self.lattice.top),
        }
    }

    fn check_limit(&self, rhs: Rhs) -> Rhs {
        match rhs {
            Rhs::Pending(pending) if pending.literal_count() > self.size_limit => {
                Rhs::Value(self.lattice.top)
            }
            other => other,
        }
    }
}
