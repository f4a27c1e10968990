use std::collections::BTreeSet;

use crate::keys::EKey;

/// Abstract stack/local value tracked by the frame analyses.
///
/// Most values are untracked `Scalar`s; the interesting ones mark the
/// parameter under analysis, boolean constants feeding contract clauses,
/// null information, and call results whose outcome is deferred to the
/// callee's equation.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum BasicValue {
    Uninit,
    Scalar { wide: bool },
    /// The parameter the current analysis is tracking.
    Param,
    /// A parameter identified by index, for analyses tracking all of them.
    NthParam(u16),
    /// Result of `instanceof` applied to the tracked parameter.
    InstanceOfCheck,
    True,
    False,
    Null,
    NotNull,
    /// Result of a call; resolving it is deferred to the keys' equations.
    Call { keys: BTreeSet<EKey>, wide: bool },
}

impl Default for BasicValue {
    fn default() -> BasicValue {
        BasicValue::Uninit
    }
}

impl BasicValue {
    pub fn untracked(wide: bool) -> BasicValue {
        BasicValue::Scalar { wide }
    }

    pub fn call(keys: BTreeSet<EKey>, wide: bool) -> BasicValue {
        BasicValue::Call { keys, wide }
    }

    pub fn wide(&self) -> bool {
        match self {
            BasicValue::Scalar { wide } | BasicValue::Call { wide, .. } => *wide,
            _ => false,
        }
    }

    /// Memoization equivalence: discriminant equality, except call results
    /// which must agree on their key sets.
    pub fn equiv(&self, other: &BasicValue) -> bool {
        match (self, other) {
            (BasicValue::Call { keys: a, .. }, BasicValue::Call { keys: b, .. }) => a == b,
            (BasicValue::Scalar { .. }, BasicValue::Scalar { .. }) => true,
            _ => self == other,
        }
    }

    /// Folding relation for loop detection: `self` is at least as specific
    /// as `base`. Untracked base values subsume everything.
    pub fn is_instance_of(&self, base: &BasicValue) -> bool {
        match base {
            BasicValue::Uninit | BasicValue::Scalar { .. } => true,
            BasicValue::Param => matches!(self, BasicValue::Param),
            BasicValue::NthParam(n) => matches!(self, BasicValue::NthParam(m) if m == n),
            BasicValue::InstanceOfCheck => matches!(self, BasicValue::InstanceOfCheck),
            BasicValue::True => matches!(self, BasicValue::True),
            BasicValue::False => matches!(self, BasicValue::False),
            BasicValue::Null => matches!(self, BasicValue::Null),
            BasicValue::NotNull => matches!(self, BasicValue::NotNull),
            BasicValue::Call { keys: base_keys, .. } => {
                matches!(self, BasicValue::Call { keys, .. } if keys == base_keys)
            }
        }
    }
}
