use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::keys::EKey;

/// Quanta beyond this many collapse to the unconditional top effect.
pub const EFFECTS_CUTOFF: usize = 32;

/// What a method's return value is made of, in terms of its inputs.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum DataValue {
    This,
    /// A value born inside the method (a fresh allocation or local).
    Local,
    Parameter(u16),
    /// The return value of a callee, resolved through its key.
    Return(EKey),
    Unknown { wide: bool },
}

impl Default for DataValue {
    fn default() -> DataValue {
        DataValue::Unknown { wide: false }
    }
}

impl DataValue {
    pub fn unknown(wide: bool) -> DataValue {
        DataValue::Unknown { wide }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, DataValue::Unknown { wide: true })
    }

    pub fn dependency(&self) -> Option<&EKey> {
        match self {
            DataValue::Return(key) => Some(key),
            _ => None,
        }
    }
}

/// One observable side effect of a method.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum EffectQuantum {
    /// Arbitrary effects; absorbs everything else.
    Top,
    /// Mutates the receiver's state.
    ThisChange,
    /// Mutates state reachable from a parameter.
    ParamChange(u16),
    /// Performs whatever the callee performs, with arguments remapped.
    Call {
        key: EKey,
        is_static: bool,
        args: Vec<DataValue>,
    },
    /// Mutates state reachable from a callee's return value.
    ReturnChange(EKey),
    /// Reads a field whose volatility is decided by the key's equation.
    FieldRead(EKey),
}

impl EffectQuantum {
    pub fn dependency(&self) -> Option<&EKey> {
        match self {
            EffectQuantum::Call { key, .. }
            | EffectQuantum::ReturnChange(key)
            | EffectQuantum::FieldRead(key) => Some(key),
            _ => None,
        }
    }
}

/// Effect summary of a method: its return value provenance plus the set
/// of side-effect quanta. The empty quanta set means pure.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Effects {
    pub return_value: DataValue,
    pub quanta: BTreeSet<EffectQuantum>,
}

impl Effects {
    pub fn new(return_value: DataValue, quanta: BTreeSet<EffectQuantum>) -> Effects {
        let mut effects = Effects {
            return_value,
            quanta,
        };
        effects.saturate();
        effects
    }

    pub fn pure(return_value: DataValue) -> Effects {
        Effects {
            return_value,
            quanta: BTreeSet::new(),
        }
    }

    pub fn top() -> Effects {
        Effects {
            return_value: DataValue::unknown(false),
            quanta: [EffectQuantum::Top].into(),
        }
    }

    pub fn is_pure(&self) -> bool {
        self.quanta.is_empty()
    }

    pub fn is_top(&self) -> bool {
        self.quanta.contains(&EffectQuantum::Top)
    }

    /// Keys this summary still depends on, sorted and deduplicated.
    pub fn dependencies(&self) -> Vec<EKey> {
        let mut keys: BTreeSet<EKey> = self
            .quanta
            .iter()
            .filter_map(|quantum| quantum.dependency().cloned())
            .collect();
        if let Some(key) = self.return_value.dependency() {
            keys.insert(key.clone());
        }
        keys.into_iter().collect()
    }

    /// Union of two summaries; disagreeing return provenance widens to
    /// unknown.
    pub fn combine(&self, other: &Effects) -> Effects {
        let return_value = if self.return_value == other.return_value {
            self.return_value.clone()
        } else {
            DataValue::unknown(self.return_value.is_wide() || other.return_value.is_wide())
        };
        let mut quanta = self.quanta.clone();
        quanta.extend(other.quanta.iter().cloned());
        Effects::new(return_value, quanta)
    }

    fn saturate(&mut self) {
        if self.is_top() || self.quanta.len() > EFFECTS_CUTOFF {
            self.quanta = [EffectQuantum::Top].into();
            if matches!(self.return_value, DataValue::Return(_)) {
                self.return_value = DataValue::unknown(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataValue, EFFECTS_CUTOFF, EffectQuantum, Effects};
    use crate::keys::{Direction, EKey, Member};

    fn key(name: &str) -> EKey {
        EKey::new(
            Member::new("com/acme/Widget", name, "()V").into(),
            Direction::Pure,
            true,
        )
    }

    #[test]
    fn pure_and_top_classification() {
        assert!(Effects::pure(DataValue::Local).is_pure());
        assert!(!Effects::pure(DataValue::Local).is_top());
        assert!(Effects::top().is_top());
        assert!(!Effects::top().is_pure());
    }

    #[test]
    fn top_quantum_absorbs_the_rest() {
        let effects = Effects::new(
            DataValue::This,
            [EffectQuantum::Top, EffectQuantum::ThisChange].into(),
        );
        assert_eq!(effects.quanta, [EffectQuantum::Top].into());
    }

    #[test]
    fn oversized_quanta_collapse_to_top() {
        let quanta = (0..=EFFECTS_CUTOFF as u16)
            .map(EffectQuantum::ParamChange)
            .collect();
        let effects = Effects::new(DataValue::Return(key("f")), quanta);
        assert!(effects.is_top());
        assert_eq!(effects.return_value, DataValue::unknown(false));
    }

    #[test]
    fn combine_unions_quanta_and_widens_disagreeing_returns() {
        let a = Effects::new(DataValue::This, [EffectQuantum::ThisChange].into());
        let b = Effects::new(DataValue::Parameter(0), [EffectQuantum::ParamChange(0)].into());
        let combined = a.combine(&b);
        assert_eq!(
            combined.quanta,
            [EffectQuantum::ThisChange, EffectQuantum::ParamChange(0)].into()
        );
        assert_eq!(combined.return_value, DataValue::unknown(false));

        let same = a.combine(&a);
        assert_eq!(same.return_value, DataValue::This);
    }

    #[test]
    fn dependencies_cover_quanta_and_return_value() {
        let effects = Effects::new(
            DataValue::Return(key("f")),
            [
                EffectQuantum::Call {
                    key: key("g"),
                    is_static: true,
                    args: vec![],
                },
                EffectQuantum::FieldRead(key("h")),
            ]
            .into(),
        );
        let deps = effects.dependencies();
        assert_eq!(deps, vec![key("f"), key("g"), key("h")]);
    }
}
