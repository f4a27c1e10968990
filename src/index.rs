//! Equation lookup capability used during global solving.
//!
//! The solver never cares where equations come from; tests back this
//! with a plain map, production callers index a persisted corpus. A
//! member may legitimately map to several `Equations` records when it is
//! duplicated across class files, and hashed members may collide, so
//! lookups return everything found.

use std::collections::BTreeMap;

use crate::keys::MemberId;
use crate::lattice::{Equations, Rhs};
use crate::solve::{hash_effects, hash_rhs};

/// Maps a member to every equations record known for it.
pub trait EquationProvider {
    fn equations(&self, member: &MemberId) -> Vec<Equations>;
}

/// In-memory index over inferred equations. Records are normalized to
/// hashed member form on insert so freshly inferred and persisted records
/// for the same member land on one entry. Inserting two different records
/// for one member degrades that member to the empty sentinel, the same
/// way a hash collision does in a persisted index.
#[derive(Debug, Default)]
pub struct InMemoryEquationIndex {
    entries: BTreeMap<MemberId, Equations>,
}

fn normalize(equations: Equations) -> Equations {
    Equations {
        member: MemberId::Hashed(equations.member.hashed()),
        stable: equations.stable,
        results: equations
            .results
            .into_iter()
            .map(|(direction, rhs)| {
                let rhs = match &rhs {
                    Rhs::Effects(effects) => Rhs::Effects(hash_effects(effects)),
                    other => hash_rhs(other),
                };
                (direction, rhs)
            })
            .collect(),
    }
}

impl InMemoryEquationIndex {
    pub fn new() -> InMemoryEquationIndex {
        InMemoryEquationIndex::default()
    }

    pub fn insert(&mut self, equations: Equations) {
        let equations = normalize(equations);
        let member = equations.member.clone();
        match self.entries.get(&member) {
            None => {
                self.entries.insert(member, equations);
            }
            Some(existing) if *existing == equations => {}
            Some(_) => {
                self.entries.insert(member.clone(), Equations::empty(member));
            }
        }
    }

    pub fn extend(&mut self, all: impl IntoIterator<Item = Equations>) {
        for equations in all {
            self.insert(equations);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberId> {
        self.entries.keys()
    }
}

impl EquationProvider for InMemoryEquationIndex {
    fn equations(&self, member: &MemberId) -> Vec<Equations> {
        self.entries
            .get(&MemberId::Hashed(member.hashed()))
            .cloned()
            .into_iter()
            .collect()
    }
}
