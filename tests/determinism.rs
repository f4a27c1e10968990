//! Insertion order must not affect the solved map.

use std::collections::BTreeSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use pactum::keys::{Direction, EKey, Member, MemberId, ParamConstraint};
use pactum::lattice::{Component, Equation, Pending, Rhs, STANDARD, Value};
use pactum::solver::Solver;

fn key(name: &str, direction: Direction, stable: bool) -> EKey {
    EKey::new(
        MemberId::from(Member::new("com/acme/Widget", name, "(Ljava/lang/Object;)Z")),
        direction,
        stable,
    )
}

fn depends(value: Value, ids: impl IntoIterator<Item = EKey>) -> Rhs {
    Rhs::Pending(Pending::single(Component::new(
        value,
        ids.into_iter().collect::<BTreeSet<_>>(),
    )))
}

// Chains, a disjunction, a negation and a mix of stabilities; enough
// shape that a wrong pop order would show.
fn batch() -> Vec<Equation> {
    let in_out = Direction::InOut {
        param: 0,
        constraint: ParamConstraint::Null,
    };
    vec![
        Equation {
            key: key("a", Direction::Out, true),
            rhs: Rhs::Value(Value::NotNull),
        },
        Equation {
            key: key("b", Direction::Out, true),
            rhs: depends(STANDARD.top, [key("a", Direction::Out, true)]),
        },
        Equation {
            key: key("c", Direction::Out, false),
            rhs: depends(STANDARD.top, [key("b", Direction::Out, true)]),
        },
        Equation {
            key: key("d", in_out, true),
            rhs: Rhs::Value(Value::False),
        },
        Equation {
            key: key("e", in_out, true),
            rhs: depends(STANDARD.top, [key("d", in_out, true).negate()]),
        },
        Equation {
            key: key("f", Direction::Out, true),
            rhs: Rhs::Pending(Pending::new(vec![
                Component::new(STANDARD.top, BTreeSet::from([key("a", Direction::Out, true)])),
                Component::new(STANDARD.top, BTreeSet::from([key("d", in_out, true)])),
            ])),
        },
        Equation {
            key: key("g", Direction::Throw, true),
            rhs: Rhs::Value(Value::Fail),
        },
        Equation {
            key: key("h", Direction::Out, true),
            rhs: depends(
                STANDARD.top,
                [key("b", Direction::Out, true), key("g", Direction::Throw, true)],
            ),
        },
    ]
}

fn solve(equations: Vec<Equation>) -> std::collections::BTreeMap<EKey, Value> {
    let mut solver = Solver::new(STANDARD);
    for equation in equations {
        solver.add_equation(equation);
    }
    solver.solve()
}

#[test]
fn shuffled_insertion_orders_solve_identically() {
    let reference = solve(batch());
    // Exact dispatch keeps the chained value; the virtual variant of an
    // overridable member degrades to top.
    assert_eq!(
        reference.get(&key("c", Direction::Out, true)),
        Some(&Value::NotNull)
    );
    assert_eq!(
        reference.get(&key("c", Direction::Out, false)),
        Some(&Value::Top)
    );

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..50 {
        let mut shuffled = batch();
        shuffled.shuffle(&mut rng);
        assert_eq!(solve(shuffled), reference);
    }
}
