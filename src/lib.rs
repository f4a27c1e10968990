//! Equation-based inference of JVM method contracts from decoded
//! bytecode.
//!
//! Per-class inference walks each method body a handful of times, once
//! per question asked about it (return value, nullability of each
//! parameter, purity, guaranteed throws), and records the answers as
//! equations over other members. Equations are self-contained per class,
//! cheap to persist, and solved lazily: a query session pulls the
//! transitive dependency set of the members it cares about and runs the
//! lattice solvers over just that set.

pub mod analysis;
pub mod cfg;
pub mod config;
pub mod descriptor;
pub mod effects;
pub mod errors;
pub mod facts;
pub mod frame;
pub mod index;
pub mod inference;
pub mod ir;
pub mod keys;
pub mod lattice;
pub mod persist;
pub mod purity_solver;
pub mod solve;
pub mod solver;
pub mod telemetry;
pub mod values;
