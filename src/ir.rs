use serde::{Deserialize, Serialize};

pub use crate::keys::Member;

/// Decoded class ready for equation inference. Produced by an external
/// class-file decoder; this crate never parses raw bytecode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassIr {
    pub name: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_interface: bool,
    #[serde(default)]
    pub fields: Vec<FieldIr>,
    pub methods: Vec<MethodIr>,
}

/// Decoded field declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldIr {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub access: FieldAccessFlags,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldAccessFlags {
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_volatile: bool,
}

/// Decoded method body: typed instruction list plus handler ranges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodIr {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub access: MethodAccessFlags,
    #[serde(default)]
    pub instructions: Vec<Insn>,
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MethodAccessFlags {
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_native: bool,
}

/// Exception handler covering instruction indices `start..end`, jumping to
/// `handler`. Converted to exceptional CFG edges.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
}

/// Constant operand of a push instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Null,
    Int(i64),
    Long(i64),
    Float(f64),
    Double(f64),
    Str(String),
    ClassRef(String),
}

impl Const {
    /// Whether the constant occupies two stack slots.
    pub fn wide(&self) -> bool {
        matches!(self, Const::Long(_) | Const::Double(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

impl ArithOp {
    pub fn operand_count(self) -> usize {
        match self {
            ArithOp::Neg => 1,
            _ => 2,
        }
    }
}

/// Condition of a one-operand branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IfCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    Null,
    NonNull,
}

/// Condition of a two-operand compare branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CmpCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReturnKind {
    Void,
    Word,
    Wide,
    Reference,
}

/// Typed stack-machine instruction. Branch targets are instruction
/// indices, already resolved by the decoder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Insn {
    Nop,
    Push(Const),
    Load { slot: u16, wide: bool },
    Store { slot: u16, wide: bool },
    ArrayLoad { reference: bool, wide: bool },
    ArrayStore { reference: bool, wide: bool },
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Arith { op: ArithOp, wide: bool },
    Iinc { slot: u16, delta: i32 },
    Convert { to_wide: bool },
    Cmp { wide: bool },
    If { cond: IfCond, target: usize },
    IfCmp { reference: bool, cond: CmpCond, target: usize },
    Goto { target: usize },
    Switch { targets: Vec<usize>, default: usize },
    Return { kind: ReturnKind },
    Throw,
    GetField { field: Member, is_static: bool },
    PutField { field: Member, is_static: bool },
    Invoke { kind: CallKind, method: Member },
    InvokeDynamic { descriptor: String },
    New { class: String },
    NewArray,
    MultiNewArray { dims: u8 },
    ArrayLength,
    CheckCast { class: String },
    InstanceOf { class: String },
    MonitorEnter,
    MonitorExit,
}

impl Insn {
    /// Whether execution can fall through to the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Insn::Goto { .. } | Insn::Switch { .. } | Insn::Return { .. } | Insn::Throw
        )
    }

    /// Explicit jump targets, deduplicated.
    pub fn jump_targets(&self) -> Vec<usize> {
        match self {
            Insn::If { target, .. } | Insn::IfCmp { target, .. } | Insn::Goto { target } => {
                vec![*target]
            }
            Insn::Switch { targets, default } => {
                let mut all = targets.clone();
                all.push(*default);
                all.sort_unstable();
                all.dedup();
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether this instruction terminates the method on this path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Insn::Return { .. } | Insn::Throw)
    }
}

#[cfg(test)]
mod tests {
    use super::{CmpCond, Const, IfCond, Insn, ReturnKind};

    #[test]
    fn fallthrough_and_targets_match_instruction_shape() {
        let goto = Insn::Goto { target: 4 };
        assert!(!goto.falls_through());
        assert_eq!(goto.jump_targets(), vec![4]);

        let branch = Insn::If {
            cond: IfCond::Null,
            target: 9,
        };
        assert!(branch.falls_through());
        assert_eq!(branch.jump_targets(), vec![9]);

        let cmp = Insn::IfCmp {
            reference: true,
            cond: CmpCond::Eq,
            target: 2,
        };
        assert!(cmp.falls_through());

        assert!(
            Insn::Return {
                kind: ReturnKind::Void
            }
            .is_terminal()
        );
        assert!(Insn::Throw.is_terminal());
    }

    #[test]
    fn switch_targets_are_deduplicated() {
        let switch = Insn::Switch {
            targets: vec![7, 3, 7],
            default: 3,
        };
        assert_eq!(switch.jump_targets(), vec![3, 7]);
    }

    #[test]
    fn instruction_model_round_trips_through_json() {
        let insns = vec![
            Insn::Push(Const::Null),
            Insn::Load {
                slot: 1,
                wide: false,
            },
            Insn::Switch {
                targets: vec![3],
                default: 5,
            },
        ];
        let json = serde_json::to_string(&insns).expect("serialize instructions");
        let back: Vec<Insn> = serde_json::from_str(&json).expect("deserialize instructions");
        assert_eq!(back, insns);
    }
}
