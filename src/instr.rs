//! Instruction encoding: opcodes, operand kinds, and the instruction word
//! itself. The opcode numbering is fixed by the loader contract — reordering
//! this enum would desync any image already produced against it, so new
//! opcodes are never inserted in the middle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Uminus,
    And,
    Or,
    Not,
    Jeq,
    Jne,
    Jle,
    Jge,
    Jlt,
    Jgt,
    Jump,
    Call,
    Pusharg,
    Funcenter,
    Funcexit,
    Newtable,
    Tablegetelem,
    Tablesetelem,
    Nop,
}

/// Operand kind, independent of its numeric payload. `Empty` marks an
/// operand slot an instruction doesn't use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperandKind {
    Empty,
    Label,
    Global,
    Local,
    Formal,
    Number,
    #[serde(rename = "string")]
    Str,
    Bool,
    Nil,
    Userfunc,
    Libfunc,
    Retval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    /// Meaning depends on `kind`: a constant-pool index, a stack offset,
    /// a jump target, or unused (0) for `Empty`/`Nil`/`Retval`.
    pub value: usize,
}

impl Operand {
    pub const EMPTY: Operand = Operand {
        kind: OperandKind::Empty,
        value: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.kind == OperandKind::Empty
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub result: Operand,
    pub arg1: Operand,
    pub arg2: Operand,
    /// Source line for diagnostics; 0 means "no update to currLine".
    #[serde(default)]
    pub src_line: u32,
}
