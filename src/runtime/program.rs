//! Function prototypes and the packed instruction format.

use std::cell::RefCell;
use std::rc::Rc;

use num_enum::TryFromPrimitive;

use super::value::{Value, VmString};
use super::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// R[a] = R[b]
    Move,
    /// R[a] = K[b]
    LoadConst,
    /// R[a] = nil
    LoadNil,
    /// R[a] = R[b] + R[c]
    Add,
    /// R[a] = R[b] - R[c]
    Sub,
    /// R[a] = U[b]
    GetUpval,
    /// U[a] = R[b]
    SetUpval,
    /// R[a] = closure over child prototype `b`
    NewClosure,
    /// call R[a] with `b` arguments, result lands in R[a]
    Call,
    /// return R[a]
    Return,
}

/// 4-byte instruction word: opcode plus three operands.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Instruction {
    pub op: u8,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl Instruction {
    pub const fn new(op: Opcode, a: u8, b: u8, c: u8) -> Self {
        Self { op: op as u8, a, b, c }
    }

    pub fn opcode(&self) -> Result<Opcode, VmError> {
        Opcode::try_from(self.op).map_err(|_| VmError::InvalidOpcode(self.op))
    }

    pub fn pack(self) -> u32 {
        u32::from_ne_bytes([self.op, self.a, self.b, self.c])
    }

    pub fn unpack(word: u32) -> Self {
        let [op, a, b, c] = word.to_ne_bytes();
        Self { op, a, b, c }
    }
}

/// Describes where a closure's upvalue is captured from: the enclosing
/// frame's registers (`in_stack`) or the enclosing closure's own upvalues.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub in_stack: bool,
    pub index: u8,
    /// Debug only.
    pub name: Option<Rc<VmString>>,
}

/// Debug interval of a local variable, in instruction offsets.
#[derive(Debug, Clone)]
pub struct LocVar {
    pub start_pc: i32,
    pub end_pc: i32,
    pub name: Option<Rc<VmString>>,
}

/// A compiled function body. Shared between every closure instantiating it;
/// the persistence reader fills a shell in place, which is why the whole
/// structure sits behind a `RefCell`.
#[derive(Debug, Default)]
pub struct FuncProto {
    pub line_defined: i32,
    pub last_line_defined: i32,
    pub nparams: u8,
    pub is_vararg: bool,
    pub max_stack: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub protos: Vec<Rc<RefCell<FuncProto>>>,
    pub upvalues: Vec<UpvalDesc>,
    // debug information; zero-filled when a stream was written without it
    pub source: Option<Rc<VmString>>,
    pub line_info: Vec<i32>,
    pub locals: Vec<LocVar>,
}

impl FuncProto {
    pub fn new(nparams: u8, max_stack: u8) -> Self {
        Self {
            nparams,
            max_stack,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_packs_to_one_word() {
        let i = Instruction::new(Opcode::Add, 1, 2, 3);
        assert_eq!(Instruction::unpack(i.pack()), i);
        assert_eq!(i.opcode().unwrap(), Opcode::Add);
    }

    #[test]
    fn bad_opcode_is_an_error() {
        let i = Instruction { op: 0xff, a: 0, b: 0, c: 0 };
        assert!(i.opcode().is_err());
    }
}
