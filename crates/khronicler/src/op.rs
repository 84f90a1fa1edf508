//! Opcode representation shared by the compiler, the serializer and the VM.
//!
//! Opcodes are a tagged sum; the binary image stores the discriminator plus
//! a two-word payload (see `image`). Jump opcodes carry a [`JumpTarget`]
//! that starts out as a label-slot index during compilation and is patched
//! to a resolved opcode position before serialization.

use strum::{FromRepr, IntoStaticStr};

/// Opcode discriminators as stored in the binary image.
///
/// Id 0 is reserved; executing it reports an unknown-opcode runtime error,
/// and loaders fold unrecognized ids onto it so the fault surfaces at the
/// offending position instead of at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u32)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OpId {
    Nul = 0,
    PushNum,
    PushStr,
    PushVar,
    SetVar,
    SetVarAsArray,
    ArrGet,
    ArrSet,
    Pop,
    UnaryOp,
    BinaryOp,
    CallBuiltIn,
    CallFunc,
    Goto,
    IfGoto,
    UnlessGoto,
    Return,
    Stop,
}

/// Which variable array an access targets, and the slot within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAccess {
    pub is_local: bool,
    pub index: u32,
}

/// Parameter of a jump opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// Index of a label-position record, compile time only.
    Slot(u32),
    /// Resolved opcode position.
    Pos(u32),
}

impl JumpTarget {
    /// The resolved position. Only valid after label patching.
    pub fn pos(self) -> u32 {
        match self {
            Self::Pos(pos) => pos,
            Self::Slot(slot) => panic!("unresolved jump target (label slot {slot})"),
        }
    }
}

/// One opcode with its payload.
///
/// Operator, built-in and user-function parameters are kept as raw ids; the
/// VM resolves them at dispatch so a corrupt image faults with the proper
/// runtime error category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Nul,
    PushNum(f64),
    PushStr(u32),
    PushVar(VarAccess),
    SetVar(VarAccess),
    SetVarAsArray(VarAccess),
    ArrGet(VarAccess),
    ArrSet(VarAccess),
    Pop,
    UnaryOp(u32),
    BinaryOp(u32),
    CallBuiltIn(u32),
    CallFunc(u32),
    Goto(JumpTarget),
    IfGoto(JumpTarget),
    UnlessGoto(JumpTarget),
    Return,
    Stop,
}

impl Op {
    pub fn id(&self) -> OpId {
        match self {
            Self::Nul => OpId::Nul,
            Self::PushNum(_) => OpId::PushNum,
            Self::PushStr(_) => OpId::PushStr,
            Self::PushVar(_) => OpId::PushVar,
            Self::SetVar(_) => OpId::SetVar,
            Self::SetVarAsArray(_) => OpId::SetVarAsArray,
            Self::ArrGet(_) => OpId::ArrGet,
            Self::ArrSet(_) => OpId::ArrSet,
            Self::Pop => OpId::Pop,
            Self::UnaryOp(_) => OpId::UnaryOp,
            Self::BinaryOp(_) => OpId::BinaryOp,
            Self::CallBuiltIn(_) => OpId::CallBuiltIn,
            Self::CallFunc(_) => OpId::CallFunc,
            Self::Goto(_) => OpId::Goto,
            Self::IfGoto(_) => OpId::IfGoto,
            Self::UnlessGoto(_) => OpId::UnlessGoto,
            Self::Return => OpId::Return,
            Self::Stop => OpId::Stop,
        }
    }

    /// Mnemonic used in diagnostics and runtime error reports.
    pub fn mnemonic(&self) -> &'static str {
        self.id().into()
    }
}
