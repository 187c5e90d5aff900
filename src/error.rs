//! Error classes of the toolchain
//!
//! Each stage has its own error type: the code generator reports
//! [`GenError`], the assembler reports [`AsmError`] and the virtual machine
//! aborts with a [`Fault`]. None of them is recoverable from inside a
//! running program.

use thiserror::Error;

use crate::encoding::Tag;

/// Errors raised while lowering the AST into assembly text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenError {
    #[error("undefined local '{name}' in function '{function}'")]
    UndefinedLocal { function: String, name: String },

    #[error("malformed call target in function '{function}'")]
    MalformedCallTarget { function: String },

    #[error("function '{callee}' takes {expected} argument(s), got {found}")]
    ArityMismatch {
        callee: String,
        expected: usize,
        found: usize,
    },

    #[error("function '{function}' needs more than {limit} local slots")]
    TooManyLocals { function: String, limit: usize },

    #[error("entry function '{function}' cannot take parameters")]
    EntryTakesParameters { function: String },
}

/// Errors raised while turning assembly text into a linked program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("line {line}: string literal is not finished properly")]
    UnterminatedString { line: usize },

    #[error("line {line}: invalid number '{text}'")]
    BadNumber { line: usize, text: String },

    #[error("line {line}: unexpected character '{ch}'")]
    UnexpectedChar { line: usize, ch: char },

    #[error("line {line}: unknown directive '.{name}'")]
    UnknownDirective { line: usize, name: String },

    #[error("line {line}: expected {expected}, got {found}")]
    UnexpectedToken {
        line: usize,
        expected: &'static str,
        found: String,
    },

    #[error("line {line}: '{mnemonic}' expects an operand")]
    MissingOperand { line: usize, mnemonic: &'static str },

    #[error("line {line}: '{mnemonic}' takes no operand")]
    UnexpectedOperand { line: usize, mnemonic: &'static str },

    #[error("line {line}: value {value} does not fit in an immediate")]
    ImmediateOutOfRange { line: usize, value: i64 },

    #[error("line {line}: '{name}' is already defined")]
    DuplicateSymbol { line: usize, name: String },

    #[error("line {line}: unresolved name '{name}'")]
    Unresolved { line: usize, name: String },
}

/// Fatal runtime faults. A fault stops the machine immediately.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("operand stack overflow")]
    OperandStackOverflow,

    #[error("operand stack underflow")]
    OperandStackUnderflow,

    #[error("call stack overflow")]
    CallStackOverflow,

    #[error("call stack underflow")]
    CallStackUnderflow,

    #[error("{op}: expected {expected}, got {found:?}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: Tag,
    },

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown value tag {0}")]
    UnknownTag(u32),

    #[error("{op}: address {addr:#x} is outside the permitted region")]
    InvalidAddress { op: &'static str, addr: usize },

    #[error("call target {0:#x} is outside the code region")]
    InvalidCallTarget(usize),

    #[error("local slot {0} does not exist")]
    InvalidSlot(i32),

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i32, len: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("heap exhausted: cannot allocate {0} word(s)")]
    HeapExhausted(usize),

    #[error("address {0:#x} is not a live heap block")]
    InvalidFree(usize),

    #[error("unknown host routine {0}")]
    UnknownHostRoutine(i32),

    #[error("'{0}' is reserved and not supported by this machine")]
    Unsupported(&'static str),

    #[error("output failed: {0}")]
    Output(String),

    #[error("program has already ended")]
    Halted,
}
