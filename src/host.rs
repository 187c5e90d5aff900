//! Registry of host routines reachable through `call_ext`
//!
//! A routine is identified by its index in this table. The assembler
//! resolves a routine's name to that index, so `call_ext printf` and
//! `call_ext 0` are the same instruction.
//!
//! Stack contract: a routine consumes its arguments from the operand stack
//! and always leaves exactly one result behind.

/// Host routines known to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRoutine {
    /// Pops a format String, then one value per `%d`, `%i`, `%f` or `%g`.
    /// Pushes the number of bytes written as an Int.
    Printf = 0,
    /// Pops one value of any type and prints it followed by a newline.
    /// Pushes Nil.
    Print = 1,
}

impl HostRoutine {
    pub const ALL: [HostRoutine; 2] = [HostRoutine::Printf, HostRoutine::Print];

    pub fn name(self) -> &'static str {
        match self {
            HostRoutine::Printf => "printf",
            HostRoutine::Print => "print",
        }
    }

    pub fn index(self) -> i32 {
        self as i32
    }

    pub fn from_index(index: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.index() == index)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}
