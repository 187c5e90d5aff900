//! Tagged-value stack machine with its assembler and code generator.
//!
//! A [`codegen::Codegen`] lowers an [`ast::Module`] to assembly text, the
//! [`bytecode::Assembler`] links that text into a [`bytecode::Program`], and a
//! [`vm::Vm`] executes the program.
//!
//! # Example
//!
//! ```text
//! .func main 0
//!     load_int 5
//!     call fact
//!     store_var 0
//!     load_var 0
//!     load_str fmt
//!     call_ext printf
//!     pop
//!     end
//!
//! .func fact 1
//!     store_var 0
//!     load_int 1
//!     load_var 0
//!     lteq
//!     ifnjump recurse
//!     load_int 1
//!     return
//! recurse:
//!     load_int 1
//!     load_var 0
//!     sub
//!     call fact
//!     load_var 0
//!     mul
//!     return
//!
//! fmt: "5! = %d\n"
//! ```
//!
//! # Values
//!
//! Every word of memory is 64 bits wide. A value keeps its tag in the high
//! half and its payload in the low half; the all-zero word is `Nil`.
//!
//! | Tag      | Payload |
//! |----------|---------|
//! | Nil      | unused |
//! | Int      | 32-bit two's complement integer |
//! | Float    | IEEE-754 single precision bits |
//! | Str      | address of a zero-terminated constant in the code region |
//! | Pointer  | address of a frame slot or heap word |
//! | Function | code address (reserved) |
//! | List     | address of a heap block `[len, e0, e1, ...]` |
//! | Tuple    | same layout as List |
//! | Map      | reserved |
//!
//! An instruction word keeps its opcode in the top 8 bits and a signed
//! 32-bit immediate in the low half.
//!
//! # Instructions
//!
//! Binary operators pop their left operand first.
//!
//! | Instruction       | Usage               | Brief   |
//! |-------------------|---------------------|---------|
//! | Noop              | `noop`              | Do nothing. |
//! | LoadInt           | `load_int n`        | Push Int `n`. |
//! | LoadFloat         | `load_float x`      | Push the Float whose bits are the immediate. |
//! | LoadStr           | `load_str label`    | Push a Str pointing at a string constant. `load_ptr` is an alias. |
//! | LoadVar           | `load_var k`        | Push a copy of local slot `k`. |
//! | LoadVarAddr       | `load_var_addr k`   | Push a Pointer to local slot `k`. |
//! | LoadMem           | `load_mem`          | Pop a Pointer, push a copy of its target. |
//! | StoreVar          | `store_var k`       | Pop a value into local slot `k`, releasing the old one. |
//! | StoreMem          | `store_mem`         | Pop a value, then a Pointer, and store through it. |
//! | Call              | `call label`        | Push a frame and jump to `label`. |
//! | CallExt           | `call_ext routine`  | Run a host routine. |
//! | Pop               | `pop`               | Discard and release the top value. |
//! | Return            | `return`            | Release the current frame and resume the caller. |
//! | IfJump            | `ifjump label`      | Pop an Int, jump if it is non-zero. |
//! | IfNJump           | `ifnjump label`     | Pop an Int, jump if it is zero. |
//! | Jump              | `jump label`        | Jump to `label`. |
//! | Not, And, Or      | `not`, `and`, `or`  | Logic on Ints, pushes 0 or 1. |
//! | Usub              | `usub`              | Negate an Int or Float. |
//! | Mul, Div, Mod, Add, Sub | `add` ...     | Arithmetic. Int with Int gives Int, any Float gives Float. `mod` is Int only. `add` also concatenates or appends to Lists. |
//! | Lteq, Lt, Gt, Gteq, Eq, Neq | `lt` ...  | Compare two numbers, pushes 0 or 1. |
//! | Inc               | `inc k`             | Pop an Int and add it to local slot `k`. |
//! | ListCreate        | `list_create n`     | Pop `n` values into a new List. The top value becomes element 0. |
//! | ListAccessPtr     | `list_access_ptr`   | Pop an index and a List (or Pointer to one), push a Pointer to the element. |
//! | ListAccess        | `list_access`       | Pop an index and a List (or Pointer to one), push the element. |
//! | ListLength        | `list_length`       | Pop a List (or Pointer to one), push its length. |
//! | TupleCreate, TupleAccessPtr, TupleAccess | `tuple_create n` ... | List operations on Tuples. |
//! | End               | `end`               | Halt the machine. |
//!
//! Closure and map mnemonics are reserved: they assemble, and fault when
//! executed.
//!
//! # Built-in functions
//!
//! Host routines are called by name or index with `call_ext` and always
//! leave one value on the stack.
//!
//! ## printf (0)
//! ### Parameters
//! - _format_: Str. `%d` and `%i` print an Int, `%f` and `%g` a Float, `%%` prints `%`.
//! - One number per conversion, in order.
//! ### Return
//! Number of bytes written as an Int.
//!
//! ## print (1)
//! ### Parameters
//! - _value_: Any value. Lists print as `[a, b]`.
//! ### Return
//! Nil.
//!
//! # Memory
//!
//! The address space is laid out as code, call frames, return addresses,
//! operand stack and heap. Sizes other than the code come from
//! [`config::VmConfig`].

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod config;
pub mod encoding;
pub mod error;
pub mod heap;
pub mod host;
mod lexer;
pub mod token;
pub mod vm;

use bytecode::{Assembler, Program};
use error::{AsmError, GenError};

/// Link assembly text into a program.
pub fn assemble(text: &str) -> Result<Program, AsmError> {
    Assembler::new(text).assemble()
}

/// Lower a module to assembly text with the default configuration.
pub fn generate(module: &ast::Module) -> Result<String, GenError> {
    codegen::Codegen::new(module).generate()
}

/// Lower and link a module.
pub fn compile(module: &ast::Module) -> anyhow::Result<Program> {
    let text = generate(module)?;
    Ok(assemble(&text)?)
}
