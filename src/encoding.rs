//! Word-level encoding of values and instructions
//!
//! Every cell of the address space is one [`Word`]. A tagged value keeps its
//! [`Tag`] in the high 32 bits and its payload in the low 32 bits. An
//! instruction keeps its [`Opcode`] in the top 8 bits and a signed 32-bit
//! immediate in the low 32 bits.

use std::fmt;

use crate::error::Fault;

/// One cell of the address space
pub type Word = u64;

/// Bytes packed into one word by inlined string constants
pub const WORD_BYTES: usize = 8;

const OPCODE_SHIFT: u32 = 56;

/// Runtime type of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Tag {
    Nil = 0,
    Int = 1,
    Float = 2,
    Str = 3,
    Pointer = 4,
    Function = 5,
    List = 6,
    Tuple = 7,
    Map = 8,
}

impl Tag {
    pub fn from_u32(raw: u32) -> Result<Self, Fault> {
        Ok(match raw {
            0 => Tag::Nil,
            1 => Tag::Int,
            2 => Tag::Float,
            3 => Tag::Str,
            4 => Tag::Pointer,
            5 => Tag::Function,
            6 => Tag::List,
            7 => Tag::Tuple,
            8 => Tag::Map,
            other => return Err(Fault::UnknownTag(other)),
        })
    }

    /// Int and Float take part in arithmetic
    pub fn is_numeric(self) -> bool {
        matches!(self, Tag::Int | Tag::Float)
    }

    /// Values whose payload is a heap block that they own
    pub fn is_composite(self) -> bool {
        matches!(self, Tag::List | Tag::Tuple | Tag::Map)
    }
}

/// Pack a tag and a payload into a word.
pub fn encode_value(tag: Tag, payload: u32) -> Word {
    (tag as Word) << 32 | payload as Word
}

/// Split a word into its tag and payload.
pub fn decode_value(word: Word) -> Result<(Tag, u32), Fault> {
    Ok((Tag::from_u32((word >> 32) as u32)?, word as u32))
}

/// A decoded tagged value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub tag: Tag,
    pub payload: u32,
}

impl Value {
    pub const NIL: Value = Value {
        tag: Tag::Nil,
        payload: 0,
    };

    pub fn new(tag: Tag, payload: u32) -> Self {
        Value { tag, payload }
    }

    pub fn int(v: i32) -> Self {
        Value::new(Tag::Int, v as u32)
    }

    pub fn float(v: f32) -> Self {
        Value::new(Tag::Float, v.to_bits())
    }

    /// Address-carrying value (string, pointer, function, list, ...)
    pub fn addr_of(tag: Tag, addr: usize) -> Self {
        Value::new(tag, addr as u32)
    }

    pub fn encode(self) -> Word {
        encode_value(self.tag, self.payload)
    }

    pub fn decode(word: Word) -> Result<Self, Fault> {
        let (tag, payload) = decode_value(word)?;
        Ok(Value { tag, payload })
    }

    pub fn as_int(self) -> i32 {
        self.payload as i32
    }

    pub fn as_float(self) -> f32 {
        f32::from_bits(self.payload)
    }

    pub fn addr(self) -> usize {
        self.payload as usize
    }

    /// Numeric payload widened to a float, for mixed arithmetic
    pub fn to_f32(self) -> f32 {
        match self.tag {
            Tag::Float => self.as_float(),
            _ => self.as_int() as f32,
        }
    }

    /// Payload as an Int, or a type fault naming `op`.
    pub fn expect_int(self, op: &'static str) -> Result<i32, Fault> {
        self.expect(Tag::Int, op, "int").map(|v| v.as_int())
    }

    pub fn expect(
        self,
        tag: Tag,
        op: &'static str,
        expected: &'static str,
    ) -> Result<Self, Fault> {
        if self.tag == tag {
            Ok(self)
        } else {
            Err(Fault::TypeMismatch {
                op,
                expected,
                found: self.tag,
            })
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            Tag::Nil => write!(f, "nil"),
            Tag::Int => write!(f, "{}", self.as_int()),
            Tag::Float => write!(f, "{}", self.as_float()),
            Tag::Str => write!(f, "str@{:#x}", self.payload),
            Tag::Pointer => write!(f, "ptr@{:#x}", self.payload),
            Tag::Function => write!(f, "fn@{:#x}", self.payload),
            Tag::List => write!(f, "list@{:#x}", self.payload),
            Tag::Tuple => write!(f, "tuple@{:#x}", self.payload),
            Tag::Map => write!(f, "map@{:#x}", self.payload),
        }
    }
}

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $name:ident = $code:literal, $mnemonic:literal, $operand:ident; )*) => {
        /// Operation codes understood by the virtual machine
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$doc])* $name = $code, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            /// Whether the mnemonic must be followed by an operand
            pub fn takes_operand(self) -> bool {
                match self {
                    $(Opcode::$name => opcodes!(@operand $operand),)*
                }
            }

            pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
                match mnemonic {
                    $($mnemonic => Some(Opcode::$name),)*
                    "load_ptr" => Some(Opcode::LoadStr),
                    _ => None,
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = Fault;

            fn try_from(byte: u8) -> Result<Self, Fault> {
                match byte {
                    $($code => Ok(Opcode::$name),)*
                    other => Err(Fault::UnknownOpcode(other)),
                }
            }
        }
    };
    (@operand imm) => { true };
    (@operand none) => { false };
}

opcodes! {
    Noop = 0x00, "noop", none;
    /// Push the immediate as an Int
    LoadInt = 0x01, "load_int", imm;
    /// Push the immediate's bit pattern as a Float
    LoadFloat = 0x02, "load_float", imm;
    /// Push a String pointing at an inlined constant
    LoadStr = 0x03, "load_str", imm;
    /// Push a copy of a local slot
    LoadVar = 0x04, "load_var", imm;
    /// Push a Pointer to a local slot
    LoadVarAddr = 0x05, "load_var_addr", imm;
    /// Pop a Pointer, push a copy of its pointee
    LoadMem = 0x06, "load_mem", none;
    StoreVar = 0x07, "store_var", imm;
    /// Pop a value, then a Pointer, and store through it
    StoreMem = 0x08, "store_mem", none;
    Call = 0x09, "call", imm;
    CallExt = 0x0a, "call_ext", imm;
    Pop = 0x0b, "pop", none;
    Return = 0x0c, "return", none;
    IfJump = 0x0d, "ifjump", imm;
    IfNJump = 0x0e, "ifnjump", imm;
    Jump = 0x0f, "jump", imm;
    Not = 0x10, "not", none;
    And = 0x11, "and", none;
    Or = 0x12, "or", none;
    Usub = 0x13, "usub", none;
    Mul = 0x14, "mul", none;
    Div = 0x15, "div", none;
    Mod = 0x16, "mod", none;
    Add = 0x17, "add", none;
    Sub = 0x18, "sub", none;
    Lteq = 0x19, "lteq", none;
    Lt = 0x1a, "lt", none;
    Gt = 0x1b, "gt", none;
    Gteq = 0x1c, "gteq", none;
    Eq = 0x1d, "eq", none;
    Neq = 0x1e, "neq", none;
    /// Pop an Int and add it to a local slot
    Inc = 0x1f, "inc", imm;
    ListCreate = 0x20, "list_create", imm;
    ListAccessPtr = 0x21, "list_access_ptr", none;
    ListAccess = 0x22, "list_access", none;
    ListLength = 0x23, "list_length", none;
    TupleCreate = 0x24, "tuple_create", imm;
    TupleAccessPtr = 0x25, "tuple_access_ptr", none;
    TupleAccess = 0x26, "tuple_access", none;
    ClosureCreate = 0x27, "closure_create", imm;
    ClosureCall = 0x28, "closure_call", none;
    MapCreate = 0x29, "map_create", none;
    MapAdd = 0x2a, "map_add", none;
    MapAccessPtr = 0x2b, "map_access_ptr", none;
    MapAccess = 0x2c, "map_access", none;
    /// Stop the machine
    End = 0x2d, "end", none;
}

/// Pack an opcode and its immediate into an instruction word.
pub fn encode_instruction(op: Opcode, imm: i32) -> Word {
    (op as Word) << OPCODE_SHIFT | imm as u32 as Word
}

/// Split an instruction word into its opcode and sign-extended immediate.
pub fn decode_instruction(word: Word) -> Result<(Opcode, i32), Fault> {
    let op = Opcode::try_from((word >> OPCODE_SHIFT) as u8)?;
    Ok((op, word as u32 as i32))
}

/// Number of words an inlined string of `byte_len` bytes occupies,
/// including its terminating zero byte.
pub fn packed_len(byte_len: usize) -> usize {
    (byte_len + 1).div_ceil(WORD_BYTES)
}

/// Pack bytes little-endian into words, terminated by a zero byte.
pub fn pack_bytes(bytes: &[u8]) -> Vec<Word> {
    let mut words = vec![0; packed_len(bytes.len())];
    for (i, &b) in bytes.iter().enumerate() {
        words[i / WORD_BYTES] |= (b as Word) << (8 * (i % WORD_BYTES));
    }
    words
}

/// Byte `index` of a packed string starting at `words[0]`.
pub fn unpack_byte(words: &[Word], index: usize) -> Option<u8> {
    words
        .get(index / WORD_BYTES)
        .map(|w| (w >> (8 * (index % WORD_BYTES))) as u8)
}
