//! Bytecode representation and the assembler that links it
//!
//! Assembly is done in two passes over the parsed lines. The first pass
//! walks the lines with a running word address and records where every
//! label, function and string constant lands. The second pass emits the
//! words, resolving name operands against the tables built by the first.
//!
//! Function names declared with `.func` form their own namespace, so a
//! function may share its name with a label, a constant or a mnemonic.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    encoding::{encode_instruction, pack_bytes, packed_len, Opcode, Word},
    error::AsmError,
    host::HostRoutine,
    lexer::Lexer,
    token::Token,
};

/// Name of the function execution starts in
pub static ENTRY_POINT: &str = "main";

/// A linked program
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Instructions and inlined constants, loaded verbatim into the code region
    pub words: Vec<Word>,
    /// Function table which maps function name to it's attributes
    pub fn_table: HashMap<String, Function>,
}

/// Function attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Name of the function
    pub name: String,
    /// Address of the first instruction of the function
    pub ptr: usize,
    /// Number of arguments the function pops on entry
    pub arity: usize,
}

impl Program {
    /// Address execution starts at: the entry function if there is one,
    /// otherwise the first word.
    pub fn entry(&self) -> usize {
        self.fn_table.get(ENTRY_POINT).map_or(0, |f| f.ptr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand<'a> {
    Literal(i32),
    Name(&'a str),
}

/// One statement of assembly text
#[derive(Debug, Clone, Copy, PartialEq)]
enum Line<'a> {
    Label(&'a str),
    Func { name: &'a str, arity: usize },
    /// String constant, escapes still encoded
    Bytes { name: &'a str, raw: &'a str },
    /// Zero-width constant standing for a 32-bit pattern
    Scalar { name: &'a str, bits: i32 },
    Op { op: Opcode, operand: Option<Operand<'a>> },
}

/// Parser and linker turning assembly text into a [`Program`]
pub struct Assembler<'a> {
    lexer: Lexer<'a>,
}

type SymbolTable<'a> = HashMap<&'a str, i32>;

impl<'a> Assembler<'a> {
    pub fn new(text: &'a str) -> Self {
        Assembler {
            lexer: Lexer::new(text),
        }
    }

    /// Parse and link the whole text
    pub fn assemble(mut self) -> Result<Program, AsmError> {
        let mut lines = Vec::new();
        while let Some(line) = self.parse_line()? {
            lines.push(line);
        }

        let (symbols, fn_table, size) = resolve_symbols(&lines)?;
        let words = emit(&lines, &symbols, &fn_table)?;
        debug_assert_eq!(words.len(), size);

        debug!(
            words = words.len(),
            functions = fn_table.len(),
            "assembled program"
        );
        Ok(Program { words, fn_table })
    }

    /// Parse the next non-empty line including its terminating newline.
    fn parse_line(&mut self) -> Result<Option<(usize, Line<'a>)>, AsmError> {
        let token = loop {
            match self.lexer.next_token()? {
                None => return Ok(None),
                Some(Token::Newline) => continue,
                Some(token) => break token,
            }
        };
        let line = self.lexer.line();

        let parsed = match token {
            Token::Instruction(op) => self.parse_op(line, op)?,
            Token::Name(name) => self.parse_definition(line, name)?,
            Token::Directive("func") => {
                let name = match self.lexer.next_name()? {
                    Some(Token::Name(name)) => name,
                    other => return Err(unexpected(line, "function name", other)),
                };
                let arity = match self.lexer.next_token()? {
                    Some(Token::Int(arity)) if arity >= 0 => arity as usize,
                    other => return Err(unexpected(line, "arity", other)),
                };
                self.expect_line_end(line)?;
                Line::Func { name, arity }
            }
            Token::Directive(name) => {
                return Err(AsmError::UnknownDirective {
                    line,
                    name: name.to_string(),
                })
            }
            token => return Err(unexpected(line, "instruction or label", Some(token))),
        };

        Ok(Some((line, parsed)))
    }

    /// `name:` on its own, or `name: <constant>`
    fn parse_definition(&mut self, line: usize, name: &'a str) -> Result<Line<'a>, AsmError> {
        match self.lexer.next_token()? {
            Some(Token::Colon) => {}
            other => return Err(unexpected(line, "':' after a label", other)),
        }

        let parsed = match self.lexer.next_token()? {
            None | Some(Token::Newline) => return Ok(Line::Label(name)),
            Some(Token::StringLiteral(raw)) => Line::Bytes { name, raw },
            Some(Token::Int(value)) => Line::Scalar {
                name,
                bits: to_immediate(line, value)?,
            },
            Some(Token::Float(value)) => Line::Scalar {
                name,
                bits: value.to_bits() as i32,
            },
            other => return Err(unexpected(line, "newline or constant", other)),
        };

        self.expect_line_end(line)?;
        Ok(parsed)
    }

    fn parse_op(&mut self, line: usize, op: Opcode) -> Result<Line<'a>, AsmError> {
        let next = self.lexer.next_token()?;

        if !op.takes_operand() {
            return match next {
                None | Some(Token::Newline) => Ok(Line::Op { op, operand: None }),
                Some(Token::Int(_) | Token::Float(_) | Token::Name(_)) => {
                    Err(AsmError::UnexpectedOperand {
                        line,
                        mnemonic: op.mnemonic(),
                    })
                }
                other => Err(unexpected(line, "newline", other)),
            };
        }

        let operand = match next {
            Some(Token::Int(value)) => Operand::Literal(to_immediate(line, value)?),
            Some(Token::Float(value)) => Operand::Literal(value.to_bits() as i32),
            Some(Token::Name(name)) => Operand::Name(name),
            None | Some(Token::Newline) => {
                return Err(AsmError::MissingOperand {
                    line,
                    mnemonic: op.mnemonic(),
                })
            }
            other => return Err(unexpected(line, "operand", other)),
        };

        self.expect_line_end(line)?;
        Ok(Line::Op {
            op,
            operand: Some(operand),
        })
    }

    // This instruction is finished so we expect a newline
    fn expect_line_end(&mut self, line: usize) -> Result<(), AsmError> {
        match self.lexer.next_token()? {
            None | Some(Token::Newline) => Ok(()),
            other => Err(unexpected(line, "newline", other)),
        }
    }
}

/// First pass: assign an address to every symbol.
fn resolve_symbols<'a>(
    lines: &[(usize, Line<'a>)],
) -> Result<(SymbolTable<'a>, HashMap<String, Function>, usize), AsmError> {
    let mut symbols = SymbolTable::new();
    let mut fn_table = HashMap::new();
    let mut addr = 0usize;

    for &(line, parsed) in lines {
        match parsed {
            Line::Label(name) => define(&mut symbols, line, name, addr as i64)?,
            Line::Func { name, arity } => {
                // Functions live apart from labels and constants
                if fn_table.contains_key(name) {
                    return Err(AsmError::DuplicateSymbol {
                        line,
                        name: name.to_string(),
                    });
                }
                to_immediate(line, addr as i64)?;
                fn_table.insert(
                    name.to_string(),
                    Function {
                        name: name.to_string(),
                        ptr: addr,
                        arity,
                    },
                );
            }
            Line::Bytes { name, raw } => {
                define(&mut symbols, line, name, addr as i64)?;
                addr += packed_len(unescape(raw).len());
            }
            Line::Scalar { name, bits } => define(&mut symbols, line, name, bits as i64)?,
            Line::Op { .. } => addr += 1,
        }
    }

    Ok((symbols, fn_table, addr))
}

fn define<'a>(
    symbols: &mut SymbolTable<'a>,
    line: usize,
    name: &'a str,
    value: i64,
) -> Result<(), AsmError> {
    if symbols.contains_key(name) {
        return Err(AsmError::DuplicateSymbol {
            line,
            name: name.to_string(),
        });
    }
    symbols.insert(name, to_immediate(line, value)?);
    Ok(())
}

/// Second pass: encode every instruction and constant.
/// Names resolve to a label or constant first, then to a function, then to
/// a host routine.
fn emit(
    lines: &[(usize, Line<'_>)],
    symbols: &SymbolTable<'_>,
    fn_table: &HashMap<String, Function>,
) -> Result<Vec<Word>, AsmError> {
    let mut words = Vec::with_capacity(lines.len());

    for &(line, parsed) in lines {
        match parsed {
            Line::Op { op, operand } => {
                let imm = match operand {
                    None => 0,
                    Some(Operand::Literal(value)) => value,
                    Some(Operand::Name(name)) => symbols
                        .get(name)
                        .copied()
                        .or_else(|| fn_table.get(name).map(|f| f.ptr as i32))
                        .or_else(|| HostRoutine::from_name(name).map(HostRoutine::index))
                        .ok_or_else(|| AsmError::Unresolved {
                            line,
                            name: name.to_string(),
                        })?,
                };
                words.push(encode_instruction(op, imm));
            }
            Line::Bytes { raw, .. } => words.extend(pack_bytes(&unescape(raw))),
            Line::Label(_) | Line::Func { .. } | Line::Scalar { .. } => {}
        }
    }

    Ok(words)
}

/// Decode the escapes of a string literal into bytes.
pub fn unescape(raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'v') => out.push(0x0b),
            Some(other) => out.extend([b'\\', other]),
            None => out.push(b'\\'),
        }
    }
    out
}

/// Encode bytes as the body of a string literal; inverse of [`unescape`].
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            ch => out.push(ch),
        }
    }
    out
}

fn to_immediate(line: usize, value: i64) -> Result<i32, AsmError> {
    i32::try_from(value).map_err(|_| AsmError::ImmediateOutOfRange { line, value })
}

fn unexpected(line: usize, expected: &'static str, found: Option<Token<'_>>) -> AsmError {
    AsmError::UnexpectedToken {
        line,
        expected,
        found: found.map_or_else(|| "end of input".to_string(), |t| t.describe()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode_instruction, unpack_byte};

    fn assemble(text: &str) -> Result<Program, AsmError> {
        Assembler::new(text).assemble()
    }

    #[test]
    fn forward_label() {
        let program = assemble("jump done\nload_int 1\ndone:\nend\n").unwrap();
        assert_eq!(program.words.len(), 3);
        assert_eq!(decode_instruction(program.words[0]).unwrap(), (Opcode::Jump, 2));
        assert_eq!(decode_instruction(program.words[2]).unwrap(), (Opcode::End, 0));
    }

    #[test]
    fn string_constant_sizing() {
        let text = "load_str msg\nload_str after\nend\nmsg: \"tab\\there\\n\"\nafter: \"x\"\n";
        let program = assemble(text).unwrap();

        // "tab\there\n" decodes to 9 bytes plus the terminator: two words
        assert_eq!(decode_instruction(program.words[0]).unwrap(), (Opcode::LoadStr, 3));
        assert_eq!(decode_instruction(program.words[1]).unwrap(), (Opcode::LoadStr, 5));
        assert_eq!(program.words.len(), 6);

        let msg = &program.words[3..5];
        let bytes: Vec<u8> = (0..9).map(|i| unpack_byte(msg, i).unwrap()).collect();
        assert_eq!(bytes, b"tab\there\n");
        assert_eq!(unpack_byte(msg, 9), Some(0));
    }

    #[test]
    fn scalar_constants() {
        let text = "load_int answer\nload_float half\nanswer: 42\nhalf: 0.5\n";
        let program = assemble(text).unwrap();
        assert_eq!(program.words.len(), 2);
        assert_eq!(decode_instruction(program.words[0]).unwrap(), (Opcode::LoadInt, 42));
        assert_eq!(
            decode_instruction(program.words[1]).unwrap(),
            (Opcode::LoadFloat, 0.5f32.to_bits() as i32)
        );
    }

    #[test]
    fn function_table_and_entry() {
        let text = "
            .func helper 2
            return
            .func main 0
            call helper
            end
        ";
        let program = assemble(text).unwrap();
        assert_eq!(
            program.fn_table["helper"],
            Function {
                name: "helper".to_string(),
                ptr: 0,
                arity: 2
            }
        );
        assert_eq!(program.entry(), 1);
        assert_eq!(decode_instruction(program.words[1]).unwrap(), (Opcode::Call, 0));
    }

    #[test]
    fn function_names_stand_apart() {
        let text = "
            .func add 2
            return
            .func k 0
            return
            .func main 0
            load_int k
            end
            k: 42
        ";
        let program = assemble(text).unwrap();
        assert_eq!(program.fn_table["add"].ptr, 0);
        assert_eq!(program.fn_table["k"].ptr, 1);
        // The constant wins over the function of the same name
        assert_eq!(decode_instruction(program.words[2]).unwrap(), (Opcode::LoadInt, 42));

        assert_eq!(
            assemble(".func f 0\nreturn\n.func f 1\nreturn\n").unwrap_err(),
            AsmError::DuplicateSymbol {
                line: 3,
                name: "f".to_string()
            }
        );
    }

    #[test]
    fn entry_defaults_to_zero() {
        let program = assemble("load_int 3\nload_int 4\nadd\nreturn").unwrap();
        assert_eq!(program.entry(), 0);
    }

    #[test]
    fn host_routine_names() {
        let program = assemble("call_ext printf\ncall_ext print\n").unwrap();
        assert_eq!(decode_instruction(program.words[0]).unwrap(), (Opcode::CallExt, 0));
        assert_eq!(decode_instruction(program.words[1]).unwrap(), (Opcode::CallExt, 1));
    }

    #[test]
    fn unresolved_name() {
        let err = assemble("load_int 1\njump nowhere\n").unwrap_err();
        assert_eq!(
            err,
            AsmError::Unresolved {
                line: 2,
                name: "nowhere".to_string()
            }
        );
    }

    #[test]
    fn duplicate_symbol() {
        let err = assemble("a:\nnoop\na:\n").unwrap_err();
        assert_eq!(
            err,
            AsmError::DuplicateSymbol {
                line: 3,
                name: "a".to_string()
            }
        );
    }

    #[test]
    fn operand_checks() {
        assert_eq!(
            assemble("load_int\n").unwrap_err(),
            AsmError::MissingOperand {
                line: 1,
                mnemonic: "load_int"
            }
        );
        assert_eq!(
            assemble("add 3\n").unwrap_err(),
            AsmError::UnexpectedOperand {
                line: 1,
                mnemonic: "add"
            }
        );
        assert_eq!(
            assemble("load_int 4294967296\n").unwrap_err(),
            AsmError::ImmediateOutOfRange {
                line: 1,
                value: 4294967296
            }
        );
        assert!(matches!(
            assemble("bogus 1\n").unwrap_err(),
            AsmError::UnexpectedToken { line: 1, .. }
        ));
        assert!(matches!(
            assemble(".data\n").unwrap_err(),
            AsmError::UnknownDirective { line: 1, .. }
        ));
    }

    #[test]
    fn escape_round_trip() {
        let text = "a \"quoted\"\tline\\\n\r\x0b";
        assert_eq!(unescape(&escape(text)), text.as_bytes());
    }
}
