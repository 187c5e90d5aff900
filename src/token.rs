use crate::encoding::Opcode;

/// Tokens of the assembly text
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'a> {
    Instruction(Opcode),
    /// `.name`, e.g. `.func`
    Directive(&'a str),

    Newline,
    Colon,

    /// Contents between double quotes, escapes still encoded
    StringLiteral(&'a str),
    Name(&'a str),

    Int(i64),
    Float(f32),
}

impl<'a> Token<'a> {
    /// Classify a bare word: mnemonics are reserved, anything else is a name.
    pub fn new(token_str: &'a str) -> Self {
        match Opcode::from_mnemonic(token_str) {
            Some(op) => Token::Instruction(op),
            None => Token::Name(token_str),
        }
    }

    /// Short description used in error messages
    pub fn describe(&self) -> String {
        match self {
            Token::Instruction(op) => format!("instruction '{}'", op.mnemonic()),
            Token::Directive(name) => format!("directive '.{}'", name),
            Token::Newline => "newline".to_string(),
            Token::Colon => "':'".to_string(),
            Token::StringLiteral(s) => format!("string \"{}\"", s),
            Token::Name(name) => format!("name '{}'", name),
            Token::Int(v) => format!("integer {}", v),
            Token::Float(v) => format!("float {}", v),
        }
    }
}
