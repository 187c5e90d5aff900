use super::token::Token;
use crate::error::AsmError;

pub struct Lexer<'a> {
    program: &'a str,
    cursor: usize,
    line: usize,
}

type LResult<'a> = Result<Option<Token<'a>>, AsmError>;

impl<'a> Lexer<'a> {
    pub fn new(program: &'a str) -> Self {
        Lexer {
            program,
            cursor: 0,
            line: 1,
        }
    }

    /// Line of the most recently returned token (1-based)
    pub fn line(&self) -> usize {
        self.line
    }

    /// Get the next token. This consumes the tokens.
    pub fn next_token(&mut self) -> LResult<'a> {
        self.trim();

        match self.next_char(false) {
            Some(b'"') => self.read_str_literal(),
            Some(b':') => Ok(Some(Token::Colon)),
            Some(b'\n') => {
                // The newline token still belongs to the line it ends
                let token = Ok(Some(Token::Newline));
                self.line += 1;
                token
            }
            Some(b'.') => self.read_directive(),
            Some(ch) => {
                if ch.is_ascii_digit() || ch == b'-' {
                    self.read_number()
                } else if ch.is_ascii_alphabetic() || ch == b'_' {
                    self.read_token()
                } else {
                    Err(AsmError::UnexpectedChar {
                        line: self.line,
                        ch: ch as char,
                    })
                }
            }

            None => Ok(None),
        }
    }

    /// Trim whitespaces, tabs, carriage returns, control chars and comments
    fn trim(&mut self) {
        while let Some(ch) = self.next_char(true) {
            if ch == b';' {
                while let Some(ch) = self.next_char(true) {
                    if ch == b'\n' {
                        break;
                    }
                    self.cursor += 1;
                }
                continue;
            }
            if ch != b'\t' && ch != b'\r' && ch != b'\x0C' && ch != b' ' {
                break;
            }
            self.cursor += 1;
        }
    }

    /// Read a decimal integer or float, optionally negative
    fn read_number(&mut self) -> LResult<'a> {
        let start_pos = self.cursor - 1;
        let mut is_float = false;
        while let Some(ch) = self.next_char(true) {
            if ch == b'.' || ch == b'e' || ch == b'E' {
                is_float = true;
            } else if (ch == b'-' || ch == b'+')
                && matches!(self.program.as_bytes()[self.cursor - 1], b'e' | b'E')
            {
                // exponent sign
            } else if !ch.is_ascii_digit() {
                break;
            }
            self.cursor += 1;
        }

        let text = &self.program[start_pos..self.cursor];
        let bad_number = || AsmError::BadNumber {
            line: self.line,
            text: text.to_string(),
        };

        if is_float {
            let number = text.parse::<f32>().map_err(|_| bad_number())?;
            Ok(Some(Token::Float(number)))
        } else {
            let number = text.parse::<i64>().map_err(|_| bad_number())?;
            Ok(Some(Token::Int(number)))
        }
    }

    /// Read a string literal that starts and ends with '"'.
    /// Escapes are kept as written and decoded by the assembler.
    fn read_str_literal(&mut self) -> LResult<'a> {
        let start_pos = self.cursor;
        let mut escaped = false;
        while let Some(ch) = self.next_char(false) {
            if ch == b'\n' {
                // Strings cannot continue from next line
                break;
            } else if escaped {
                escaped = false;
            } else if ch == b'\\' {
                escaped = true;
            } else if ch == b'"' {
                return Ok(Some(Token::StringLiteral(
                    &self.program[start_pos..self.cursor - 1],
                )));
            }
        }

        Err(AsmError::UnterminatedString { line: self.line })
    }

    /// Read a directive name following '.'
    fn read_directive(&mut self) -> LResult<'a> {
        match self.read_token()? {
            Some(Token::Name(name)) => Ok(Some(Token::Directive(name))),
            Some(token) => Err(AsmError::UnexpectedToken {
                line: self.line,
                expected: "directive name",
                found: token.describe(),
            }),
            None => Err(AsmError::UnexpectedToken {
                line: self.line,
                expected: "directive name",
                found: "end of input".to_string(),
            }),
        }
    }

    /// Read any other token
    fn read_token(&mut self) -> LResult<'a> {
        let start_pos = if self.program.as_bytes()[self.cursor - 1] == b'.' {
            self.cursor
        } else {
            self.cursor - 1
        };
        while let Some(ch) = self.next_char(true) {
            // Only alphanumberic characters and '_'
            if !ch.is_ascii_alphanumeric() && ch != b'_' {
                break;
            }
            self.cursor += 1;
        }

        if start_pos == self.cursor {
            return Ok(None);
        }

        Ok(Some(Token::new(&self.program[start_pos..self.cursor])))
    }

    /// Like `next_token`, but a word that spells a mnemonic comes back as a
    /// plain name.
    pub fn next_name(&mut self) -> LResult<'a> {
        self.trim();
        let start_pos = self.cursor;
        match self.next_token()? {
            Some(Token::Instruction(_)) => {
                Ok(Some(Token::Name(&self.program[start_pos..self.cursor])))
            }
            other => Ok(other),
        }
    }

    /// Get the next char and increase the cursor if `peek` is false
    fn next_char(&mut self, peek: bool) -> Option<u8> {
        if let Some(ch) = self.program.as_bytes().get(self.cursor) {
            if !peek {
                self.cursor += 1;
            }
            Some(*ch)
        } else {
            None
        }
    }
}
