//! Assembly language parser and instruction-stream compiler.
//!
//! Converts mnemonic source into the fixed-width word stream the machine
//! loads. Assembly is two-pass: a discovery pass records every label's
//! program counter (accounting for string-literal expansion) and assigns
//! variable indices, then an emission pass parses each instruction's
//! operands against its [`Shape`](crate::isa::Shape) and encodes the words.
//! Forward label references are legal because of the discovery pass.
//!
//! # Syntax
//!
//! ```text
//! @start:
//! mov %eax 10       ; load a constant ;
//! prt %eax
//! jmp @start
//! ```
//!
//! - Instructions are lowercase mnemonics, operands whitespace-separated
//! - `%name` is a register from the fixed register table
//! - `@name` declares (with a trailing `:`) or references a label
//! - `#name` is a variable slot, assigned first-use-wins at assemble time
//! - `'c'` is a character literal, `"..."` a string literal (escapes:
//!   `\n \r \t \0 \' \" \\`)
//! - `;...;` is a comment
//!
//! A string literal after `psh` lowers to a terminator push followed by one
//! push-immediate per character in reverse order, so popping at run time
//! yields the characters in order, then zero.
//!
//! Several units can be assembled into one output; labels in later units
//! see a program-counter baseline carried over from every earlier unit.

use crate::errors::VmError;
use crate::isa::{self, Opcode, Operands, Shape, IMM_MAX, TARGET_MAX};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;

const COMMENT_DELIM: char = ';';
const LABEL_SUFFIX: char = ':';
const REGISTER_SIGIL: char = '%';
const LABEL_SIGIL: char = '@';
const VARIABLE_SIGIL: char = '#';

/// Default number of `#name` slots one session may assign.
///
/// Matches the machine's default variable region, so indices emitted here
/// are valid there without further coordination.
pub const VARIABLE_CAPACITY: usize = 256;

/// Recoverable assembly diagnostic: a reference to a label that was never
/// declared. The reference resolves to address 0 and assembly continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Unit (file name) containing the reference.
    pub unit: String,
    /// 1-based source line of the reference.
    pub line: usize,
    /// The undeclared label name.
    pub label: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: undeclared label `@{}` resolved to address 0",
            self.unit, self.line, self.label
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Mnemonic(Opcode),
    LabelDecl(String),
    LabelRef(String),
    VarRef(String),
    Register(u8),
    Int(u32),
    Str(String),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Mnemonic(op) => format!("instruction `{}`", op.mnemonic()),
            TokenKind::LabelDecl(l) => format!("label `{l}:`"),
            TokenKind::LabelRef(l) => format!("label reference `@{l}`"),
            TokenKind::VarRef(v) => format!("variable reference `#{v}`"),
            TokenKind::Register(r) => format!("register `%{}`", isa::register_name(*r)),
            TokenKind::Int(v) => format!("integer `{v}`"),
            TokenKind::Str(_) => "string literal".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    /// 1-based source line, for diagnostics.
    line: usize,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, VmError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Skips whitespace and comments with a plain loop.
    fn skip_insignificant(&mut self) -> Result<(), VmError> {
        loop {
            match self.chars.peek() {
                Some('\n') => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some(&COMMENT_DELIM) => {
                    let start = self.line;
                    self.chars.next();
                    loop {
                        match self.chars.next() {
                            Some(COMMENT_DELIM) => break,
                            Some('\n') => self.line += 1,
                            Some(_) => {}
                            None => {
                                return Err(VmError::UnterminatedComment.at_line(start));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, VmError> {
        self.skip_insignificant()?;
        let line = self.line;

        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };

        let kind = match c {
            REGISTER_SIGIL => {
                self.chars.next();
                let name = self.ident(line)?;
                let index = isa::register_index(&name)
                    .ok_or(VmError::UnknownRegister { name })
                    .map_err(|e| e.at_line(line))?;
                TokenKind::Register(index)
            }
            LABEL_SIGIL => {
                self.chars.next();
                let name = self.ident(line)?;
                if self.chars.peek() == Some(&LABEL_SUFFIX) {
                    self.chars.next();
                    TokenKind::LabelDecl(name)
                } else {
                    TokenKind::LabelRef(name)
                }
            }
            VARIABLE_SIGIL => {
                self.chars.next();
                TokenKind::VarRef(self.ident(line)?)
            }
            '"' => {
                self.chars.next();
                TokenKind::Str(self.string_literal(line)?)
            }
            '\'' => {
                self.chars.next();
                TokenKind::Int(self.char_literal(line)?)
            }
            c if c.is_ascii_digit() => {
                let value = self.number(line)?;
                TokenKind::Int(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let name = self.ident(line)?;
                if self.chars.peek() == Some(&LABEL_SUFFIX) {
                    self.chars.next();
                    TokenKind::LabelDecl(name)
                } else {
                    let op = Opcode::from_mnemonic(&name)
                        .ok_or(VmError::UnknownInstruction { name })
                        .map_err(|e| e.at_line(line))?;
                    TokenKind::Mnemonic(op)
                }
            }
            other => {
                return Err(VmError::UnexpectedToken {
                    expected: "instruction, label, or operand",
                    found: format!("`{other}`"),
                }
                .at_line(line));
            }
        };

        Ok(Some(Token { kind, line }))
    }

    fn ident(&mut self, line: usize) -> Result<String, VmError> {
        let mut name = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(VmError::UnexpectedToken {
                expected: "name",
                found: match self.chars.peek() {
                    Some(c) => format!("`{c}`"),
                    None => "end of input".to_string(),
                },
            }
            .at_line(line));
        }
        Ok(name)
    }

    fn number(&mut self, line: usize) -> Result<u32, VmError> {
        let mut digits = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        let value: u64 = digits.parse().map_err(|_| {
            VmError::ImmediateOutOfRange {
                value: u64::MAX,
                max: TARGET_MAX as u64,
            }
            .at_line(line)
        })?;
        if value > TARGET_MAX as u64 {
            return Err(VmError::ImmediateOutOfRange {
                value,
                max: TARGET_MAX as u64,
            }
            .at_line(line));
        }
        Ok(value as u32)
    }

    fn escape(&mut self, line: usize) -> Result<char, VmError> {
        match self.chars.next() {
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('t') => Ok('\t'),
            Some('0') => Ok('\0'),
            Some('\'') => Ok('\''),
            Some('"') => Ok('"'),
            Some('\\') => Ok('\\'),
            Some(other) => Err(VmError::InvalidEscape { escape: other }.at_line(line)),
            None => Err(VmError::UnterminatedString.at_line(line)),
        }
    }

    fn string_literal(&mut self, line: usize) -> Result<String, VmError> {
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(text),
                Some('\\') => text.push(self.escape(line)?),
                Some('\n') => {
                    self.line += 1;
                    text.push('\n');
                }
                Some(c) => text.push(c),
                None => return Err(VmError::UnterminatedString.at_line(line)),
            }
        }
    }

    fn char_literal(&mut self, line: usize) -> Result<u32, VmError> {
        let value = match self.chars.next() {
            Some('\\') => self.escape(line)?,
            Some(c) => c,
            None => return Err(VmError::UnterminatedChar.at_line(line)),
        };
        match self.chars.next() {
            Some('\'') => Ok(value as u32),
            _ => Err(VmError::UnterminatedChar.at_line(line)),
        }
    }
}

struct Unit {
    name: String,
    tokens: Vec<Token>,
}

/// Result of one assembly session.
#[derive(Debug)]
pub struct Assembled {
    /// The encoded instruction stream.
    pub words: Vec<u32>,
    /// Recoverable diagnostics collected during emission.
    pub warnings: Vec<Warning>,
    /// Label table, sorted by address. Diagnostic output only.
    pub symbols: Vec<(String, u32)>,
    /// Variable names in index order. Diagnostic output only.
    pub variables: Vec<String>,
}

/// One assembly session.
///
/// Units added with [`add_unit`](Assembler::add_unit) share a symbol table
/// and a relocation counter, so a later unit's labels already account for
/// every word emitted by earlier units. The session's tables are dropped
/// with it; nothing is process-global.
pub struct Assembler {
    symbols: HashMap<String, u32>,
    variables: Vec<String>,
    variable_capacity: usize,
    units: Vec<Unit>,
    reloc: u32,
}

impl Assembler {
    /// Creates an empty session with the default variable capacity.
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            variables: Vec::new(),
            variable_capacity: VARIABLE_CAPACITY,
            units: Vec::new(),
            reloc: 0,
        }
    }

    /// Tokenizes a unit and runs the discovery pass over it.
    ///
    /// Labels are recorded at program counters that account for one word per
    /// instruction plus one word per character of any string literal, and
    /// for every word of every previously added unit.
    pub fn add_unit(&mut self, name: &str, source: &str) -> Result<(), VmError> {
        let tokens = Lexer::new(source).tokenize()?;

        let mut pc = self.reloc;
        for token in &tokens {
            match &token.kind {
                TokenKind::LabelDecl(label) => {
                    if self.symbols.contains_key(label) {
                        return Err(VmError::DuplicateLabel {
                            label: label.clone(),
                        }
                        .at_line(token.line));
                    }
                    self.symbols.insert(label.clone(), pc);
                }
                TokenKind::Mnemonic(_) => pc += 1,
                TokenKind::Str(s) => pc += s.chars().count() as u32,
                TokenKind::VarRef(name) => {
                    self.resolve_variable(name)
                        .map_err(|e| e.at_line(token.line))?;
                }
                _ => {}
            }
            if pc > TARGET_MAX {
                return Err(VmError::ProgramTooLarge {
                    words: pc as usize,
                    limit: TARGET_MAX as usize,
                }
                .at_line(token.line));
            }
        }
        self.reloc = pc;

        self.units.push(Unit {
            name: name.to_string(),
            tokens,
        });
        Ok(())
    }

    /// Reads a source file and adds it as a unit.
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), VmError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| VmError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.add_unit(&path.display().to_string(), &source)
    }

    /// Runs the emission pass over every unit, in the order they were added.
    pub fn assemble(mut self) -> Result<Assembled, VmError> {
        let mut words = Vec::with_capacity(self.reloc as usize);
        let mut warnings = Vec::new();

        let units = std::mem::take(&mut self.units);
        for unit in &units {
            self.emit_unit(unit, &mut words, &mut warnings)?;
        }
        debug_assert_eq!(words.len(), self.reloc as usize);

        let mut symbols: Vec<(String, u32)> = self.symbols.into_iter().collect();
        symbols.sort_by_key(|&(_, pc)| pc);

        Ok(Assembled {
            words,
            warnings,
            symbols,
            variables: self.variables,
        })
    }

    fn resolve_variable(&mut self, name: &str) -> Result<u32, VmError> {
        if let Some(index) = self.variables.iter().position(|v| v == name) {
            return Ok(index as u32);
        }
        if self.variables.len() >= self.variable_capacity {
            return Err(VmError::VariableTableFull {
                capacity: self.variable_capacity,
            });
        }
        self.variables.push(name.to_string());
        Ok((self.variables.len() - 1) as u32)
    }

    fn emit_unit(
        &mut self,
        unit: &Unit,
        words: &mut Vec<u32>,
        warnings: &mut Vec<Warning>,
    ) -> Result<(), VmError> {
        let mut tokens = unit.tokens.iter().peekable();
        while let Some(token) = tokens.next() {
            match &token.kind {
                TokenKind::LabelDecl(_) => {}
                TokenKind::Mnemonic(op) => {
                    self.emit_instruction(*op, token.line, &mut tokens, unit, words, warnings)?;
                }
                other => {
                    return Err(VmError::UnexpectedToken {
                        expected: "instruction or label",
                        found: other.describe(),
                    }
                    .at_line(token.line));
                }
            }
        }
        Ok(())
    }

    fn emit_instruction<'t>(
        &mut self,
        op: Opcode,
        line: usize,
        tokens: &mut Peekable<impl Iterator<Item = &'t Token>>,
        unit: &Unit,
        words: &mut Vec<u32>,
        warnings: &mut Vec<Warning>,
    ) -> Result<(), VmError> {
        // `psh "..."` lowers to a terminator push plus one push-immediate
        // per character, reversed, so pops yield the string forward.
        if op == Opcode::Psh {
            if let Some(Token {
                kind: TokenKind::Str(text),
                line: str_line,
            }) = tokens.peek()
            {
                let text = text.clone();
                let line = *str_line;
                tokens.next();

                words.push(isa::encode(Opcode::Psi, &Operands::RegImm { r: 0, imm: 0 })?);
                for ch in text.chars().rev() {
                    let code = ch as u32;
                    if code > IMM_MAX {
                        return Err(VmError::ImmediateOutOfRange {
                            value: code as u64,
                            max: IMM_MAX as u64,
                        }
                        .at_line(line));
                    }
                    words.push(isa::encode(
                        Opcode::Psi,
                        &Operands::RegImm { r: 0, imm: code },
                    )?);
                }
                return Ok(());
            }
        }

        let operands = if op == Opcode::Psi {
            // Push-immediate takes a single operand; the register field is
            // unused and encoded as zero.
            let imm = self.operand_immediate(line, tokens, unit, IMM_MAX, warnings)?;
            Operands::RegImm { r: 0, imm }
        } else {
            match op.shape() {
                Shape::Reg => Operands::Reg {
                    r: self.operand_register(line, tokens)?,
                },
                Shape::RegImm => {
                    let r = self.operand_register(line, tokens)?;
                    let imm = self.operand_immediate(line, tokens, unit, IMM_MAX, warnings)?;
                    Operands::RegImm { r, imm }
                }
                Shape::TwoReg => {
                    let a = self.operand_register(line, tokens)?;
                    let b = self.operand_register(line, tokens)?;
                    Operands::TwoReg { a, b }
                }
                Shape::ThreeReg => {
                    let a = self.operand_register(line, tokens)?;
                    let b = self.operand_register(line, tokens)?;
                    let c = self.operand_register(line, tokens)?;
                    Operands::ThreeReg { a, b, c }
                }
                Shape::FourReg => {
                    let a = self.operand_register(line, tokens)?;
                    let b = self.operand_register(line, tokens)?;
                    let c = self.operand_register(line, tokens)?;
                    let d = self.operand_register(line, tokens)?;
                    Operands::FourReg { a, b, c, d }
                }
                Shape::LongImm => Operands::LongImm {
                    target: self.operand_immediate(line, tokens, unit, TARGET_MAX, warnings)?,
                },
            }
        };

        words.push(isa::encode(op, &operands).map_err(|e| e.at_line(line))?);
        Ok(())
    }

    fn operand_register<'t>(
        &mut self,
        line: usize,
        tokens: &mut Peekable<impl Iterator<Item = &'t Token>>,
    ) -> Result<u8, VmError> {
        match tokens.next() {
            Some(Token {
                kind: TokenKind::Register(r),
                ..
            }) => Ok(*r),
            Some(token) => Err(VmError::UnexpectedToken {
                expected: "register",
                found: token.kind.describe(),
            }
            .at_line(token.line)),
            None => Err(VmError::UnexpectedToken {
                expected: "register",
                found: "end of input".to_string(),
            }
            .at_line(line)),
        }
    }

    /// Reads an immediate operand: an integer literal, a variable reference
    /// (its assigned index), or a label reference (its program counter).
    ///
    /// A reference to an undeclared label degrades to address 0 with a
    /// recorded warning rather than aborting.
    fn operand_immediate<'t>(
        &mut self,
        line: usize,
        tokens: &mut Peekable<impl Iterator<Item = &'t Token>>,
        unit: &Unit,
        max: u32,
        warnings: &mut Vec<Warning>,
    ) -> Result<u32, VmError> {
        let (value, line) = match tokens.next() {
            Some(Token {
                kind: TokenKind::Int(v),
                line,
            }) => (*v, *line),
            Some(Token {
                kind: TokenKind::VarRef(name),
                line,
            }) => {
                let index = self
                    .resolve_variable(name)
                    .map_err(|e| e.at_line(*line))?;
                (index, *line)
            }
            Some(Token {
                kind: TokenKind::LabelRef(name),
                line,
            }) => {
                let pc = match self.symbols.get(name) {
                    Some(&pc) => pc,
                    None => {
                        warnings.push(Warning {
                            unit: unit.name.clone(),
                            line: *line,
                            label: name.clone(),
                        });
                        0
                    }
                };
                (pc, *line)
            }
            Some(token) => {
                return Err(VmError::UnexpectedToken {
                    expected: "integer, label, or variable reference",
                    found: token.kind.describe(),
                }
                .at_line(token.line));
            }
            None => {
                return Err(VmError::UnexpectedToken {
                    expected: "integer, label, or variable reference",
                    found: "end of input".to_string(),
                }
                .at_line(line));
            }
        };

        if value > max {
            return Err(VmError::ImmediateOutOfRange {
                value: value as u64,
                max: max as u64,
            }
            .at_line(line));
        }
        Ok(value)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles a single in-memory unit.
pub fn assemble_source(source: &str) -> Result<Assembled, VmError> {
    let mut assembler = Assembler::new();
    assembler.add_unit("<source>", source)?;
    assembler.assemble()
}

/// Assembles several source files into one instruction stream, in argument
/// order, with a shared symbol table and carried relocation counter.
pub fn assemble_files<P: AsRef<Path>>(inputs: &[P]) -> Result<Assembled, VmError> {
    let mut assembler = Assembler::new();
    for input in inputs {
        assembler.add_file(input)?;
    }
    assembler.assemble()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::decode;

    fn words(source: &str) -> Vec<u32> {
        assemble_source(source).expect("assembly failed").words
    }

    #[test]
    fn assemble_empty_source() {
        assert!(words("").is_empty());
        assert!(words("  \n\t \n").is_empty());
    }

    #[test]
    fn assemble_comments_only() {
        assert!(words("; a comment ;\n; another\nspanning lines ;").is_empty());
    }

    #[test]
    fn assemble_single_instruction() {
        let words = words("mov %eax 10");
        assert_eq!(words, vec![0x0110_000A]);
    }

    #[test]
    fn assemble_end_to_end_sequence() {
        let words = words("mov %eax 10\nprt %eax\nhlt %eax");
        assert_eq!(words.len(), 3);
        let ops: Vec<Opcode> = words.iter().map(|&w| decode(w).unwrap().0).collect();
        assert_eq!(ops, vec![Opcode::Mov, Opcode::Prt, Opcode::Halt]);
    }

    #[test]
    fn whitespace_and_newlines_are_insignificant() {
        assert_eq!(
            words("mov %eax 10 prt %eax hlt %eax"),
            words("mov %eax 10\n  prt %eax\n\thlt %eax\n")
        );
    }

    #[test]
    fn inline_comment_between_operands() {
        let words = words("mov ; destination ; %ebx ; value ; 7");
        assert_eq!(
            decode(words[0]).unwrap(),
            (Opcode::Mov, Operands::RegImm { r: 2, imm: 7 })
        );
    }

    #[test]
    fn unknown_instruction_is_line_qualified() {
        let err = assemble_source("mov %eax 1\nbogus %eax").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 2, ref source }
                if matches!(**source, VmError::UnknownInstruction { ref name } if name == "bogus")
        ));
    }

    #[test]
    fn unknown_register_is_an_error() {
        let err = assemble_source("mov %rax 1").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 1, ref source }
                if matches!(**source, VmError::UnknownRegister { ref name } if name == "rax")
        ));
    }

    #[test]
    fn wrong_operand_type_is_an_error() {
        let err = assemble_source("mov 10 %eax").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 1, ref source }
                if matches!(**source, VmError::UnexpectedToken { expected: "register", .. })
        ));

        let err = assemble_source("add %eax %ebx 3").unwrap_err();
        assert!(matches!(err, VmError::AssemblyError { .. }));
    }

    #[test]
    fn missing_operand_is_an_error() {
        let err = assemble_source("add %eax %ebx").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 1, ref source }
                if matches!(**source, VmError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = assemble_source("psh \"abc").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 1, ref source }
                if matches!(**source, VmError::UnterminatedString)
        ));
    }

    #[test]
    fn unterminated_comment_is_an_error() {
        let err = assemble_source("mov %eax 1 ; runs off the end").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { ref source, .. }
                if matches!(**source, VmError::UnterminatedComment)
        ));
    }

    #[test]
    fn immediate_range_is_checked() {
        // 20-bit operand position
        let err = assemble_source("mov %eax 1048576").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { ref source, .. }
                if matches!(**source, VmError::ImmediateOutOfRange { value: 1048576, .. })
        ));
        // within range
        assert_eq!(
            decode(words("mov %eax 1048575")[0]).unwrap(),
            (
                Opcode::Mov,
                Operands::RegImm {
                    r: 1,
                    imm: 1048575
                }
            )
        );
    }

    #[test]
    fn char_literals_are_integers() {
        assert_eq!(words("mov %eax 'A'"), words("mov %eax 65"));
        assert_eq!(words("mov %eax '\\n'"), words("mov %eax 10"));
        assert_eq!(words("mov %eax '\\0'"), words("mov %eax 0"));
        assert_eq!(words("mov %eax '\\\\'"), words("mov %eax 92"));
    }

    #[test]
    fn invalid_escape_is_an_error() {
        let err = assemble_source("mov %eax '\\q'").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { ref source, .. }
                if matches!(**source, VmError::InvalidEscape { escape: 'q' })
        ));
    }

    #[test]
    fn string_lowering_reverses_characters() {
        let words = words("psh \"AB\"");
        assert_eq!(words.len(), 3);
        assert_eq!(
            decode(words[0]).unwrap(),
            (Opcode::Psi, Operands::RegImm { r: 0, imm: 0 })
        );
        assert_eq!(
            decode(words[1]).unwrap(),
            (Opcode::Psi, Operands::RegImm { r: 0, imm: 'B' as u32 })
        );
        assert_eq!(
            decode(words[2]).unwrap(),
            (Opcode::Psi, Operands::RegImm { r: 0, imm: 'A' as u32 })
        );
    }

    #[test]
    fn string_escapes_lower_to_their_codes() {
        let words = words("psh \"a\\n\"");
        assert_eq!(words.len(), 3);
        assert_eq!(
            decode(words[1]).unwrap(),
            (Opcode::Psi, Operands::RegImm { r: 0, imm: 10 })
        );
    }

    #[test]
    fn backward_label_resolves() {
        let words = words("@start:\nmov %eax 1\njmp @start");
        assert_eq!(
            decode(words[1]).unwrap(),
            (Opcode::Jmp, Operands::LongImm { target: 0 })
        );
    }

    #[test]
    fn forward_label_resolves() {
        let words = words("jmp @end\nmov %eax 1\n@end:\nhlt %eax");
        assert_eq!(
            decode(words[0]).unwrap(),
            (Opcode::Jmp, Operands::LongImm { target: 2 })
        );
    }

    #[test]
    fn labels_account_for_string_expansion() {
        // psh "AB" occupies 3 words, so @after sits at pc 4.
        let out = assemble_source("mov %eax 1\npsh \"AB\"\n@after:\nhlt %eax\njmp @after")
            .unwrap();
        assert_eq!(out.symbols, vec![("after".to_string(), 4)]);
        assert_eq!(
            decode(out.words[5]).unwrap(),
            (Opcode::Jmp, Operands::LongImm { target: 4 })
        );
    }

    #[test]
    fn conditional_jump_takes_label_in_immediate_position() {
        let words = words("@loop:\njnz %eax @loop\nhlt %zero");
        assert_eq!(
            decode(words[0]).unwrap(),
            (Opcode::Jnz, Operands::RegImm { r: 1, imm: 0 })
        );
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let err = assemble_source("@dup:\nmov %eax 1\n@dup:\nmov %eax 2").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 3, ref source }
                if matches!(**source, VmError::DuplicateLabel { ref label } if label == "dup")
        ));
    }

    #[test]
    fn undeclared_label_warns_and_resolves_to_zero() {
        let out = assemble_source("jmp @missing\nhlt %zero").unwrap();
        assert_eq!(
            decode(out.words[0]).unwrap(),
            (Opcode::Jmp, Operands::LongImm { target: 0 })
        );
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].label, "missing");
        assert_eq!(out.warnings[0].line, 1);
    }

    #[test]
    fn variable_indices_are_idempotent() {
        let out = assemble_source(
            "mov %eax 1\nset %eax #counter\nget %ebx #counter\nset %ebx #other",
        )
        .unwrap();
        assert_eq!(out.variables, vec!["counter", "other"]);
        assert_eq!(
            decode(out.words[1]).unwrap(),
            (Opcode::Set, Operands::RegImm { r: 1, imm: 0 })
        );
        assert_eq!(
            decode(out.words[2]).unwrap(),
            (Opcode::Get, Operands::RegImm { r: 2, imm: 0 })
        );
        assert_eq!(
            decode(out.words[3]).unwrap(),
            (Opcode::Set, Operands::RegImm { r: 2, imm: 1 })
        );
    }

    #[test]
    fn push_immediate_takes_one_operand() {
        let words = words("psi 42");
        assert_eq!(
            decode(words[0]).unwrap(),
            (Opcode::Psi, Operands::RegImm { r: 0, imm: 42 })
        );
    }

    #[test]
    fn four_register_shape_parses() {
        let words = words("cal %et0 %eax %ebx %ecx");
        assert_eq!(
            decode(words[0]).unwrap(),
            (
                Opcode::Cal,
                Operands::FourReg {
                    a: 12,
                    b: 1,
                    c: 2,
                    d: 3
                }
            )
        );
    }

    #[test]
    fn stray_operand_token_is_an_error() {
        let err = assemble_source("mov %eax 1\n7").unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { line: 2, ref source }
                if matches!(**source, VmError::UnexpectedToken { expected: "instruction or label", .. })
        ));
    }

    #[test]
    fn multi_unit_relocation_carries_across_units() {
        let mut asm = Assembler::new();
        asm.add_unit("first", "mov %eax 1\nmov %ebx 2\njmp @entry").unwrap();
        asm.add_unit("second", "@entry:\nhlt %eax").unwrap();
        let out = asm.assemble().unwrap();

        assert_eq!(out.words.len(), 4);
        assert_eq!(out.symbols, vec![("entry".to_string(), 3)]);
        assert_eq!(
            decode(out.words[2]).unwrap(),
            (Opcode::Jmp, Operands::LongImm { target: 3 })
        );
        assert_eq!(
            decode(out.words[3]).unwrap(),
            (Opcode::Halt, Operands::Reg { r: 1 })
        );
    }

    #[test]
    fn multi_unit_shares_variable_table() {
        let mut asm = Assembler::new();
        asm.add_unit("first", "set %eax #shared").unwrap();
        asm.add_unit("second", "get %ebx #shared\nset %ecx #own").unwrap();
        let out = asm.assemble().unwrap();
        assert_eq!(out.variables, vec!["shared", "own"]);
        assert_eq!(
            decode(out.words[1]).unwrap(),
            (Opcode::Get, Operands::RegImm { r: 2, imm: 0 })
        );
    }

    #[test]
    fn variable_capacity_is_enforced() {
        let mut source = String::new();
        for i in 0..=VARIABLE_CAPACITY {
            source.push_str(&format!("set %eax #v{i}\n"));
        }
        let err = assemble_source(&source).unwrap_err();
        assert!(matches!(
            err,
            VmError::AssemblyError { ref source, .. }
                if matches!(**source, VmError::VariableTableFull { capacity: VARIABLE_CAPACITY })
        ));
    }
}
