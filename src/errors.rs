//! Assembly and execution error types.
//!
//! One flat enum covers the whole toolchain so CLI callers and embedding
//! hosts can match on the exact failure: assembly errors carry the source
//! line, runtime faults carry the program counter of the faulting
//! instruction, and wire/file problems carry the offending path or token.

use thiserror::Error;

/// Errors that can occur during assembly, loading, or execution.
#[derive(Debug, Error)]
pub enum VmError {
    // ---- assembly ----
    /// Unrecognized instruction mnemonic.
    #[error("unknown instruction `{name}`")]
    UnknownInstruction { name: String },
    /// Register name not in the fixed register table.
    #[error("unknown register `%{name}`")]
    UnknownRegister { name: String },
    /// Operand token of the wrong type for the current shape position.
    #[error("expected {expected}, got {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
    },
    /// String literal without a closing quote.
    #[error("unterminated string literal")]
    UnterminatedString,
    /// Character literal without a closing quote.
    #[error("unterminated character literal")]
    UnterminatedChar,
    /// Comment without a closing `;`.
    #[error("unterminated comment")]
    UnterminatedComment,
    /// Unsupported backslash escape in a string or character literal.
    #[error("invalid escape sequence `\\{escape}`")]
    InvalidEscape { escape: char },
    /// Numeric operand too large for the field it must be encoded into.
    #[error("immediate {value} exceeds the operand maximum {max}")]
    ImmediateOutOfRange { value: u64, max: u64 },
    /// Label declared at two different program counters.
    #[error("duplicate label `{label}`")]
    DuplicateLabel { label: String },
    /// Variable table has no free slot for a new `#name`.
    #[error("variable table full ({capacity} slots)")]
    VariableTableFull { capacity: usize },
    /// Assembled output would exceed the addressable program space.
    #[error("program too large ({words} words, limit {limit})")]
    ProgramTooLarge { words: usize, limit: usize },
    /// Assembly failure with source line context.
    #[error("line {line}: {source}")]
    AssemblyError { line: usize, source: Box<VmError> },

    // ---- encoding ----
    /// Operands do not match the opcode's shape.
    #[error("operand shape mismatch for `{mnemonic}` (expected {expected})")]
    ShapeMismatch {
        mnemonic: &'static str,
        expected: &'static str,
    },
    /// Register index exceeds the register file.
    #[error("register index {index} out of range")]
    RegisterOutOfRange { index: u8 },

    // ---- wire format / io ----
    /// File I/O failure.
    #[error("{path}: {reason}")]
    Io { path: String, reason: String },
    /// Wire-format token that is not exactly eight hex digits.
    #[error("malformed program word `{token}`: expected exactly 8 hex digits")]
    FormatError { token: String },

    // ---- runtime faults ----
    /// Unknown opcode fetched from the instruction stream.
    #[error("invalid instruction {opcode:#04x} at pc {pc}")]
    InvalidInstruction { opcode: u8, pc: usize },
    /// No program loaded into the machine.
    #[error("no program loaded")]
    NoProgram,
    /// Program counter left the loaded program.
    #[error("program counter {pc} outside the program ({len} words)")]
    PcOutOfRange { pc: usize, len: usize },
    /// Operand stack exceeded its configured depth.
    #[error("stack overflow at pc {pc} (limit {limit})")]
    StackOverflow { pc: usize, limit: usize },
    /// Pop from an empty operand stack.
    #[error("stack underflow at pc {pc}")]
    StackUnderflow { pc: usize },
    /// Integer division by zero.
    #[error("division by zero at pc {pc}")]
    DivisionByZero { pc: usize },
    /// Variable index outside the configured variable region.
    #[error("variable index {index} out of range at pc {pc} ({capacity} slots)")]
    VariableOutOfRange {
        pc: usize,
        index: usize,
        capacity: usize,
    },
    /// Arena address outside the configured memory region.
    #[error("memory address {address} out of range at pc {pc} ({cells} cells)")]
    MemoryOutOfRange { pc: usize, address: i64, cells: usize },
    /// Jump-history table exceeded its configured depth.
    #[error("jump history full at pc {pc} (depth {depth})")]
    JumpHistoryFull { pc: usize, depth: usize },
    /// `ret` target has no recorded jump to return through.
    #[error("return without a recorded jump to {target} at pc {pc}")]
    ReturnWithoutJump { pc: usize, target: usize },
    /// `cal` id with no bound host function.
    #[error("no host function bound at id {id} (pc {pc})")]
    UnboundHostFunction { pc: usize, id: i64 },
    /// Failure raised by a host binding.
    #[error("host function fault: {reason}")]
    HostFault { reason: String },
    /// Host allocator could not satisfy a request.
    #[error("arena exhausted: no room for {cells} more cells")]
    ArenaExhausted { cells: usize },
}

impl VmError {
    /// Wraps an error with the source line it was produced on.
    ///
    /// Already line-qualified errors pass through unchanged so nested
    /// contexts do not stack prefixes.
    pub fn at_line(self, line: usize) -> VmError {
        match self {
            VmError::AssemblyError { .. } => self,
            other => VmError::AssemblyError {
                line,
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_error_displays_line() {
        let err = VmError::UnknownInstruction {
            name: "frobnicate".into(),
        }
        .at_line(12);
        assert_eq!(
            err.to_string(),
            "line 12: unknown instruction `frobnicate`"
        );
    }

    #[test]
    fn at_line_does_not_nest() {
        let err = VmError::UnterminatedString.at_line(3).at_line(9);
        assert_eq!(err.to_string(), "line 3: unterminated string literal");
    }

    #[test]
    fn fault_displays_pc() {
        let err = VmError::DivisionByZero { pc: 7 };
        assert_eq!(err.to_string(), "division by zero at pc 7");
    }
}
