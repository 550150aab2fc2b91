//! Instruction set definition and word encoding.
//!
//! Defines the machine's instruction set. The [`for_each_opcode!`](crate::for_each_opcode)
//! macro holds the canonical opcode table and invokes a callback macro for
//! code generation, so the opcode enum, the mnemonic lookup, and the shape
//! table are all generated from a single definition list. See
//! [`assembler`](crate::assembler) for the parsing side.
//!
//! # Word Format
//!
//! Every instruction is one 32-bit word, fields packed MSB-first:
//!
//! - Opcode: bits 31..24
//! - Register operands: four 4-bit fields at bits 23..20, 19..16, 15..12, 11..8
//! - Short immediate: bits 19..0 (shares the word with one register field)
//! - Long immediate: bits 23..0 (absolute jump/return targets only)
//!
//! Which fields a given opcode carries is decided by its [`Shape`], never
//! per instruction. Encoding validates operand ranges; decoding a word
//! produced by [`encode`] always yields the exact operands that went in.

use crate::errors::VmError;

/// Mask for the opcode field.
pub const OPCODE_MASK: u32 = 0xFF00_0000;
/// Mask for the first register field.
pub const REG1_MASK: u32 = 0x00F0_0000;
/// Mask for the second register field.
pub const REG2_MASK: u32 = 0x000F_0000;
/// Mask for the third register field.
pub const REG3_MASK: u32 = 0x0000_F000;
/// Mask for the fourth register field.
pub const REG4_MASK: u32 = 0x0000_0F00;
/// Mask for the 20-bit short immediate.
pub const IMM_MASK: u32 = 0x000F_FFFF;
/// Mask for the 24-bit long immediate.
pub const TARGET_MASK: u32 = 0x00FF_FFFF;

/// Largest value a short immediate can carry.
pub const IMM_MAX: u32 = IMM_MASK;
/// Largest value a long immediate (jump target) can carry.
pub const TARGET_MAX: u32 = TARGET_MASK;

/// Number of general-purpose registers.
pub const NUM_REGS: usize = 16;
/// Index of the hardwired zero register.
pub const REG_ZERO: u8 = 0;
/// Index of the stack-length register, refreshed every cycle.
pub const REG_ESL: u8 = 15;

/// Hex digits per instruction word in the persisted wire format.
pub const WORD_HEX_DIGITS: usize = 8;

/// Fixed register name table consumed by the assembler's `%name` tokens.
pub const REGISTER_NAMES: [&str; NUM_REGS] = [
    "zero", "eax", "ebx", "ecx", "edx", "eex", "efx", "egx", "ehx", "esi", "edi", "ebp", "et0",
    "et1", "et2", "esl",
];

/// Resolves a register name to its index.
pub fn register_index(name: &str) -> Option<u8> {
    REGISTER_NAMES.iter().position(|&n| n == name).map(|i| i as u8)
}

/// Returns the name of a register index (index is masked to 4 bits).
pub fn register_name(index: u8) -> &'static str {
    REGISTER_NAMES[(index as usize) & (NUM_REGS - 1)]
}

/// Operand arrangement of an opcode.
///
/// Field extraction in both the assembler and the machine is driven by this
/// table, never hand-written per instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Shape {
    /// One register operand.
    Reg,
    /// One register plus a 20-bit immediate.
    RegImm,
    /// Two register operands.
    TwoReg,
    /// Three register operands.
    ThreeReg,
    /// Four register operands.
    FourReg,
    /// A 24-bit immediate, reserved for absolute jump/return targets.
    LongImm,
}

impl Shape {
    /// Human-readable operand list for diagnostics.
    pub const fn describe(&self) -> &'static str {
        match self {
            Shape::Reg => "register",
            Shape::RegImm => "register, immediate",
            Shape::TwoReg => "register, register",
            Shape::ThreeReg => "register, register, register",
            Shape::FourReg => "register, register, register, register",
            Shape::LongImm => "target address",
        }
    }
}

/// Invokes a callback macro with the complete opcode definition list.
///
/// Entries are `Name = code, "mnemonic", Shape`. This enables code
/// generation in multiple modules without duplicating the table.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            /// hlt %r ; stop execution, program result = %r
            Halt = 0x00, "hlt", Reg,
            /// mov %r imm ; r = imm
            Mov = 0x01, "mov", RegImm,
            /// add %a %b %c ; a = b + c
            Add = 0x02, "add", ThreeReg,
            /// sub %a %b %c ; a = b - c
            Sub = 0x03, "sub", ThreeReg,
            /// mul %a %b %c ; a = b * c
            Mul = 0x04, "mul", ThreeReg,
            /// div %a %b %c ; a = b / c, faults on zero divisor
            Div = 0x05, "div", ThreeReg,
            /// neg %r ; r = -r
            Neg = 0x06, "neg", Reg,
            /// prt %r ; print r as a decimal integer
            Prt = 0x07, "prt", Reg,
            /// ptc %r ; print the low byte of r as a character
            Ptc = 0x08, "ptc", Reg,
            /// jmp @target ; unconditional jump, recorded in the history
            Jmp = 0x09, "jmp", LongImm,
            /// jnz %r @target ; jump if r != 0
            Jnz = 0x0A, "jnz", RegImm,
            /// jz %r @target ; jump if r == 0
            Jz = 0x0B, "jz", RegImm,
            /// jne @target ; jump if cmp1 != cmp2
            Jne = 0x0C, "jne", LongImm,
            /// je @target ; jump if cmp1 == cmp2
            Je = 0x0D, "je", LongImm,
            /// jgt @target ; jump if cmp1 > cmp2
            Jgt = 0x0E, "jgt", LongImm,
            /// jlt @target ; jump if cmp1 < cmp2
            Jlt = 0x0F, "jlt", LongImm,
            /// jge @target ; jump if cmp1 >= cmp2
            Jge = 0x10, "jge", LongImm,
            /// jle @target ; jump if cmp1 <= cmp2
            Jle = 0x11, "jle", LongImm,
            /// cmp %a %b ; latch cmp1 = a, cmp2 = b
            Cmp = 0x12, "cmp", TwoReg,
            /// ret @target ; resume after the most recent jump to target
            Ret = 0x13, "ret", LongImm,
            /// mvr %a %b ; a = b
            Mvr = 0x14, "mvr", TwoReg,
            /// cal %id %a %b %c ; invoke host binding regs[id], a..c are its operand registers
            Cal = 0x15, "cal", FourReg,
            /// psh %r ; push r on the operand stack
            Psh = 0x16, "psh", Reg,
            /// pop %r ; pop the operand stack into r
            Pop = 0x17, "pop", Reg,
            /// set %r #var ; variable[var] = r
            Set = 0x18, "set", RegImm,
            /// get %r #var ; r = variable[var]
            Get = 0x19, "get", RegImm,
            /// gta %r #var ; r = arena address of variable[var]
            Gta = 0x1A, "gta", RegImm,
            /// drf %a %b ; a = arena[b]
            Drf = 0x1B, "drf", TwoReg,
            /// pok %a %b ; arena[a] = b
            Pok = 0x1C, "pok", TwoReg,
            /// shl %a %b ; a = a << b
            Shl = 0x1D, "shl", TwoReg,
            /// shr %a %b ; a = a >> b (arithmetic)
            Shr = 0x1E, "shr", TwoReg,
            /// msk %a %b ; a = a & b
            Msk = 0x1F, "msk", TwoReg,
            /// psi imm ; push an immediate on the operand stack
            Psi = 0x20, "psi", RegImm,
        }
    };
}

macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $code:literal, $mnemonic:literal, $shape:ident
        ),* $(,)?
    ) => {
        /// One opcode of the instruction set.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $code,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $code => Ok(Opcode::$name), )*
                    _ => Err(VmError::InvalidInstruction {
                        opcode: value,
                        pc: 0,
                    }),
                }
            }
        }

        impl Opcode {
            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Returns the operand shape for this opcode.
            pub const fn shape(&self) -> Shape {
                match self {
                    $( Opcode::$name => Shape::$shape, )*
                }
            }

            /// Resolves a mnemonic to its opcode.
            pub fn from_mnemonic(name: &str) -> Option<Opcode> {
                match name {
                    $( $mnemonic => Some(Opcode::$name), )*
                    _ => None,
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

/// Decoded operand fields of one instruction word, one variant per [`Shape`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operands {
    Reg { r: u8 },
    RegImm { r: u8, imm: u32 },
    TwoReg { a: u8, b: u8 },
    ThreeReg { a: u8, b: u8, c: u8 },
    FourReg { a: u8, b: u8, c: u8, d: u8 },
    LongImm { target: u32 },
}

impl Operands {
    /// Returns the shape these operands belong to.
    pub const fn shape(&self) -> Shape {
        match self {
            Operands::Reg { .. } => Shape::Reg,
            Operands::RegImm { .. } => Shape::RegImm,
            Operands::TwoReg { .. } => Shape::TwoReg,
            Operands::ThreeReg { .. } => Shape::ThreeReg,
            Operands::FourReg { .. } => Shape::FourReg,
            Operands::LongImm { .. } => Shape::LongImm,
        }
    }
}

fn check_reg(r: u8) -> Result<u32, VmError> {
    if (r as usize) < NUM_REGS {
        Ok(r as u32)
    } else {
        Err(VmError::RegisterOutOfRange { index: r })
    }
}

fn check_imm(value: u32, max: u32) -> Result<u32, VmError> {
    if value <= max {
        Ok(value)
    } else {
        Err(VmError::ImmediateOutOfRange {
            value: value as u64,
            max: max as u64,
        })
    }
}

/// Encodes an instruction word.
///
/// The operands must match the opcode's shape and every field must fit its
/// width; out-of-range values are an error, never silently truncated.
pub fn encode(op: Opcode, operands: &Operands) -> Result<u32, VmError> {
    if operands.shape() != op.shape() {
        return Err(VmError::ShapeMismatch {
            mnemonic: op.mnemonic(),
            expected: op.shape().describe(),
        });
    }

    let head = (op as u32) << 24;
    let word = match *operands {
        Operands::Reg { r } => head | check_reg(r)? << 20,
        Operands::RegImm { r, imm } => head | check_reg(r)? << 20 | check_imm(imm, IMM_MAX)?,
        Operands::TwoReg { a, b } => head | check_reg(a)? << 20 | check_reg(b)? << 16,
        Operands::ThreeReg { a, b, c } => {
            head | check_reg(a)? << 20 | check_reg(b)? << 16 | check_reg(c)? << 12
        }
        Operands::FourReg { a, b, c, d } => {
            head | check_reg(a)? << 20 | check_reg(b)? << 16 | check_reg(c)? << 12
                | check_reg(d)? << 8
        }
        Operands::LongImm { target } => head | check_imm(target, TARGET_MAX)?,
    };
    Ok(word)
}

/// Decodes an instruction word into its opcode and shape-prescribed operands.
pub fn decode(word: u32) -> Result<(Opcode, Operands), VmError> {
    let op = Opcode::try_from(((word & OPCODE_MASK) >> 24) as u8)?;
    let r1 = ((word & REG1_MASK) >> 20) as u8;
    let r2 = ((word & REG2_MASK) >> 16) as u8;
    let r3 = ((word & REG3_MASK) >> 12) as u8;
    let r4 = ((word & REG4_MASK) >> 8) as u8;

    let operands = match op.shape() {
        Shape::Reg => Operands::Reg { r: r1 },
        Shape::RegImm => Operands::RegImm {
            r: r1,
            imm: word & IMM_MASK,
        },
        Shape::TwoReg => Operands::TwoReg { a: r1, b: r2 },
        Shape::ThreeReg => Operands::ThreeReg { a: r1, b: r2, c: r3 },
        Shape::FourReg => Operands::FourReg {
            a: r1,
            b: r2,
            c: r3,
            d: r4,
        },
        Shape::LongImm => Operands::LongImm {
            target: word & TARGET_MASK,
        },
    };
    Ok((op, operands))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_try_from_invalid() {
        assert!(matches!(
            Opcode::try_from(0xFF),
            Err(VmError::InvalidInstruction { opcode: 0xFF, .. })
        ));
        assert!(matches!(
            Opcode::try_from(0x21),
            Err(VmError::InvalidInstruction { opcode: 0x21, .. })
        ));
    }

    #[test]
    fn opcode_mnemonic_roundtrip() {
        for code in 0x00..=0x20u8 {
            let op = Opcode::try_from(code).unwrap();
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
        }
        assert_eq!(Opcode::from_mnemonic("nop"), None);
    }

    #[test]
    fn register_table_lookup() {
        assert_eq!(register_index("zero"), Some(0));
        assert_eq!(register_index("eax"), Some(1));
        assert_eq!(register_index("esl"), Some(15));
        assert_eq!(register_index("rax"), None);
        assert_eq!(register_name(11), "ebp");
    }

    #[test]
    fn encode_reg_shape() {
        let word = encode(Opcode::Halt, &Operands::Reg { r: 3 }).unwrap();
        assert_eq!(word, 0x0030_0000);
        assert_eq!(decode(word).unwrap(), (Opcode::Halt, Operands::Reg { r: 3 }));
    }

    #[test]
    fn encode_reg_imm_shape() {
        let word = encode(Opcode::Mov, &Operands::RegImm { r: 1, imm: 10 }).unwrap();
        assert_eq!(word, 0x0110_000A);
        assert_eq!(
            decode(word).unwrap(),
            (Opcode::Mov, Operands::RegImm { r: 1, imm: 10 })
        );
    }

    #[test]
    fn roundtrip_every_shape() {
        let cases = [
            (Opcode::Neg, Operands::Reg { r: 15 }),
            (Opcode::Jnz, Operands::RegImm { r: 7, imm: IMM_MAX }),
            (Opcode::Cmp, Operands::TwoReg { a: 4, b: 9 }),
            (Opcode::Add, Operands::ThreeReg { a: 1, b: 2, c: 3 }),
            (
                Opcode::Cal,
                Operands::FourReg {
                    a: 12,
                    b: 1,
                    c: 2,
                    d: 3,
                },
            ),
            (
                Opcode::Jmp,
                Operands::LongImm {
                    target: TARGET_MAX,
                },
            ),
        ];
        for (op, operands) in cases {
            let word = encode(op, &operands).unwrap();
            assert_eq!(decode(word).unwrap(), (op, operands));
        }
    }

    #[test]
    fn encode_rejects_out_of_range_register() {
        let err = encode(Opcode::Halt, &Operands::Reg { r: 16 }).unwrap_err();
        assert!(matches!(err, VmError::RegisterOutOfRange { index: 16 }));
    }

    #[test]
    fn encode_rejects_oversized_immediate() {
        let err = encode(
            Opcode::Mov,
            &Operands::RegImm {
                r: 1,
                imm: IMM_MAX + 1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, VmError::ImmediateOutOfRange { .. }));

        let err = encode(
            Opcode::Jmp,
            &Operands::LongImm {
                target: TARGET_MAX + 1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, VmError::ImmediateOutOfRange { .. }));
    }

    #[test]
    fn encode_rejects_shape_mismatch() {
        let err = encode(Opcode::Add, &Operands::Reg { r: 1 }).unwrap_err();
        assert!(matches!(err, VmError::ShapeMismatch { mnemonic: "add", .. }));
    }

    #[test]
    fn long_immediate_reaches_full_24_bits() {
        // Jump targets must not be limited to the short immediate width.
        let word = encode(
            Opcode::Ret,
            &Operands::LongImm { target: 0x12_3456 },
        )
        .unwrap();
        let (op, operands) = decode(word).unwrap();
        assert_eq!(op, Opcode::Ret);
        assert_eq!(operands, Operands::LongImm { target: 0x12_3456 });
    }
}
