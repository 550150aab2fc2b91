//! Embeddable bytecode virtual machine and its two-pass assembler.
//!
//! A toolchain for a tiny, sandbox-able scripting layer: the assembler
//! compiles mnemonic source into a stream of fixed-width 32-bit instruction
//! words, and the machine executes that stream on a register/stack
//! architecture extensible through host-bound native functions.
//!
//! # Architecture
//!
//! - **Registers**: 16 untyped slots; `%zero` is hardwired zero, `%esl`
//!   mirrors the operand-stack depth every cycle
//! - **Instruction format**: one 32-bit word per instruction, fields
//!   decided per opcode by a shape table shared with the assembler
//! - **Execution model**: fetch/decode/execute until `hlt`, which yields
//!   its operand register as the program result
//! - **Hardening**: stack, memory, variable, jump, and program-counter
//!   limits are all checked, distinguishable runtime faults
//!
//! # Modules
//!
//! - [`assembler`]: tokenizer, two-pass assembly, multi-unit relocation
//! - [`bindings`]: reference host bindings (allocator, fill/copy, printing)
//! - [`errors`]: assembly, wire-format, and runtime error types
//! - [`isa`]: instruction set definition and word encoding
//! - [`machine`]: the virtual machine and its host-binding mechanism
//! - [`program`]: hex wire-format reader and writer
//! - [`utils`]: logging macros for the CLI binaries
//!
//! # Example
//!
//! ```
//! use wordvm::{assembler, machine::Machine};
//!
//! let assembled = assembler::assemble_source("mov %eax 10\nhlt %eax")?;
//! let mut vm = Machine::default();
//! vm.load_owned(assembled.words);
//! assert_eq!(vm.run()?, 10);
//! # Ok::<(), wordvm::errors::VmError>(())
//! ```

pub mod assembler;
pub mod bindings;
pub mod errors;
pub mod isa;
pub mod machine;
pub mod program;
pub mod utils;
