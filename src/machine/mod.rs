//! Core virtual machine implementation.
//!
//! The machine executes the fixed-width instruction stream produced by the
//! [`assembler`](crate::assembler) with a register/stack architecture:
//!
//! - **Registers**: 16 untyped `i64` slots; `%zero` is hardwired to zero and
//!   `%esl` mirrors the operand-stack depth before every dispatch
//! - **Operand stack**: bounded LIFO driven by `psh`/`psi`/`pop`
//! - **Jump history**: bounded log of taken jumps backing the `ret`
//!   pseudo-call mechanism
//! - **Memory arena**: bounded `i64` cells; its base region backs the
//!   variable database, the rest is open to host allocators
//! - **Host bindings**: index-keyed [`HostFunction`] registry dispatched by
//!   `cal`, each callee scoped through a [`HostContext`] capability
//!
//! Execution is strictly single-threaded and synchronous: `run` blocks
//! until `hlt` or a fault. Every capacity is a configured limit enforced as
//! a distinguishable [`VmError`] fault carrying the faulting program
//! counter.

mod arena;
mod host;
mod jumps;
mod regs;
mod stack;
#[cfg(test)]
mod tests;

pub use host::{HostContext, HostFunction};

use crate::errors::VmError;
use crate::isa::{self, Opcode, Operands};
use crate::program;
use arena::MemoryArena;
use host::BindingTable;
use jumps::JumpHistory;
use regs::RegisterFile;
use stack::OperandStack;
use std::borrow::Cow;
use std::io::{self, Write};
use std::path::Path;

/// Capacity limits for one machine instance.
///
/// Defaults mirror the reference implementation's fixed table sizes, but
/// every limit is enforced as a checked runtime fault rather than a buffer
/// bound.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Maximum operand-stack depth.
    pub stack_limit: usize,
    /// Maximum recorded jumps.
    pub jump_depth: usize,
    /// Addressable memory arena cells.
    pub memory_cells: usize,
    /// Arena cells reserved for the variable database.
    pub variable_cells: usize,
    /// Valid host-binding ids are `0..binding_slots`.
    pub binding_slots: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stack_limit: 0xFFFF,
            jump_depth: 0xFF,
            memory_cells: 0xFFFF,
            variable_cells: 256,
            binding_slots: 0xFFFF,
        }
    }
}

/// Bytecode virtual machine.
///
/// Owns every piece of run state; nothing is process-global, so callers may
/// hold any number of independent machines. A program is either borrowed
/// from the caller (`load_words`) or owned by the machine (`load_owned`,
/// `load_file`); `reset` releases it either way.
pub struct Machine<'p> {
    program: Option<Cow<'p, [u32]>>,
    pc: usize,
    cmp1: i64,
    cmp2: i64,
    regs: RegisterFile,
    stack: OperandStack,
    jumps: JumpHistory,
    memory: MemoryArena,
    bindings: BindingTable,
    running: bool,
    result: i64,
    trace: bool,
    output: Box<dyn Write>,
    config: MachineConfig,
}

impl<'p> Machine<'p> {
    /// Creates a machine with the given capacity limits.
    pub fn new(config: MachineConfig) -> Self {
        Self {
            program: None,
            pc: 0,
            cmp1: 0,
            cmp2: 0,
            regs: RegisterFile::new(),
            stack: OperandStack::new(config.stack_limit),
            jumps: JumpHistory::new(config.jump_depth),
            memory: MemoryArena::new(config.memory_cells, config.variable_cells),
            bindings: BindingTable::new(config.binding_slots),
            running: false,
            result: 0,
            trace: false,
            output: Box::new(io::stdout()),
            config,
        }
    }

    /// Restores the freshly-initialized state and releases the loaded
    /// program (an owned buffer is freed, a borrowed one is merely let go).
    pub fn reset(&mut self) {
        self.program = None;
        self.pc = 0;
        self.cmp1 = 0;
        self.cmp2 = 0;
        self.regs.clear();
        self.stack.clear();
        self.jumps.clear();
        self.memory.clear();
        self.bindings.clear();
        self.running = false;
        self.result = 0;
    }

    /// Loads a caller-owned word array. The machine never frees it.
    ///
    /// Returns `false` without touching any state if a program is currently
    /// running; callers that need to know should check [`is_running`]
    /// first.
    ///
    /// [`is_running`]: Machine::is_running
    pub fn load_words(&mut self, words: &'p [u32]) -> bool {
        if self.running {
            return false;
        }
        self.reset();
        self.program = Some(Cow::Borrowed(words));
        true
    }

    /// Loads a word array the machine takes ownership of.
    pub fn load_owned(&mut self, words: Vec<u32>) -> bool {
        if self.running {
            return false;
        }
        self.reset();
        self.program = Some(Cow::Owned(words));
        true
    }

    /// Reads a program from a wire-format file; the machine owns the result.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<bool, VmError> {
        if self.running {
            return Ok(false);
        }
        let words = program::read_file(path)?;
        self.reset();
        self.program = Some(Cow::Owned(words));
        Ok(true)
    }

    /// Whether the machine is inside [`run`](Machine::run).
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Enables per-instruction trace printing to standard output.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    /// Redirects `prt`/`ptc` and host output away from standard output.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Reads a register. Host embedders use this to pick up results.
    pub fn register(&self, index: u8) -> i64 {
        self.regs.get(index)
    }

    /// Registers a host function at a vacant id.
    ///
    /// Returns `false` if the id is out of range or already bound.
    pub fn bind<F: HostFunction + 'static>(&mut self, id: usize, function: F) -> bool {
        self.bindings.bind(id, Box::new(function))
    }

    /// Replaces a previously bound host function.
    ///
    /// Returns `false` if the id was never bound.
    pub fn overbind<F: HostFunction + 'static>(&mut self, id: usize, function: F) -> bool {
        self.bindings.overbind(id, Box::new(function))
    }

    /// Executes the loaded program until `hlt`, returning the value of the
    /// halt instruction's operand register.
    pub fn run(&mut self) -> Result<i64, VmError> {
        if self.program.is_none() {
            return Err(VmError::NoProgram);
        }
        self.running = true;
        let outcome = self.run_loop();
        self.running = false;
        self.pc = 0;
        outcome?;
        Ok(self.result)
    }

    fn run_loop(&mut self) -> Result<(), VmError> {
        while self.running {
            let pc = self.pc;
            let word = self.fetch()?;
            let (op, operands) = isa::decode(word).map_err(|e| match e {
                VmError::InvalidInstruction { opcode, .. } => {
                    VmError::InvalidInstruction { opcode, pc }
                }
                other => other,
            })?;
            self.regs.refresh(self.stack.depth());
            if self.trace {
                println!("{pc:>6}  {}", render_instruction(op, &operands));
            }
            self.exec(pc, op, operands)?;
        }
        Ok(())
    }

    fn fetch(&mut self) -> Result<u32, VmError> {
        let program = self.program.as_ref().ok_or(VmError::NoProgram)?;
        let word = *program.get(self.pc).ok_or(VmError::PcOutOfRange {
            pc: self.pc,
            len: program.len(),
        })?;
        self.pc += 1;
        Ok(word)
    }

    fn exec(&mut self, pc: usize, op: Opcode, operands: Operands) -> Result<(), VmError> {
        use Opcode as Op;
        use Operands as Args;

        match (op, operands) {
            (Op::Halt, Args::Reg { r }) => self.op_halt(r),
            (Op::Mov, Args::RegImm { r, imm }) => self.op_mov(r, imm),
            (Op::Add, Args::ThreeReg { a, b, c }) => self.op_add(a, b, c),
            (Op::Sub, Args::ThreeReg { a, b, c }) => self.op_sub(a, b, c),
            (Op::Mul, Args::ThreeReg { a, b, c }) => self.op_mul(a, b, c),
            (Op::Div, Args::ThreeReg { a, b, c }) => self.op_div(pc, a, b, c),
            (Op::Neg, Args::Reg { r }) => self.op_neg(r),
            (Op::Prt, Args::Reg { r }) => self.op_prt(r),
            (Op::Ptc, Args::Reg { r }) => self.op_ptc(r),
            (Op::Jmp, Args::LongImm { target }) => self.take_jump(pc, target as usize),
            (Op::Jnz, Args::RegImm { r, imm }) => self.op_jnz(pc, r, imm),
            (Op::Jz, Args::RegImm { r, imm }) => self.op_jz(pc, r, imm),
            (Op::Jne, Args::LongImm { target }) => self.latch_jump(pc, target, self.cmp1 != self.cmp2),
            (Op::Je, Args::LongImm { target }) => self.latch_jump(pc, target, self.cmp1 == self.cmp2),
            (Op::Jgt, Args::LongImm { target }) => self.latch_jump(pc, target, self.cmp1 > self.cmp2),
            (Op::Jlt, Args::LongImm { target }) => self.latch_jump(pc, target, self.cmp1 < self.cmp2),
            (Op::Jge, Args::LongImm { target }) => self.latch_jump(pc, target, self.cmp1 >= self.cmp2),
            (Op::Jle, Args::LongImm { target }) => self.latch_jump(pc, target, self.cmp1 <= self.cmp2),
            (Op::Cmp, Args::TwoReg { a, b }) => self.op_cmp(a, b),
            (Op::Ret, Args::LongImm { target }) => self.op_ret(pc, target as usize),
            (Op::Mvr, Args::TwoReg { a, b }) => self.op_mvr(a, b),
            (Op::Cal, Args::FourReg { a, b, c, d }) => self.op_cal(pc, a, b, c, d),
            (Op::Psh, Args::Reg { r }) => self.op_psh(pc, r),
            (Op::Pop, Args::Reg { r }) => self.op_pop(pc, r),
            (Op::Set, Args::RegImm { r, imm }) => self.op_set(pc, r, imm),
            (Op::Get, Args::RegImm { r, imm }) => self.op_get(pc, r, imm),
            (Op::Gta, Args::RegImm { r, imm }) => self.op_gta(pc, r, imm),
            (Op::Drf, Args::TwoReg { a, b }) => self.op_drf(pc, a, b),
            (Op::Pok, Args::TwoReg { a, b }) => self.op_pok(pc, a, b),
            (Op::Shl, Args::TwoReg { a, b }) => self.op_shl(a, b),
            (Op::Shr, Args::TwoReg { a, b }) => self.op_shr(a, b),
            (Op::Msk, Args::TwoReg { a, b }) => self.op_msk(a, b),
            (Op::Psi, Args::RegImm { imm, .. }) => self.op_psi(pc, imm),
            // decode always produces the opcode's own shape; this arm only
            // guards against a corrupted word sneaking past it
            (op, _) => Err(VmError::InvalidInstruction {
                opcode: op as u8,
                pc,
            }),
        }
    }

    fn program_len(&self) -> usize {
        self.program.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    fn write_output(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.output.write_all(bytes).map_err(|e| VmError::Io {
            path: "<output>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Records a taken jump and redirects the program counter. The recorded
    /// source is the address of the next instruction, which is exactly what
    /// `ret` must resume at.
    fn take_jump(&mut self, pc: usize, target: usize) -> Result<(), VmError> {
        if !self.jumps.record(self.pc, target) {
            return Err(VmError::JumpHistoryFull {
                pc,
                depth: self.config.jump_depth,
            });
        }
        self.pc = target;
        Ok(())
    }

    fn latch_jump(&mut self, pc: usize, target: u32, taken: bool) -> Result<(), VmError> {
        if taken {
            self.take_jump(pc, target as usize)
        } else {
            Ok(())
        }
    }

    fn mem_address(&self, pc: usize, value: i64) -> Result<usize, VmError> {
        if value < 0 || value as usize >= self.memory.cells() {
            return Err(VmError::MemoryOutOfRange {
                pc,
                address: value,
                cells: self.memory.cells(),
            });
        }
        Ok(value as usize)
    }

    fn variable_address(&self, pc: usize, imm: u32) -> Result<usize, VmError> {
        let index = imm as usize;
        if index >= self.memory.variable_cells() {
            return Err(VmError::VariableOutOfRange {
                pc,
                index,
                capacity: self.memory.variable_cells(),
            });
        }
        Ok(index)
    }

    fn op_halt(&mut self, r: u8) -> Result<(), VmError> {
        self.running = false;
        self.result = self.regs.get(r);
        Ok(())
    }

    fn op_mov(&mut self, r: u8, imm: u32) -> Result<(), VmError> {
        self.regs.set(r, imm as i64);
        Ok(())
    }

    fn op_add(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let value = self.regs.get(b).wrapping_add(self.regs.get(c));
        self.regs.set(a, value);
        Ok(())
    }

    fn op_sub(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let value = self.regs.get(b).wrapping_sub(self.regs.get(c));
        self.regs.set(a, value);
        Ok(())
    }

    fn op_mul(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let value = self.regs.get(b).wrapping_mul(self.regs.get(c));
        self.regs.set(a, value);
        Ok(())
    }

    fn op_div(&mut self, pc: usize, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let divisor = self.regs.get(c);
        if divisor == 0 {
            return Err(VmError::DivisionByZero { pc });
        }
        let value = self.regs.get(b).wrapping_div(divisor);
        self.regs.set(a, value);
        Ok(())
    }

    fn op_neg(&mut self, r: u8) -> Result<(), VmError> {
        let value = self.regs.get(r).wrapping_neg();
        self.regs.set(r, value);
        Ok(())
    }

    fn op_prt(&mut self, r: u8) -> Result<(), VmError> {
        let value = self.regs.get(r);
        self.write_output(value.to_string().as_bytes())
    }

    fn op_ptc(&mut self, r: u8) -> Result<(), VmError> {
        let byte = self.regs.get(r) as u8;
        self.write_output(&[byte])
    }

    fn op_jnz(&mut self, pc: usize, r: u8, imm: u32) -> Result<(), VmError> {
        if self.regs.get(r) != 0 {
            self.take_jump(pc, imm as usize)?;
        }
        Ok(())
    }

    fn op_jz(&mut self, pc: usize, r: u8, imm: u32) -> Result<(), VmError> {
        if self.regs.get(r) == 0 {
            self.take_jump(pc, imm as usize)?;
        }
        Ok(())
    }

    fn op_cmp(&mut self, a: u8, b: u8) -> Result<(), VmError> {
        self.cmp1 = self.regs.get(a);
        self.cmp2 = self.regs.get(b);
        Ok(())
    }

    fn op_ret(&mut self, pc: usize, target: usize) -> Result<(), VmError> {
        let from = self
            .jumps
            .unwind(target)
            .ok_or(VmError::ReturnWithoutJump { pc, target })?;
        self.pc = from;
        Ok(())
    }

    fn op_mvr(&mut self, a: u8, b: u8) -> Result<(), VmError> {
        let value = self.regs.get(b);
        self.regs.set(a, value);
        Ok(())
    }

    fn op_cal(&mut self, pc: usize, a: u8, b: u8, c: u8, d: u8) -> Result<(), VmError> {
        let id = self.regs.get(a);
        if id < 0 || id as usize >= self.config.binding_slots {
            return Err(VmError::UnboundHostFunction { pc, id });
        }
        let Some(mut function) = self.bindings.take(id as usize) else {
            return Err(VmError::UnboundHostFunction { pc, id });
        };
        let outcome = function.invoke(HostContext {
            machine: self,
            operands: [b, c, d],
            pc,
        });
        self.bindings.restore(id as usize, function);
        outcome
    }

    fn op_psh(&mut self, pc: usize, r: u8) -> Result<(), VmError> {
        let value = self.regs.get(r);
        if !self.stack.push(value) {
            return Err(VmError::StackOverflow {
                pc,
                limit: self.stack.limit(),
            });
        }
        Ok(())
    }

    fn op_pop(&mut self, pc: usize, r: u8) -> Result<(), VmError> {
        let value = self
            .stack
            .pop()
            .ok_or(VmError::StackUnderflow { pc })?;
        self.regs.set(r, value);
        Ok(())
    }

    fn op_set(&mut self, pc: usize, r: u8, imm: u32) -> Result<(), VmError> {
        let index = self.variable_address(pc, imm)?;
        let value = self.regs.get(r);
        self.memory.write(index, value);
        Ok(())
    }

    fn op_get(&mut self, pc: usize, r: u8, imm: u32) -> Result<(), VmError> {
        let index = self.variable_address(pc, imm)?;
        let value = self.memory.read(index).unwrap_or(0);
        self.regs.set(r, value);
        Ok(())
    }

    fn op_gta(&mut self, pc: usize, r: u8, imm: u32) -> Result<(), VmError> {
        let index = self.variable_address(pc, imm)?;
        self.regs.set(r, index as i64);
        Ok(())
    }

    fn op_drf(&mut self, pc: usize, a: u8, b: u8) -> Result<(), VmError> {
        let address = self.mem_address(pc, self.regs.get(b))?;
        let value = self.memory.read(address).unwrap_or(0);
        self.regs.set(a, value);
        Ok(())
    }

    fn op_pok(&mut self, pc: usize, a: u8, b: u8) -> Result<(), VmError> {
        let address = self.mem_address(pc, self.regs.get(a))?;
        let value = self.regs.get(b);
        self.memory.write(address, value);
        Ok(())
    }

    fn op_shl(&mut self, a: u8, b: u8) -> Result<(), VmError> {
        let value = self.regs.get(a).wrapping_shl(self.regs.get(b) as u32);
        self.regs.set(a, value);
        Ok(())
    }

    fn op_shr(&mut self, a: u8, b: u8) -> Result<(), VmError> {
        let value = self.regs.get(a).wrapping_shr(self.regs.get(b) as u32);
        self.regs.set(a, value);
        Ok(())
    }

    fn op_msk(&mut self, a: u8, b: u8) -> Result<(), VmError> {
        let value = self.regs.get(a) & self.regs.get(b);
        self.regs.set(a, value);
        Ok(())
    }

    fn op_psi(&mut self, pc: usize, imm: u32) -> Result<(), VmError> {
        if !self.stack.push(imm as i64) {
            return Err(VmError::StackOverflow {
                pc,
                limit: self.stack.limit(),
            });
        }
        Ok(())
    }
}

impl Default for Machine<'_> {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

fn render_instruction(op: Opcode, operands: &Operands) -> String {
    let name = op.mnemonic();
    match *operands {
        Operands::Reg { r } => format!("{name} %{}", isa::register_name(r)),
        Operands::RegImm { r, imm } => {
            format!("{name} %{} {imm}", isa::register_name(r))
        }
        Operands::TwoReg { a, b } => format!(
            "{name} %{} %{}",
            isa::register_name(a),
            isa::register_name(b)
        ),
        Operands::ThreeReg { a, b, c } => format!(
            "{name} %{} %{} %{}",
            isa::register_name(a),
            isa::register_name(b),
            isa::register_name(c)
        ),
        Operands::FourReg { a, b, c, d } => format!(
            "{name} %{} %{} %{} %{}",
            isa::register_name(a),
            isa::register_name(b),
            isa::register_name(c),
            isa::register_name(d)
        ),
        Operands::LongImm { target } => format!("{name} {target}"),
    }
}
