//! Host-function extension mechanism.
//!
//! Native extensions implement [`HostFunction`] and are registered in the
//! machine's binding table under small integer ids. The `cal` opcode
//! dispatches through the table using a register value as the id and hands
//! the callee a [`HostContext`], a capability scoping its access to the
//! registers, the operand stack, the memory arena, the program counter,
//! and the output sink. The binding table itself is not reachable from a
//! running host function, so a binding cannot rebind or re-enter itself.

use super::Machine;
use crate::errors::VmError;
use std::collections::HashMap;

/// A native function invokable from bytecode through the binding table.
pub trait HostFunction {
    /// Runs the binding. Errors become machine-level faults.
    fn invoke(&mut self, ctx: HostContext<'_, '_>) -> Result<(), VmError>;
}

impl<F> HostFunction for F
where
    F: for<'m, 'p> FnMut(HostContext<'m, 'p>) -> Result<(), VmError>,
{
    fn invoke(&mut self, ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        self(ctx)
    }
}

/// Index-keyed registry of host functions.
///
/// `bind` and `overbind` are the only two mutation entry points, and they
/// are intentionally asymmetric: `bind` refuses an occupied id, `overbind`
/// refuses a vacant one, so a binding is never silently replaced.
pub(super) struct BindingTable {
    slots: HashMap<usize, Box<dyn HostFunction>>,
    capacity: usize,
}

impl BindingTable {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity,
        }
    }

    pub(super) fn bind(&mut self, id: usize, function: Box<dyn HostFunction>) -> bool {
        if id >= self.capacity || self.slots.contains_key(&id) {
            return false;
        }
        self.slots.insert(id, function);
        true
    }

    pub(super) fn overbind(&mut self, id: usize, function: Box<dyn HostFunction>) -> bool {
        if !self.slots.contains_key(&id) {
            return false;
        }
        self.slots.insert(id, function);
        true
    }

    /// Removes a binding for the duration of its invocation.
    pub(super) fn take(&mut self, id: usize) -> Option<Box<dyn HostFunction>> {
        self.slots.remove(&id)
    }

    pub(super) fn restore(&mut self, id: usize, function: Box<dyn HostFunction>) {
        self.slots.insert(id, function);
    }

    pub(super) fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Scoped, auditable access to the machine handed to a host function.
///
/// The three operand registers come from the `cal` instruction word itself,
/// so one binding id can serve several call sites with different argument
/// registers.
pub struct HostContext<'m, 'p> {
    pub(super) machine: &'m mut Machine<'p>,
    pub(super) operands: [u8; 3],
    pub(super) pc: usize,
}

impl HostContext<'_, '_> {
    /// The three operand register indices of the invoking `cal` word.
    pub fn operands(&self) -> [u8; 3] {
        self.operands
    }

    /// Reads a register.
    pub fn reg(&self, index: u8) -> i64 {
        self.machine.regs.get(index)
    }

    /// Writes a register (the zero register stays zero).
    pub fn set_reg(&mut self, index: u8, value: i64) {
        self.machine.regs.set(index, value);
    }

    /// Pushes onto the operand stack.
    pub fn push(&mut self, value: i64) -> Result<(), VmError> {
        if self.machine.stack.push(value) {
            Ok(())
        } else {
            Err(VmError::StackOverflow {
                pc: self.pc,
                limit: self.machine.stack.limit(),
            })
        }
    }

    /// Pops from the operand stack.
    pub fn pop(&mut self) -> Result<i64, VmError> {
        self.machine
            .stack
            .pop()
            .ok_or(VmError::StackUnderflow { pc: self.pc })
    }

    pub fn stack_depth(&self) -> usize {
        self.machine.stack.depth()
    }

    fn checked_address(&self, address: i64) -> Result<usize, VmError> {
        let cells = self.machine.memory.cells();
        if address < 0 || address as usize >= cells {
            return Err(VmError::MemoryOutOfRange {
                pc: self.pc,
                address,
                cells,
            });
        }
        Ok(address as usize)
    }

    /// Reads an arena cell through a validated address.
    pub fn mem_read(&self, address: i64) -> Result<i64, VmError> {
        let address = self.checked_address(address)?;
        self.machine
            .memory
            .read(address)
            .ok_or(VmError::MemoryOutOfRange {
                pc: self.pc,
                address: address as i64,
                cells: self.machine.memory.cells(),
            })
    }

    /// Writes an arena cell through a validated address.
    pub fn mem_write(&mut self, address: i64, value: i64) -> Result<(), VmError> {
        let address = self.checked_address(address)?;
        self.machine.memory.write(address, value);
        Ok(())
    }

    /// Total addressable arena cells.
    pub fn memory_cells(&self) -> usize {
        self.machine.memory.cells()
    }

    /// Cells at the arena base reserved for the variable database.
    pub fn variable_cells(&self) -> usize {
        self.machine.memory.variable_cells()
    }

    /// Address of the instruction after the invoking `cal`.
    pub fn pc(&self) -> usize {
        self.machine.pc
    }

    /// Redirects execution. The target is validated against the program.
    pub fn set_pc(&mut self, target: usize) -> Result<(), VmError> {
        let len = self.machine.program_len();
        if target >= len {
            return Err(VmError::PcOutOfRange { pc: target, len });
        }
        self.machine.pc = target;
        Ok(())
    }

    /// Writes bytes to the machine's program-output sink.
    pub fn write_output(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.machine.write_output(bytes)
    }

    /// Builds a host fault carrying the given reason.
    pub fn fault(&self, reason: impl Into<String>) -> VmError {
        VmError::HostFault {
            reason: reason.into(),
        }
    }
}
