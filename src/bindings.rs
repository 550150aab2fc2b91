//! Reference host bindings.
//!
//! The machine deliberately has no allocation strategy of its own: raw
//! memory management is delegated to host functions. This module provides
//! the reference set the CLI runner installs — a bump-and-free-list
//! allocator over the arena's open region, cell fill/copy, a typed load,
//! and nul-terminated string printing. Embedding hosts can use these as-is,
//! rebind them with [`Machine::overbind`], or supply their own.
//!
//! All bindings read their arguments from the operand registers carried by
//! the invoking `cal` word, in order.

use crate::errors::VmError;
use crate::machine::{HostContext, HostFunction, Machine};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// `cal %id %cells %dst %_` — allocate `cells`, block address into `%dst`.
pub const BIND_ALLOC: usize = 0;
/// `cal %id %addr %_ %_` — release the block at `%addr`.
pub const BIND_FREE: usize = 1;
/// `cal %id %addr %value %count` — fill `count` cells at `addr`.
pub const BIND_FILL: usize = 2;
/// `cal %id %dst %src %count` — copy `count` cells from `src` to `dst`.
pub const BIND_COPY: usize = 3;
/// `cal %id %dst %addr %_` — load the cell at `addr` into register `dst`.
pub const BIND_LOAD: usize = 4;
/// `cal %id %addr %_ %_` — print the nul-terminated characters at `addr`.
pub const BIND_PRINTS: usize = 5;

/// Bump allocator with a free list, shared by the alloc and free bindings.
///
/// Lives entirely on the host side of the binding table; the machine knows
/// nothing about blocks. Allocation starts above the variable region.
struct Allocator {
    next: usize,
    free: Vec<(usize, usize)>,
    live: HashMap<usize, usize>,
}

impl Allocator {
    fn new() -> Self {
        Self {
            next: 0,
            free: Vec::new(),
            live: HashMap::new(),
        }
    }

    fn allocate(&mut self, ctx: &HostContext<'_, '_>, cells: usize) -> Result<usize, VmError> {
        let base = ctx.variable_cells();
        if self.next < base {
            self.next = base;
        }

        if let Some(i) = self.free.iter().position(|&(_, len)| len >= cells) {
            let (address, len) = self.free.remove(i);
            if len > cells {
                self.free.push((address + cells, len - cells));
            }
            self.live.insert(address, cells);
            return Ok(address);
        }

        if self.next + cells > ctx.memory_cells() {
            return Err(VmError::ArenaExhausted { cells });
        }
        let address = self.next;
        self.next += cells;
        self.live.insert(address, cells);
        Ok(address)
    }

    fn release(&mut self, address: usize) -> Option<usize> {
        let cells = self.live.remove(&address)?;
        self.free.push((address, cells));
        Some(cells)
    }
}

struct Alloc(Rc<RefCell<Allocator>>);

impl HostFunction for Alloc {
    fn invoke(&mut self, mut ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        let [cells_reg, dst_reg, _] = ctx.operands();
        let cells = ctx.reg(cells_reg);
        if cells <= 0 {
            return Err(ctx.fault(format!("allocation size {cells} must be positive")));
        }
        let address = self.0.borrow_mut().allocate(&ctx, cells as usize)?;
        ctx.set_reg(dst_reg, address as i64);
        Ok(())
    }
}

struct Free(Rc<RefCell<Allocator>>);

impl HostFunction for Free {
    fn invoke(&mut self, ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        let [addr_reg, _, _] = ctx.operands();
        let address = ctx.reg(addr_reg);
        if address < 0 || self.0.borrow_mut().release(address as usize).is_none() {
            return Err(ctx.fault(format!("free of an unallocated address {address}")));
        }
        Ok(())
    }
}

struct Fill;

impl HostFunction for Fill {
    fn invoke(&mut self, mut ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        let [addr_reg, value_reg, count_reg] = ctx.operands();
        let address = ctx.reg(addr_reg);
        let value = ctx.reg(value_reg);
        let count = ctx.reg(count_reg);
        if count < 0 {
            return Err(ctx.fault(format!("fill count {count} must not be negative")));
        }
        for i in 0..count {
            ctx.mem_write(address + i, value)?;
        }
        Ok(())
    }
}

struct CopyCells;

impl HostFunction for CopyCells {
    fn invoke(&mut self, mut ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        let [dst_reg, src_reg, count_reg] = ctx.operands();
        let dst = ctx.reg(dst_reg);
        let src = ctx.reg(src_reg);
        let count = ctx.reg(count_reg);
        if count < 0 {
            return Err(ctx.fault(format!("copy count {count} must not be negative")));
        }
        // buffered so overlapping regions copy correctly
        let mut cells = Vec::with_capacity(count as usize);
        for i in 0..count {
            cells.push(ctx.mem_read(src + i)?);
        }
        for (i, cell) in cells.into_iter().enumerate() {
            ctx.mem_write(dst + i as i64, cell)?;
        }
        Ok(())
    }
}

struct Load;

impl HostFunction for Load {
    fn invoke(&mut self, mut ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        let [dst_reg, addr_reg, _] = ctx.operands();
        let value = ctx.mem_read(ctx.reg(addr_reg))?;
        ctx.set_reg(dst_reg, value);
        Ok(())
    }
}

struct PrintStr;

impl HostFunction for PrintStr {
    fn invoke(&mut self, mut ctx: HostContext<'_, '_>) -> Result<(), VmError> {
        let [addr_reg, _, _] = ctx.operands();
        let mut address = ctx.reg(addr_reg);
        let mut bytes = Vec::new();
        loop {
            let cell = ctx.mem_read(address)?;
            if cell == 0 {
                break;
            }
            bytes.push(cell as u8);
            address += 1;
        }
        ctx.write_output(&bytes)
    }
}

/// Installs the reference bindings at ids [`BIND_ALLOC`]..=[`BIND_PRINTS`].
///
/// Returns `false` if any of those ids was already bound.
pub fn install(machine: &mut Machine<'_>) -> bool {
    let allocator = Rc::new(RefCell::new(Allocator::new()));
    let mut ok = true;
    ok &= machine.bind(BIND_ALLOC, Alloc(Rc::clone(&allocator)));
    ok &= machine.bind(BIND_FREE, Free(allocator));
    ok &= machine.bind(BIND_FILL, Fill);
    ok &= machine.bind(BIND_COPY, CopyCells);
    ok &= machine.bind(BIND_LOAD, Load);
    ok &= machine.bind(BIND_PRINTS, PrintStr);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_source;
    use crate::machine::MachineConfig;
    use std::io::{self, Write};

    #[derive(Clone)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> (Machine<'static>, String) {
        let assembled = assemble_source(source).expect("assembly failed");
        let mut machine = Machine::default();
        let buffer = Rc::new(RefCell::new(Vec::new()));
        machine.set_output(Box::new(SharedSink(Rc::clone(&buffer))));
        assert!(machine.load_owned(assembled.words));
        assert!(install(&mut machine));
        machine.run().expect("machine run failed");
        let output = String::from_utf8(buffer.borrow().clone()).unwrap();
        (machine, output)
    }

    #[test]
    fn alloc_returns_address_above_variable_region() {
        let (machine, _) = run(
            "mov %et0 0\n\
             mov %eax 4\n\
             cal %et0 %eax %ebx %zero\n\
             hlt %ebx",
        );
        assert_eq!(machine.register(2), 256);
    }

    #[test]
    fn fill_and_load_roundtrip() {
        // allocate 4 cells, fill them with 7, load the third back
        let (machine, _) = run(
            "mov %et0 0\n\
             mov %eax 4\n\
             cal %et0 %eax %ebx %zero\n\
             mov %et0 2\n\
             mov %ecx 7\n\
             mov %edx 4\n\
             cal %et0 %ebx %ecx %edx\n\
             mov %et0 4\n\
             mov %edx 2\n\
             add %edx %ebx %edx\n\
             cal %et0 %esi %edx %zero\n\
             hlt %esi",
        );
        assert_eq!(machine.register(9), 7);
    }

    #[test]
    fn copy_moves_cells() {
        let (machine, _) = run(
            "mov %et0 0\n\
             mov %eax 2\n\
             cal %et0 %eax %ebx %zero\n\
             cal %et0 %eax %ecx %zero\n\
             mov %edx 41\n\
             pok %ebx %edx\n\
             mov %et0 3\n\
             mov %edx 2\n\
             cal %et0 %ecx %ebx %edx\n\
             drf %esi %ecx\n\
             hlt %esi",
        );
        assert_eq!(machine.register(9), 41);
    }

    #[test]
    fn free_allows_reuse() {
        let (machine, _) = run(
            "mov %et0 0\n\
             mov %eax 8\n\
             cal %et0 %eax %ebx %zero\n\
             mov %et0 1\n\
             cal %et0 %ebx %zero %zero\n\
             mov %et0 0\n\
             cal %et0 %eax %ecx %zero\n\
             hlt %ecx",
        );
        // the released block is handed back out
        assert_eq!(machine.register(3), machine.register(2));
    }

    #[test]
    fn prints_writes_nul_terminated_cells() {
        let (_, output) = run(
            "mov %et0 0\n\
             mov %eax 3\n\
             cal %et0 %eax %ebx %zero\n\
             mov %ecx 'h'\n\
             pok %ebx %ecx\n\
             mov %edx 1\n\
             add %edx %ebx %edx\n\
             mov %ecx 'i'\n\
             pok %edx %ecx\n\
             mov %et0 5\n\
             cal %et0 %ebx %zero %zero\n\
             hlt %zero",
        );
        assert_eq!(output, "hi");
    }

    #[test]
    fn alloc_exhaustion_faults() {
        let assembled = assemble_source(
            "mov %et0 0\n\
             mov %eax 64\n\
             cal %et0 %eax %ebx %zero\n\
             hlt %zero",
        )
        .unwrap();
        let mut machine = Machine::new(MachineConfig {
            memory_cells: 32,
            variable_cells: 8,
            ..MachineConfig::default()
        });
        assert!(machine.load_owned(assembled.words));
        assert!(install(&mut machine));
        let err = machine.run().unwrap_err();
        assert!(matches!(err, VmError::ArenaExhausted { cells: 64 }));
    }

    #[test]
    fn free_of_unallocated_address_faults() {
        let assembled = assemble_source(
            "mov %et0 1\n\
             mov %eax 300\n\
             cal %et0 %eax %zero %zero\n\
             hlt %zero",
        )
        .unwrap();
        let mut machine = Machine::default();
        assert!(machine.load_owned(assembled.words));
        assert!(install(&mut machine));
        let err = machine.run().unwrap_err();
        assert!(matches!(err, VmError::HostFault { .. }));
    }

    #[test]
    fn install_refuses_occupied_ids() {
        let mut machine = Machine::default();
        assert!(install(&mut machine));
        assert!(!install(&mut machine));
    }
}
