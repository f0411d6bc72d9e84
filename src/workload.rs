// The parallel dot-product workload: program, memory image and result
// collection. Each PE walks its slice of A and B and accumulates into a
// partial sum that lives on its own cache line.

use crate::commons::{SimError, LINE_SIZE_BYTES, WORD_SIZE};
use crate::memory::{MainMemory, MEM_SIZE_WORDS};
use crate::processor::{Instruction, ProcessingElement};

/// One accumulator per PE, each on its own line, so the partial sums do
/// not false-share.
pub const PARTIAL_STRIDE: u64 = LINE_SIZE_BYTES as u64;

pub struct Layout {
    pub a_base: u64,
    pub b_base: u64,
    pub partial_base: u64,
}

/// Place A, B and the accumulator block in backing memory. The
/// accumulators are rounded up to a line boundary.
pub fn layout(n: usize, num_pes: usize) -> Result<Layout, SimError> {
    let a_base = 0u64;
    let b_base = (n * WORD_SIZE) as u64;
    let vectors_end = b_base + (n * WORD_SIZE) as u64;
    let partial_base = (vectors_end + PARTIAL_STRIDE - 1) & !(PARTIAL_STRIDE - 1);
    let end = partial_base + num_pes as u64 * PARTIAL_STRIDE;
    if end > (MEM_SIZE_WORDS * WORD_SIZE) as u64 {
        return Err(SimError::OutOfRange { addr: end });
    }
    Ok(Layout {
        a_base,
        b_base,
        partial_base,
    })
}

/// Register convention:
///   R0 A element pointer, R1 B element pointer, R2 partial-sum pointer,
///   R3 iteration counter, R4 accumulator, R5-R7 temporaries.
pub fn dot_product_program() -> Vec<Instruction> {
    let mut code = vec![Instruction::Load { dst: 4, addr: 2 }];
    let loop_start = code.len();
    code.push(Instruction::Load { dst: 5, addr: 0 });
    code.push(Instruction::Load { dst: 6, addr: 1 });
    code.push(Instruction::Fmul { dst: 7, a: 5, b: 6 });
    code.push(Instruction::Fadd { dst: 4, a: 4, b: 7 });
    code.push(Instruction::Inc(0));
    code.push(Instruction::Inc(1));
    code.push(Instruction::Dec(3));
    code.push(Instruction::Jnz {
        reg: 3,
        target: loop_start,
    });
    code.push(Instruction::Store { src: 4, addr: 2 });
    code
}

/// Write A, B and zeroed partial sums into backing memory.
pub fn load_vectors(
    mem: &MainMemory,
    layout: &Layout,
    a: &[f64],
    b: &[f64],
    num_pes: usize,
) -> Result<(), SimError> {
    for (i, v) in a.iter().enumerate() {
        mem.write_double(layout.a_base + (i * WORD_SIZE) as u64, *v)?;
    }
    for (i, v) in b.iter().enumerate() {
        mem.write_double(layout.b_base + (i * WORD_SIZE) as u64, *v)?;
    }
    for p in 0..num_pes {
        mem.write_double(layout.partial_base + p as u64 * PARTIAL_STRIDE, 0.0)?;
    }
    Ok(())
}

/// Point a PE at its slice and load the program.
pub fn configure_pe(
    pe: &mut ProcessingElement,
    layout: &Layout,
    pe_idx: usize,
    n_per_pe: usize,
) -> Result<(), SimError> {
    let slice_off = (pe_idx * n_per_pe * WORD_SIZE) as u64;
    pe.set_reg(0, layout.a_base + slice_off)?;
    pe.set_reg(1, layout.b_base + slice_off)?;
    pe.set_reg(2, layout.partial_base + pe_idx as u64 * PARTIAL_STRIDE)?;
    pe.set_reg(3, n_per_pe as u64)?;
    pe.load_program(dot_product_program());
    Ok(())
}

/// Sum the partial results out of backing memory. Caches must have been
/// flushed first.
pub fn collect_result(mem: &MainMemory, layout: &Layout, num_pes: usize) -> Result<f64, SimError> {
    let mut total = 0.0;
    for p in 0..num_pes {
        total += mem.read_double(layout.partial_base + p as u64 * PARTIAL_STRIDE)?;
    }
    Ok(total)
}

pub fn serial_dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
