// Processing element: a small register machine over seven opcodes that
// drives one private cache. All memory traffic goes through the cache;
// the PE never touches backing memory or peer caches directly.

use std::sync::Arc;

use log::trace;

use crate::cache::Cache;
use crate::commons::{SimError, WORD_SIZE};

pub const NUM_REGS: usize = 8;

/// Operands name registers; `Load`/`Store` address memory through the
/// register given in `addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Load { dst: usize, addr: usize },
    Store { src: usize, addr: usize },
    Fmul { dst: usize, a: usize, b: usize },
    Fadd { dst: usize, a: usize, b: usize },
    /// Advance a register by one 8-byte word (pointer bump).
    Inc(usize),
    /// Decrement a register by 1 (loop counter).
    Dec(usize),
    /// Jump to `target` while the register is non-zero.
    Jnz { reg: usize, target: usize },
}

pub struct ProcessingElement {
    id: u32,
    regs: [u64; NUM_REGS],
    program: Vec<Instruction>,
    pc: usize,
    cache: Arc<Cache>,
    read_ops: u64,
    write_ops: u64,
}

impl ProcessingElement {
    pub fn new(id: u32, cache: Arc<Cache>) -> Self {
        ProcessingElement {
            id,
            regs: [0; NUM_REGS],
            program: Vec::new(),
            pc: 0,
            cache,
            read_ops: 0,
            write_ops: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn load_program(&mut self, program: Vec<Instruction>) {
        self.program = program;
        self.pc = 0;
    }

    pub fn finished(&self) -> bool {
        self.pc >= self.program.len()
    }

    /// Execute one instruction. Returns false once the program has run out.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let Some(&instr) = self.program.get(self.pc) else {
            return Ok(false);
        };
        trace!("PE{}: pc={} {:?}", self.id, self.pc, instr);
        match instr {
            Instruction::Load { dst, addr } => {
                let a = self.reg(addr)?;
                let (value, _hit) = self.cache.load_word(a)?;
                self.set_reg(dst, value)?;
                self.read_ops += 1;
                self.pc += 1;
            }
            Instruction::Store { src, addr } => {
                let a = self.reg(addr)?;
                let value = self.reg(src)?;
                self.cache.store_word(a, value)?;
                self.write_ops += 1;
                self.pc += 1;
            }
            Instruction::Fmul { dst, a, b } => {
                let x = f64::from_bits(self.reg(a)?);
                let y = f64::from_bits(self.reg(b)?);
                self.set_reg(dst, (x * y).to_bits())?;
                self.pc += 1;
            }
            Instruction::Fadd { dst, a, b } => {
                let x = f64::from_bits(self.reg(a)?);
                let y = f64::from_bits(self.reg(b)?);
                self.set_reg(dst, (x + y).to_bits())?;
                self.pc += 1;
            }
            Instruction::Inc(r) => {
                let v = self.reg(r)?;
                self.set_reg(r, v.wrapping_add(WORD_SIZE as u64))?;
                self.pc += 1;
            }
            Instruction::Dec(r) => {
                let v = self.reg(r)?;
                self.set_reg(r, v.wrapping_sub(1))?;
                self.pc += 1;
            }
            Instruction::Jnz { reg, target } => {
                if target >= self.program.len() {
                    return Err(SimError::BadJump {
                        target,
                        len: self.program.len(),
                    });
                }
                if self.reg(reg)? != 0 {
                    self.pc = target;
                } else {
                    self.pc += 1;
                }
            }
        }
        Ok(true)
    }

    /// Run the loaded program to completion.
    pub fn run(&mut self) -> Result<(), SimError> {
        while self.step()? {}
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pc = 0;
        self.regs = [0; NUM_REGS];
        self.reset_stats();
    }

    pub fn reg(&self, i: usize) -> Result<u64, SimError> {
        self.regs.get(i).copied().ok_or(SimError::BadRegister(i))
    }

    pub fn set_reg(&mut self, i: usize, value: u64) -> Result<(), SimError> {
        *self.regs.get_mut(i).ok_or(SimError::BadRegister(i))? = value;
        Ok(())
    }

    /// Bit-exact f64 view of a register.
    pub fn reg_double(&self, i: usize) -> Result<f64, SimError> {
        Ok(f64::from_bits(self.reg(i)?))
    }

    pub fn set_reg_double(&mut self, i: usize, value: f64) -> Result<(), SimError> {
        self.set_reg(i, value.to_bits())
    }

    pub fn read_ops(&self) -> u64 {
        self.read_ops
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops
    }

    pub fn reset_stats(&mut self) {
        self.read_ops = 0;
        self.write_ops = 0;
    }
}
