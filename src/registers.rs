use std::{mem, fmt};
use crate::{*, error::*};

// Register display for one stack frame. Values come either straight from the target's
// thread context (top frame) or from unwinding (everything below), in which case some
// of them are guesses - the dubious mask remembers which.
#[derive(Clone, Default)]
pub struct Registers {
    pub ints: [u64; RegisterIdx::COUNT],

    // Bitmask saying which values are populated in the array above (including dubious values).
    pub mask: u32,
    // Which of the values are just guesses.
    pub dubious_mask: u32,
}

#[repr(u8)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub enum RegisterIdx {
    // x86-64 registers.
    Rax = 0,
    Rdx = 1,
    Rcx = 2,
    Rbx = 3,
    Rsi = 4,
    Rdi = 5,
    Rbp = 6,
    Rsp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,

    // Things for unwinding. Not actually registers.
    Cfa = 17, // canonical frame address (caller's rsp at the call site)
    Ret = 18, // return address
}

impl RegisterIdx {
    pub const COUNT: usize = RegisterIdx::Ret as usize + 1;

    pub fn name(self) -> &'static str {
        REGISTER_NAMES[self as usize]
    }

    pub fn all() -> &'static [RegisterIdx] {
        &REGISTER_IDXS
    }
}

pub const REGISTER_IDXS: [RegisterIdx; RegisterIdx::COUNT] = [RegisterIdx::Rax, RegisterIdx::Rdx, RegisterIdx::Rcx, RegisterIdx::Rbx, RegisterIdx::Rsi, RegisterIdx::Rdi, RegisterIdx::Rbp, RegisterIdx::Rsp, RegisterIdx::R8, RegisterIdx::R9, RegisterIdx::R10, RegisterIdx::R11, RegisterIdx::R12, RegisterIdx::R13, RegisterIdx::R14, RegisterIdx::R15, RegisterIdx::Rip, RegisterIdx::Cfa, RegisterIdx::Ret];
pub const REGISTER_NAMES: [&'static str; RegisterIdx::COUNT] = ["rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rip", "cfa", "ret"];

impl Registers {
    pub fn has(&self, reg: RegisterIdx) -> bool { self.mask & 1u32 << reg as u32 != 0 }

    pub fn get(&self, reg: RegisterIdx) -> Result<(u64, /*dubious*/ bool)> {
        if !self.has(reg) {
            return err!(ProcessState, "register {} not available", reg.name());
        }
        Ok((self.ints[reg as usize], self.dubious_mask & 1u32 << reg as u32 != 0))
    }

    pub fn get_option(&self, reg: RegisterIdx) -> Option<(u64, bool)> {
        if self.has(reg) { Some((self.ints[reg as usize], self.dubious_mask & 1u32 << reg as u32 != 0)) } else { None }
    }

    pub fn set(&mut self, reg: RegisterIdx, val: u64, dubious: bool) {
        self.ints[reg as usize] = val;
        self.mask |= 1u32 << reg as u32;
        if dubious {
            self.dubious_mask |= 1u32 << reg as u32;
        } else {
            self.dubious_mask &= !(1u32 << reg as u32);
        }
    }

    pub fn clear(&mut self, reg: RegisterIdx) {
        self.mask &= !(1u32 << reg as u32);
        self.dubious_mask &= !(1u32 << reg as u32);
    }
}

impl fmt::Display for RegisterIdx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}", self.name()) }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for &reg in RegisterIdx::all() {
            if let Some((v, dubious)) = self.get_option(reg) {
                write!(f, "{}{}: 0x{:x}{}", if mem::replace(&mut first, false) {""} else {", "}, reg, v, if dubious {"?"} else {""})?;
            }
        }
        Ok(())
    }
}
