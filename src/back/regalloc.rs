//! The register allocator.
//!
//! A linear scan over a single linearized numbering of the function's
//! instructions.  Every non-fixed register gets a live interval spanning
//! its definition and all of its uses; intervals that are live across a
//! call must be placed in callee-saved registers, everything else draws
//! from the temporaries.  Intervals that find no free register are
//! spilled to 8-byte stack slots below the function's locals, with
//! reloads and store-backs rewritten around each use.
//!
//! Allocation binds each virtual register to a physical register's name
//! in the [RegFile], so no rewrite of the instruction stream is needed
//! except for spills.  The set of callee-saved registers actually used is
//! reported back to the driver, which re-runs selection until the set is
//! stable.

use log::debug;

use crate::back::asm::*;
use crate::back::codegen::{imm_fits, split_offset};
use crate::common::*;

/// Scratch registers reserved for spilled operands; never allocated.
const INT_SCRATCH: [usize; 2] = [5, 6]; // t5, t6
const FLOAT_SCRATCH: [usize; 2] = [10, 11]; // ft10, ft11

pub struct RegAllocator<'a> {
    func: &'a mut MachFunction,
    regs: &'a mut RegFile,
    offset: i32,
}

impl<'a> RegAllocator<'a> {
    /// `offset` is the frame offset after the selector placed all locals;
    /// spill slots are carved out below it.
    pub fn new(func: &'a mut MachFunction, regs: &'a mut RegFile, offset: i32) -> Self {
        RegAllocator { func, regs, offset }
    }

    /// Allocate; returns the callee-saved registers used and the frame
    /// offset including any spill slots.
    pub fn run(mut self) -> (Set<Reg>, i32) {
        let (intervals, calls) = self.collect_intervals();

        let mut free_int_tmp: Set<Reg> = self.regs.int_tmp[..INT_SCRATCH[0]]
            .iter()
            .copied()
            .collect();
        let mut free_float_tmp: Set<Reg> = self.regs.float_tmp[..FLOAT_SCRATCH[0]]
            .iter()
            .copied()
            .collect();
        let mut free_int_saved: Set<Reg> = self.regs.int_saved.iter().copied().collect();
        let mut free_float_saved: Set<Reg> = self.regs.float_saved.iter().copied().collect();

        let mut active: Vec<(u32, Reg, Reg)> = Vec::new();
        let mut assigned: Map<Reg, Reg> = Map::new();
        let mut spilled: Map<Reg, i32> = Map::new();
        let mut used_callee: Set<Reg> = Set::new();

        for &(vreg, start, end) in &intervals {
            // Expire intervals that ended before this one starts.
            active.retain(|&(act_end, _, phys)| {
                if act_end < start {
                    let pool = match (self.regs.is_float(phys), self.regs.is_callee_saved(phys)) {
                        (false, false) => &mut free_int_tmp,
                        (true, false) => &mut free_float_tmp,
                        (false, true) => &mut free_int_saved,
                        (true, true) => &mut free_float_saved,
                    };
                    pool.insert(phys);
                    false
                } else {
                    true
                }
            });

            let crosses_call = calls.iter().any(|&c| start < c && c < end);
            let float = self.regs.is_float(vreg);
            let (tmp_pool, saved_pool) = if float {
                (&mut free_float_tmp, &mut free_float_saved)
            } else {
                (&mut free_int_tmp, &mut free_int_saved)
            };

            let choice = if crosses_call {
                saved_pool.iter().next().copied()
            } else {
                tmp_pool
                    .iter()
                    .next()
                    .copied()
                    .or_else(|| saved_pool.iter().next().copied())
            };

            match choice {
                Some(phys) => {
                    if crosses_call || !tmp_pool.remove(&phys) {
                        saved_pool.remove(&phys);
                    }
                    if self.regs.is_callee_saved(phys) {
                        used_callee.insert(phys);
                    }
                    active.push((end, vreg, phys));
                    assigned.insert(vreg, phys);
                }
                None => {
                    self.offset -= 8;
                    spilled.insert(vreg, self.offset);
                    debug!("{}: spill {vreg:?} to {}", self.func.name, self.offset);
                }
            }
        }

        for (&vreg, &phys) in &assigned {
            self.regs.assign(vreg, phys);
        }
        self.rewrite_spills(&spilled);

        (used_callee, self.offset)
    }

    /// Number all instructions in layout order and compute each non-fixed
    /// register's interval, plus the positions of call instructions.
    fn collect_intervals(&mut self) -> (Vec<(Reg, u32, u32)>, Vec<u32>) {
        let mut ranges: Map<Reg, (u32, u32)> = Map::new();
        let mut calls = Vec::new();
        let mut pos = 0u32;
        for &bid in &self.func.layout {
            for inst in &self.func.block(bid).insts {
                let mut touch = |r: Reg| {
                    let range = ranges.entry(r).or_insert((pos, pos));
                    range.0 = range.0.min(pos);
                    range.1 = range.1.max(pos);
                };
                if let Some(d) = inst.dst() {
                    if !self.regs.is_fixed(d) {
                        touch(d);
                    }
                }
                for u in inst.uses() {
                    if !self.regs.is_fixed(u) {
                        touch(u);
                    }
                }
                if matches!(inst, Inst::Call { .. }) {
                    calls.push(pos);
                }
                pos += 1;
            }
        }

        let mut intervals: Vec<(Reg, u32, u32)> = ranges
            .into_iter()
            .map(|(r, (start, end))| (r, start, end))
            .collect();
        for &(r, start, end) in &intervals {
            self.regs.set_interval(r, (start, end));
        }
        intervals.sort_by_key(|&(r, start, _)| (start, r));
        (intervals, calls)
    }

    /// Rewrite every instruction touching a spilled register: reload each
    /// spilled source into a scratch register, store a spilled
    /// destination back to its slot.
    fn rewrite_spills(&mut self, spilled: &Map<Reg, i32>) {
        if spilled.is_empty() {
            return;
        }
        let s0 = self.regs.s0;
        let int_scratch = [
            self.regs.int_tmp[INT_SCRATCH[0]],
            self.regs.int_tmp[INT_SCRATCH[1]],
        ];
        let float_scratch = [
            self.regs.float_tmp[FLOAT_SCRATCH[0]],
            self.regs.float_tmp[FLOAT_SCRATCH[1]],
        ];

        for i in 0..self.func.layout.len() {
            let bid = self.func.layout[i];
            let old = std::mem::take(&mut self.func.block_mut(bid).insts);
            let mut new = Vec::with_capacity(old.len());
            for mut inst in old {
                let mut spilled_uses: Vec<Reg> = Vec::new();
                for u in inst.uses() {
                    if spilled.contains_key(&u) && !spilled_uses.contains(&u) {
                        spilled_uses.push(u);
                    }
                }
                let spilled_def = inst.dst().filter(|d| spilled.contains_key(d));

                // Value scratches are handed out from the front of the
                // reserved pair, address temporaries for float reloads
                // from the back; an instruction has at most two source
                // registers so the two never collide.
                let mut next_int = 0;
                let mut next_addr = int_scratch.len();
                let mut next_float = 0;
                let mut scratch_of: Map<Reg, Reg> = Map::new();
                for &v in &spilled_uses {
                    let slot = spilled[&v];
                    let scratch = if self.regs.is_float(v) {
                        let s = float_scratch[next_float];
                        next_float += 1;
                        next_addr -= 1;
                        let addr = int_scratch[next_addr];
                        self.reload(&mut new, LoadOp::Fld, s, addr, s0, slot);
                        s
                    } else {
                        let s = int_scratch[next_int];
                        next_int += 1;
                        self.reload(&mut new, LoadOp::Ld, s, s, s0, slot);
                        s
                    };
                    scratch_of.insert(v, scratch);
                    inst.replace_reg(v, scratch);
                }

                if let Some(d) = spilled_def {
                    let scratch = *scratch_of.entry(d).or_insert_with(|| {
                        if self.regs.is_float(d) {
                            float_scratch[0]
                        } else {
                            int_scratch[0]
                        }
                    });
                    inst.replace_reg(d, scratch);
                    new.push(inst);
                    // The other int scratch is dead once the instruction
                    // has executed, so it can hold the slot address.
                    let addr = if scratch == int_scratch[0] {
                        int_scratch[1]
                    } else {
                        int_scratch[0]
                    };
                    let op = if self.regs.is_float(d) {
                        StoreOp::Fsd
                    } else {
                        StoreOp::Sd
                    };
                    self.store_back(&mut new, op, scratch, addr, s0, spilled[&d]);
                } else {
                    new.push(inst);
                }
            }
            self.func.block_mut(bid).insts = new;
        }
    }

    fn reload(&self, out: &mut Vec<Inst>, op: LoadOp, dst: Reg, addr: Reg, s0: Reg, slot: i32) {
        if imm_fits(slot) {
            out.push(Inst::Load {
                op,
                dst,
                base: s0,
                offset: slot,
            });
        } else {
            let (hi20, lo12) = split_offset(slot);
            out.push(Inst::Imm {
                op: ImmOp::Lui,
                dst: addr,
                imm: hi20,
            });
            out.push(Inst::Binary {
                op: BinOp::Add,
                dst: addr,
                lhs: s0,
                rhs: addr,
            });
            out.push(Inst::Load {
                op,
                dst,
                base: addr,
                offset: lo12,
            });
        }
    }

    fn store_back(&self, out: &mut Vec<Inst>, op: StoreOp, src: Reg, addr: Reg, s0: Reg, slot: i32) {
        if imm_fits(slot) {
            out.push(Inst::Store {
                op,
                src,
                base: s0,
                offset: slot,
            });
        } else {
            let (hi20, lo12) = split_offset(slot);
            out.push(Inst::Imm {
                op: ImmOp::Lui,
                dst: addr,
                imm: hi20,
            });
            out.push(Inst::Binary {
                op: BinOp::Add,
                dst: addr,
                lhs: s0,
                rhs: addr,
            });
            out.push(Inst::Store {
                op,
                src,
                base: addr,
                offset: lo12,
            });
        }
    }
}
