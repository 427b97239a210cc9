//! The 64-bit RISC-V (RV64GC) machine IR.
//!
//! The backend keeps a thin, flat model of the machine: a register file
//! holding physical and virtual registers, a tagged instruction enum, and
//! per-function basic blocks that serialize to GNU-style assembly text.
//!
//! # Call stack frame
//!
//! The stack grows down and every frame is 16-byte aligned.  A finished
//! frame looks like this:
//!
//! ```txt
//!   High memory addresses
//!
//!   +--------------------------+
//!   | caller's frame           |
//!   +--------------------------+ <- s0 (and the caller's sp)
//!   | saved ra (if any call)   |
//!   | saved s0 (always)        |
//!   | used callee-saved regs   |
//!   | locals and spill slots   |
//!   | outgoing argument words  |
//!   +--------------------------+ <- sp
//!
//!   Low memory addresses
//! ```
//!
//! Locals are addressed at negative offsets from `s0`, which the prologue
//! points at the caller's stack pointer.  Arguments past the eighth of a
//! bank travel in the outgoing-argument words at the bottom of the
//! caller's frame, so the callee sees them at small positive offsets from
//! its own `s0`.
//!
//! # Registers
//!
//! - caller-saved: `a0`-`a7`, `fa0`-`fa7`, `t0`-`t6`, `ft0`-`ft11`.
//! - callee-saved: `s1`-`s11`, `fs0`-`fs11`.
//! - reserved: `zero`, `ra`, `sp`, and `s0` (the frame pointer).
//!
//! Virtual registers are created nameless by the instruction selector.
//! Allocation assigns each one the name of a physical register (or
//! rewrites its uses with spill code), so serialization never needs a
//! separate rename pass: printing a register prints its assigned name.

use std::fmt::Write as _;

use derive_more::Display;

use crate::common::*;

/// A register handle: an index into the backend's [RegFile].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Reg(u32);

struct RegInfo {
    name: Option<&'static str>,
    float: bool,
    fixed: bool,
    /// Live interval in linearized instruction positions, set by the
    /// register allocator for non-fixed registers.
    interval: Option<(u32, u32)>,
}

static INT_ARG_NAMES: [&str; 8] = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"];
static FLOAT_ARG_NAMES: [&str; 8] = ["fa0", "fa1", "fa2", "fa3", "fa4", "fa5", "fa6", "fa7"];
static INT_TMP_NAMES: [&str; 7] = ["t0", "t1", "t2", "t3", "t4", "t5", "t6"];
static FLOAT_TMP_NAMES: [&str; 12] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "ft8", "ft9", "ft10", "ft11",
];
static INT_SAVED_NAMES: [&str; 11] = [
    "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
];
static FLOAT_SAVED_NAMES: [&str; 12] = [
    "fs0", "fs1", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9", "fs10", "fs11",
];

/// The register file: every physical register plus all virtual registers
/// created during selection.
pub struct RegFile {
    regs: Vec<RegInfo>,
    pub ra: Reg,
    pub sp: Reg,
    pub s0: Reg,
    pub zero: Reg,
    /// `a0`-`a7`.
    pub int_arg: Vec<Reg>,
    /// `fa0`-`fa7`.
    pub float_arg: Vec<Reg>,
    /// `t0`-`t6`.
    pub int_tmp: Vec<Reg>,
    /// `ft0`-`ft11`.
    pub float_tmp: Vec<Reg>,
    /// `s1`-`s11`.
    pub int_saved: Vec<Reg>,
    /// `fs0`-`fs11`.
    pub float_saved: Vec<Reg>,
}

impl RegFile {
    pub fn new() -> Self {
        fn fixed(regs: &mut Vec<RegInfo>, name: &'static str, float: bool) -> Reg {
            let id = Reg(regs.len() as u32);
            regs.push(RegInfo {
                name: Some(name),
                float,
                fixed: true,
                interval: None,
            });
            id
        }

        let mut regs = Vec::new();
        let ra = fixed(&mut regs, "ra", false);
        let sp = fixed(&mut regs, "sp", false);
        let s0 = fixed(&mut regs, "s0", false);
        let zero = fixed(&mut regs, "zero", false);
        let int_arg = INT_ARG_NAMES
            .iter()
            .map(|&n| fixed(&mut regs, n, false))
            .collect();
        let float_arg = FLOAT_ARG_NAMES
            .iter()
            .map(|&n| fixed(&mut regs, n, true))
            .collect();
        let int_tmp = INT_TMP_NAMES
            .iter()
            .map(|&n| fixed(&mut regs, n, false))
            .collect();
        let float_tmp = FLOAT_TMP_NAMES
            .iter()
            .map(|&n| fixed(&mut regs, n, true))
            .collect();
        let int_saved = INT_SAVED_NAMES
            .iter()
            .map(|&n| fixed(&mut regs, n, false))
            .collect();
        let float_saved = FLOAT_SAVED_NAMES
            .iter()
            .map(|&n| fixed(&mut regs, n, true))
            .collect();

        RegFile {
            regs,
            ra,
            sp,
            s0,
            zero,
            int_arg,
            float_arg,
            int_tmp,
            float_tmp,
            int_saved,
            float_saved,
        }
    }

    /// Create a fresh virtual register in the given bank.
    pub fn new_vreg(&mut self, float: bool) -> Reg {
        let id = Reg(self.regs.len() as u32);
        self.regs.push(RegInfo {
            name: None,
            float,
            fixed: false,
            interval: None,
        });
        id
    }

    /// The register's assembly name.  Panics on a virtual register the
    /// allocator has not assigned; reaching here with one is a bug.
    pub fn name(&self, r: Reg) -> &'static str {
        self.regs[r.0 as usize]
            .name
            .unwrap_or_else(|| panic!("virtual register v{} was never allocated", r.0))
    }

    pub fn is_float(&self, r: Reg) -> bool {
        self.regs[r.0 as usize].float
    }

    pub fn is_fixed(&self, r: Reg) -> bool {
        self.regs[r.0 as usize].fixed
    }

    /// Bind a virtual register to a physical register's name.
    pub fn assign(&mut self, vreg: Reg, phys: Reg) {
        debug_assert!(!self.is_fixed(vreg));
        self.regs[vreg.0 as usize].name = self.regs[phys.0 as usize].name;
    }

    pub fn set_interval(&mut self, r: Reg, interval: (u32, u32)) {
        self.regs[r.0 as usize].interval = Some(interval);
    }

    pub fn interval(&self, r: Reg) -> Option<(u32, u32)> {
        self.regs[r.0 as usize].interval
    }

    pub fn is_callee_saved(&self, r: Reg) -> bool {
        self.int_saved.contains(&r) || self.float_saved.contains(&r)
    }
}

impl Default for RegFile {
    fn default() -> Self {
        RegFile::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum LoadOp {
    #[display("lw")]
    Lw,
    #[display("ld")]
    Ld,
    #[display("flw")]
    Flw,
    #[display("fld")]
    Fld,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum StoreOp {
    #[display("sw")]
    Sw,
    #[display("sd")]
    Sd,
    #[display("fsw")]
    Fsw,
    #[display("fsd")]
    Fsd,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum ImmOp {
    #[display("li")]
    Li,
    #[display("lui")]
    Lui,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum UnaryOp {
    #[display("mv")]
    Mv,
    #[display("fmv.s")]
    FmvS,
    #[display("fmv.w.x")]
    FmvWX,
    #[display("fcvt.s.w")]
    FcvtSW,
    #[display("fcvt.w.s")]
    FcvtWS,
    #[display("seqz")]
    Seqz,
    #[display("snez")]
    Snez,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BinOp {
    #[display("add")]
    Add,
    #[display("addw")]
    Addw,
    #[display("subw")]
    Subw,
    #[display("mul")]
    Mul,
    #[display("mulw")]
    Mulw,
    #[display("divw")]
    Divw,
    #[display("remw")]
    Remw,
    #[display("slt")]
    Slt,
    #[display("xor")]
    Xor,
    #[display("fadd.s")]
    FaddS,
    #[display("fsub.s")]
    FsubS,
    #[display("fmul.s")]
    FmulS,
    #[display("fdiv.s")]
    FdivS,
    #[display("flt.s")]
    FltS,
    #[display("fle.s")]
    FleS,
    #[display("feq.s")]
    FeqS,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BinImmOp {
    #[display("addi")]
    Addi,
    #[display("addiw")]
    Addiw,
    #[display("slli")]
    Slli,
    #[display("slti")]
    Slti,
    #[display("xori")]
    Xori,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BranchOp {
    #[display("beq")]
    Beq,
    #[display("bne")]
    Bne,
    #[display("blt")]
    Blt,
    #[display("bge")]
    Bge,
}

/// A machine basic block handle within a [MachFunction]'s block arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct BlockId(pub usize);

/// One machine instruction.  Prior to register allocation every
/// destination is a freshly created virtual register with a single
/// defining instruction (the `fmv.w.x` join of the float-compare
/// conversion pattern being the sole exception).
#[derive(Clone, PartialEq, Debug)]
pub enum Inst {
    Load {
        op: LoadOp,
        dst: Reg,
        base: Reg,
        offset: i32,
    },
    Store {
        op: StoreOp,
        src: Reg,
        base: Reg,
        offset: i32,
    },
    Imm {
        op: ImmOp,
        dst: Reg,
        imm: i32,
    },
    /// Load the address of a symbol.
    La {
        dst: Reg,
        symbol: String,
    },
    Unary {
        op: UnaryOp,
        dst: Reg,
        src: Reg,
    },
    Binary {
        op: BinOp,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    BinaryImm {
        op: BinImmOp,
        dst: Reg,
        src: Reg,
        imm: i32,
    },
    Jump {
        target: BlockId,
    },
    CondJump {
        op: BranchOp,
        lhs: Reg,
        rhs: Reg,
        target: BlockId,
    },
    Call {
        callee: String,
        /// `a0`/`fa0` when the callee returns a value.
        result: Option<Reg>,
        /// The argument registers the call reads.
        args: Vec<Reg>,
    },
    Ret,
}

impl Inst {
    /// The register this instruction defines, if any.
    pub fn dst(&self) -> Option<Reg> {
        match self {
            Inst::Load { dst, .. }
            | Inst::Imm { dst, .. }
            | Inst::La { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::BinaryImm { dst, .. } => Some(*dst),
            Inst::Call { result, .. } => *result,
            Inst::Store { .. } | Inst::Jump { .. } | Inst::CondJump { .. } | Inst::Ret => None,
        }
    }

    /// The registers this instruction reads.
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Inst::Load { base, .. } => vec![*base],
            Inst::Store { src, base, .. } => vec![*src, *base],
            Inst::Imm { .. } | Inst::La { .. } | Inst::Jump { .. } | Inst::Ret => vec![],
            Inst::Unary { src, .. } => vec![*src],
            Inst::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::BinaryImm { src, .. } => vec![*src],
            Inst::CondJump { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::Call { args, .. } => args.clone(),
        }
    }

    /// Substitute every occurrence of a register, reads and writes alike.
    pub fn replace_reg(&mut self, from: Reg, to: Reg) {
        let sub = |r: &mut Reg| {
            if *r == from {
                *r = to;
            }
        };
        match self {
            Inst::Load { dst, base, .. } => {
                sub(dst);
                sub(base);
            }
            Inst::Store { src, base, .. } => {
                sub(src);
                sub(base);
            }
            Inst::Imm { dst, .. } | Inst::La { dst, .. } => sub(dst),
            Inst::Unary { dst, src, .. } => {
                sub(dst);
                sub(src);
            }
            Inst::Binary { dst, lhs, rhs, .. } => {
                sub(dst);
                sub(lhs);
                sub(rhs);
            }
            Inst::BinaryImm { dst, src, .. } => {
                sub(dst);
                sub(src);
            }
            Inst::CondJump { lhs, rhs, .. } => {
                sub(lhs);
                sub(rhs);
            }
            Inst::Call { result, args, .. } => {
                if let Some(r) = result {
                    sub(r);
                }
                for a in args {
                    sub(a);
                }
            }
            Inst::Jump { .. } | Inst::Ret => {}
        }
    }
}

pub struct MachBlock {
    pub label: String,
    pub insts: Vec<Inst>,
    pub is_entry: bool,
}

/// A machine-level function: a block arena plus the order blocks are laid
/// out in the final text.
pub struct MachFunction {
    pub name: String,
    blocks: Vec<MachBlock>,
    pub layout: Vec<BlockId>,
    /// Callee-saved registers the allocator ended up using.
    pub need_push: Set<Reg>,
}

impl MachFunction {
    pub fn new(name: impl Into<String>) -> Self {
        MachFunction {
            name: name.into(),
            blocks: Vec::new(),
            layout: Vec::new(),
            need_push: Set::new(),
        }
    }

    /// Create a block in the arena without placing it in the layout.
    pub fn new_block(&mut self, label: String, is_entry: bool) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(MachBlock {
            label,
            insts: Vec::new(),
            is_entry,
        });
        id
    }

    /// Append a block to the layout.
    pub fn place(&mut self, block: BlockId) {
        self.layout.push(block);
    }

    /// Drop all blocks and layout for a fresh selection pass.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.layout.clear();
    }

    pub fn block(&self, id: BlockId) -> &MachBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut MachBlock {
        &mut self.blocks[id.0]
    }

    pub fn label(&self, id: BlockId) -> &str {
        &self.blocks[id.0].label
    }

    /// Serialize the function to assembly text.
    pub fn write_text(&self, regs: &RegFile, out: &mut String) {
        writeln!(out, "\t.globl\t{}", self.name).unwrap();
        writeln!(out, "{}:", self.name).unwrap();
        for &id in &self.layout {
            let block = self.block(id);
            if !block.is_entry {
                writeln!(out, "{}:", block.label).unwrap();
            }
            for inst in &block.insts {
                self.write_inst(inst, regs, out);
            }
        }
        writeln!(out, "\t.size\t{0}, .-{0}", self.name).unwrap();
        out.push('\n');
    }

    fn write_inst(&self, inst: &Inst, regs: &RegFile, out: &mut String) {
        let r = |reg: Reg| regs.name(reg);
        match inst {
            Inst::Load {
                op,
                dst,
                base,
                offset,
            } => writeln!(out, "\t{op}\t{}, {offset}({})", r(*dst), r(*base)),
            Inst::Store {
                op,
                src,
                base,
                offset,
            } => writeln!(out, "\t{op}\t{}, {offset}({})", r(*src), r(*base)),
            Inst::Imm { op, dst, imm } => writeln!(out, "\t{op}\t{}, {imm}", r(*dst)),
            Inst::La { dst, symbol } => writeln!(out, "\tla\t{}, {symbol}", r(*dst)),
            Inst::Unary { op, dst, src } => match op {
                // fcvt.w.s must truncate toward zero
                UnaryOp::FcvtWS => writeln!(out, "\t{op}\t{}, {}, rtz", r(*dst), r(*src)),
                _ => writeln!(out, "\t{op}\t{}, {}", r(*dst), r(*src)),
            },
            Inst::Binary { op, dst, lhs, rhs } => {
                writeln!(out, "\t{op}\t{}, {}, {}", r(*dst), r(*lhs), r(*rhs))
            }
            Inst::BinaryImm { op, dst, src, imm } => {
                writeln!(out, "\t{op}\t{}, {}, {imm}", r(*dst), r(*src))
            }
            Inst::Jump { target } => writeln!(out, "\tj\t{}", self.label(*target)),
            Inst::CondJump {
                op,
                lhs,
                rhs,
                target,
            } => writeln!(
                out,
                "\t{op}\t{}, {}, {}",
                r(*lhs),
                r(*rhs),
                self.label(*target)
            ),
            Inst::Call { callee, .. } => writeln!(out, "\tcall\t{callee}"),
            Inst::Ret => writeln!(out, "\tret"),
        }
        .unwrap()
    }
}
