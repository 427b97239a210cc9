//! The instruction selector and frame finalizer.
//!
//! Selection walks each AtomIR function, mapping SSA values to machine
//! registers and expanding each IR operation into a short machine
//! sequence.  The register allocator then assigns physical registers and
//! reports which callee-saved registers it used; since the size of the
//! callee-saved save area shifts every local's frame offset, selection
//! and allocation are re-run until the callee-saved set stops changing.
//! Only then is the prologue/epilogue materialized.

use std::fmt::Write as _;

use log::debug;

use crate::back::asm::*;
use crate::back::regalloc::RegAllocator;
use crate::common::*;
use crate::middle::ir::{self, Constant, Operand, ParamOrdinals, Type, ValueId};

/// Generate assembly text for a whole module.
pub fn code_gen(module: &ir::Module) -> String {
    CodeGen::new(module).run()
}

/// Is `offset` encodable as an I-type 12-bit signed immediate?
pub fn imm_fits(offset: i32) -> bool {
    (-2048..=2047).contains(&offset)
}

/// Split an out-of-range offset into a `lui` upper part and a 12-bit
/// remainder, compensating for the sign extension of the low half.
pub fn split_offset(offset: i32) -> (i32, i32) {
    let mut hi20 = ((offset as u32) >> 12) as i32;
    let mut lo12 = offset & 0xfff;
    if lo12 > 2047 {
        lo12 -= 4096;
        hi20 += 1;
    }
    (hi20, lo12)
}

pub struct CodeGen<'m> {
    module: &'m ir::Module,
    regs: RegFile,
    out: String,
    /// Float literals interned by bit pattern, each with its `.LC<n>` label.
    float_labels: Map<u32, String>,
    bb_index: u32,

    // Per-function selection state, reset on every fixed-point pass.
    func: MachFunction,
    offset: i32,
    max_out_args: i32,
    value_reg: Map<ValueId, Reg>,
    value_offset: Map<ValueId, i32>,
    param_on_stack: Set<ValueId>,
    bb_map: Map<usize, BlockId>,
    cur: BlockId,
    entry: BlockId,
    ret_bb: BlockId,
}

impl<'m> CodeGen<'m> {
    pub fn new(module: &'m ir::Module) -> Self {
        CodeGen {
            module,
            regs: RegFile::new(),
            out: String::new(),
            float_labels: Map::new(),
            bb_index: 0,
            func: MachFunction::new(""),
            offset: 0,
            max_out_args: 0,
            value_reg: Map::new(),
            value_offset: Map::new(),
            param_on_stack: Set::new(),
            bb_map: Map::new(),
            cur: BlockId(0),
            entry: BlockId(0),
            ret_bb: BlockId(0),
        }
    }

    pub fn run(mut self) -> String {
        let module = self.module;
        if !module.globals.is_empty() {
            self.out.push_str("\t.data\n");
        }
        for global in &module.globals {
            self.emit_global(global);
        }

        if !module.functions.is_empty() {
            self.out.push_str("\t.text\n");
        }
        for func in &module.functions {
            self.emit_function(func);
        }

        if !self.float_labels.is_empty() {
            // "aw",@progbits is load-bearing: without it the literals are
            // not materialized at run time
            self.out.push_str("\t.section\t.sdata,\"aw\",@progbits\n");
            self.out.push_str("\t.p2align\t2\n");
            for (bits, label) in &self.float_labels {
                writeln!(self.out, "{label}:").unwrap();
                writeln!(self.out, "\t.word\t{}", *bits as i32).unwrap();
            }
        }
        self.out
    }

    fn emit_global(&mut self, var: &ir::GlobalVariable) {
        fn word(c: &Constant) -> i32 {
            match c {
                Constant::Int(v) => *v,
                Constant::Float(v) => v.to_bits() as i32,
            }
        }

        writeln!(self.out, "\t.type\t{},@object", var.name).unwrap();
        writeln!(self.out, "\t.globl\t{}", var.name).unwrap();
        self.out.push_str("\t.p2align\t2\n");
        writeln!(self.out, "{}:", var.name).unwrap();
        let mut size = 0;
        match &var.init {
            ir::GlobalInit::Scalar(c) => {
                size = 4;
                writeln!(self.out, "\t.word\t{}", word(c)).unwrap();
            }
            ir::GlobalInit::Array(runs) => {
                for (count, elements) in runs {
                    if elements.is_empty() {
                        size += *count as i32 * 4;
                        writeln!(self.out, "\t.zero\t{}", count * 4).unwrap();
                    } else {
                        for element in elements {
                            size += 4;
                            writeln!(self.out, "\t.word\t{}", word(element)).unwrap();
                        }
                    }
                }
            }
        }
        writeln!(self.out, "\t.size\t{}, {size}\n", var.name).unwrap();
    }

    fn emit_function(&mut self, f: &ir::Function) {
        self.func = MachFunction::new(f.name.as_str());
        let mut passes = 0;
        loop {
            passes += 1;
            let prev_push = self.func.need_push.clone();

            // Reset all per-function selection state.
            self.offset = if f.has_call { -16 } else { -8 };
            self.offset -= prev_push.len() as i32 * 8;
            self.max_out_args = 0;
            self.value_reg.clear();
            self.value_offset.clear();
            self.param_on_stack.clear();
            self.bb_map.clear();
            self.func.clear();

            // Stage parameters: the first eight of each bank arrive in
            // registers, the rest stay where the caller put them.
            let mut int_order = 0;
            let mut float_order = 0;
            for &param in &f.params {
                if f.value_ty(param).is_float() {
                    if float_order < 8 {
                        self.value_reg.insert(param, self.regs.float_arg[float_order]);
                        float_order += 1;
                    } else {
                        self.param_on_stack.insert(param);
                    }
                } else if int_order < 8 {
                    self.value_reg.insert(param, self.regs.int_arg[int_order]);
                    int_order += 1;
                } else {
                    self.param_on_stack.insert(param);
                }
            }

            self.entry = self.new_block(true);
            self.func.place(self.entry);
            for i in 0..f.blocks.len() {
                let id = self.new_block(false);
                self.bb_map.insert(i, id);
            }
            self.ret_bb = self.func.new_block(format!(".{}_ret", f.name), false);

            for (i, bb) in f.blocks.iter().enumerate() {
                self.cur = self.bb_map[&i];
                self.func.place(self.cur);
                for inst in &bb.insts {
                    self.emit_inst(f, inst);
                }
            }
            self.func.place(self.ret_bb);

            let (used, final_offset) =
                RegAllocator::new(&mut self.func, &mut self.regs, self.offset).run();
            self.offset = final_offset;
            self.func.need_push = used;
            if self.func.need_push == prev_push {
                break;
            }
            debug!(
                "{}: callee-saved set changed after pass {passes}, reselecting",
                f.name
            );
        }
        debug!("{}: converged after {passes} pass(es)", f.name);

        self.finalize_frame(f);
        self.func.write_text(&self.regs, &mut self.out);
    }

    fn new_block(&mut self, is_entry: bool) -> BlockId {
        let label = format!(".LBB{}", self.bb_index);
        self.bb_index += 1;
        self.func.new_block(label, is_entry)
    }

    fn push(&mut self, inst: Inst) {
        let cur = self.cur;
        self.func.block_mut(cur).insts.push(inst);
    }

    fn vreg(&mut self, float: bool) -> Reg {
        self.regs.new_vreg(float)
    }

    fn emit_bin(&mut self, op: BinOp, lhs: Reg, rhs: Reg, float_dst: bool) -> Reg {
        let dst = self.vreg(float_dst);
        self.push(Inst::Binary { op, dst, lhs, rhs });
        dst
    }

    fn emit_bin_imm(&mut self, op: BinImmOp, src: Reg, imm: i32) -> Reg {
        let dst = self.vreg(false);
        self.push(Inst::BinaryImm { op, dst, src, imm });
        dst
    }

    fn emit_un(&mut self, op: UnaryOp, src: Reg, float_dst: bool) -> Reg {
        let dst = self.vreg(float_dst);
        self.push(Inst::Unary { op, dst, src });
        dst
    }

    fn load_const_int(&mut self, value: i32) -> Reg {
        let dst = self.vreg(false);
        self.push(Inst::Imm {
            op: ImmOp::Li,
            dst,
            imm: value,
        });
        dst
    }

    fn load_const_float(&mut self, value: f32) -> Reg {
        let bits = value.to_bits();
        let next = self.float_labels.len();
        let label = self
            .float_labels
            .entry(bits)
            .or_insert_with(|| format!(".LC{next}"))
            .clone();
        let addr = self.vreg(false);
        self.push(Inst::La { dst: addr, symbol: label });
        let dst = self.vreg(true);
        self.push(Inst::Load {
            op: LoadOp::Flw,
            dst,
            base: addr,
            offset: 0,
        });
        dst
    }

    fn reg_from_operand(&mut self, op: &Operand) -> Reg {
        match op {
            Operand::Const(Constant::Int(v)) => self.load_const_int(*v),
            Operand::Const(Constant::Float(v)) => self.load_const_float(*v),
            Operand::Global(name) => {
                let dst = self.vreg(false);
                self.push(Inst::La {
                    dst,
                    symbol: name.to_string(),
                });
                dst
            }
            Operand::Value(v) => *self
                .value_reg
                .get(v)
                .unwrap_or_else(|| panic!("value {v} has no register binding")),
        }
    }

    /// The stack offset a pointer operand addresses at, if any.
    fn operand_offset(&self, op: &Operand) -> i32 {
        match op {
            Operand::Value(v) => self.value_offset.get(v).copied().unwrap_or(0),
            _ => 0,
        }
    }

    /// The immediate-range helper: reduce an out-of-range offset to its
    /// low 12 bits by adding the upper part to the base register.
    fn legalize_offset(&mut self, base: Reg, offset: i32) -> (Reg, i32) {
        if imm_fits(offset) {
            return (base, offset);
        }
        let (hi20, lo12) = split_offset(offset);
        let hi = self.vreg(false);
        self.push(Inst::Imm {
            op: ImmOp::Lui,
            dst: hi,
            imm: hi20,
        });
        let dst = self.emit_bin(BinOp::Add, base, hi, false);
        (dst, lo12)
    }

    fn emit_inst(&mut self, f: &ir::Function, inst: &ir::Instruction) {
        match inst {
            ir::Instruction::Alloc { result, for_param } => {
                self.emit_alloc(f, *result, *for_param)
            }
            ir::Instruction::Store { value, dest } => self.emit_store(f, value, dest),
            ir::Instruction::Unary {
                op,
                result,
                operand,
            } => self.emit_unary(f, *op, *result, operand),
            ir::Instruction::Binary {
                op,
                result,
                lhs,
                rhs,
            } => self.emit_binary(f, *op, *result, lhs, rhs),
            ir::Instruction::Gep {
                result,
                ptr,
                indexes,
            } => self.emit_gep(f, *result, ptr, indexes),
            ir::Instruction::BitCast { result, ptr } => self.emit_bitcast(*result, ptr),
            ir::Instruction::Call {
                result,
                callee,
                args,
            } => self.emit_call(f, *result, *callee, args),
            ir::Instruction::Ret { value } => self.emit_ret(f, value.as_ref()),
            ir::Instruction::Jump { target } => {
                let target = self.bb_map[&target.0];
                self.push(Inst::Jump { target });
            }
            ir::Instruction::CondJump {
                op,
                lhs,
                rhs,
                tt,
                ff,
            } => self.emit_cond_jump(f, *op, lhs, rhs, *tt, *ff),
        }
    }

    fn emit_alloc(&mut self, f: &ir::Function, result: ValueId, for_param: Option<ParamOrdinals>) {
        self.value_reg.insert(result, self.regs.s0);

        let ty = f.value_ty(result).base_type();
        if let Some(ord) = for_param {
            // A parameter past the eighth of its bank already lives in the
            // caller's outgoing-argument area, at a positive offset from s0.
            let int_num = ord.int_num as i32;
            let float_num = ord.float_num as i32;
            if !ty.is_float() && int_num > 8 {
                let home = (int_num - 8 + (float_num - 8).max(0) - 1) * 8;
                self.value_offset.insert(result, home);
                return;
            } else if ty.is_float() && float_num > 8 {
                let home = (float_num - 8 + (int_num - 8).max(0) - 1) * 8;
                self.value_offset.insert(result, home);
                return;
            }
        }
        self.offset -= ty.byte_len();
        self.value_offset.insert(result, self.offset);
    }

    fn emit_store(&mut self, f: &ir::Function, value: &Operand, dest: &Operand) {
        // A stack-resident parameter is already in its slot.
        if let Operand::Value(v) = value {
            if self.param_on_stack.contains(v) {
                return;
            }
        }
        let src = self.reg_from_operand(value);
        let base = self.reg_from_operand(dest);
        let offset = self.operand_offset(dest);

        let value_ty = f.operand_ty(self.module, value);
        let op = if value_ty == Type::Int32 {
            StoreOp::Sw
        } else if value_ty.is_pointer() {
            StoreOp::Sd
        } else {
            StoreOp::Fsw
        };

        let (base, offset) = self.legalize_offset(base, offset);
        self.push(Inst::Store {
            op,
            src,
            base,
            offset,
        });
    }

    fn emit_unary(&mut self, f: &ir::Function, op: ir::UnaryOp, result: ValueId, operand: &Operand) {
        let src = self.reg_from_operand(operand);
        match op {
            ir::UnaryOp::Load => {
                let offset = self.operand_offset(operand);
                let (base, offset) = self.legalize_offset(src, offset);
                let result_ty = f.value_ty(result);
                let (op, float) = if result_ty.is_pointer() {
                    (LoadOp::Ld, false)
                } else if result_ty.is_float() {
                    (LoadOp::Flw, true)
                } else {
                    (LoadOp::Lw, false)
                };
                let dst = self.vreg(float);
                self.push(Inst::Load {
                    op,
                    dst,
                    base,
                    offset,
                });
                self.value_reg.insert(result, dst);
            }
            ir::UnaryOp::Itof => {
                // A float equality feeding a conversion would turn a 0/1
                // flag into garbage through fcvt; branch to materialize
                // 1.0 or 0.0 instead.
                let fed_by_feq = self
                    .func
                    .block(self.cur)
                    .insts
                    .iter()
                    .any(|i| matches!(i, Inst::Binary { op: BinOp::FeqS, dst, .. } if *dst == src));
                if fed_by_feq {
                    let one_bb = self.new_block(false);
                    self.func.place(one_bb);
                    let zero_bb = self.new_block(false);
                    self.func.place(zero_bb);
                    let after_bb = self.new_block(false);
                    self.func.place(after_bb);

                    let zero = self.regs.zero;
                    self.push(Inst::CondJump {
                        op: BranchOp::Beq,
                        lhs: src,
                        rhs: zero,
                        target: zero_bb,
                    });
                    self.push(Inst::Jump { target: one_bb });

                    self.cur = one_bb;
                    let dst = self.load_const_float(1.0);
                    self.push(Inst::Jump { target: after_bb });

                    self.cur = zero_bb;
                    self.push(Inst::Unary {
                        op: UnaryOp::FmvWX,
                        dst,
                        src: zero,
                    });
                    self.push(Inst::Jump { target: after_bb });

                    self.cur = after_bb;
                    self.value_reg.insert(result, dst);
                    return;
                }
                let dst = self.emit_un(UnaryOp::FcvtSW, src, true);
                self.value_reg.insert(result, dst);
            }
            ir::UnaryOp::Ftoi => {
                let dst = self.emit_un(UnaryOp::FcvtWS, src, false);
                self.value_reg.insert(result, dst);
            }
        }
    }

    fn emit_binary(
        &mut self,
        f: &ir::Function,
        op: ir::BinOp,
        result: ValueId,
        lhs: &Operand,
        rhs: &Operand,
    ) {
        let float = f.operand_ty(self.module, lhs).is_float()
            || f.operand_ty(self.module, rhs).is_float();
        let dst = if float {
            self.emit_float_binary(op, lhs, rhs)
        } else {
            self.emit_int_binary(op, lhs, rhs)
        };
        self.value_reg.insert(result, dst);
    }

    fn emit_int_binary(&mut self, op: ir::BinOp, lhs: &Operand, rhs: &Operand) -> Reg {
        use ir::BinOp as Op;

        // Fold a constant operand into the immediate where the opcode (or
        // a comparison rewrite) allows it; otherwise materialize it.
        let src1: Reg;
        let mut src2: Option<Reg> = None;
        let mut imm = 0;
        let mut need_xor = false;
        if let Operand::Const(Constant::Int(c)) = lhs {
            imm = *c;
            match op {
                Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Lt => {
                    src1 = self.load_const_int(imm);
                    src2 = Some(self.reg_from_operand(rhs));
                }
                Op::Le => {
                    src1 = self.load_const_int(imm - 1);
                    src2 = Some(self.reg_from_operand(rhs));
                }
                Op::Gt => {
                    src1 = self.reg_from_operand(rhs);
                }
                Op::Ge => {
                    imm += 1;
                    src1 = self.reg_from_operand(rhs);
                }
                Op::Eq | Op::Ne => {
                    imm = -imm;
                    src1 = self.reg_from_operand(rhs);
                }
                _ => {
                    src1 = self.reg_from_operand(rhs);
                }
            }
        } else if let Operand::Const(Constant::Int(c)) = rhs {
            imm = *c;
            match op {
                Op::Sub => {
                    imm = -imm;
                    src1 = self.reg_from_operand(lhs);
                }
                Op::Mul | Op::Div | Op::Mod => {
                    src1 = self.reg_from_operand(lhs);
                    src2 = Some(self.load_const_int(imm));
                }
                Op::Le => {
                    imm += 1;
                    src1 = self.reg_from_operand(lhs);
                }
                Op::Gt => {
                    src1 = self.load_const_int(imm);
                    src2 = Some(self.reg_from_operand(lhs));
                }
                Op::Ge => {
                    src1 = self.load_const_int(imm - 1);
                    src2 = Some(self.reg_from_operand(lhs));
                }
                Op::Eq | Op::Ne => {
                    imm = -imm;
                    src1 = self.reg_from_operand(lhs);
                }
                _ => {
                    src1 = self.reg_from_operand(lhs);
                }
            }
        } else {
            match op {
                Op::Le => {
                    need_xor = true;
                    src1 = self.reg_from_operand(rhs);
                    src2 = Some(self.reg_from_operand(lhs));
                }
                Op::Gt => {
                    src1 = self.reg_from_operand(rhs);
                    src2 = Some(self.reg_from_operand(lhs));
                }
                Op::Ge => {
                    need_xor = true;
                    src1 = self.reg_from_operand(lhs);
                    src2 = Some(self.reg_from_operand(rhs));
                }
                _ => {
                    src1 = self.reg_from_operand(lhs);
                    src2 = Some(self.reg_from_operand(rhs));
                }
            }
        }

        let mut dst = match op {
            Op::Add | Op::Sub => match src2 {
                Some(src2) => {
                    let mach = if op == Op::Add { BinOp::Addw } else { BinOp::Subw };
                    self.emit_bin(mach, src1, src2, false)
                }
                None => {
                    let (src1, imm) = self.legalize_offset(src1, imm);
                    self.emit_bin_imm(BinImmOp::Addiw, src1, imm)
                }
            },
            Op::Mul => self.emit_bin(BinOp::Mulw, src1, src2.unwrap(), false),
            Op::Div => self.emit_bin(BinOp::Divw, src1, src2.unwrap(), false),
            Op::Mod => self.emit_bin(BinOp::Remw, src1, src2.unwrap(), false),
            Op::Lt | Op::Le | Op::Gt | Op::Ge => match src2 {
                Some(src2) => self.emit_bin(BinOp::Slt, src1, src2, false),
                None if imm_fits(imm) => self.emit_bin_imm(BinImmOp::Slti, src1, imm),
                None => {
                    let src2 = self.load_const_int(imm);
                    self.emit_bin(BinOp::Slt, src1, src2, false)
                }
            },
            Op::Eq | Op::Ne => match src2 {
                Some(src2) => self.emit_bin(BinOp::Xor, src1, src2, false),
                None => {
                    let (src1, imm) = self.legalize_offset(src1, imm);
                    self.emit_bin_imm(BinImmOp::Addi, src1, imm)
                }
            },
        };
        if need_xor {
            // revert the comparison result
            dst = self.emit_bin_imm(BinImmOp::Xori, dst, 1);
        }
        if op == Op::Eq {
            dst = self.emit_un(UnaryOp::Seqz, dst, false);
        } else if op == Op::Ne {
            dst = self.emit_un(UnaryOp::Snez, dst, false);
        }
        dst
    }

    fn emit_float_binary(&mut self, op: ir::BinOp, lhs: &Operand, rhs: &Operand) -> Reg {
        use ir::BinOp as Op;

        let src1 = self.reg_from_operand(lhs);
        let src2 = self.reg_from_operand(rhs);
        let dst = match op {
            Op::Add => self.emit_bin(BinOp::FaddS, src1, src2, true),
            Op::Sub => self.emit_bin(BinOp::FsubS, src1, src2, true),
            Op::Mul => self.emit_bin(BinOp::FmulS, src1, src2, true),
            Op::Div => self.emit_bin(BinOp::FdivS, src1, src2, true),
            Op::Lt => self.emit_bin(BinOp::FltS, src1, src2, false),
            Op::Le => self.emit_bin(BinOp::FleS, src1, src2, false),
            Op::Gt => self.emit_bin(BinOp::FltS, src2, src1, false),
            Op::Ge => self.emit_bin(BinOp::FleS, src2, src1, false),
            Op::Eq | Op::Ne => self.emit_bin(BinOp::FeqS, src1, src2, false),
            Op::Mod => panic!("float modulo reached the selector"),
        };
        if op == Op::Ne {
            self.push(Inst::Unary {
                op: UnaryOp::Seqz,
                dst,
                src: dst,
            });
        }
        dst
    }

    fn emit_gep(&mut self, f: &ir::Function, result: ValueId, ptr: &Operand, indexes: &[Operand]) {
        let mut ptr_reg = self.reg_from_operand(ptr);
        if ptr_reg == self.regs.s0 {
            let offset = self.operand_offset(ptr);
            let (base, offset) = self.legalize_offset(ptr_reg, offset);
            ptr_reg = self.emit_bin_imm(BinImmOp::Addi, base, offset);
        }

        let ptr_ty = f.operand_ty(self.module, ptr);
        let offset_reg = if indexes.len() == 1 {
            let stride = ptr_ty.base_type().byte_len();
            match &indexes[0] {
                Operand::Const(Constant::Int(c)) => self.load_const_int(stride * c),
                index => {
                    let index = self.reg_from_operand(index);
                    if stride == 4 {
                        self.emit_bin_imm(BinImmOp::Slli, index, 2)
                    } else {
                        let stride = self.load_const_int(stride);
                        self.emit_bin(BinOp::Mul, index, stride, false)
                    }
                }
            }
        } else {
            let elem_len = ptr_ty.base_type().base_type().byte_len();
            match &indexes[1] {
                Operand::Const(Constant::Int(c)) => self.load_const_int(elem_len * c),
                index => {
                    let index = self.reg_from_operand(index);
                    match elem_len {
                        4 => self.emit_bin_imm(BinImmOp::Slli, index, 2),
                        8 => self.emit_bin_imm(BinImmOp::Slli, index, 3),
                        _ => {
                            let stride = self.load_const_int(elem_len);
                            self.emit_bin(BinOp::Mul, index, stride, false)
                        }
                    }
                }
            }
        };
        let dst = self.emit_bin(BinOp::Add, ptr_reg, offset_reg, false);
        self.value_reg.insert(result, dst);
    }

    fn emit_bitcast(&mut self, result: ValueId, ptr: &Operand) {
        let ptr_reg = self.reg_from_operand(ptr);
        if ptr_reg == self.regs.s0 {
            let offset = self.operand_offset(ptr);
            let (base, offset) = self.legalize_offset(ptr_reg, offset);
            let dst = self.emit_bin_imm(BinImmOp::Addi, base, offset);
            self.value_reg.insert(result, dst);
        } else {
            self.value_reg.insert(result, ptr_reg);
        }
    }

    fn emit_call(
        &mut self,
        f: &ir::Function,
        result: Option<ValueId>,
        callee: Id,
        args: &[Operand],
    ) {
        let mut int_order = 0;
        let mut float_order = 0;
        let mut stack_offset = 0;
        for arg in args {
            let arg_reg = self.reg_from_operand(arg);
            let ty = f.operand_ty(self.module, arg);
            if ty.is_float() {
                if float_order < 8 {
                    let dst = self.regs.float_arg[float_order];
                    float_order += 1;
                    self.push(Inst::Unary {
                        op: UnaryOp::FmvS,
                        dst,
                        src: arg_reg,
                    });
                } else {
                    self.insert_stack_arg(arg_reg, StoreOp::Fsw, stack_offset);
                    stack_offset += 8;
                }
            } else if int_order < 8 {
                let dst = self.regs.int_arg[int_order];
                int_order += 1;
                self.push(Inst::Unary {
                    op: UnaryOp::Mv,
                    dst,
                    src: arg_reg,
                });
            } else {
                let op = if ty.is_pointer() {
                    StoreOp::Sd
                } else {
                    StoreOp::Sw
                };
                self.insert_stack_arg(arg_reg, op, stack_offset);
                stack_offset += 8;
            }
        }
        self.max_out_args = self.max_out_args.max(stack_offset);

        let result_reg = result.map(|r| {
            if f.value_ty(r).is_float() {
                self.regs.float_arg[0]
            } else {
                self.regs.int_arg[0]
            }
        });
        let mut used = Vec::new();
        used.extend_from_slice(&self.regs.int_arg[..int_order]);
        used.extend_from_slice(&self.regs.float_arg[..float_order]);
        self.push(Inst::Call {
            callee: callee.to_string(),
            result: result_reg,
            args: used,
        });

        if let Some(r) = result {
            let float = f.value_ty(r).is_float();
            let (op, src) = if float {
                (UnaryOp::FmvS, self.regs.float_arg[0])
            } else {
                (UnaryOp::Mv, self.regs.int_arg[0])
            };
            let dst = self.emit_un(op, src, float);
            self.value_reg.insert(r, dst);
        }
    }

    /// Park a surplus call argument in the outgoing-argument words.  The
    /// store is inserted right after the instruction that produced the
    /// argument's register, before later staging can clobber anything.
    fn insert_stack_arg(&mut self, arg_reg: Reg, op: StoreOp, stack_offset: i32) {
        let sp = self.regs.sp;
        let mut seq = Vec::new();
        if stack_offset > 2047 {
            let (hi20, lo12) = split_offset(stack_offset);
            let hi = self.vreg(false);
            seq.push(Inst::Imm {
                op: ImmOp::Lui,
                dst: hi,
                imm: hi20,
            });
            let addr = self.vreg(false);
            seq.push(Inst::Binary {
                op: BinOp::Add,
                dst: addr,
                lhs: sp,
                rhs: hi,
            });
            seq.push(Inst::Store {
                op,
                src: arg_reg,
                base: addr,
                offset: lo12,
            });
        } else {
            seq.push(Inst::Store {
                op,
                src: arg_reg,
                base: sp,
                offset: stack_offset,
            });
        }
        let cur = self.cur;
        let insts = &mut self.func.block_mut(cur).insts;
        let at = insts
            .iter()
            .position(|i| i.dst() == Some(arg_reg))
            .map(|p| p + 1)
            .unwrap_or(insts.len());
        for (k, inst) in seq.into_iter().enumerate() {
            insts.insert(at + k, inst);
        }
    }

    fn emit_ret(&mut self, f: &ir::Function, value: Option<&Operand>) {
        if let Some(value) = value {
            let src = self.reg_from_operand(value);
            if f.operand_ty(self.module, value).is_float() {
                let dst = self.regs.float_arg[0];
                self.push(Inst::Unary {
                    op: UnaryOp::FmvS,
                    dst,
                    src,
                });
            } else {
                let dst = self.regs.int_arg[0];
                self.push(Inst::Unary {
                    op: UnaryOp::Mv,
                    dst,
                    src,
                });
            }
        }
        let target = self.ret_bb;
        self.push(Inst::Jump { target });
    }

    fn emit_cond_jump(
        &mut self,
        f: &ir::Function,
        op: ir::CondOp,
        lhs: &Operand,
        rhs: &Operand,
        tt: ir::BlockRef,
        ff: ir::BlockRef,
    ) {
        use ir::CondOp as Cond;

        let mut src1 = self.reg_from_operand(lhs);
        let mut src2 = self.reg_from_operand(rhs);
        let float = f.operand_ty(self.module, lhs).is_float()
            || f.operand_ty(self.module, rhs).is_float();

        let branch = if !float {
            match op {
                Cond::Eq => BranchOp::Beq,
                Cond::Ne => BranchOp::Bne,
                Cond::Lt => BranchOp::Blt,
                Cond::Le => {
                    std::mem::swap(&mut src1, &mut src2);
                    BranchOp::Bge
                }
                Cond::Gt => {
                    std::mem::swap(&mut src1, &mut src2);
                    BranchOp::Blt
                }
                Cond::Ge => BranchOp::Bge,
            }
        } else {
            let cmp = match op {
                Cond::Eq | Cond::Ne => self.emit_bin(BinOp::FeqS, src1, src2, false),
                Cond::Lt => self.emit_bin(BinOp::FltS, src1, src2, false),
                Cond::Le => self.emit_bin(BinOp::FleS, src1, src2, false),
                Cond::Gt => self.emit_bin(BinOp::FltS, src2, src1, false),
                Cond::Ge => self.emit_bin(BinOp::FleS, src2, src1, false),
            };
            src1 = cmp;
            src2 = self.regs.zero;
            if op == Cond::Ne {
                BranchOp::Beq
            } else {
                BranchOp::Bne
            }
        };

        // Branch through a bridge block holding a plain jump so the
        // conditional branch itself always lands within relocation range.
        let bridge = self.new_block(false);
        self.func.place(bridge);
        let tt = self.bb_map[&tt.0];
        self.func.block_mut(bridge).insts.push(Inst::Jump { target: tt });
        self.push(Inst::CondJump {
            op: branch,
            lhs: src1,
            rhs: src2,
            target: bridge,
        });
        let ff = self.bb_map[&ff.0];
        self.push(Inst::Jump { target: ff });
    }

    /// Materialize the prologue and epilogue once the callee-saved set
    /// has settled.
    fn finalize_frame(&mut self, f: &ir::Function) {
        self.offset -= self.max_out_args;
        // keep sp 16-byte aligned
        if self.offset % 16 != 0 {
            self.offset = (self.offset - 15) / 16 * 16;
        }
        let total = -self.offset;
        let (sp, ra, s0) = (self.regs.sp, self.regs.ra, self.regs.s0);
        let entry = self.entry;
        let ret = self.ret_bb;
        let push_regs: Vec<Reg> = self.func.need_push.iter().copied().collect();

        if self.offset >= -2048 {
            let imm = self.offset;
            self.func.block_mut(entry).insts.push(Inst::BinaryImm {
                op: BinImmOp::Addi,
                dst: sp,
                src: sp,
                imm,
            });
            let mut push_off;
            if f.has_call {
                push_off = total - 24;
                for (reg, off) in [(ra, total - 8), (s0, total - 16)] {
                    self.func.block_mut(entry).insts.push(Inst::Store {
                        op: StoreOp::Sd,
                        src: reg,
                        base: sp,
                        offset: off,
                    });
                    self.func.block_mut(ret).insts.push(Inst::Load {
                        op: LoadOp::Ld,
                        dst: reg,
                        base: sp,
                        offset: off,
                    });
                }
            } else {
                push_off = total - 16;
                self.func.block_mut(entry).insts.push(Inst::Store {
                    op: StoreOp::Sd,
                    src: s0,
                    base: sp,
                    offset: total - 8,
                });
                self.func.block_mut(ret).insts.push(Inst::Load {
                    op: LoadOp::Ld,
                    dst: s0,
                    base: sp,
                    offset: total - 8,
                });
            }
            for &reg in &push_regs {
                let (store, load) = if self.regs.is_float(reg) {
                    (StoreOp::Fsd, LoadOp::Fld)
                } else {
                    (StoreOp::Sd, LoadOp::Ld)
                };
                self.func.block_mut(entry).insts.push(Inst::Store {
                    op: store,
                    src: reg,
                    base: sp,
                    offset: push_off,
                });
                self.func.block_mut(ret).insts.push(Inst::Load {
                    op: load,
                    dst: reg,
                    base: sp,
                    offset: push_off,
                });
                push_off -= 8;
            }
            self.func.block_mut(entry).insts.push(Inst::BinaryImm {
                op: BinImmOp::Addi,
                dst: s0,
                src: sp,
                imm: total,
            });
            self.func.block_mut(ret).insts.push(Inst::BinaryImm {
                op: BinImmOp::Addi,
                dst: sp,
                src: sp,
                imm: total,
            });
        } else {
            // 2032 rather than 2048: -2048 encodes but 2048 does not, and
            // the epilogue adds the bump back with a positive immediate.
            let t0 = self.regs.int_tmp[0];
            self.func.block_mut(entry).insts.push(Inst::BinaryImm {
                op: BinImmOp::Addi,
                dst: sp,
                src: sp,
                imm: -2032,
            });
            self.func.block_mut(ret).insts.push(Inst::Imm {
                op: ImmOp::Li,
                dst: t0,
                imm: total - 2032,
            });
            self.func.block_mut(ret).insts.push(Inst::Binary {
                op: BinOp::Add,
                dst: sp,
                lhs: sp,
                rhs: t0,
            });
            let mut push_off;
            if f.has_call {
                push_off = 2008;
                for (reg, off) in [(ra, 2024), (s0, 2016)] {
                    self.func.block_mut(entry).insts.push(Inst::Store {
                        op: StoreOp::Sd,
                        src: reg,
                        base: sp,
                        offset: off,
                    });
                    self.func.block_mut(ret).insts.push(Inst::Load {
                        op: LoadOp::Ld,
                        dst: reg,
                        base: sp,
                        offset: off,
                    });
                }
            } else {
                push_off = 2016;
                self.func.block_mut(entry).insts.push(Inst::Store {
                    op: StoreOp::Sd,
                    src: s0,
                    base: sp,
                    offset: 2024,
                });
                self.func.block_mut(ret).insts.push(Inst::Load {
                    op: LoadOp::Ld,
                    dst: s0,
                    base: sp,
                    offset: 2024,
                });
            }
            for &reg in &push_regs {
                let (store, load) = if self.regs.is_float(reg) {
                    (StoreOp::Fsd, LoadOp::Fld)
                } else {
                    (StoreOp::Sd, LoadOp::Ld)
                };
                self.func.block_mut(entry).insts.push(Inst::Store {
                    op: store,
                    src: reg,
                    base: sp,
                    offset: push_off,
                });
                self.func.block_mut(ret).insts.push(Inst::Load {
                    op: load,
                    dst: reg,
                    base: sp,
                    offset: push_off,
                });
                push_off -= 8;
            }
            self.func.block_mut(entry).insts.push(Inst::BinaryImm {
                op: BinImmOp::Addi,
                dst: s0,
                src: sp,
                imm: 2032,
            });
            self.func.block_mut(entry).insts.push(Inst::Imm {
                op: ImmOp::Li,
                dst: t0,
                imm: self.offset + 2032,
            });
            self.func.block_mut(entry).insts.push(Inst::Binary {
                op: BinOp::Add,
                dst: sp,
                lhs: sp,
                rhs: t0,
            });
            self.func.block_mut(ret).insts.push(Inst::BinaryImm {
                op: BinImmOp::Addi,
                dst: sp,
                src: sp,
                imm: 2032,
            });
        }
        self.func.block_mut(ret).insts.push(Inst::Ret);
    }
}
