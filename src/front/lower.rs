//! Lowering from the AST to AtomIR.
//!
//! Every variable gets a stack slot; reads load from it and writes store
//! to it.  Control flow is expanded into basic blocks here, including the
//! short-circuit forms of `&&` and `||`, so the IR the backend sees has
//! no compound conditions.  Implicit `int`/`float` conversions are made
//! explicit as `itof`/`ftoi`.

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::*;
use crate::front::ast::{self, BOp, BType, InitVal, LVal, RetType, UOp};
use crate::middle::ir::*;

#[derive(Display)]
#[display("Lowering error: {}", self.0)]
pub struct LowerError(String);

impl Debug for LowerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub fn lower(program: &ast::Program) -> Result<Module, LowerError> {
    Lowerer::new().run(program)
}

#[derive(Clone)]
struct FuncSig {
    ret: Type,
    params: Vec<Type>,
}

#[derive(Clone, Copy)]
enum Symbol {
    Local(ValueId),
    Global(Id),
}

struct Lowerer {
    module: Module,
    sigs: Map<Id, FuncSig>,
    func: Function,
    cur: BlockRef,
    scopes: Vec<Map<Id, Symbol>>,
    /// `(continue target, break target)` for each enclosing loop.
    loops: Vec<(BlockRef, BlockRef)>,
    terminated: bool,
}

fn scalar_type(ty: BType) -> Type {
    match ty {
        BType::Int => Type::Int32,
        BType::Float => Type::Float32,
    }
}

fn ret_type(ret: RetType) -> Type {
    match ret {
        RetType::Void => Type::Void,
        RetType::Int => Type::Int32,
        RetType::Float => Type::Float32,
    }
}

fn param_type(param: &ast::Param) -> Type {
    let scalar = scalar_type(param.ty);
    if param.array {
        scalar.pointer_to()
    } else {
        scalar
    }
}

fn is_comparison(op: BOp) -> bool {
    matches!(op, BOp::Lt | BOp::Le | BOp::Gt | BOp::Ge | BOp::Eq | BOp::Ne)
}

fn bin_op(op: BOp) -> BinOp {
    match op {
        BOp::Mul => BinOp::Mul,
        BOp::Div => BinOp::Div,
        BOp::Mod => BinOp::Mod,
        BOp::Add => BinOp::Add,
        BOp::Sub => BinOp::Sub,
        BOp::Lt => BinOp::Lt,
        BOp::Le => BinOp::Le,
        BOp::Gt => BinOp::Gt,
        BOp::Ge => BinOp::Ge,
        BOp::Eq => BinOp::Eq,
        BOp::Ne => BinOp::Ne,
        BOp::And | BOp::Or => unreachable!("short-circuit operators lower to control flow"),
    }
}

fn cond_op(op: BOp) -> CondOp {
    match op {
        BOp::Lt => CondOp::Lt,
        BOp::Le => CondOp::Le,
        BOp::Gt => CondOp::Gt,
        BOp::Ge => CondOp::Ge,
        BOp::Eq => CondOp::Eq,
        BOp::Ne => CondOp::Ne,
        _ => unreachable!("not a comparison"),
    }
}

/// Signatures of the runtime library.
fn builtin_sigs() -> Map<Id, FuncSig> {
    let int = Type::Int32;
    let float = Type::Float32;
    let sig = |ret: &Type, params: &[Type]| FuncSig {
        ret: ret.clone(),
        params: params.to_vec(),
    };
    let mut sigs = Map::new();
    sigs.insert(intern("getint"), sig(&int, &[]));
    sigs.insert(intern("getch"), sig(&int, &[]));
    sigs.insert(intern("getfloat"), sig(&float, &[]));
    sigs.insert(intern("getarray"), sig(&int, &[int.clone().pointer_to()]));
    sigs.insert(intern("getfarray"), sig(&int, &[float.clone().pointer_to()]));
    sigs.insert(intern("putint"), sig(&Type::Void, &[int.clone()]));
    sigs.insert(intern("putch"), sig(&Type::Void, &[int.clone()]));
    sigs.insert(intern("putfloat"), sig(&Type::Void, &[float.clone()]));
    sigs.insert(
        intern("putarray"),
        sig(&Type::Void, &[int.clone(), int.clone().pointer_to()]),
    );
    sigs.insert(
        intern("putfarray"),
        sig(&Type::Void, &[int, float.pointer_to()]),
    );
    sigs
}

fn const_eval(e: &ast::Expr) -> Result<Constant, LowerError> {
    match e {
        ast::Expr::Int(v) => Ok(Constant::Int(*v)),
        ast::Expr::Float(v) => Ok(Constant::Float(*v)),
        ast::Expr::Unary { op: UOp::Pos, operand } => const_eval(operand),
        ast::Expr::Unary { op: UOp::Neg, operand } => match const_eval(operand)? {
            Constant::Int(v) => Ok(Constant::Int(v.wrapping_neg())),
            Constant::Float(v) => Ok(Constant::Float(-v)),
        },
        ast::Expr::BOp { op, lhs, rhs } if !matches!(op, BOp::And | BOp::Or) => {
            let lhs = const_eval(lhs)?;
            let rhs = const_eval(rhs)?;
            match (lhs, rhs) {
                (Constant::Int(a), Constant::Int(b)) => const_eval_int(*op, a, b),
                (a, b) => {
                    let to_float = |c| match c {
                        Constant::Int(v) => v as f32,
                        Constant::Float(v) => v,
                    };
                    const_eval_float(*op, to_float(a), to_float(b))
                }
            }
        }
        _ => Err(LowerError(
            "initializer of a global must be a constant expression".into(),
        )),
    }
}

fn const_eval_int(op: BOp, a: i32, b: i32) -> Result<Constant, LowerError> {
    let v = match op {
        BOp::Mul => a.wrapping_mul(b),
        BOp::Div | BOp::Mod if b == 0 => {
            return Err(LowerError("division by zero in a constant expression".into()))
        }
        BOp::Div => a.wrapping_div(b),
        BOp::Mod => a.wrapping_rem(b),
        BOp::Add => a.wrapping_add(b),
        BOp::Sub => a.wrapping_sub(b),
        BOp::Lt => (a < b) as i32,
        BOp::Le => (a <= b) as i32,
        BOp::Gt => (a > b) as i32,
        BOp::Ge => (a >= b) as i32,
        BOp::Eq => (a == b) as i32,
        BOp::Ne => (a != b) as i32,
        BOp::And | BOp::Or => unreachable!(),
    };
    Ok(Constant::Int(v))
}

fn const_eval_float(op: BOp, a: f32, b: f32) -> Result<Constant, LowerError> {
    let c = match op {
        BOp::Mul => Constant::Float(a * b),
        BOp::Div => Constant::Float(a / b),
        BOp::Add => Constant::Float(a + b),
        BOp::Sub => Constant::Float(a - b),
        BOp::Lt => Constant::Int((a < b) as i32),
        BOp::Le => Constant::Int((a <= b) as i32),
        BOp::Gt => Constant::Int((a > b) as i32),
        BOp::Ge => Constant::Int((a >= b) as i32),
        BOp::Eq => Constant::Int((a == b) as i32),
        BOp::Ne => Constant::Int((a != b) as i32),
        BOp::Mod => {
            return Err(LowerError("'%' cannot be applied to float operands".into()))
        }
        BOp::And | BOp::Or => unreachable!(),
    };
    Ok(c)
}

fn const_convert(c: Constant, to: &Type) -> Constant {
    match (c, to) {
        (Constant::Int(v), Type::Float32) => Constant::Float(v as f32),
        (Constant::Float(v), Type::Int32) => Constant::Int(v as i32),
        (c, _) => c,
    }
}

impl Lowerer {
    fn new() -> Self {
        Lowerer {
            module: Module::new(intern("main")),
            sigs: builtin_sigs(),
            func: Function::new(intern(""), Type::Void),
            cur: BlockRef(0),
            scopes: vec![Map::new()],
            loops: Vec::new(),
            terminated: false,
        }
    }

    fn run(mut self, program: &ast::Program) -> Result<Module, LowerError> {
        // Collect signatures up front so calls can reference any function.
        for item in &program.items {
            if let ast::Item::Func(def) = item {
                let sig = FuncSig {
                    ret: ret_type(def.ret),
                    params: def.params.iter().map(param_type).collect(),
                };
                if self.sigs.insert(def.name, sig).is_some() {
                    return Err(LowerError(format!("function '{}' is already defined", def.name)));
                }
            }
        }
        for item in &program.items {
            match item {
                ast::Item::Global(decls) => {
                    for decl in decls {
                        self.lower_global(decl)?;
                    }
                }
                ast::Item::Func(def) => self.lower_function(def)?,
            }
        }
        Ok(self.module)
    }

    fn emit(&mut self, inst: Instruction) {
        if matches!(inst, Instruction::Call { .. }) {
            self.func.has_call = true;
        }
        self.func.blocks[self.cur.0].insts.push(inst);
    }

    fn switch_to(&mut self, block: BlockRef) {
        self.cur = block;
        self.terminated = false;
    }

    fn new_block(&mut self) -> BlockRef {
        let n = self.func.blocks.len();
        self.func.new_block(format!("b{n}"))
    }

    fn bind(&mut self, name: Id, sym: Symbol) -> Result<(), LowerError> {
        let scope = self.scopes.last_mut().unwrap();
        if scope.insert(name, sym).is_some() {
            return Err(LowerError(format!(
                "'{name}' is already defined in this scope"
            )));
        }
        Ok(())
    }

    fn lookup(&self, name: Id) -> Result<Symbol, LowerError> {
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.get(&name) {
                return Ok(*sym);
            }
        }
        Err(LowerError(format!("'{name}' is not defined")))
    }

    fn const_len(&self, dim: &ast::Expr) -> Result<u32, LowerError> {
        match const_eval(dim)? {
            Constant::Int(v) if v >= 0 => Ok(v as u32),
            Constant::Int(_) => Err(LowerError("array length must not be negative".into())),
            Constant::Float(_) => Err(LowerError("array length must be an integer".into())),
        }
    }

    fn lower_global(&mut self, decl: &ast::VarDecl) -> Result<(), LowerError> {
        let elem = scalar_type(decl.ty);
        let (ty, init) = match &decl.dim {
            None => {
                let c = match &decl.init {
                    Some(InitVal::Expr(e)) => const_convert(const_eval(e)?, &elem),
                    Some(InitVal::List(_)) => {
                        return Err(LowerError(format!(
                            "'{}' is a scalar but is initialized with a list",
                            decl.name
                        )))
                    }
                    None => const_convert(Constant::Int(0), &elem),
                };
                (elem, GlobalInit::Scalar(c))
            }
            Some(dim) => {
                let len = self.const_len(dim)?;
                let ty = Type::array_of(elem.clone(), len);
                let init = match &decl.init {
                    None => GlobalInit::Array(vec![(len, Vec::new())]),
                    Some(InitVal::Expr(_)) => {
                        return Err(LowerError(format!(
                            "'{}' is an array but is initialized with a scalar",
                            decl.name
                        )))
                    }
                    Some(InitVal::List(elements)) => {
                        if elements.len() as u32 > len {
                            return Err(LowerError(format!(
                                "too many initializers for '{}'",
                                decl.name
                            )));
                        }
                        let elements: Vec<Constant> = elements
                            .iter()
                            .map(|e| Ok(const_convert(const_eval(e)?, &elem)))
                            .collect::<Result<_, LowerError>>()?;
                        let mut runs = Vec::new();
                        let rest = len - elements.len() as u32;
                        if !elements.is_empty() {
                            runs.push((elements.len() as u32, elements));
                        }
                        if rest > 0 {
                            runs.push((rest, Vec::new()));
                        }
                        GlobalInit::Array(runs)
                    }
                };
                (ty, init)
            }
        };
        self.bind(decl.name, Symbol::Global(decl.name))?;
        self.module.add_global(GlobalVariable {
            name: decl.name,
            ty,
            init,
        });
        Ok(())
    }

    fn lower_function(&mut self, def: &ast::FuncDef) -> Result<(), LowerError> {
        self.func = Function::new(def.name, ret_type(def.ret));
        self.scopes.push(Map::new());
        let entry = self.func.new_block("entry");
        self.switch_to(entry);

        // Parameters get a slot each; allocations record the 1-based bank
        // ordinals so the backend can find parameters the caller left on
        // the stack.
        let mut int_num = 0;
        let mut float_num = 0;
        let mut staged = Vec::new();
        for param in &def.params {
            let ty = param_type(param);
            if ty.is_float() {
                float_num += 1;
            } else {
                int_num += 1;
            }
            let value = self.func.new_value(ty.clone());
            self.func.params.push(value);
            staged.push((param.name, value, ty, ParamOrdinals { int_num, float_num }));
        }
        for (name, value, ty, ord) in staged {
            let addr = self.func.new_value(ty.pointer_to());
            self.emit(Instruction::Alloc {
                result: addr,
                for_param: Some(ord),
            });
            self.emit(Instruction::Store {
                value: Operand::Value(value),
                dest: Operand::Value(addr),
            });
            self.bind(name, Symbol::Local(addr))?;
        }

        self.lower_stmts(&def.body)?;
        if !self.terminated {
            let value = match &self.func.ret_ty {
                Type::Void => None,
                ty if ty.is_float() => Some(Operand::Const(Constant::Float(0.0))),
                _ => Some(Operand::Const(Constant::Int(0))),
            };
            self.emit(Instruction::Ret { value });
        }

        self.scopes.pop();
        let func = std::mem::replace(&mut self.func, Function::new(intern(""), Type::Void));
        self.module.functions.push(func);
        Ok(())
    }

    fn lower_stmts(&mut self, block: &ast::Block) -> Result<(), LowerError> {
        for stmt in &block.stmts {
            if self.terminated {
                break; // unreachable
            }
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &ast::Stmt) -> Result<(), LowerError> {
        match stmt {
            ast::Stmt::Decl(decls) => {
                for decl in decls {
                    self.lower_local(decl)?;
                }
                Ok(())
            }
            ast::Stmt::Assign { target, value } => {
                let (v, vt) = self.lower_expr(value)?;
                let (dest, elem) = self.lval_addr(target)?;
                let v = self.convert(v, &vt, &elem);
                self.emit(Instruction::Store { value: v, dest });
                Ok(())
            }
            ast::Stmt::Expr(e) => {
                if let Some(e) = e {
                    self.lower_expr(e)?;
                }
                Ok(())
            }
            ast::Stmt::Block(block) => {
                self.scopes.push(Map::new());
                let result = self.lower_stmts(block);
                self.scopes.pop();
                result
            }
            ast::Stmt::If { guard, tt, ff } => {
                let tt_bb = self.new_block();
                let ff_bb = ff.as_ref().map(|_| self.new_block());
                let join = self.new_block();
                self.lower_cond(guard, tt_bb, ff_bb.unwrap_or(join))?;

                self.switch_to(tt_bb);
                self.lower_stmt(tt)?;
                if !self.terminated {
                    self.emit(Instruction::Jump { target: join });
                }
                if let (Some(ff_bb), Some(ff)) = (ff_bb, ff) {
                    self.switch_to(ff_bb);
                    self.lower_stmt(ff)?;
                    if !self.terminated {
                        self.emit(Instruction::Jump { target: join });
                    }
                }
                self.switch_to(join);
                Ok(())
            }
            ast::Stmt::While { guard, body } => {
                let cond_bb = self.new_block();
                let body_bb = self.new_block();
                let after = self.new_block();
                self.emit(Instruction::Jump { target: cond_bb });
                self.switch_to(cond_bb);
                self.lower_cond(guard, body_bb, after)?;

                self.switch_to(body_bb);
                self.loops.push((cond_bb, after));
                let result = self.lower_stmt(body);
                self.loops.pop();
                result?;
                if !self.terminated {
                    self.emit(Instruction::Jump { target: cond_bb });
                }
                self.switch_to(after);
                Ok(())
            }
            ast::Stmt::Break => {
                let &(_, after) = self
                    .loops
                    .last()
                    .ok_or_else(|| LowerError("break outside of a loop".into()))?;
                self.emit(Instruction::Jump { target: after });
                self.terminated = true;
                Ok(())
            }
            ast::Stmt::Continue => {
                let &(cond_bb, _) = self
                    .loops
                    .last()
                    .ok_or_else(|| LowerError("continue outside of a loop".into()))?;
                self.emit(Instruction::Jump { target: cond_bb });
                self.terminated = true;
                Ok(())
            }
            ast::Stmt::Return(value) => {
                let ret_ty = self.func.ret_ty.clone();
                let value = match (value, &ret_ty) {
                    (None, Type::Void) => None,
                    (None, _) => {
                        return Err(LowerError(format!(
                            "'{}' must return a value",
                            self.func.name
                        )))
                    }
                    (Some(_), Type::Void) => {
                        return Err(LowerError(format!(
                            "'{}' returns void but a value is given",
                            self.func.name
                        )))
                    }
                    (Some(e), _) => {
                        let (v, vt) = self.lower_expr(e)?;
                        Some(self.convert(v, &vt, &ret_ty))
                    }
                };
                self.emit(Instruction::Ret { value });
                self.terminated = true;
                Ok(())
            }
        }
    }

    fn lower_local(&mut self, decl: &ast::VarDecl) -> Result<(), LowerError> {
        let elem = scalar_type(decl.ty);
        let ty = match &decl.dim {
            None => elem.clone(),
            Some(dim) => Type::array_of(elem.clone(), self.const_len(dim)?),
        };
        let addr = self.func.new_value(ty.clone().pointer_to());
        self.emit(Instruction::Alloc {
            result: addr,
            for_param: None,
        });
        self.bind(decl.name, Symbol::Local(addr))?;

        match &decl.init {
            None => {}
            Some(InitVal::Expr(e)) => {
                if decl.dim.is_some() {
                    return Err(LowerError(format!(
                        "'{}' is an array but is initialized with a scalar",
                        decl.name
                    )));
                }
                let (v, vt) = self.lower_expr(e)?;
                let v = self.convert(v, &vt, &elem);
                self.emit(Instruction::Store {
                    value: v,
                    dest: Operand::Value(addr),
                });
            }
            Some(InitVal::List(elements)) => {
                let Type::Array { len, .. } = &ty else {
                    return Err(LowerError(format!(
                        "'{}' is a scalar but is initialized with a list",
                        decl.name
                    )));
                };
                if elements.len() as u32 > *len {
                    return Err(LowerError(format!(
                        "too many initializers for '{}'",
                        decl.name
                    )));
                }
                for (i, e) in elements.iter().enumerate() {
                    let (v, vt) = self.lower_expr(e)?;
                    let v = self.convert(v, &vt, &elem);
                    let slot = self.func.new_value(elem.clone().pointer_to());
                    self.emit(Instruction::Gep {
                        result: slot,
                        ptr: Operand::Value(addr),
                        indexes: vec![
                            Operand::Const(Constant::Int(0)),
                            Operand::Const(Constant::Int(i as i32)),
                        ],
                    });
                    self.emit(Instruction::Store {
                        value: v,
                        dest: Operand::Value(slot),
                    });
                }
            }
        }
        Ok(())
    }

    /// Branch on a condition, expanding `&&`, `||` and `!` into control
    /// flow.  The current block is terminated afterwards.
    fn lower_cond(&mut self, e: &ast::Expr, tt: BlockRef, ff: BlockRef) -> Result<(), LowerError> {
        match e {
            ast::Expr::BOp {
                op: BOp::And,
                lhs,
                rhs,
            } => {
                let mid = self.new_block();
                self.lower_cond(lhs, mid, ff)?;
                self.switch_to(mid);
                self.lower_cond(rhs, tt, ff)
            }
            ast::Expr::BOp {
                op: BOp::Or,
                lhs,
                rhs,
            } => {
                let mid = self.new_block();
                self.lower_cond(lhs, tt, mid)?;
                self.switch_to(mid);
                self.lower_cond(rhs, tt, ff)
            }
            ast::Expr::BOp { op, lhs, rhs } if is_comparison(*op) => {
                let (l, lt) = self.lower_expr(lhs)?;
                let (r, rt) = self.lower_expr(rhs)?;
                let (l, r, _) = self.unify(l, lt, r, rt);
                self.emit(Instruction::CondJump {
                    op: cond_op(*op),
                    lhs: l,
                    rhs: r,
                    tt,
                    ff,
                });
                self.terminated = true;
                Ok(())
            }
            ast::Expr::Unary {
                op: UOp::Not,
                operand,
            } => self.lower_cond(operand, ff, tt),
            other => {
                let (v, t) = self.lower_expr(other)?;
                let zero = if t.is_float() {
                    Operand::Const(Constant::Float(0.0))
                } else {
                    Operand::Const(Constant::Int(0))
                };
                self.emit(Instruction::CondJump {
                    op: CondOp::Ne,
                    lhs: v,
                    rhs: zero,
                    tt,
                    ff,
                });
                self.terminated = true;
                Ok(())
            }
        }
    }

    fn unify(
        &mut self,
        l: Operand,
        lt: Type,
        r: Operand,
        rt: Type,
    ) -> (Operand, Operand, Type) {
        if lt.is_float() || rt.is_float() {
            (
                self.convert(l, &lt, &Type::Float32),
                self.convert(r, &rt, &Type::Float32),
                Type::Float32,
            )
        } else {
            (l, r, Type::Int32)
        }
    }

    fn convert(&mut self, op: Operand, from: &Type, to: &Type) -> Operand {
        match (from, to) {
            (Type::Int32, Type::Float32) => match op {
                Operand::Const(Constant::Int(v)) => Operand::Const(Constant::Float(v as f32)),
                op => {
                    let result = self.func.new_value(Type::Float32);
                    self.emit(Instruction::Unary {
                        op: UnaryOp::Itof,
                        result,
                        operand: op,
                    });
                    Operand::Value(result)
                }
            },
            (Type::Float32, Type::Int32) => match op {
                Operand::Const(Constant::Float(v)) => Operand::Const(Constant::Int(v as i32)),
                op => {
                    let result = self.func.new_value(Type::Int32);
                    self.emit(Instruction::Unary {
                        op: UnaryOp::Ftoi,
                        result,
                        operand: op,
                    });
                    Operand::Value(result)
                }
            },
            _ => op,
        }
    }

    fn lower_expr(&mut self, e: &ast::Expr) -> Result<(Operand, Type), LowerError> {
        match e {
            ast::Expr::Int(v) => Ok((Operand::Const(Constant::Int(*v)), Type::Int32)),
            ast::Expr::Float(v) => Ok((Operand::Const(Constant::Float(*v)), Type::Float32)),
            ast::Expr::LVal(lval) => self.lower_lval_read(lval),
            ast::Expr::Call { callee, args } => {
                let sig = self
                    .sigs
                    .get(callee)
                    .ok_or_else(|| LowerError(format!("function '{callee}' is not defined")))?
                    .clone();
                if args.len() != sig.params.len() {
                    return Err(LowerError(format!(
                        "'{callee}' takes {} argument(s), {} given",
                        sig.params.len(),
                        args.len()
                    )));
                }
                let mut ops = Vec::new();
                for (arg, pty) in args.iter().zip(&sig.params) {
                    let (v, vt) = self.lower_expr(arg)?;
                    ops.push(self.convert(v, &vt, pty));
                }
                let result = if sig.ret == Type::Void {
                    None
                } else {
                    Some(self.func.new_value(sig.ret.clone()))
                };
                self.emit(Instruction::Call {
                    result,
                    callee: *callee,
                    args: ops,
                });
                match result {
                    Some(r) => Ok((Operand::Value(r), sig.ret)),
                    None => Ok((Operand::Const(Constant::Int(0)), Type::Void)),
                }
            }
            ast::Expr::Unary { op, operand } => match op {
                UOp::Pos => self.lower_expr(operand),
                UOp::Neg => {
                    let (v, t) = self.lower_expr(operand)?;
                    match v {
                        Operand::Const(Constant::Int(c)) => {
                            Ok((Operand::Const(Constant::Int(c.wrapping_neg())), t))
                        }
                        Operand::Const(Constant::Float(c)) => {
                            Ok((Operand::Const(Constant::Float(-c)), t))
                        }
                        v => {
                            let zero = if t.is_float() {
                                Operand::Const(Constant::Float(0.0))
                            } else {
                                Operand::Const(Constant::Int(0))
                            };
                            let result = self.func.new_value(t.clone());
                            self.emit(Instruction::Binary {
                                op: BinOp::Sub,
                                result,
                                lhs: zero,
                                rhs: v,
                            });
                            Ok((Operand::Value(result), t))
                        }
                    }
                }
                UOp::Not => {
                    let (v, t) = self.lower_expr(operand)?;
                    let zero = if t.is_float() {
                        Operand::Const(Constant::Float(0.0))
                    } else {
                        Operand::Const(Constant::Int(0))
                    };
                    let result = self.func.new_value(Type::Int32);
                    self.emit(Instruction::Binary {
                        op: BinOp::Eq,
                        result,
                        lhs: v,
                        rhs: zero,
                    });
                    Ok((Operand::Value(result), Type::Int32))
                }
            },
            ast::Expr::BOp {
                op: BOp::And | BOp::Or,
                ..
            } => self.lower_logic_value(e),
            ast::Expr::BOp { op, lhs, rhs } => {
                let (l, lt) = self.lower_expr(lhs)?;
                let (r, rt) = self.lower_expr(rhs)?;
                let (l, r, ty) = self.unify(l, lt, r, rt);
                if *op == BOp::Mod && ty.is_float() {
                    return Err(LowerError("'%' cannot be applied to float operands".into()));
                }
                let result_ty = if is_comparison(*op) { Type::Int32 } else { ty };
                let result = self.func.new_value(result_ty.clone());
                self.emit(Instruction::Binary {
                    op: bin_op(*op),
                    result,
                    lhs: l,
                    rhs: r,
                });
                Ok((Operand::Value(result), result_ty))
            }
        }
    }

    /// `&&`/`||` in value position: route the condition through a flag
    /// slot and load the 0/1 back out.
    fn lower_logic_value(&mut self, e: &ast::Expr) -> Result<(Operand, Type), LowerError> {
        let flag = self.func.new_value(Type::Int32.pointer_to());
        self.emit(Instruction::Alloc {
            result: flag,
            for_param: None,
        });
        let tt = self.new_block();
        let ff = self.new_block();
        let join = self.new_block();
        self.lower_cond(e, tt, ff)?;

        self.switch_to(tt);
        self.emit(Instruction::Store {
            value: Operand::Const(Constant::Int(1)),
            dest: Operand::Value(flag),
        });
        self.emit(Instruction::Jump { target: join });
        self.switch_to(ff);
        self.emit(Instruction::Store {
            value: Operand::Const(Constant::Int(0)),
            dest: Operand::Value(flag),
        });
        self.emit(Instruction::Jump { target: join });

        self.switch_to(join);
        let result = self.func.new_value(Type::Int32);
        self.emit(Instruction::Unary {
            op: UnaryOp::Load,
            result,
            operand: Operand::Value(flag),
        });
        Ok((Operand::Value(result), Type::Int32))
    }

    fn lower_lval_read(&mut self, lval: &LVal) -> Result<(Operand, Type), LowerError> {
        let sym = self.lookup(lval.name)?;
        match sym {
            Symbol::Local(addr) => {
                let inner = self.func.value_ty(addr).base_type().clone();
                match (&lval.index, inner) {
                    (None, Type::Array { elem, .. }) => {
                        // decay to the array's address for argument passing
                        let ty = (*elem).pointer_to();
                        let result = self.func.new_value(ty.clone());
                        self.emit(Instruction::BitCast {
                            result,
                            ptr: Operand::Value(addr),
                        });
                        Ok((Operand::Value(result), ty))
                    }
                    (None, ty) => {
                        let result = self.func.new_value(ty.clone());
                        self.emit(Instruction::Unary {
                            op: UnaryOp::Load,
                            result,
                            operand: Operand::Value(addr),
                        });
                        Ok((Operand::Value(result), ty))
                    }
                    (Some(_), _) => {
                        let (slot, elem) = self.lval_addr(lval)?;
                        let result = self.func.new_value(elem.clone());
                        self.emit(Instruction::Unary {
                            op: UnaryOp::Load,
                            result,
                            operand: slot,
                        });
                        Ok((Operand::Value(result), elem))
                    }
                }
            }
            Symbol::Global(name) => {
                let gty = self.module.global_ty(name).clone();
                match (&lval.index, gty) {
                    (None, Type::Array { elem, .. }) => {
                        Ok((Operand::Global(name), (*elem).pointer_to()))
                    }
                    (None, ty) => {
                        let result = self.func.new_value(ty.clone());
                        self.emit(Instruction::Unary {
                            op: UnaryOp::Load,
                            result,
                            operand: Operand::Global(name),
                        });
                        Ok((Operand::Value(result), ty))
                    }
                    (Some(_), _) => {
                        let (slot, elem) = self.lval_addr(lval)?;
                        let result = self.func.new_value(elem.clone());
                        self.emit(Instruction::Unary {
                            op: UnaryOp::Load,
                            result,
                            operand: slot,
                        });
                        Ok((Operand::Value(result), elem))
                    }
                }
            }
        }
    }

    /// The address an lvalue denotes, plus the element type stored there.
    fn lval_addr(&mut self, lval: &LVal) -> Result<(Operand, Type), LowerError> {
        let sym = self.lookup(lval.name)?;
        let (ptr, inner): (Operand, Type) = match sym {
            Symbol::Local(addr) => (
                Operand::Value(addr),
                self.func.value_ty(addr).base_type().clone(),
            ),
            Symbol::Global(name) => (Operand::Global(name), self.module.global_ty(name).clone()),
        };
        match &lval.index {
            None => match inner {
                Type::Array { .. } => Err(LowerError(format!(
                    "array '{}' cannot be assigned as a whole",
                    lval.name
                ))),
                ty => Ok((ptr, ty)),
            },
            Some(index) => {
                let (i, it) = self.lower_expr(index)?;
                let i = self.convert(i, &it, &Type::Int32);
                match inner {
                    Type::Array { elem, .. } => {
                        let elem = *elem;
                        let slot = self.func.new_value(elem.clone().pointer_to());
                        self.emit(Instruction::Gep {
                            result: slot,
                            ptr,
                            indexes: vec![Operand::Const(Constant::Int(0)), i],
                        });
                        Ok((Operand::Value(slot), elem))
                    }
                    Type::Pointer(elem) => {
                        // an array parameter: load the pointer first
                        let elem = *elem;
                        let pointer = self.func.new_value(elem.clone().pointer_to());
                        self.emit(Instruction::Unary {
                            op: UnaryOp::Load,
                            result: pointer,
                            operand: ptr,
                        });
                        let slot = self.func.new_value(elem.clone().pointer_to());
                        self.emit(Instruction::Gep {
                            result: slot,
                            ptr: Operand::Value(pointer),
                            indexes: vec![i],
                        });
                        Ok((Operand::Value(slot), elem))
                    }
                    _ => Err(LowerError(format!("'{}' is not an array", lval.name))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;

    fn module_for(src: &str) -> Module {
        lower(&parse(src).unwrap()).unwrap()
    }

    #[test]
    fn records_parameter_bank_ordinals() {
        let module = module_for("int f(int a, float b, int c) { return a; }");
        let f = &module.functions[0];
        let ordinals: Vec<ParamOrdinals> = f.blocks[0]
            .insts
            .iter()
            .filter_map(|inst| match inst {
                Instruction::Alloc {
                    for_param: Some(ord),
                    ..
                } => Some(*ord),
                _ => None,
            })
            .collect();
        assert_eq!(ordinals.len(), 3);
        assert_eq!((ordinals[0].int_num, ordinals[0].float_num), (1, 0));
        assert_eq!((ordinals[1].int_num, ordinals[1].float_num), (1, 1));
        assert_eq!((ordinals[2].int_num, ordinals[2].float_num), (2, 1));
    }

    #[test]
    fn has_call_tracks_calls_only() {
        let module = module_for("int f() { return 1; } int main() { return f(); }");
        assert!(!module.functions[0].has_call);
        assert!(module.functions[1].has_call);
    }

    #[test]
    fn global_arrays_zero_fill_their_tail() {
        let module = module_for("int a[10] = {1, 2}; int main() { return 0; }");
        let GlobalInit::Array(runs) = &module.globals[0].init else {
            panic!("expected an array initializer")
        };
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, 2);
        assert_eq!(runs[0].1, vec![Constant::Int(1), Constant::Int(2)]);
        assert_eq!(runs[1].0, 8);
        assert!(runs[1].1.is_empty());
    }

    #[test]
    fn conversions_are_made_explicit() {
        let module = module_for("int main() { float f = 1; int i = f + 2; return i; }");
        let main = &module.functions[0];
        let has = |op: UnaryOp| {
            main.blocks.iter().any(|b| {
                b.insts
                    .iter()
                    .any(|i| matches!(i, Instruction::Unary { op: o, .. } if *o == op))
            })
        };
        // `float f = 1` folds at compile time, but `f + 2` promotes the 2
        // and the assignment back to int truncates
        assert!(has(UnaryOp::Ftoi));
        let stores_float_const = main.blocks.iter().any(|b| {
            b.insts.iter().any(|i| {
                matches!(
                    i,
                    Instruction::Store {
                        value: Operand::Const(Constant::Float(v)),
                        ..
                    } if *v == 1.0
                )
            })
        });
        assert!(stores_float_const);
    }

    #[test]
    fn short_circuit_lowers_to_branches() {
        let module = module_for(
            "int main() { int a = getint(); if (a > 0 && a < 10) { return 1; } return 0; }",
        );
        let main = &module.functions[0];
        let cond_jumps = main
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Instruction::CondJump { .. }))
            .count();
        assert_eq!(cond_jumps, 2);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!(lower(&parse("int main() { return x; }").unwrap()).is_err());
        assert!(lower(&parse("int main() { return f(); }").unwrap()).is_err());
        assert!(lower(&parse("int main() { break; return 0; }").unwrap()).is_err());
    }
}
