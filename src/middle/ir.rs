//! AtomIR, the SSA-form intermediate representation the backend consumes.
//!
//! A module holds global variables and functions; a function holds basic
//! blocks of instructions plus a table typing every SSA value it defines.
//! There are no phi nodes: values that cross control flow go through
//! stack slots created by [Instruction::Alloc].

use std::fmt;

use crate::common::*;

/// AtomIR types.  All source scalars are 32 bits; pointers are 64 bits.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Type {
    Int32,
    Float32,
    Void,
    Pointer(Box<Type>),
    Array { elem: Box<Type>, len: u32 },
}

impl Type {
    pub fn pointer_to(self) -> Type {
        Type::Pointer(Box::new(self))
    }

    pub fn array_of(elem: Type, len: u32) -> Type {
        Type::Array {
            elem: Box::new(elem),
            len,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float32)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    /// The type a pointer points at, or an array's element type.
    pub fn base_type(&self) -> &Type {
        match self {
            Type::Pointer(t) => t,
            Type::Array { elem, .. } => elem,
            other => other,
        }
    }

    pub fn byte_len(&self) -> i32 {
        match self {
            Type::Int32 | Type::Float32 => 4,
            Type::Void => 0,
            Type::Pointer(_) => 8,
            Type::Array { elem, len } => elem.byte_len() * *len as i32,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int32 => write!(f, "i32"),
            Type::Float32 => write!(f, "float"),
            Type::Void => write!(f, "void"),
            Type::Pointer(t) => write!(f, "{t}*"),
            Type::Array { elem, len } => write!(f, "[{len} x {elem}]"),
        }
    }
}

/// A compile-time constant.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Constant {
    Int(i32),
    Float(f32),
}

impl Constant {
    pub fn ty(&self) -> Type {
        match self {
            Constant::Int(_) => Type::Int32,
            Constant::Float(_) => Type::Float32,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{v}"),
            Constant::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// A function-local SSA value.  Indexes the owning function's value table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An instruction operand.
#[derive(Clone, PartialEq, Debug)]
pub enum Operand {
    Const(Constant),
    Global(Id),
    Value(ValueId),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Const(c) => write!(f, "{c}"),
            Operand::Global(name) => write!(f, "@{name}"),
            Operand::Value(v) => write!(f, "{v}"),
        }
    }
}

/// A basic block within a function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct BlockRef(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnaryOp {
    /// Load through a pointer operand.
    Load,
    /// Convert a 32-bit integer to a float.
    Itof,
    /// Convert a float to a 32-bit integer, truncating.
    Ftoi,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Comparison kinds for [Instruction::CondJump].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CondOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Bank ordinals recorded on a parameter's stack-slot allocation: how many
/// integer-bank and float-bank parameters have been declared up to and
/// including this one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ParamOrdinals {
    pub int_num: u32,
    pub float_num: u32,
}

#[derive(Clone, Debug)]
pub enum Instruction {
    /// Reserve a stack slot; the result is a pointer to it.
    Alloc {
        result: ValueId,
        for_param: Option<ParamOrdinals>,
    },
    Store {
        value: Operand,
        dest: Operand,
    },
    Unary {
        op: UnaryOp,
        result: ValueId,
        operand: Operand,
    },
    Binary {
        op: BinOp,
        result: ValueId,
        lhs: Operand,
        rhs: Operand,
    },
    /// Address arithmetic: `ptr` plus scaled indexes.
    Gep {
        result: ValueId,
        ptr: Operand,
        indexes: Vec<Operand>,
    },
    /// Reinterpret a pointer; used to decay a stack array to its address.
    BitCast {
        result: ValueId,
        ptr: Operand,
    },
    Call {
        result: Option<ValueId>,
        callee: Id,
        args: Vec<Operand>,
    },
    Ret {
        value: Option<Operand>,
    },
    Jump {
        target: BlockRef,
    },
    CondJump {
        op: CondOp,
        lhs: Operand,
        rhs: Operand,
        tt: BlockRef,
        ff: BlockRef,
    },
}

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub name: String,
    pub insts: Vec<Instruction>,
}

/// Per-value bookkeeping: the value's type.
#[derive(Clone, Debug)]
pub struct ValueInfo {
    pub ty: Type,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: Id,
    pub ret_ty: Type,
    pub params: Vec<ValueId>,
    pub blocks: Vec<BasicBlock>,
    pub values: Vec<ValueInfo>,
    /// Whether any instruction in the body is a call; decides whether the
    /// backend saves `ra`.
    pub has_call: bool,
}

impl Function {
    pub fn new(name: Id, ret_ty: Type) -> Self {
        Function {
            name,
            ret_ty,
            params: Vec::new(),
            blocks: Vec::new(),
            values: Vec::new(),
            has_call: false,
        }
    }

    pub fn new_value(&mut self, ty: Type) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo { ty });
        id
    }

    pub fn new_block(&mut self, name: impl Into<String>) -> BlockRef {
        let id = BlockRef(self.blocks.len());
        self.blocks.push(BasicBlock {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    pub fn value_ty(&self, v: ValueId) -> &Type {
        &self.values[v.0 as usize].ty
    }

    /// The type of an operand.  Globals type as pointers to their contents.
    pub fn operand_ty(&self, module: &Module, op: &Operand) -> Type {
        match op {
            Operand::Const(c) => c.ty(),
            Operand::Global(name) => module.global_ty(*name).clone().pointer_to(),
            Operand::Value(v) => self.value_ty(*v).clone(),
        }
    }
}

/// A global variable's initializer.
#[derive(Clone, Debug)]
pub enum GlobalInit {
    Scalar(Constant),
    /// Runs of `(count, elements)`; a run with no elements is `count`
    /// zero-filled words.
    Array(Vec<(u32, Vec<Constant>)>),
}

#[derive(Clone, Debug)]
pub struct GlobalVariable {
    pub name: Id,
    pub ty: Type,
    pub init: GlobalInit,
}

#[derive(Clone, Debug)]
pub struct Module {
    pub name: Id,
    pub globals: Vec<GlobalVariable>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: Id) -> Self {
        Module {
            name,
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn add_global(&mut self, var: GlobalVariable) {
        self.globals.push(var);
    }

    pub fn global_ty(&self, name: Id) -> &Type {
        &self
            .globals
            .iter()
            .find(|g| g.name == name)
            .unwrap_or_else(|| panic!("unknown global @{name}"))
            .ty
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for global in &self.globals {
            write!(f, "@{} : {} = ", global.name, global.ty)?;
            match &global.init {
                GlobalInit::Scalar(c) => writeln!(f, "{c}")?,
                GlobalInit::Array(runs) => {
                    write!(f, "[")?;
                    let mut first = true;
                    for (count, elements) in runs {
                        if !first {
                            write!(f, ", ")?;
                        }
                        first = false;
                        if elements.is_empty() {
                            write!(f, "zero x {count}")?;
                        } else {
                            for (i, e) in elements.iter().enumerate() {
                                if i > 0 {
                                    write!(f, ", ")?;
                                }
                                write!(f, "{e}")?;
                            }
                        }
                    }
                    writeln!(f, "]")?;
                }
            }
        }
        for func in &self.functions {
            let params: Vec<String> = func
                .params
                .iter()
                .map(|p| format!("{p} : {}", func.value_ty(*p)))
                .collect();
            writeln!(
                f,
                "fn {}({}) -> {} {{",
                func.name,
                params.join(", "),
                func.ret_ty
            )?;
            for block in &func.blocks {
                writeln!(f, "{}:", block.name)?;
                for inst in &block.insts {
                    writeln!(f, "    {}", DisplayInst(func, inst))?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

struct DisplayInst<'a>(&'a Function, &'a Instruction);

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let DisplayInst(func, inst) = self;
        match inst {
            Instruction::Alloc { result, for_param } => {
                write!(f, "{result} = alloc {}", func.value_ty(*result).base_type())?;
                if for_param.is_some() {
                    write!(f, " ; param")?;
                }
                Ok(())
            }
            Instruction::Store { value, dest } => write!(f, "store {value}, {dest}"),
            Instruction::Unary {
                op,
                result,
                operand,
            } => {
                let name = match op {
                    UnaryOp::Load => "load",
                    UnaryOp::Itof => "itof",
                    UnaryOp::Ftoi => "ftoi",
                };
                write!(f, "{result} = {name} {operand}")
            }
            Instruction::Binary {
                op,
                result,
                lhs,
                rhs,
            } => write!(f, "{result} = {op:?} {lhs}, {rhs}"),
            Instruction::Gep {
                result,
                ptr,
                indexes,
            } => {
                write!(f, "{result} = getelementptr {ptr}")?;
                for idx in indexes {
                    write!(f, ", {idx}")?;
                }
                Ok(())
            }
            Instruction::BitCast { result, ptr } => write!(f, "{result} = bitcast {ptr}"),
            Instruction::Call {
                result,
                callee,
                args,
            } => {
                if let Some(result) = result {
                    write!(f, "{result} = ")?;
                }
                write!(f, "call {callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Instruction::Ret { value } => match value {
                Some(v) => write!(f, "ret {v}"),
                None => write!(f, "ret"),
            },
            Instruction::Jump { target } => write!(f, "jump {}", func.blocks[target.0].name),
            Instruction::CondJump {
                op,
                lhs,
                rhs,
                tt,
                ff,
            } => write!(
                f,
                "jump_{op:?} {lhs}, {rhs}, {}, {}",
                func.blocks[tt.0].name, func.blocks[ff.0].name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;

    #[test]
    fn byte_lengths() {
        assert_eq!(Type::Int32.byte_len(), 4);
        assert_eq!(Type::Float32.byte_len(), 4);
        assert_eq!(Type::Int32.pointer_to().byte_len(), 8);
        assert_eq!(Type::array_of(Type::Int32, 1024).byte_len(), 4096);
        assert_eq!(Type::array_of(Type::Float32, 3).byte_len(), 12);
    }

    #[test]
    fn base_type_unwraps_one_level() {
        let arr = Type::array_of(Type::Float32, 8);
        assert_eq!(*arr.base_type(), Type::Float32);
        let ptr = Type::Int32.pointer_to();
        assert_eq!(*ptr.base_type(), Type::Int32);
        assert_eq!(*Type::Void.base_type(), Type::Void);
    }

    #[test]
    fn value_table_types_values() {
        let mut f = Function::new(intern("f"), Type::Int32);
        let a = f.new_value(Type::Float32);
        let b = f.new_value(Type::Int32.pointer_to());
        assert_ne!(a, b);
        assert!(f.value_ty(a).is_float());
        assert!(f.value_ty(b).is_pointer());
    }
}
