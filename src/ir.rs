//! The operation stream that the [`Instrumenter`](crate::instrument::Instrumenter)
//! consumes and produces.
//!
//! A [`Block`] is one code unit: a flat list of [`Stmt`]s over typed
//! temporaries, followed by an exit to `next`.  The host decodes machine code
//! into blocks; this crate never looks at machine code itself.  Expressions
//! compare structurally (`PartialEq`), which is what the read/write merge in
//! [`EventBuffer`](crate::event::EventBuffer) relies on.

use crate::event::EventKind;

/// Value types of expressions and temporaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    V128,
    V256,
}

impl Ty {
    /// Size of a value of this type in memory.  `I1` occupies a byte.
    pub fn size(self) -> usize {
        match self {
            Ty::I1 | Ty::I8 => 1,
            Ty::I16 => 2,
            Ty::I32 | Ty::F32 => 4,
            Ty::I64 | Ty::F64 => 8,
            Ty::I128 | Ty::V128 => 16,
            Ty::V256 => 32,
        }
    }
}

/// Index of a temporary in [`Block::tmps`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Temp(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    CmpEq,
    CmpNe,
    CmpLt,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Const { value: u64, ty: Ty },
    Tmp(Temp),
    /// Read of a guest register.
    Get { offset: u32, ty: Ty },
    Load { ty: Ty, addr: Box<Expr> },
    Binop {
        op: BinOp,
        ty: Ty,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ite {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// A 64-bit constant, the usual shape of an absolute address.
    pub fn addr(value: u64) -> Self {
        Expr::Const { value, ty: Ty::I64 }
    }

    pub fn constant(value: u64, ty: Ty) -> Self {
        Expr::Const { value, ty }
    }

    pub fn load(ty: Ty, addr: Expr) -> Self {
        Expr::Load {
            ty,
            addr: Box::new(addr),
        }
    }

    pub fn binop(op: BinOp, ty: Ty, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binop {
            op,
            ty,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JumpKind {
    Boring,
    Call,
    Ret,
    Syscall,
    SigTrap,
}

/// Memory effect a helper call declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Effect {
    None,
    Read,
    Write,
    Modify,
}

/// Memory range touched by a helper call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemRange {
    pub addr: Expr,
    pub size: usize,
}

/// A call from the code unit into a host helper with side effects the host
/// cannot express as plain statements.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dirty {
    pub callee: String,
    pub guard: Option<Expr>,
    pub args: Vec<Expr>,
    pub dst: Option<Temp>,
    pub effect: Effect,
    /// Must be `Some` exactly when `effect` is not [`Effect::None`].
    pub mem: Option<MemRange>,
}

/// Helper calls injected by the instrumenter.  At run time the host hands
/// each of them to [`Tracer::dispatch`](crate::runtime::Tracer::dispatch).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HelperCall {
    Access {
        kind: EventKind,
        addr: Expr,
        size: usize,
        guard: Option<Expr>,
    },
    Function {
        name: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stmt {
    NoOp,
    /// Start of a guest instruction of `len` bytes at `addr`.
    IMark {
        addr: u64,
        len: usize,
    },
    AbiHint {
        base: Expr,
        len: usize,
        nia: Expr,
    },
    Put {
        offset: u32,
        data: Expr,
    },
    PutI {
        base: u32,
        index: Expr,
        data: Expr,
    },
    WrTmp {
        tmp: Temp,
        data: Expr,
    },
    Store {
        addr: Expr,
        data: Expr,
    },
    StoreG {
        guard: Expr,
        addr: Expr,
        data: Expr,
    },
    /// Guarded load of a `loaded`-typed value; `alt` is used when the guard
    /// is false.
    LoadG {
        guard: Expr,
        dst: Temp,
        addr: Expr,
        alt: Expr,
        loaded: Ty,
    },
    /// Compare-and-swap; `*_hi` are present for double-width CAS.
    Cas {
        old_lo: Temp,
        old_hi: Option<Temp>,
        addr: Expr,
        expected_lo: Expr,
        expected_hi: Option<Expr>,
        data_lo: Expr,
        data_hi: Option<Expr>,
    },
    /// Load-linked when `store_data` is `None`, store-conditional otherwise.
    Llsc {
        result: Temp,
        addr: Expr,
        store_data: Option<Expr>,
    },
    Dirty(Dirty),
    MemBarrier,
    Exit {
        guard: Expr,
        target: u64,
        jump: JumpKind,
    },
    Helper(HelperCall),
    /// An operation the host decoded but this crate has no model for.
    Opaque(String),
}

/// One code unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub tmps: Vec<Ty>,
    pub stmts: Vec<Stmt>,
    pub next: Expr,
    pub jump: JumpKind,
}

impl Block {
    pub fn new(next: Expr, jump: JumpKind) -> Self {
        Block {
            tmps: Vec::new(),
            stmts: Vec::new(),
            next,
            jump,
        }
    }

    /// Copy of this block with the same type environment and exit, but no
    /// statements.
    pub fn empty_copy(&self) -> Self {
        Block {
            tmps: self.tmps.clone(),
            stmts: Vec::with_capacity(self.stmts.len()),
            next: self.next.clone(),
            jump: self.jump,
        }
    }

    pub fn new_tmp(&mut self, ty: Ty) -> Temp {
        self.tmps.push(ty);
        Temp(self.tmps.len() as u32 - 1)
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    pub fn type_of_tmp(&self, tmp: Temp) -> Option<Ty> {
        self.tmps.get(tmp.0 as usize).copied()
    }

    /// Type of `expr` in this block's environment, `None` if it mentions an
    /// undeclared temporary.
    pub fn type_of(&self, expr: &Expr) -> Option<Ty> {
        match expr {
            Expr::Const { ty, .. } | Expr::Get { ty, .. } | Expr::Load { ty, .. } => Some(*ty),
            Expr::Binop { ty, .. } => Some(*ty),
            Expr::Tmp(tmp) => self.type_of_tmp(*tmp),
            Expr::Ite { then, .. } => self.type_of(then),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_of_expressions() {
        let mut block = Block::new(Expr::addr(0), JumpKind::Boring);
        let t = block.new_tmp(Ty::I16);

        assert_eq!(block.type_of(&Expr::Tmp(t)), Some(Ty::I16));
        assert_eq!(block.type_of(&Expr::Tmp(Temp(7))), None);
        assert_eq!(
            block.type_of(&Expr::load(Ty::F64, Expr::addr(0x10))),
            Some(Ty::F64)
        );
        let ite = Expr::Ite {
            cond: Box::new(Expr::constant(1, Ty::I1)),
            then: Box::new(Expr::Tmp(t)),
            otherwise: Box::new(Expr::constant(0, Ty::I16)),
        };
        assert_eq!(block.type_of(&ite).map(Ty::size), Some(2));
    }

    #[test]
    fn empty_copy_keeps_environment() {
        let mut block = Block::new(Expr::addr(0x400), JumpKind::Ret);
        block.new_tmp(Ty::I32);
        block.push(Stmt::NoOp);

        let copy = block.empty_copy();
        assert!(copy.stmts.is_empty());
        assert_eq!(copy.tmps, block.tmps);
        assert_eq!(copy.next, block.next);
        assert_eq!(copy.jump, JumpKind::Ret);
    }
}
