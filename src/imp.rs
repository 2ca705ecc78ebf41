use hashbrown::HashSet;

use crate::name::Name;
use crate::expr::{ BaseTy, BinOp, UnOp, CmpOp, Direction, LitVal };
use crate::errors::TabResult;
use crate::compiler_err;

/// The imperative IR: typed instructions over scalars and raw pointers,
/// explicit allocation, and structured loops. This is the last stop
/// before native code generation (which is someone else's job).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrSpace {
    Stack,
    Heap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IType {
    Scalar(BaseTy),
    Ptr(AddrSpace, Device, BaseTy),
}

impl IType {
    pub fn is_ptr(&self) -> bool {
        match self {
            IType::Ptr(..) => true,
            IType::Scalar(..) => false,
        }
    }

    pub fn elem_ty(&self) -> BaseTy {
        match self {
            IType::Scalar(b) => *b,
            IType::Ptr(_, _, b) => *b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IVar {
    pub name : Name,
    pub ty : IType,
}

impl IVar {
    pub fn mk(name : Name, ty : IType) -> Self {
        IVar { name, ty }
    }
}

pub type IBinder = IVar;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IExpr {
    ILit(LitVal),
    IVarRef(IVar),
}

impl IExpr {
    pub fn get_itype(&self) -> IType {
        match self {
            IExpr::ILit(l) => IType::Scalar(l.base_ty()),
            IExpr::IVarRef(v) => v.ty,
        }
    }
}

pub fn ilit_int(i : i64) -> IExpr {
    IExpr::ILit(LitVal::IntLit(i))
}

/// Scalar operations and pointer arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpOp {
    IBinOp(BinOp, IExpr, IExpr),
    IUnOp(UnOp, IExpr),
    ICmp(CmpOp, IExpr, IExpr),
    FCmp(CmpOp, IExpr, IExpr),
    ISelect(IExpr, IExpr, IExpr),
    PtrOffset(IExpr, IExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpInstr {
    IPrimOp(ImpOp),
    ICastOp(IType, IExpr),
    Alloc(AddrSpace, BaseTy, IExpr),
    Free(IExpr),
    MemCopy { dest : IExpr, src : IExpr, numel : IExpr },
    Store(IExpr, IExpr),
    Load(IExpr),
    IThrowError,
    IFor(Direction, IBinder, IExpr, ImpBlock),
    IWhile(ImpBlock, ImpBlock),
    ICond(IExpr, ImpBlock, ImpBlock),
    ILaunch(Name, IExpr, Vec<IExpr>),
}

impl ImpInstr {
    /// The type of the value an instruction binds, if any. Control flow
    /// and stores bind nothing.
    pub fn result_ty(&self, main_device : Device) -> TabResult<Option<IType>> {
        Ok(match self {
            ImpInstr::IPrimOp(op) => Some(op_result_ty(op)?),
            ImpInstr::ICastOp(ty, _) => Some(*ty),
            ImpInstr::Alloc(space, b, _) => Some(IType::Ptr(*space, main_device, *b)),
            ImpInstr::Load(ptr) => match ptr.get_itype() {
                IType::Ptr(_, _, b) => Some(IType::Scalar(b)),
                owise => compiler_err!("Load from a non-pointer : {:?}", owise),
            },
            ImpInstr::Free(..) | ImpInstr::MemCopy { .. } | ImpInstr::Store(..)
            | ImpInstr::IThrowError | ImpInstr::IFor(..) | ImpInstr::IWhile(..)
            | ImpInstr::ICond(..) | ImpInstr::ILaunch(..) => None,
        })
    }
}

fn op_result_ty(op : &ImpOp) -> TabResult<IType> {
    Ok(match op {
        ImpOp::IBinOp(o, _, _) => match o {
            BinOp::BAnd | BinOp::BOr => IType::Scalar(BaseTy::BoolType),
            BinOp::IAdd | BinOp::ISub | BinOp::IMul | BinOp::IDiv | BinOp::IRem =>
                IType::Scalar(BaseTy::IntType),
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv =>
                IType::Scalar(BaseTy::RealType),
        },
        ImpOp::IUnOp(o, _) => match o {
            UnOp::FNeg => IType::Scalar(BaseTy::RealType),
            UnOp::INeg => IType::Scalar(BaseTy::IntType),
            UnOp::BNot => IType::Scalar(BaseTy::BoolType),
        },
        ImpOp::ICmp(..) | ImpOp::FCmp(..) => IType::Scalar(BaseTy::BoolType),
        ImpOp::ISelect(_, x, _) => x.get_itype(),
        ImpOp::PtrOffset(ptr, _) => match ptr.get_itype() {
            ty @ IType::Ptr(..) => ty,
            owise => compiler_err!("PtrOffset of a non-pointer : {:?}", owise),
        },
    })
}

/// One statement: an instruction, optionally binding its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpStmt {
    pub binder : Option<IBinder>,
    pub instr : ImpInstr,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImpBlock {
    pub stmts : Vec<ImpStmt>,
    pub results : Vec<IExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    OrdinaryFun,
    EntryFun,
    MCThreadLaunch,
    CudaKernelLaunch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpFunction {
    pub name : Name,
    pub cc : CallingConvention,
    pub args : Vec<IBinder>,
    pub body : ImpBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpModule {
    pub funs : Vec<ImpFunction>,
    pub main : Name,
}

impl ImpModule {
    pub fn get_main(&self) -> TabResult<&ImpFunction> {
        match self.funs.iter().find(|f| f.name == self.main) {
            Some(f) => Ok(f),
            None => compiler_err!("module has no main function {:?}", self.main),
        }
    }
}

// ----------------------------------------------------------------------
// free variables / well-formedness

fn fiv_expr(e : &IExpr, acc : &mut HashSet<Name>, bound : &HashSet<Name>) {
    if let IExpr::IVarRef(v) = e {
        if !bound.contains(&v.name) {
            acc.insert(v.name.clone());
        }
    }
}

fn fiv_op(op : &ImpOp, acc : &mut HashSet<Name>, bound : &HashSet<Name>) {
    match op {
        ImpOp::IBinOp(_, x, y) | ImpOp::ICmp(_, x, y) | ImpOp::FCmp(_, x, y)
        | ImpOp::PtrOffset(x, y) => {
            fiv_expr(x, acc, bound);
            fiv_expr(y, acc, bound);
        },
        ImpOp::IUnOp(_, x) => fiv_expr(x, acc, bound),
        ImpOp::ISelect(p, x, y) => {
            fiv_expr(p, acc, bound);
            fiv_expr(x, acc, bound);
            fiv_expr(y, acc, bound);
        },
    }
}

fn fiv_instr(instr : &ImpInstr, acc : &mut HashSet<Name>, bound : &mut HashSet<Name>) {
    match instr {
        ImpInstr::IPrimOp(op) => fiv_op(op, acc, bound),
        ImpInstr::ICastOp(_, x) | ImpInstr::Free(x) | ImpInstr::Load(x) =>
            fiv_expr(x, acc, bound),
        ImpInstr::Alloc(_, _, n) => fiv_expr(n, acc, bound),
        ImpInstr::MemCopy { dest, src, numel } => {
            fiv_expr(dest, acc, bound);
            fiv_expr(src, acc, bound);
            fiv_expr(numel, acc, bound);
        },
        ImpInstr::Store(d, v) => {
            fiv_expr(d, acc, bound);
            fiv_expr(v, acc, bound);
        },
        ImpInstr::IThrowError => (),
        ImpInstr::IFor(_, i, n, body) => {
            fiv_expr(n, acc, bound);
            let added = bound.insert(i.name.clone());
            fiv_block_inner(body, acc, bound);
            if added {
                bound.remove(&i.name);
            }
        },
        ImpInstr::IWhile(cond, body) => {
            fiv_block_inner(cond, acc, bound);
            fiv_block_inner(body, acc, bound);
        },
        ImpInstr::ICond(p, t, f) => {
            fiv_expr(p, acc, bound);
            fiv_block_inner(t, acc, bound);
            fiv_block_inner(f, acc, bound);
        },
        ImpInstr::ILaunch(_, n, args) => {
            fiv_expr(n, acc, bound);
            for a in args {
                fiv_expr(a, acc, bound);
            }
        },
    }
}

fn fiv_block_inner(block : &ImpBlock, acc : &mut HashSet<Name>, bound : &mut HashSet<Name>) {
    let mut added = Vec::new();
    for stmt in &block.stmts {
        fiv_instr(&stmt.instr, acc, bound);
        if let Some(b) = &stmt.binder {
            if bound.insert(b.name.clone()) {
                added.push(b.name.clone());
            }
        }
    }
    for r in &block.results {
        fiv_expr(r, acc, bound);
    }
    for n in added {
        bound.remove(&n);
    }
}

/// Free Imp variables of a block. For an emitted kernel this must be
/// empty once the kernel's argument binders are subtracted.
pub fn free_ivars(block : &ImpBlock) -> HashSet<Name> {
    let mut acc = HashSet::new();
    fiv_block_inner(block, &mut acc, &mut HashSet::new());
    acc
}

/// Light well-formedness check: every function must be closed by its
/// argument list. Violations are compiler bugs.
pub fn check_module(m : &ImpModule) -> TabResult<()> {
    for f in &m.funs {
        let mut bound : HashSet<Name> = f.args.iter().map(|a| a.name.clone()).collect();
        let mut acc = HashSet::new();
        fiv_block_inner(&f.body, &mut acc, &mut bound);
        if !acc.is_empty() {
            compiler_err!("function {:?} is not closed; escaped vars : {:?}", f.name, acc)
        }
    }
    m.get_main()?;
    Ok(())
}

#[cfg(test)]
mod imp_tests {
    use super::*;
    use crate::name::{ mk_gen_name, mk_name, NameTag };

    #[test]
    fn free_ivars_respect_binders() {
        let i = IVar::mk(mk_gen_name("i"), IType::Scalar(BaseTy::IntType));
        let outer = IVar::mk(mk_gen_name("buf"),
                             IType::Ptr(AddrSpace::Heap, Device::Cpu, BaseTy::IntType));
        let body = ImpBlock {
            stmts : vec![ImpStmt {
                binder : None,
                instr : ImpInstr::Store(IExpr::IVarRef(outer.clone()),
                                        IExpr::IVarRef(i.clone())),
            }],
            results : Vec::new(),
        };
        let loop_block = ImpBlock {
            stmts : vec![ImpStmt {
                binder : None,
                instr : ImpInstr::IFor(Direction::Fwd, i, ilit_int(4), body),
            }],
            results : Vec::new(),
        };
        let fvs = free_ivars(&loop_block);
        assert!(fvs.contains(&outer.name));
        assert_eq!(fvs.len(), 1);
    }

    #[test]
    fn module_check_requires_closure() {
        let stray = IVar::mk(mk_gen_name("stray"), IType::Scalar(BaseTy::IntType));
        let main = mk_name(NameTag::TopFunName, "impMain", 0);
        let body = ImpBlock {
            stmts : Vec::new(),
            results : vec![IExpr::IVarRef(stray)],
        };
        let m = ImpModule {
            funs : vec![ImpFunction {
                name : main.clone(),
                cc : CallingConvention::EntryFun,
                args : Vec::new(),
                body,
            }],
            main,
        };
        assert!(check_module(&m).is_err());
    }
}
