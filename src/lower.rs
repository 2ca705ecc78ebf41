use std::sync::Arc;

use hashbrown::HashMap;

use crate::name::{ Name, NameTag, mk_name };
use crate::expr::*;
use crate::imp::*;
use crate::algebra::{ self, ScalarEmitter };
use crate::source::Backend;
use crate::errors::TabResult;
use crate::compiler_err;

/// Core → Imp lowering. Structured values are decomposed into
/// destinations that mirror the source type but hold pointers at the
/// leaves; `for` over a finite index set becomes a pointer-indexed
/// scalar loop; `RunX` regions become explicitly managed buffers.

/// How the result of a module is reconstructed from the low-level
/// return values: substituting the returned values for `binders` in
/// `atom` rebuilds the high-level result.
#[derive(Debug, Clone)]
pub struct AtomRecon {
    pub binders : Vec<Binder>,
    pub atom : Atom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Managed,
    Unmanaged,
}

/// A destination mirrors the structure of a type, with pointers at the
/// base-type leaves. The leaf records the index atoms of every
/// enclosing table dimension; they are applied (as a flat offset) when
/// the leaf is finally stored to or loaded from.
#[derive(Debug, Clone)]
pub enum Dest {
    BaseDest { ptr : IExpr, idxs : Vec<Atom> },
    TabDest(Binder, Box<Dest>),
    DataConDest(Arc<DataDef>, Vec<Atom>, Vec<Dest>),
    RecDest(LabeledItems<Dest>),
    PairDest(Box<Dest>, Box<Dest>),
    UnitDest,
    SumAsProdDest(Type, Box<Dest>, Vec<Vec<Dest>>),
    CharDest(Box<Dest>),
    IntRangeDest(Atom, Atom, Box<Dest>),
    IndexRangeDest(Type, Limit, Limit, Box<Dest>),
    ConstDest(Atom),
}

pub struct LowerCtx {
    scope : Scope,
    stmts : Vec<ImpStmt>,
    env : SubstEnv,
    dests : HashMap<Name, Dest>,
    ivar_tys : HashMap<Name, IType>,
    backend : Backend,
    cur_dev : Device,
    parallel_top : bool,
    to_free : Vec<IExpr>,
    funcs : Vec<ImpFunction>,
    ptr_lits : Vec<LitVal>,
}

fn as_int_lit(x : &IExpr) -> Option<i64> {
    match x {
        IExpr::ILit(LitVal::IntLit(i)) => Some(*i),
        _ => None,
    }
}

/// The size/offset arithmetic folds constants as it goes, so
/// statically-sized index sets produce literal allocation sizes and
/// offsets stay free of dead multiplications by zero or one.
impl ScalarEmitter for LowerCtx {
    type Val = IExpr;

    fn lit_int(&mut self, i : i64) -> IExpr {
        ilit_int(i)
    }

    fn iadd(&mut self, x : IExpr, y : IExpr) -> TabResult<IExpr> {
        match (as_int_lit(&x), as_int_lit(&y)) {
            (Some(a), Some(b)) => Ok(ilit_int(a + b)),
            (Some(0), _) => Ok(y),
            (_, Some(0)) => Ok(x),
            _ => self.emit_pure(ImpInstr::IPrimOp(ImpOp::IBinOp(BinOp::IAdd, x, y))),
        }
    }

    fn isub(&mut self, x : IExpr, y : IExpr) -> TabResult<IExpr> {
        match (as_int_lit(&x), as_int_lit(&y)) {
            (Some(a), Some(b)) => Ok(ilit_int(a - b)),
            (_, Some(0)) => Ok(x),
            _ => self.emit_pure(ImpInstr::IPrimOp(ImpOp::IBinOp(BinOp::ISub, x, y))),
        }
    }

    fn imul(&mut self, x : IExpr, y : IExpr) -> TabResult<IExpr> {
        match (as_int_lit(&x), as_int_lit(&y)) {
            (Some(a), Some(b)) => Ok(ilit_int(a * b)),
            (Some(0), _) | (_, Some(0)) => Ok(ilit_int(0)),
            (Some(1), _) => Ok(y),
            (_, Some(1)) => Ok(x),
            _ => self.emit_pure(ImpInstr::IPrimOp(ImpOp::IBinOp(BinOp::IMul, x, y))),
        }
    }

    fn clamp0(&mut self, x : IExpr) -> TabResult<IExpr> {
        if let Some(a) = as_int_lit(&x) {
            return Ok(ilit_int(a.max(0)))
        }
        let neg = self.emit_pure(ImpInstr::IPrimOp(
            ImpOp::ICmp(CmpOp::Less, x.clone(), ilit_int(0))))?;
        self.emit_pure(ImpInstr::IPrimOp(ImpOp::ISelect(neg, ilit_int(0), x)))
    }

    fn scalar(&mut self, a : &Atom) -> TabResult<IExpr> {
        self.atom_to_iexpr(a)
    }
}

impl LowerCtx {
    pub fn new(backend : Backend) -> Self {
        LowerCtx {
            scope : Scope::new(),
            stmts : Vec::new(),
            env : SubstEnv::new(),
            dests : HashMap::new(),
            ivar_tys : HashMap::new(),
            backend,
            cur_dev : backend.main_device(),
            parallel_top : true,
            to_free : Vec::new(),
            funcs : Vec::new(),
            ptr_lits : Vec::new(),
        }
    }

    fn freshen(&mut self, hint : &str) -> Name {
        let n = mk_name(NameTag::GenName, hint, 0)
            .fresh_in(|n| self.scope.contains_key(n));
        self.scope.insert(n.clone(), scope_entry(int_ty()));
        n
    }

    /// Emit an instruction, binding its result (if it has one) to a
    /// fresh Imp variable.
    fn emit_instr(&mut self, instr : ImpInstr) -> TabResult<Option<IExpr>> {
        match instr.result_ty(self.cur_dev)? {
            Some(ty) => {
                let name = self.freshen("v");
                self.ivar_tys.insert(name.clone(), ty);
                let binder = IVar::mk(name, ty);
                let out = IExpr::IVarRef(binder.clone());
                self.stmts.push(ImpStmt { binder : Some(binder), instr });
                Ok(Some(out))
            },
            None => {
                self.stmts.push(ImpStmt { binder : None, instr });
                Ok(None)
            },
        }
    }

    fn emit_pure(&mut self, instr : ImpInstr) -> TabResult<IExpr> {
        match self.emit_instr(instr)? {
            Some(x) => Ok(x),
            None => compiler_err!("expected a value-producing instruction"),
        }
    }

    /// Scalar atoms (literals, loaded variables) as Imp operands.
    fn atom_to_iexpr(&mut self, a : &Atom) -> TabResult<IExpr> {
        match a.as_ref() {
            InnerAtom::Con(PrimCon::Lit(l)) => Ok(IExpr::ILit(l.clone())),
            InnerAtom::AVar(v) => {
                match self.ivar_tys.get(&v.name) {
                    Some(ty) => Ok(IExpr::IVarRef(IVar::mk(v.name.clone(), *ty))),
                    None => compiler_err!("variable {:?} has no Imp binding", v.name),
                }
            },
            owise => compiler_err!("not a scalar operand : {:?}", owise),
        }
    }

    fn ivar_atom(&mut self, x : &IExpr) -> TabResult<Atom> {
        match x {
            IExpr::ILit(l) => Ok(mk_con(PrimCon::Lit(l.clone()))),
            IExpr::IVarRef(v) => {
                self.ivar_tys.insert(v.name.clone(), v.ty);
                let ty = match v.ty {
                    IType::Scalar(b) => mk_tc(PrimTC::BaseType(b)),
                    IType::Ptr(..) => int_ty(),
                };
                Ok(mk_var_nt(v.name.clone(), ty))
            },
        }
    }

    fn subst(&self, a : &Atom) -> TabResult<Atom> {
        subst_atom(&self.env, &self.scope, a)
    }

    // ------------------------------------------------------------------
    // destinations

    /// Allocate a destination mirroring `ty`. Table dimensions extend
    /// the index stack; each base-type leaf allocates one buffer sized
    /// to the product of the enclosing index-set sizes. Small
    /// literal-sized managed buffers live on the stack; everything else
    /// goes on the heap, with managed heap buffers freed at block exit
    /// and unmanaged ones recorded as pointer literals for the caller.
    pub fn make_alloc_dest(&mut self, kind : AllocKind, hint : &str, ty : &Type) -> TabResult<Dest> {
        let mut idx_binders = Vec::new();
        self.alloc_dest_rec(kind, hint, ty, &mut idx_binders)
    }

    fn alloc_dest_rec(&mut self,
                      kind : AllocKind,
                      hint : &str,
                      ty : &Type,
                      idxs : &mut Vec<Binder>) -> TabResult<Dest> {
        match ty.as_ref() {
            InnerAtom::Pi(Arrow::Tab, abs) => {
                let name = self.freshen(abs.binder.name.hint());
                let binder = Var::mk(name, abs.binder.ty.clone());
                // a dependent element type sees the fresh index binder
                let elem = {
                    let mut env = SubstEnv::new();
                    env.insert(abs.binder.name.clone(), mk_var(binder.clone()));
                    subst_atom(&env, &self.scope, &abs.body.1)?
                };
                idxs.push(binder.clone());
                let inner = self.alloc_dest_rec(kind, hint, &elem, idxs)?;
                idxs.pop();
                Ok(Dest::TabDest(binder, Box::new(inner)))
            },
            InnerAtom::TC(PrimTC::BaseType(b)) => {
                let idx_tys : Vec<Type> = idxs.iter().map(|v| v.ty.clone()).collect();
                let numel = algebra::elem_count(self, &idx_tys)?;
                let space = match (&numel, kind) {
                    (IExpr::ILit(LitVal::IntLit(n)), AllocKind::Managed) if *n <= 256 =>
                        AddrSpace::Stack,
                    _ => AddrSpace::Heap,
                };
                let ptr = self.emit_pure(ImpInstr::Alloc(space, *b, numel))?;
                match (space, kind) {
                    (AddrSpace::Heap, AllocKind::Managed) => self.to_free.push(ptr.clone()),
                    (AddrSpace::Heap, AllocKind::Unmanaged) => {
                        if let IExpr::IVarRef(v) = &ptr {
                            self.ptr_lits.push(LitVal::PtrLit(v.name.clone(), *b));
                        }
                    },
                    _ => (),
                }
                Ok(Dest::BaseDest {
                    ptr,
                    idxs : idxs.iter().cloned().map(mk_var).collect(),
                })
            },
            InnerAtom::TC(PrimTC::PairType(l, r)) => {
                let dl = self.alloc_dest_rec(kind, hint, l, idxs)?;
                let dr = self.alloc_dest_rec(kind, hint, r, idxs)?;
                Ok(Dest::PairDest(Box::new(dl), Box::new(dr)))
            },
            InnerAtom::TC(PrimTC::UnitType) => Ok(Dest::UnitDest),
            InnerAtom::TC(PrimTC::RecType(items)) =>
                Ok(Dest::RecDest(items.try_map(|t| self.alloc_dest_rec(kind, hint, t, idxs))?)),
            InnerAtom::TC(PrimTC::TypeCon(def, params)) => {
                if def.cons.len() == 1 {
                    let mut fields = Vec::new();
                    for fty in &def.cons[0].field_tys {
                        fields.push(self.alloc_dest_rec(kind, hint, fty, idxs)?);
                    }
                    Ok(Dest::DataConDest(def.clone(), params.clone(), fields))
                } else {
                    let tag = self.alloc_dest_rec(kind, hint, &int_ty(), idxs)?;
                    let mut payloads = Vec::new();
                    for con in &def.cons {
                        let mut fields = Vec::new();
                        for fty in &con.field_tys {
                            fields.push(self.alloc_dest_rec(kind, hint, fty, idxs)?);
                        }
                        payloads.push(fields);
                    }
                    Ok(Dest::SumAsProdDest(ty.clone(), Box::new(tag), payloads))
                }
            },
            InnerAtom::TC(PrimTC::VariantType(items)) => {
                let tag = self.alloc_dest_rec(kind, hint, &int_ty(), idxs)?;
                let mut payloads = Vec::new();
                for t in items.values() {
                    payloads.push(vec![self.alloc_dest_rec(kind, hint, t, idxs)?]);
                }
                Ok(Dest::SumAsProdDest(ty.clone(), Box::new(tag), payloads))
            },
            InnerAtom::TC(PrimTC::SumType(l, r)) => {
                let tag = self.alloc_dest_rec(kind, hint, &bool_ty(), idxs)?;
                let dl = self.alloc_dest_rec(kind, hint, l, idxs)?;
                let dr = self.alloc_dest_rec(kind, hint, r, idxs)?;
                Ok(Dest::SumAsProdDest(ty.clone(), Box::new(tag), vec![vec![dl], vec![dr]]))
            },
            InnerAtom::TC(PrimTC::IntRange(l, h)) => {
                let inner = self.alloc_dest_rec(kind, hint, &idx_rep_ty(), idxs)?;
                Ok(Dest::IntRangeDest(l.clone(), h.clone(), Box::new(inner)))
            },
            InnerAtom::TC(PrimTC::IndexRange(t, l, h)) => {
                let inner = self.alloc_dest_rec(kind, hint, &idx_rep_ty(), idxs)?;
                Ok(Dest::IndexRangeDest(t.clone(), l.clone(), h.clone(), Box::new(inner)))
            },
            InnerAtom::TC(PrimTC::CharType) => {
                let inner = self.alloc_dest_rec(kind, hint, &idx_rep_ty(), idxs)?;
                Ok(Dest::CharDest(Box::new(inner)))
            },
            owise => compiler_err!("cannot allocate a destination for type {:?}", owise),
        }
    }

    /// Substitute atoms inside a destination (used to apply an index to
    /// a table destination).
    fn subst_dest(&self, env : &SubstEnv, dest : &Dest) -> TabResult<Dest> {
        Ok(match dest {
            Dest::BaseDest { ptr, idxs } => Dest::BaseDest {
                ptr : ptr.clone(),
                idxs : idxs.iter()
                    .map(|a| subst_atom(env, &self.scope, a))
                    .collect::<TabResult<Vec<_>>>()?,
            },
            Dest::TabDest(b, inner) => {
                let ty = subst_atom(env, &self.scope, &b.ty)?;
                Dest::TabDest(Var::mk(b.name.clone(), ty),
                              Box::new(self.subst_dest(env, inner)?))
            },
            Dest::DataConDest(def, params, fields) => Dest::DataConDest(
                def.clone(),
                params.iter().map(|p| subst_atom(env, &self.scope, p))
                    .collect::<TabResult<Vec<_>>>()?,
                fields.iter().map(|d| self.subst_dest(env, d))
                    .collect::<TabResult<Vec<_>>>()?),
            Dest::RecDest(items) => Dest::RecDest(items.try_map(|d| self.subst_dest(env, d))?),
            Dest::PairDest(l, r) => Dest::PairDest(
                Box::new(self.subst_dest(env, l)?),
                Box::new(self.subst_dest(env, r)?)),
            Dest::UnitDest => Dest::UnitDest,
            Dest::SumAsProdDest(ty, tag, payloads) => Dest::SumAsProdDest(
                subst_atom(env, &self.scope, ty)?,
                Box::new(self.subst_dest(env, tag)?),
                payloads.iter()
                    .map(|alt| alt.iter().map(|d| self.subst_dest(env, d))
                         .collect::<TabResult<Vec<_>>>())
                    .collect::<TabResult<Vec<_>>>()?),
            Dest::CharDest(inner) => Dest::CharDest(Box::new(self.subst_dest(env, inner)?)),
            Dest::IntRangeDest(l, h, inner) => Dest::IntRangeDest(
                subst_atom(env, &self.scope, l)?,
                subst_atom(env, &self.scope, h)?,
                Box::new(self.subst_dest(env, inner)?)),
            Dest::IndexRangeDest(t, l, h, inner) => Dest::IndexRangeDest(
                subst_atom(env, &self.scope, t)?,
                l.clone(), h.clone(),
                Box::new(self.subst_dest(env, inner)?)),
            Dest::ConstDest(a) => Dest::ConstDest(subst_atom(env, &self.scope, a)?),
        })
    }

    /// Apply an index to a table destination.
    fn index_dest(&self, dest : &Dest, i : &Atom) -> TabResult<Dest> {
        match dest {
            Dest::TabDest(b, inner) => {
                let mut env = SubstEnv::new();
                env.insert(b.name.clone(), i.clone());
                self.subst_dest(&env, inner)
            },
            owise => compiler_err!("indexing a non-table destination : {:?}", owise),
        }
    }

    /// The pointer of a leaf, with the accumulated indices applied as a
    /// flat offset.
    fn leaf_ptr(&mut self, ptr : &IExpr, idxs : &[Atom]) -> TabResult<IExpr> {
        if idxs.is_empty() {
            return Ok(ptr.clone())
        }
        let mut pairs = Vec::with_capacity(idxs.len());
        for i in idxs {
            pairs.push((i.clone(), i.get_type()?));
        }
        let off = algebra::flat_offset(self, &pairs)?;
        if as_int_lit(&off) == Some(0) {
            return Ok(ptr.clone())
        }
        self.emit_pure(ImpInstr::IPrimOp(ImpOp::PtrOffset(ptr.clone(), off)))
    }

    /// Store a value into a destination. Types must agree structurally;
    /// a mismatch is a compiler bug.
    pub fn copy_atom(&mut self, dest : &Dest, src : &Atom) -> TabResult<()> {
        match dest {
            Dest::BaseDest { ptr, idxs } => {
                let val = self.atom_to_iexpr(src)?;
                let ptr_ty = ptr.get_itype();
                if ptr_ty.elem_ty() != val.get_itype().elem_ty() || !ptr_ty.is_ptr() {
                    compiler_err!("store type mismatch : {:?} into {:?}", val, ptr_ty)
                }
                let idxs = idxs.clone();
                let p = self.leaf_ptr(&ptr.clone(), &idxs)?;
                self.emit_instr(ImpInstr::Store(p, val))?;
                Ok(())
            },
            Dest::TabDest(b, _) => {
                let ix_ty = b.ty.clone();
                let n = algebra::index_set_size(self, &ix_ty)?;
                let src = src.clone();
                let dest = dest.clone();
                self.emit_loop(Direction::Fwd, n, |ctx, i_expr| {
                    let i_atom = ctx.ivar_atom(&i_expr)?;
                    let idx = ctx.int_to_index(&ix_ty, &i_atom)?;
                    let sub_dest = ctx.index_dest(&dest, &idx)?;
                    let elem = ctx.index_table_atom(&src, &idx)?;
                    ctx.copy_atom(&sub_dest, &elem)
                })
            },
            Dest::PairDest(l, r) => {
                let (sl, sr) = self.proj_pair(src)?;
                self.copy_atom(l, &sl)?;
                self.copy_atom(r, &sr)
            },
            Dest::UnitDest => Ok(()),
            Dest::RecDest(items) => match src.as_ref() {
                InnerAtom::Con(PrimCon::RecCon(fields)) => {
                    let zipped = items.zip_with(fields, |d, f| Ok((d.clone(), f.clone())))?;
                    for (d, f) in zipped.values() {
                        self.copy_atom(d, f)?;
                    }
                    Ok(())
                },
                owise => compiler_err!("copying a non-record into a record dest : {:?}", owise),
            },
            Dest::DataConDest(_, _, fields) => match src.as_ref() {
                InnerAtom::Con(PrimCon::DataCon(_, _, _, args)) if args.len() == fields.len() => {
                    for (d, a) in fields.iter().zip(args) {
                        self.copy_atom(d, a)?;
                    }
                    Ok(())
                },
                owise => compiler_err!("copying {:?} into a data-constructor dest", owise),
            },
            Dest::SumAsProdDest(_, tag, payloads) => match src.as_ref() {
                InnerAtom::Con(PrimCon::SumAsProd(_, src_tag, src_payloads)) => {
                    self.copy_atom(tag, src_tag)?;
                    for (ds, ss) in payloads.iter().zip(src_payloads) {
                        for (d, s) in ds.iter().zip(ss) {
                            self.copy_atom(d, s)?;
                        }
                    }
                    Ok(())
                },
                InnerAtom::Con(PrimCon::DataCon(_, _, con_ix, args)) => {
                    self.copy_atom(tag, &mk_int(*con_ix as i64))?;
                    match payloads.get(*con_ix) {
                        Some(fields) => {
                            for (d, a) in fields.iter().zip(args) {
                                self.copy_atom(d, a)?;
                            }
                            Ok(())
                        },
                        None => compiler_err!("constructor index {} out of range", con_ix),
                    }
                },
                InnerAtom::Con(PrimCon::VariantCon(tys, label, sub_ix, payload)) => {
                    let flat = crate::simplify::variant_alt_index(tys, label, *sub_ix)?;
                    self.copy_atom(tag, &mk_int(flat as i64))?;
                    match payloads.get(flat).and_then(|p| p.first()) {
                        Some(d) => self.copy_atom(d, payload),
                        None => compiler_err!("variant index {} out of range", flat),
                    }
                },
                owise => compiler_err!("copying {:?} into a sum dest", owise),
            },
            Dest::CharDest(inner) => match src.as_ref() {
                InnerAtom::Con(PrimCon::CharCon(i)) => self.copy_atom(inner, i),
                owise => compiler_err!("copying {:?} into a char dest", owise),
            },
            Dest::IntRangeDest(_, _, inner) => {
                let ord = algebra::index_ordinal(self, src)?;
                let ord_atom = self.ivar_atom(&ord)?;
                self.copy_atom(inner, &ord_atom)
            },
            Dest::IndexRangeDest(_, _, _, inner) => {
                let ord = algebra::index_ordinal(self, src)?;
                let ord_atom = self.ivar_atom(&ord)?;
                self.copy_atom(inner, &ord_atom)
            },
            Dest::ConstDest(..) => Ok(()),
        }
    }

    /// Load-add-store on the leaves; same shape as `copy_atom`.
    pub fn add_to_atom(&mut self, dest : &Dest, src : &Atom) -> TabResult<()> {
        match dest {
            Dest::BaseDest { ptr, idxs } => {
                let val = self.atom_to_iexpr(src)?;
                let idxs = idxs.clone();
                let p = self.leaf_ptr(&ptr.clone(), &idxs)?;
                let cur = self.emit_pure(ImpInstr::Load(p.clone()))?;
                let op = match val.get_itype().elem_ty() {
                    BaseTy::RealType => BinOp::FAdd,
                    BaseTy::IntType => BinOp::IAdd,
                    owise => compiler_err!("no accumulation at base type {:?}", owise),
                };
                let sum = self.emit_pure(ImpInstr::IPrimOp(ImpOp::IBinOp(op, cur, val)))?;
                self.emit_instr(ImpInstr::Store(p, sum))?;
                Ok(())
            },
            Dest::TabDest(b, _) => {
                let ix_ty = b.ty.clone();
                let n = algebra::index_set_size(self, &ix_ty)?;
                let src = src.clone();
                let dest = dest.clone();
                self.emit_loop(Direction::Fwd, n, |ctx, i_expr| {
                    let i_atom = ctx.ivar_atom(&i_expr)?;
                    let idx = ctx.int_to_index(&ix_ty, &i_atom)?;
                    let sub_dest = ctx.index_dest(&dest, &idx)?;
                    let elem = ctx.index_table_atom(&src, &idx)?;
                    ctx.add_to_atom(&sub_dest, &elem)
                })
            },
            Dest::PairDest(l, r) => {
                let (sl, sr) = self.proj_pair(src)?;
                self.add_to_atom(l, &sl)?;
                self.add_to_atom(r, &sr)
            },
            Dest::UnitDest => Ok(()),
            Dest::RecDest(items) => match src.as_ref() {
                InnerAtom::Con(PrimCon::RecCon(fields)) => {
                    let zipped = items.zip_with(fields, |d, f| Ok((d.clone(), f.clone())))?;
                    for (d, f) in zipped.values() {
                        self.add_to_atom(d, f)?;
                    }
                    Ok(())
                },
                owise => compiler_err!("accumulating a non-record : {:?}", owise),
            },
            owise => compiler_err!("no accumulation into dest {:?}", owise),
        }
    }

    fn proj_pair(&mut self, src : &Atom) -> TabResult<(Atom, Atom)> {
        match src.as_ref() {
            InnerAtom::Con(PrimCon::PairCon(l, r)) => Ok((l.clone(), r.clone())),
            owise => compiler_err!("projecting a non-pair : {:?}", owise),
        }
    }

    /// Read a destination back as an atom. Scalar leaves load; table
    /// destinations become named table handles resolved at indexing
    /// time.
    pub fn dest_to_atom(&mut self, dest : &Dest, ty : &Type) -> TabResult<Atom> {
        match (dest, ty.as_ref()) {
            (Dest::BaseDest { ptr, idxs }, _) => {
                let idxs = idxs.clone();
                let p = self.leaf_ptr(&ptr.clone(), &idxs)?;
                let v = self.emit_pure(ImpInstr::Load(p))?;
                self.ivar_atom(&v)
            },
            (Dest::TabDest(..), _) => {
                let name = self.freshen("tab");
                self.scope.insert(name.clone(), scope_entry(ty.clone()));
                self.dests.insert(name.clone(), dest.clone());
                self.ivar_tys.remove(&name);
                Ok(mk_var_nt(name, ty.clone()))
            },
            (Dest::PairDest(l, r), InnerAtom::TC(PrimTC::PairType(lt, rt))) => {
                let la = self.dest_to_atom(l, lt)?;
                let ra = self.dest_to_atom(r, rt)?;
                Ok(mk_pair(la, ra))
            },
            (Dest::UnitDest, _) => Ok(mk_unit()),
            (Dest::RecDest(items), InnerAtom::TC(PrimTC::RecType(tys))) => {
                let zipped = items.zip_with(tys, |d, t| self.dest_to_atom(d, t))?;
                Ok(mk_con(PrimCon::RecCon(zipped)))
            },
            (Dest::DataConDest(def, params, fields), _) => {
                let mut args = Vec::with_capacity(fields.len());
                for (d, fty) in fields.iter().zip(&def.cons[0].field_tys) {
                    args.push(self.dest_to_atom(d, fty)?);
                }
                Ok(mk_con(PrimCon::DataCon(def.clone(), params.clone(), 0, args)))
            },
            (Dest::SumAsProdDest(sum_ty, tag, payloads), _) => {
                let tag_atom = self.dest_to_atom(tag, &int_ty())?;
                let mut out = Vec::with_capacity(payloads.len());
                for alt in payloads {
                    let mut vals = Vec::with_capacity(alt.len());
                    for d in alt {
                        vals.push(self.dest_to_atom(d, &int_ty())?);
                    }
                    out.push(vals);
                }
                Ok(mk_con(PrimCon::SumAsProd(sum_ty.clone(), tag_atom, out)))
            },
            (Dest::CharDest(inner), _) => {
                let i = self.dest_to_atom(inner, &idx_rep_ty())?;
                Ok(mk_con(PrimCon::CharCon(i)))
            },
            (Dest::IntRangeDest(l, h, inner), _) => {
                let i = self.dest_to_atom(inner, &idx_rep_ty())?;
                Ok(mk_con(PrimCon::IntRangeVal(l.clone(), h.clone(), i)))
            },
            (Dest::IndexRangeDest(t, l, h, inner), _) => {
                let i = self.dest_to_atom(inner, &idx_rep_ty())?;
                Ok(mk_con(PrimCon::IndexRangeVal(t.clone(), l.clone(), h.clone(), i)))
            },
            (Dest::ConstDest(a), _) => Ok(a.clone()),
            (d, t) => compiler_err!("destination/type mismatch : {:?} at {:?}", d, t),
        }
    }

    /// Zero-fill a destination (writer accumulators).
    fn zero_dest(&mut self, dest : &Dest, ty : &Type) -> TabResult<()> {
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) =>
                self.copy_atom(dest, &mk_real(0.0)),
            InnerAtom::TC(PrimTC::BaseType(BaseTy::IntType)) =>
                self.copy_atom(dest, &mk_int(0)),
            InnerAtom::TC(PrimTC::UnitType) => Ok(()),
            InnerAtom::TC(PrimTC::PairType(lt, rt)) => match dest {
                Dest::PairDest(l, r) => {
                    self.zero_dest(l, lt)?;
                    self.zero_dest(r, rt)
                },
                owise => compiler_err!("zeroing {:?} at a pair type", owise),
            },
            InnerAtom::TC(PrimTC::RecType(tys)) => match dest {
                Dest::RecDest(items) => {
                    let zipped = items.zip_with(tys, |d, t| Ok((d.clone(), t.clone())))?;
                    for (d, t) in zipped.values() {
                        self.zero_dest(d, t)?;
                    }
                    Ok(())
                },
                owise => compiler_err!("zeroing {:?} at a record type", owise),
            },
            InnerAtom::Pi(Arrow::Tab, abs) => match dest {
                Dest::TabDest(b, _) => {
                    let ix_ty = b.ty.clone();
                    let elem_ty = abs.body.1.clone();
                    let n = algebra::index_set_size(self, &ix_ty)?;
                    let dest = dest.clone();
                    self.emit_loop(Direction::Fwd, n, |ctx, i_expr| {
                        let i_atom = ctx.ivar_atom(&i_expr)?;
                        let idx = ctx.int_to_index(&ix_ty, &i_atom)?;
                        let sub = ctx.index_dest(&dest, &idx)?;
                        ctx.zero_dest(&sub, &elem_ty)
                    })
                },
                owise => compiler_err!("zeroing {:?} at a table type", owise),
            },
            owise => compiler_err!("no zero at type {:?}", owise),
        }
    }

    // ------------------------------------------------------------------
    // loops and indexing

    fn emit_loop(&mut self,
                 dir : Direction,
                 n : IExpr,
                 body : impl FnOnce(&mut LowerCtx, IExpr) -> TabResult<()>) -> TabResult<()> {
        let name = self.freshen("i");
        let binder = IVar::mk(name.clone(), IType::Scalar(BaseTy::IntType));
        self.ivar_tys.insert(name, IType::Scalar(BaseTy::IntType));
        let saved = std::mem::replace(&mut self.stmts, Vec::new());
        let was_top = std::mem::replace(&mut self.parallel_top, false);
        let result = body(self, IExpr::IVarRef(binder.clone()));
        let body_stmts = std::mem::replace(&mut self.stmts, saved);
        self.parallel_top = was_top;
        result?;
        let block = ImpBlock { stmts : body_stmts, results : Vec::new() };
        self.emit_instr(ImpInstr::IFor(dir, binder, n, block))?;
        Ok(())
    }

    /// A chain of conditionals comparing the tag against 0, 1, 2, ….
    fn emit_switch(&mut self,
                   tag : IExpr,
                   arms : Vec<Vec<ImpStmt>>) -> TabResult<()> {
        let mut chain = ImpBlock::default();
        for (i, arm) in arms.into_iter().enumerate().rev() {
            let arm_block = ImpBlock { stmts : arm, results : Vec::new() };
            if chain.stmts.is_empty() && chain.results.is_empty() && i == 0 {
                chain = arm_block;
                continue
            }
            let saved = std::mem::replace(&mut self.stmts, Vec::new());
            let p = self.emit_pure(ImpInstr::IPrimOp(
                ImpOp::ICmp(CmpOp::Equal, tag.clone(), ilit_int(i as i64))))?;
            let mut stmts = std::mem::replace(&mut self.stmts, saved);
            stmts.push(ImpStmt {
                binder : None,
                instr : ImpInstr::ICond(p, arm_block, chain),
            });
            chain = ImpBlock { stmts, results : Vec::new() };
        }
        self.stmts.extend(chain.stmts);
        Ok(())
    }

    fn int_to_index(&mut self, ty : &Type, i : &Atom) -> TabResult<Atom> {
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::IntRange(l, h)) =>
                Ok(mk_con(PrimCon::IntRangeVal(l.clone(), h.clone(), i.clone()))),
            InnerAtom::TC(PrimTC::IndexRange(t, l, h)) =>
                Ok(mk_con(PrimCon::IndexRangeVal(t.clone(), l.clone(), h.clone(), i.clone()))),
            owise => compiler_err!("intToIndex at type {:?}", owise),
        }
    }

    /// Index a table value during lowering: lambdas beta-reduce, stored
    /// tables substitute, materialized handles go through their
    /// destination.
    fn index_table_atom(&mut self, tab : &Atom, i : &Atom) -> TabResult<Atom> {
        match tab.as_ref() {
            InnerAtom::Lam(Arrow::Tab, _) => {
                let body = apply_abs(tab, i)?;
                self.translate_block(None, &body)
            },
            InnerAtom::Con(PrimCon::AFor(_, body)) => Ok(body.clone()),
            InnerAtom::AVar(v) => {
                let dest = match self.dests.get(&v.name) {
                    Some(d) => d.clone(),
                    None => compiler_err!("table {:?} has no destination", v.name),
                };
                let sub = self.index_dest(&dest, i)?;
                let elem_ty = apply_pi(&v.ty, i)?.1;
                self.dest_to_atom(&sub, &elem_ty)
            },
            owise => compiler_err!("indexing a non-table : {:?}", owise),
        }
    }

    // ------------------------------------------------------------------
    // blocks

    /// Route the destination into the block: declarations whose bound
    /// variable is consumed by the (pure atom) result write directly
    /// into their slice of the destination; anything else is copied at
    /// the end.
    fn split_dest(&self,
                  result : &Atom,
                  dest : &Dest,
                  let_names : &hashbrown::HashSet<Name>)
                  -> (HashMap<Name, Dest>, Vec<(Dest, Atom)>) {
        let mut routed = HashMap::new();
        let mut copies = Vec::new();
        self.split_dest_rec(result, dest, let_names, &mut routed, &mut copies);
        (routed, copies)
    }

    fn split_dest_rec(&self,
                      result : &Atom,
                      dest : &Dest,
                      let_names : &hashbrown::HashSet<Name>,
                      routed : &mut HashMap<Name, Dest>,
                      copies : &mut Vec<(Dest, Atom)>) {
        match (result.as_ref(), dest) {
            (InnerAtom::AVar(v), _) if let_names.contains(&v.name)
                                       && !routed.contains_key(&v.name) => {
                routed.insert(v.name.clone(), dest.clone());
            },
            (InnerAtom::Con(PrimCon::PairCon(l, r)), Dest::PairDest(dl, dr)) => {
                self.split_dest_rec(l, dl, let_names, routed, copies);
                self.split_dest_rec(r, dr, let_names, routed, copies);
            },
            (InnerAtom::Con(PrimCon::RecCon(fields)), Dest::RecDest(dests))
                if fields.len() == dests.len() => {
                for (f, d) in fields.values().iter().zip(dests.values()) {
                    self.split_dest_rec(f, d, let_names, routed, copies);
                }
            },
            (InnerAtom::Con(PrimCon::UnitCon), Dest::UnitDest) => (),
            _ => copies.push((dest.clone(), result.clone())),
        }
    }

    pub fn translate_block(&mut self, dest : Option<Dest>, block : &Block) -> TabResult<Atom> {
        let let_names : hashbrown::HashSet<Name> = block.decls.iter()
            .flat_map(|d| d.binders().into_iter().map(|b| b.name.clone()))
            .collect();

        // when the result is a pure atom, route the destination into the
        // declarations that produce it
        let (mut routed, copies, atom_result) = match (&dest, &block.result) {
            (Some(d), Expr::Atom(res)) => {
                let (routed, copies) = self.split_dest(res, d, &let_names);
                (routed, copies, true)
            },
            _ => (HashMap::new(), Vec::new(), false),
        };

        for d in &block.decls {
            match d {
                Decl::Let(_, binder, expr) => {
                    let route = routed.remove(&binder.name);
                    let out = self.translate_expr(route, expr)?;
                    self.env.insert(binder.name.clone(), out);
                },
                Decl::Unpack(binders, expr) => {
                    let out = self.translate_expr(None, expr)?;
                    let parts : Vec<Atom> = match out.as_ref() {
                        InnerAtom::Con(PrimCon::RecCon(items)) =>
                            items.values().into_iter().cloned().collect(),
                        InnerAtom::Con(PrimCon::DataCon(_, _, _, args)) => args.clone(),
                        owise => compiler_err!("unpacking a non-record : {:?}", owise),
                    };
                    if parts.len() != binders.len() {
                        compiler_err!("unpack arity mismatch")
                    }
                    for (binder, part) in binders.iter().zip(parts) {
                        self.env.insert(binder.name.clone(), part);
                    }
                },
            }
        }

        if atom_result {
            for (d, a) in copies {
                let a = self.subst(&a)?;
                self.copy_atom(&d, &a)?;
            }
            match &block.result {
                Expr::Atom(res) => self.subst(res),
                _ => unreachable!(),
            }
        } else {
            self.translate_expr(dest, &block.result)
        }
    }

    // ------------------------------------------------------------------
    // expressions

    fn translate_expr(&mut self, dest : Option<Dest>, expr : &Expr) -> TabResult<Atom> {
        match expr {
            Expr::Atom(a) => {
                let a = self.subst(a)?;
                if let Some(d) = dest {
                    self.copy_atom(&d, &a)?;
                }
                Ok(a)
            },
            Expr::App(_, f, x) => {
                let f = self.subst(f)?;
                let x = self.subst(x)?;
                let out = self.index_table_atom(&f, &x)?;
                if let Some(d) = dest {
                    self.copy_atom(&d, &out)?;
                }
                Ok(out)
            },
            Expr::Op(op) => self.to_imp_op(dest, op),
            Expr::Hof(hof) => self.to_imp_hof(dest, hof),
            Expr::Case(scrut, alts, ty) => self.translate_case(dest, scrut, alts, ty),
        }
    }

    fn to_imp_op(&mut self, dest : Option<Dest>, op : &PrimOp) -> TabResult<Atom> {
        let out = self.to_imp_op_nodest(op)?;
        if let Some(d) = dest {
            self.copy_atom(&d, &out)?;
        }
        Ok(out)
    }

    fn to_imp_op_nodest(&mut self, op : &PrimOp) -> TabResult<Atom> {
        match op {
            PrimOp::ScalarBinOp(o, x, y) => {
                let x = self.subst(x)?;
                let y = self.subst(y)?;
                let xi = self.atom_to_iexpr(&x)?;
                let yi = self.atom_to_iexpr(&y)?;
                let v = self.emit_pure(ImpInstr::IPrimOp(ImpOp::IBinOp(*o, xi, yi)))?;
                self.ivar_atom(&v)
            },
            PrimOp::ScalarUnOp(o, x) => {
                let x = self.subst(x)?;
                let xi = self.atom_to_iexpr(&x)?;
                let v = self.emit_pure(ImpInstr::IPrimOp(ImpOp::IUnOp(*o, xi)))?;
                self.ivar_atom(&v)
            },
            PrimOp::Cmp(cmp, ty, x, y) => {
                let x = self.subst(x)?;
                let y = self.subst(y)?;
                let xi = self.atom_to_iexpr(&x)?;
                let yi = self.atom_to_iexpr(&y)?;
                let instr = match ty.as_ref() {
                    InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) =>
                        ImpOp::FCmp(*cmp, xi, yi),
                    _ => ImpOp::ICmp(*cmp, xi, yi),
                };
                let v = self.emit_pure(ImpInstr::IPrimOp(instr))?;
                self.ivar_atom(&v)
            },
            PrimOp::Select(p, x, y) => {
                let p = self.subst(p)?;
                let x = self.subst(x)?;
                let y = self.subst(y)?;
                let pi = self.atom_to_iexpr(&p)?;
                let xi = self.atom_to_iexpr(&x)?;
                let yi = self.atom_to_iexpr(&y)?;
                let v = self.emit_pure(ImpInstr::IPrimOp(ImpOp::ISelect(pi, xi, yi)))?;
                self.ivar_atom(&v)
            },
            PrimOp::Fst(x) => {
                let x = self.subst(x)?;
                Ok(self.proj_pair(&x)?.0)
            },
            PrimOp::Snd(x) => {
                let x = self.subst(x)?;
                Ok(self.proj_pair(&x)?.1)
            },
            PrimOp::RecGet(x, label) => {
                let x = self.subst(x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::RecCon(items)) => match (items, label) {
                        (LabeledItems::Tup(xs), Label::At(i)) => match xs.get(*i) {
                            Some(v) => Ok(v.clone()),
                            None => compiler_err!("tuple index {} out of range", i),
                        },
                        (LabeledItems::Named(m), Label::Field(f)) => match m.get(f) {
                            Some(v) => Ok(v.clone()),
                            None => compiler_err!("missing field {:?}", f),
                        },
                        _ => compiler_err!("record selector shape mismatch"),
                    },
                    owise => compiler_err!("RecGet of {:?}", owise),
                }
            },
            PrimOp::SumTag(x) => {
                let x = self.subst(x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::SumAsProd(_, tag, _)) => Ok(tag.clone()),
                    owise => compiler_err!("SumTag of {:?}", owise),
                }
            },
            PrimOp::SumGet(x, left) => {
                let x = self.subst(x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::SumAsProd(_, _, payloads)) => {
                        let side = if *left { 0 } else { 1 };
                        match payloads.get(side).and_then(|p| p.first()) {
                            Some(v) => Ok(v.clone()),
                            None => compiler_err!("malformed sum payload"),
                        }
                    },
                    owise => compiler_err!("SumGet of {:?}", owise),
                }
            },
            PrimOp::IndexAsInt(x) => {
                let x = self.subst(x)?;
                let v = algebra::index_ordinal(self, &x)?;
                self.ivar_atom(&v)
            },
            PrimOp::IntAsIndex(ty, i) => {
                let ty = self.subst(ty)?;
                let i = self.subst(i)?;
                let ii = self.atom_to_iexpr(&i)?;
                let n = algebra::index_set_size(self, &ty)?;
                // trap out-of-range conversions
                let lt = self.emit_pure(ImpInstr::IPrimOp(
                    ImpOp::ICmp(CmpOp::Less, ii.clone(), ilit_int(0))))?;
                let ge = self.emit_pure(ImpInstr::IPrimOp(
                    ImpOp::ICmp(CmpOp::GreaterEqual, ii.clone(), n)))?;
                let bad = self.emit_pure(ImpInstr::IPrimOp(
                    ImpOp::IBinOp(BinOp::BOr, lt, ge)))?;
                let throw = ImpBlock {
                    stmts : vec![ImpStmt { binder : None, instr : ImpInstr::IThrowError }],
                    results : Vec::new(),
                };
                self.emit_instr(ImpInstr::ICond(bad, throw, ImpBlock::default()))?;
                let i_atom = self.ivar_atom(&ii)?;
                self.int_to_index(&ty, &i_atom)
            },
            PrimOp::IdxSetSize(ty) => {
                let ty = self.subst(ty)?;
                let n = algebra::index_set_size(self, &ty)?;
                self.ivar_atom(&n)
            },
            PrimOp::PrimEffect(r, eop) => {
                let r = self.subst(r)?;
                let (dest, val_ty) = self.ref_dest(&r)?;
                match eop {
                    EffectOp::MAsk | EffectOp::MGet => self.dest_to_atom(&dest, &val_ty),
                    EffectOp::MTell(x) => {
                        let x = self.subst(x)?;
                        self.add_to_atom(&dest, &x)?;
                        Ok(mk_unit())
                    },
                    EffectOp::MPut(x) => {
                        let x = self.subst(x)?;
                        self.copy_atom(&dest, &x)?;
                        Ok(mk_unit())
                    },
                }
            },
            PrimOp::IndexRef(r, i) => {
                let r = self.subst(r)?;
                let i = self.subst(i)?;
                let (dest, _) = self.ref_dest(&r)?;
                let sub = self.index_dest(&dest, &i)?;
                let sub_ty = Expr::Op(PrimOp::IndexRef(r, i)).get_type()?;
                let name = self.freshen("ref");
                self.scope.insert(name.clone(), scope_entry(sub_ty.clone()));
                self.dests.insert(name.clone(), sub);
                Ok(mk_var_nt(name, sub_ty))
            },
        }
    }

    fn ref_dest(&mut self, r : &Atom) -> TabResult<(Dest, Type)> {
        let v = match r.as_var() {
            Some(v) => v.clone(),
            None => compiler_err!("reference is not a variable : {:?}", r),
        };
        let dest = match self.dests.get(&v.name) {
            Some(d) => d.clone(),
            None => compiler_err!("reference {:?} has no destination", v.name),
        };
        let val_ty = match v.ty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(_, t)) => t.clone(),
            owise => compiler_err!("reference of a non-ref type : {:?}", owise),
        };
        Ok((dest, val_ty))
    }

    // ------------------------------------------------------------------
    // hofs

    fn to_imp_hof(&mut self, dest : Option<Dest>, hof : &PrimHof) -> TabResult<Atom> {
        match hof {
            PrimHof::For(d, lam) => {
                let lam = self.subst(lam)?;
                let (ix_ty, pure_body) = match lam.get_type()?.as_ref() {
                    InnerAtom::Pi(arrow, abs) =>
                        (abs.binder.ty.clone(), arrow.eff().is_pure()),
                    owise => compiler_err!("For of a non-lambda : {:?}", owise),
                };
                let tab_ty = Expr::Hof(PrimHof::For(*d, lam.clone())).get_type()?;
                let dest = match dest {
                    Some(d) => d,
                    None => self.make_alloc_dest(AllocKind::Managed, "v", &tab_ty)?,
                };

                let wants_kernel = self.parallel_top
                    && pure_body
                    && matches!(self.backend, Backend::LLVMMC | Backend::LLVMCUDA);
                if wants_kernel {
                    self.emit_kernel(*d, &lam, &ix_ty, &dest)?;
                } else {
                    let n = algebra::index_set_size(self, &ix_ty)?;
                    let dest_c = dest.clone();
                    let ix_ty_c = ix_ty.clone();
                    self.emit_loop(*d, n, move |ctx, i_expr| {
                        let i_atom = ctx.ivar_atom(&i_expr)?;
                        let idx = ctx.int_to_index(&ix_ty_c, &i_atom)?;
                        let sub_dest = ctx.index_dest(&dest_c, &idx)?;
                        let body = apply_abs(&lam, &idx)?;
                        ctx.translate_block(Some(sub_dest), &body)?;
                        Ok(())
                    })?;
                }
                self.dest_to_atom(&dest, &tab_ty)
            },
            PrimHof::While(cond, body) => {
                let cond = self.subst(cond)?;
                let body = self.subst(body)?;
                let cond_block = self.lower_nullary_block(&cond, true)?;
                let body_block = self.lower_nullary_block(&body, false)?;
                self.emit_instr(ImpInstr::IWhile(cond_block, body_block))?;
                Ok(mk_unit())
            },
            PrimHof::RunReader(r, f) => {
                let r = self.subst(r)?;
                let f = self.subst(f)?;
                let (_, ref_b, _, body) = open_binary_fun(&f)?;
                let val_ty = match ref_b.ty.as_ref() {
                    InnerAtom::TC(PrimTC::RefType(_, t)) => t.clone(),
                    owise => compiler_err!("reader ref of a non-ref type : {:?}", owise),
                };
                let rdest = self.make_alloc_dest(AllocKind::Managed, "r", &val_ty)?;
                self.copy_atom(&rdest, &r)?;
                self.bind_ref(&ref_b, rdest);
                self.translate_block(dest, &body)
            },
            PrimHof::RunWriter(f) => {
                let f = self.subst(f)?;
                let (_, ref_b, _, body) = open_binary_fun(&f)?;
                let w_ty = match ref_b.ty.as_ref() {
                    InnerAtom::TC(PrimTC::RefType(_, t)) => t.clone(),
                    owise => compiler_err!("writer ref of a non-ref type : {:?}", owise),
                };
                let (ans_dest, w_dest) = match dest {
                    Some(Dest::PairDest(a, w)) => (Some(*a), *w),
                    Some(owise) => compiler_err!("RunWriter into dest {:?}", owise),
                    None => {
                        let w = self.make_alloc_dest(AllocKind::Managed, "w", &w_ty)?;
                        (None, w)
                    },
                };
                self.zero_dest(&w_dest, &w_ty)?;
                self.bind_ref(&ref_b, w_dest.clone());
                let ans = self.translate_block(ans_dest, &body)?;
                let w = self.dest_to_atom(&w_dest, &w_ty)?;
                Ok(mk_pair(ans, w))
            },
            PrimHof::RunState(s, f) => {
                let s = self.subst(s)?;
                let f = self.subst(f)?;
                let (_, ref_b, _, body) = open_binary_fun(&f)?;
                let val_ty = match ref_b.ty.as_ref() {
                    InnerAtom::TC(PrimTC::RefType(_, t)) => t.clone(),
                    owise => compiler_err!("state ref of a non-ref type : {:?}", owise),
                };
                let (ans_dest, s_dest) = match dest {
                    Some(Dest::PairDest(a, sd)) => (Some(*a), *sd),
                    Some(owise) => compiler_err!("RunState into dest {:?}", owise),
                    None => {
                        let sd = self.make_alloc_dest(AllocKind::Managed, "s", &val_ty)?;
                        (None, sd)
                    },
                };
                self.copy_atom(&s_dest, &s)?;
                self.bind_ref(&ref_b, s_dest.clone());
                let ans = self.translate_block(ans_dest, &body)?;
                let fin = self.dest_to_atom(&s_dest, &val_ty)?;
                Ok(mk_pair(ans, fin))
            },
            PrimHof::Linearize(..) | PrimHof::Transpose(..) =>
                compiler_err!("autodiff hof survived simplification"),
        }
    }

    fn bind_ref(&mut self, ref_b : &Binder, dest : Dest) {
        let name = self.freshen(ref_b.name.hint());
        self.scope.insert(name.clone(), scope_entry(ref_b.ty.clone()));
        self.dests.insert(name.clone(), dest);
        self.env.insert(ref_b.name.clone(), mk_var_nt(name, ref_b.ty.clone()));
    }

    /// Compile a unit-argument lambda into an Imp block; `wants_result`
    /// asks for the scalar result (the `while` condition).
    fn lower_nullary_block(&mut self, lam : &Atom, wants_result : bool) -> TabResult<ImpBlock> {
        let body = apply_abs(lam, &mk_unit())?;
        let saved = std::mem::replace(&mut self.stmts, Vec::new());
        let out = self.translate_block(None, &body);
        let stmts = std::mem::replace(&mut self.stmts, saved);
        let out = out?;
        let results = if wants_result {
            vec![self.atom_to_iexpr(&out)?]
        } else {
            Vec::new()
        };
        Ok(ImpBlock { stmts, results })
    }

    fn translate_case(&mut self,
                      dest : Option<Dest>,
                      scrut : &Atom,
                      alts : &[Alt],
                      ty : &Type) -> TabResult<Atom> {
        let scrut = self.subst(scrut)?;
        match scrut.as_ref() {
            InnerAtom::Con(PrimCon::DataCon(_, _, con_ix, args)) => {
                let alt = match alts.get(*con_ix) {
                    Some(alt) => alt,
                    None => compiler_err!("case has no alternative {}", con_ix),
                };
                for (binder, arg) in alt.binders.iter().zip(args) {
                    self.env.insert(binder.name.clone(), arg.clone());
                }
                self.translate_block(dest, &alt.body)
            },
            InnerAtom::Con(PrimCon::SumAsProd(_, tag, payloads)) => {
                let ty = self.subst(ty)?;
                let dest = match dest {
                    Some(d) => d,
                    None => self.make_alloc_dest(AllocKind::Managed, "case", &ty)?,
                };
                let tag_i = self.atom_to_iexpr(tag)?;
                let mut arms = Vec::with_capacity(alts.len());
                for (alt, payload) in alts.iter().zip(payloads) {
                    let saved = std::mem::replace(&mut self.stmts, Vec::new());
                    for (binder, val) in alt.binders.iter().zip(payload) {
                        self.env.insert(binder.name.clone(), val.clone());
                    }
                    let r = self.translate_block(Some(dest.clone()), &alt.body);
                    let stmts = std::mem::replace(&mut self.stmts, saved);
                    r?;
                    arms.push(stmts);
                }
                self.emit_switch(tag_i, arms)?;
                self.dest_to_atom(&dest, &ty)
            },
            owise => compiler_err!("case on a non-constructor scrutinee : {:?}", owise),
        }
    }

    // ------------------------------------------------------------------
    // kernels

    /// Extract the loop body as its own Imp function and launch it. The
    /// calling convention follows the backend; every value the body
    /// captures travels through the argument list.
    fn emit_kernel(&mut self,
                   _d : Direction,
                   lam : &Atom,
                   ix_ty : &Type,
                   dest : &Dest) -> TabResult<()> {
        let (cc, dev) = match self.backend {
            Backend::LLVMCUDA => (CallingConvention::CudaKernelLaunch, Device::Gpu),
            Backend::LLVMMC => (CallingConvention::MCThreadLaunch, Device::Cpu),
            owise => compiler_err!("backend {:?} cannot launch kernels", owise),
        };
        let n = algebra::index_set_size(self, ix_ty)?;

        let i_name = self.freshen("tid");
        let i_binder = IVar::mk(i_name.clone(), IType::Scalar(BaseTy::IntType));
        self.ivar_tys.insert(i_name, IType::Scalar(BaseTy::IntType));

        let saved_stmts = std::mem::replace(&mut self.stmts, Vec::new());
        let saved_dev = std::mem::replace(&mut self.cur_dev, dev);
        let was_top = std::mem::replace(&mut self.parallel_top, false);
        let body_result = (|| -> TabResult<()> {
            let i_atom = self.ivar_atom(&IExpr::IVarRef(i_binder.clone()))?;
            let idx = self.int_to_index(ix_ty, &i_atom)?;
            let sub_dest = self.index_dest(dest, &idx)?;
            let body = apply_abs(lam, &idx)?;
            self.translate_block(Some(sub_dest), &body)?;
            Ok(())
        })();
        let body_stmts = std::mem::replace(&mut self.stmts, saved_stmts);
        self.cur_dev = saved_dev;
        self.parallel_top = was_top;
        body_result?;

        let body_block = ImpBlock { stmts : body_stmts, results : Vec::new() };
        let mut captured : Vec<Name> = free_ivars(&body_block)
            .into_iter()
            .filter(|n| *n != i_binder.name)
            .collect();
        captured.sort();
        let mut args = vec![i_binder];
        for n in &captured {
            let ty = match self.ivar_tys.get(n) {
                Some(t) => *t,
                None => compiler_err!("kernel captures an untyped variable {:?}", n),
            };
            args.push(IVar::mk(n.clone(), ty));
        }

        let fun_name = mk_name(NameTag::TopFunName, "kernel", 0)
            .fresh_in(|n| self.funcs.iter().any(|f| &f.name == n));
        self.funcs.push(ImpFunction {
            name : fun_name.clone(),
            cc,
            args : args.clone(),
            body : body_block,
        });

        let launch_args = args[1..].iter()
            .map(|v| IExpr::IVarRef(v.clone()))
            .collect();
        self.emit_instr(ImpInstr::ILaunch(fun_name, n, launch_args))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// module entry

/// Lower a fully simplified block to an Imp module. The designated main
/// writes the block's result into an unmanaged destination and returns
/// its leaf pointers; the recon describes how the high-level result is
/// rebuilt from them; the pointer literals are returned in allocation
/// order.
pub fn lower_block(backend : Backend, block : &Block)
                   -> TabResult<(ImpModule, AtomRecon, Vec<LitVal>)> {
    let mut ctx = LowerCtx::new(backend);
    let result_ty = block.get_type()?;
    let dest = ctx.make_alloc_dest(AllocKind::Unmanaged, "out", &result_ty)?;
    ctx.translate_block(Some(dest.clone()), block)?;

    for ptr in std::mem::replace(&mut ctx.to_free, Vec::new()) {
        ctx.emit_instr(ImpInstr::Free(ptr))?;
    }

    let (binders, recon_atom, results) = dest_recon(&mut ctx, &dest, &result_ty)?;
    let main_name = mk_name(NameTag::TopFunName, "impMain", 0);
    let main = ImpFunction {
        name : main_name.clone(),
        cc : CallingConvention::EntryFun,
        args : Vec::new(),
        body : ImpBlock { stmts : ctx.stmts, results },
    };
    let mut funs = ctx.funcs;
    funs.push(main);
    let module = ImpModule { funs, main : main_name };
    check_module(&module)?;
    Ok((module, AtomRecon { binders, atom : recon_atom }, ctx.ptr_lits))
}

/// One returned value per destination leaf; tables return their buffer
/// pointer and reconstruct as a single table-typed binder.
fn dest_recon(ctx : &mut LowerCtx, dest : &Dest, ty : &Type)
              -> TabResult<(Vec<Binder>, Atom, Vec<IExpr>)> {
    match (dest, ty.as_ref()) {
        (Dest::BaseDest { ptr, .. }, _) => {
            let b = Var::mk(ctx.freshen("res"), ty.clone());
            Ok((vec![b.clone()], mk_var(b), vec![ptr.clone()]))
        },
        (Dest::TabDest(..), _) => {
            let mut ptrs = Vec::new();
            collect_leaf_ptrs(dest, &mut ptrs);
            let b = Var::mk(ctx.freshen("res"), ty.clone());
            Ok((vec![b.clone()], mk_var(b), ptrs))
        },
        (Dest::PairDest(l, r), InnerAtom::TC(PrimTC::PairType(lt, rt))) => {
            let (mut bs, la, mut ps) = dest_recon(ctx, l, lt)?;
            let (bs2, ra, ps2) = dest_recon(ctx, r, rt)?;
            bs.extend(bs2);
            ps.extend(ps2);
            Ok((bs, mk_pair(la, ra), ps))
        },
        (Dest::UnitDest, _) => Ok((Vec::new(), mk_unit(), Vec::new())),
        (d, _) => {
            // remaining shapes return their leaves positionally under a
            // single opaque binder
            let mut ptrs = Vec::new();
            collect_leaf_ptrs(d, &mut ptrs);
            let b = Var::mk(ctx.freshen("res"), ty.clone());
            Ok((vec![b.clone()], mk_var(b), ptrs))
        },
    }
}

fn collect_leaf_ptrs(dest : &Dest, out : &mut Vec<IExpr>) {
    match dest {
        Dest::BaseDest { ptr, .. } => out.push(ptr.clone()),
        Dest::TabDest(_, inner) | Dest::CharDest(inner)
        | Dest::IntRangeDest(_, _, inner) | Dest::IndexRangeDest(_, _, _, inner) =>
            collect_leaf_ptrs(inner, out),
        Dest::PairDest(l, r) => {
            collect_leaf_ptrs(l, out);
            collect_leaf_ptrs(r, out);
        },
        Dest::DataConDest(_, _, fields) => for d in fields {
            collect_leaf_ptrs(d, out);
        },
        Dest::RecDest(items) => for d in items.values() {
            collect_leaf_ptrs(d, out);
        },
        Dest::SumAsProdDest(_, tag, payloads) => {
            collect_leaf_ptrs(tag, out);
            for alt in payloads {
                for d in alt {
                    collect_leaf_ptrs(d, out);
                }
            }
        },
        Dest::UnitDest | Dest::ConstDest(..) => (),
    }
}

#[cfg(test)]
mod lower_tests {
    use super::*;
    use crate::name::mk_src_name;

    /// A small machine for emitted Imp programs: named buffers, scalar
    /// registers, structured loops. Enough to observe what the lowered
    /// code actually computes.
    #[derive(Debug, Clone, PartialEq)]
    enum SVal {
        I(i64),
        R(f64),
        B(bool),
        P(Name, i64),
    }

    impl SVal {
        fn as_i(&self) -> i64 {
            match self {
                SVal::I(i) => *i,
                owise => panic!("expected an int, got {:?}", owise),
            }
        }

        fn as_b(&self) -> bool {
            match self {
                SVal::B(b) => *b,
                owise => panic!("expected a bool, got {:?}", owise),
            }
        }
    }

    struct Machine {
        bufs : HashMap<Name, Vec<SVal>>,
        regs : HashMap<Name, SVal>,
        funs : HashMap<Name, ImpFunction>,
    }

    impl Machine {
        fn new(module : &ImpModule) -> Self {
            Machine {
                bufs : HashMap::new(),
                regs : HashMap::new(),
                funs : module.funs.iter().map(|f| (f.name.clone(), f.clone())).collect(),
            }
        }

        fn eval(&self, e : &IExpr) -> SVal {
            match e {
                IExpr::ILit(LitVal::IntLit(i)) => SVal::I(*i),
                IExpr::ILit(LitVal::RealLit(R64(r))) => SVal::R(*r),
                IExpr::ILit(LitVal::BoolLit(b)) => SVal::B(*b),
                IExpr::ILit(LitVal::PtrLit(n, _)) => SVal::P(n.clone(), 0),
                IExpr::IVarRef(v) => self.regs.get(&v.name)
                    .unwrap_or_else(|| panic!("unbound Imp variable {:?}", v.name))
                    .clone(),
            }
        }

        fn run_block(&mut self, block : &ImpBlock) -> Vec<SVal> {
            for stmt in &block.stmts {
                self.run_stmt(stmt);
            }
            block.results.iter().map(|r| self.eval(r)).collect()
        }

        fn run_stmt(&mut self, stmt : &ImpStmt) {
            let out = match &stmt.instr {
                ImpInstr::IPrimOp(op) => Some(self.run_op(op)),
                ImpInstr::ICastOp(_, x) => Some(self.eval(x)),
                ImpInstr::Alloc(_, b, n) => {
                    let n = self.eval(n).as_i().max(0) as usize;
                    let zero = match b {
                        BaseTy::IntType => SVal::I(0),
                        BaseTy::RealType => SVal::R(0.0),
                        BaseTy::BoolType => SVal::B(false),
                    };
                    let name = match &stmt.binder {
                        Some(v) => v.name.clone(),
                        None => panic!("anonymous allocation"),
                    };
                    self.bufs.insert(name.clone(), vec![zero; n]);
                    Some(SVal::P(name, 0))
                },
                ImpInstr::Free(..) => None,
                ImpInstr::MemCopy { dest, src, numel } => {
                    let n = self.eval(numel).as_i();
                    let (dn, doff) = match self.eval(dest) {
                        SVal::P(n, o) => (n, o),
                        owise => panic!("memcopy to {:?}", owise),
                    };
                    let (sn, soff) = match self.eval(src) {
                        SVal::P(n, o) => (n, o),
                        owise => panic!("memcopy from {:?}", owise),
                    };
                    for k in 0..n {
                        let v = self.bufs[&sn][(soff + k) as usize].clone();
                        let dst = self.bufs.get_mut(&dn).unwrap();
                        dst[(doff + k) as usize] = v;
                    }
                    None
                },
                ImpInstr::Store(p, v) => {
                    let val = self.eval(v);
                    match self.eval(p) {
                        SVal::P(n, off) => {
                            let buf = self.bufs.get_mut(&n)
                                .unwrap_or_else(|| panic!("store to unknown buffer {:?}", n));
                            buf[off as usize] = val;
                        },
                        owise => panic!("store to {:?}", owise),
                    }
                    None
                },
                ImpInstr::Load(p) => match self.eval(p) {
                    SVal::P(n, off) => Some(self.bufs[&n][off as usize].clone()),
                    owise => panic!("load from {:?}", owise),
                },
                ImpInstr::IThrowError => panic!("program trapped"),
                ImpInstr::IFor(dir, i, n, body) => {
                    let n = self.eval(n).as_i();
                    let iter : Vec<i64> = match dir {
                        Direction::Fwd => (0..n).collect(),
                        Direction::Rev => (0..n).rev().collect(),
                    };
                    for k in iter {
                        self.regs.insert(i.name.clone(), SVal::I(k));
                        self.run_block(body);
                    }
                    None
                },
                ImpInstr::IWhile(cond, body) => {
                    loop {
                        let r = self.run_block(cond);
                        if !r[0].as_b() {
                            break
                        }
                        self.run_block(body);
                    }
                    None
                },
                ImpInstr::ICond(p, t, f) => {
                    if self.eval(p).as_b() {
                        self.run_block(t);
                    } else {
                        self.run_block(f);
                    }
                    None
                },
                ImpInstr::ILaunch(fun, n, args) => {
                    let f = self.funs.get(fun)
                        .unwrap_or_else(|| panic!("launch of unknown function {:?}", fun))
                        .clone();
                    let n = self.eval(n).as_i();
                    let arg_vals : Vec<SVal> = args.iter().map(|a| self.eval(a)).collect();
                    for tid in 0..n {
                        self.regs.insert(f.args[0].name.clone(), SVal::I(tid));
                        for (binder, v) in f.args[1..].iter().zip(&arg_vals) {
                            self.regs.insert(binder.name.clone(), v.clone());
                        }
                        self.run_block(&f.body);
                    }
                    None
                },
            };
            if let Some(binder) = &stmt.binder {
                let v = out.expect("binder on a void instruction");
                self.regs.insert(binder.name.clone(), v);
            }
        }

        fn run_op(&mut self, op : &ImpOp) -> SVal {
            match op {
                ImpOp::IBinOp(o, x, y) => {
                    let x = self.eval(x);
                    let y = self.eval(y);
                    match o {
                        BinOp::IAdd => SVal::I(x.as_i() + y.as_i()),
                        BinOp::ISub => SVal::I(x.as_i() - y.as_i()),
                        BinOp::IMul => SVal::I(x.as_i() * y.as_i()),
                        BinOp::IDiv => SVal::I(x.as_i() / y.as_i()),
                        BinOp::IRem => SVal::I(x.as_i() % y.as_i()),
                        BinOp::BAnd => SVal::B(x.as_b() && y.as_b()),
                        BinOp::BOr => SVal::B(x.as_b() || y.as_b()),
                        BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv => {
                            let (a, b) = match (x, y) {
                                (SVal::R(a), SVal::R(b)) => (a, b),
                                owise => panic!("float op on {:?}", owise),
                            };
                            SVal::R(match o {
                                BinOp::FAdd => a + b,
                                BinOp::FSub => a - b,
                                BinOp::FMul => a * b,
                                _ => a / b,
                            })
                        },
                    }
                },
                ImpOp::IUnOp(o, x) => {
                    let x = self.eval(x);
                    match o {
                        UnOp::INeg => SVal::I(-x.as_i()),
                        UnOp::BNot => SVal::B(!x.as_b()),
                        UnOp::FNeg => match x {
                            SVal::R(r) => SVal::R(-r),
                            owise => panic!("fneg of {:?}", owise),
                        },
                    }
                },
                ImpOp::ICmp(cmp, x, y) => {
                    let x = self.eval(x).as_i();
                    let y = self.eval(y).as_i();
                    SVal::B(match cmp {
                        CmpOp::Equal => x == y,
                        CmpOp::Less => x < y,
                        CmpOp::LessEqual => x <= y,
                        CmpOp::Greater => x > y,
                        CmpOp::GreaterEqual => x >= y,
                    })
                },
                ImpOp::FCmp(cmp, x, y) => {
                    let x = match self.eval(x) { SVal::R(r) => r, o => panic!("{:?}", o) };
                    let y = match self.eval(y) { SVal::R(r) => r, o => panic!("{:?}", o) };
                    SVal::B(match cmp {
                        CmpOp::Equal => x == y,
                        CmpOp::Less => x < y,
                        CmpOp::LessEqual => x <= y,
                        CmpOp::Greater => x > y,
                        CmpOp::GreaterEqual => x >= y,
                    })
                },
                ImpOp::ISelect(p, x, y) => {
                    if self.eval(p).as_b() {
                        self.eval(x)
                    } else {
                        self.eval(y)
                    }
                },
                ImpOp::PtrOffset(p, d) => {
                    let d = self.eval(d).as_i();
                    match self.eval(p) {
                        SVal::P(n, off) => SVal::P(n, off + d),
                        owise => panic!("ptr offset of {:?}", owise),
                    }
                },
            }
        }
    }

    fn run_main(module : &ImpModule) -> (Machine, Vec<SVal>) {
        let mut m = Machine::new(module);
        let results = m.run_block(&module.get_main().unwrap().body.clone());
        (m, results)
    }

    fn buffer_of<'m>(m : &'m Machine, ptr : &SVal) -> &'m Vec<SVal> {
        match ptr {
            SVal::P(n, 0) => &m.bufs[n],
            owise => panic!("expected a base pointer, got {:?}", owise),
        }
    }

    /// `for i in range(0,4). i*i` of type `range(0,4) ⇒ Int`
    fn squares_block() -> Block {
        let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(4)));
        let a = Var::mk(mk_src_name("a"), int_ty());
        let body = Block::new(
            vec![Decl::Let(LetAnn::Plain, a.clone(),
                           Expr::Op(PrimOp::IndexAsInt(mk_var(i.clone()))))],
            Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, mk_var(a.clone()), mk_var(a))),
        ).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), i, body);
        Block::new(Vec::new(), Expr::Hof(PrimHof::For(Direction::Fwd, lam))).unwrap()
    }

    #[test]
    fn lowers_a_loop_into_alloc_and_stores() {
        let (module, _recon, _ptrs) = lower_block(Backend::LLVM, &squares_block()).unwrap();
        let main = module.get_main().unwrap();

        // one 4-element buffer, one loop over it
        let has_alloc4 = main.body.stmts.iter().any(|s| matches!(
            &s.instr,
            ImpInstr::Alloc(_, BaseTy::IntType, IExpr::ILit(LitVal::IntLit(4)))));
        let has_for = main.body.stmts.iter().any(|s| matches!(
            &s.instr, ImpInstr::IFor(Direction::Fwd, _, _, _)));
        assert!(has_alloc4, "expected a literal 4-element Int allocation");
        assert!(has_for, "expected a loop");

        let (machine, results) = run_main(&module);
        assert_eq!(results.len(), 1);
        assert_eq!(buffer_of(&machine, &results[0]),
                   &vec![SVal::I(0), SVal::I(1), SVal::I(4), SVal::I(9)]);
    }

    /// `for i in range(0,2). for j in range(0,3). i+j` — store addresses
    /// must follow `buf + i*3 + j`, observable as the row-major layout.
    #[test]
    fn nested_loops_use_row_major_offsets() {
        let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(2)));
        let j = Var::mk(mk_src_name("j"), int_range(mk_int(0), mk_int(3)));
        let a = Var::mk(mk_src_name("a"), int_ty());
        let b = Var::mk(mk_src_name("b"), int_ty());
        let inner_body = Block::new(
            vec![
                Decl::Let(LetAnn::Plain, a.clone(),
                          Expr::Op(PrimOp::IndexAsInt(mk_var(i.clone())))),
                Decl::Let(LetAnn::Plain, b.clone(),
                          Expr::Op(PrimOp::IndexAsInt(mk_var(j.clone())))),
            ],
            Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, mk_var(a), mk_var(b))),
        ).unwrap();
        let inner = mk_lam(Arrow::Plain(pure_row()), j, inner_body);
        let outer_body = Block::new(
            Vec::new(), Expr::Hof(PrimHof::For(Direction::Fwd, inner))).unwrap();
        let outer = mk_lam(Arrow::Plain(pure_row()), i, outer_body);
        let block = Block::new(
            Vec::new(), Expr::Hof(PrimHof::For(Direction::Fwd, outer))).unwrap();

        let (module, _, _) = lower_block(Backend::LLVM, &block).unwrap();
        let (machine, results) = run_main(&module);
        assert_eq!(buffer_of(&machine, &results[0]),
                   &vec![SVal::I(0), SVal::I(1), SVal::I(2),
                         SVal::I(1), SVal::I(2), SVal::I(3)]);
    }

    #[test]
    fn writer_regions_lower_to_accumulator_buffers() {
        // runWriter λref. { for i in range(0,3). tell ref 1.0; () }
        let region = Var::mk(mk_src_name("h"), mk_tc(PrimTC::TypeKind));
        let r = Var::mk(mk_src_name("ref"), ref_ty(mk_var(region.clone()), real_ty()));
        let row = one_eff(region.name.clone(), EffectName::Writer, real_ty());
        let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(3)));
        let loop_body = Block::new(Vec::new(), Expr::Op(PrimOp::PrimEffect(
            mk_var(r.clone()), EffectOp::MTell(mk_real(1.0))))).unwrap();
        let loop_lam = mk_lam(Arrow::Plain(row.clone()), i, loop_body);
        let t = Var::mk(mk_src_name("t"),
                        Expr::Hof(PrimHof::For(Direction::Fwd, loop_lam.clone()))
                            .get_type().unwrap());
        let eff_body = Block::new(
            vec![Decl::Let(LetAnn::Plain, t,
                           Expr::Hof(PrimHof::For(Direction::Fwd, loop_lam)))],
            Expr::Atom(mk_unit()),
        ).unwrap();
        let f = mk_binary_fun(region, r, row, eff_body);
        let block = Block::new(Vec::new(), Expr::Hof(PrimHof::RunWriter(f))).unwrap();

        let (module, _, _) = lower_block(Backend::LLVM, &block).unwrap();
        let (machine, results) = run_main(&module);
        // the pair's only base leaf is the accumulator
        assert_eq!(results.len(), 1);
        assert_eq!(buffer_of(&machine, &results[0]), &vec![SVal::R(3.0)]);
    }

    #[test]
    fn multicore_backend_extracts_kernels() {
        let (module, _, _) = lower_block(Backend::LLVMMC, &squares_block()).unwrap();
        let kernel = module.funs.iter()
            .find(|f| f.cc == CallingConvention::MCThreadLaunch)
            .expect("expected an extracted kernel");
        // kernel isolation: everything it touches comes in through args
        let bound : hashbrown::HashSet<Name> =
            kernel.args.iter().map(|a| a.name.clone()).collect();
        for fv in free_ivars(&kernel.body) {
            assert!(bound.contains(&fv), "kernel leaks variable {:?}", fv);
        }
        let main = module.get_main().unwrap();
        assert!(main.body.stmts.iter().any(|s| matches!(
            &s.instr, ImpInstr::ILaunch(..))), "expected a kernel launch");

        // and it still computes the same thing
        let (machine, results) = run_main(&module);
        assert_eq!(buffer_of(&machine, &results[0]),
                   &vec![SVal::I(0), SVal::I(1), SVal::I(4), SVal::I(9)]);
    }

    #[test]
    fn int_as_index_traps_out_of_range() {
        // intAsIndex range(0,4) 9 must emit a guarded throw
        let idx_ty = int_range(mk_int(0), mk_int(4));
        let block = Block::new(
            Vec::new(),
            Expr::Op(PrimOp::IntAsIndex(idx_ty, mk_int(9))),
        ).unwrap();
        let (module, _, _) = lower_block(Backend::LLVM, &block).unwrap();
        let main = module.get_main().unwrap();
        fn block_throws(b : &ImpBlock) -> bool {
            b.stmts.iter().any(|s| match &s.instr {
                ImpInstr::IThrowError => true,
                ImpInstr::ICond(_, t, f) => block_throws(t) || block_throws(f),
                ImpInstr::IFor(_, _, _, body) => block_throws(body),
                _ => false,
            })
        }
        assert!(block_throws(&main.body));
    }
}
