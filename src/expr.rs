use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::name::{ Name, NameTag, mk_name };
use crate::errors::TabResult;
use crate::compiler_err;

use InnerAtom::*;

/// A real literal with bitwise equality. Atoms need `Eq` (they are
/// compared structurally all over the simplifier), and `f64` on its own
/// refuses to provide it.
#[derive(Debug, Clone, Copy)]
pub struct R64(pub f64);

impl PartialEq for R64 {
    fn eq(&self, other : &R64) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for R64 {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseTy {
    IntType,
    RealType,
    BoolType,
}

/// Scalar literals, plus the pointer literals captured during Imp
/// lowering (returned to the code generator in allocation order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LitVal {
    IntLit(i64),
    RealLit(R64),
    BoolLit(bool),
    PtrLit(Name, BaseTy),
}

impl LitVal {
    pub fn base_ty(&self) -> BaseTy {
        match self {
            LitVal::IntLit(..) => BaseTy::IntType,
            LitVal::RealLit(..) => BaseTy::RealType,
            LitVal::BoolLit(..) => BaseTy::BoolType,
            LitVal::PtrLit(_, b) => *b,
        }
    }
}

/// Record fields come in two shapes: positional tuples and named rows.
/// The zip of two different shapes is a compiler error; there is no
/// implicit conversion between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabeledItems<T> {
    Tup(Vec<T>),
    Named(IndexMap<String, T>),
}

impl<T> LabeledItems<T> {
    pub fn len(&self) -> usize {
        match self {
            LabeledItems::Tup(xs) => xs.len(),
            LabeledItems::Named(m) => m.len(),
        }
    }

    pub fn values(&self) -> Vec<&T> {
        match self {
            LabeledItems::Tup(xs) => xs.iter().collect(),
            LabeledItems::Named(m) => m.values().collect(),
        }
    }

    pub fn try_map<U>(&self, mut f : impl FnMut(&T) -> TabResult<U>) -> TabResult<LabeledItems<U>> {
        match self {
            LabeledItems::Tup(xs) => {
                let mut out = Vec::with_capacity(xs.len());
                for x in xs {
                    out.push(f(x)?);
                }
                Ok(LabeledItems::Tup(out))
            },
            LabeledItems::Named(m) => {
                let mut out = IndexMap::with_capacity(m.len());
                for (k, v) in m {
                    out.insert(k.clone(), f(v)?);
                }
                Ok(LabeledItems::Named(out))
            }
        }
    }

    pub fn zip_with<U, V>(&self,
                          other : &LabeledItems<U>,
                          mut f : impl FnMut(&T, &U) -> TabResult<V>) -> TabResult<LabeledItems<V>> {
        match (self, other) {
            (LabeledItems::Tup(xs), LabeledItems::Tup(ys)) if xs.len() == ys.len() => {
                let mut out = Vec::with_capacity(xs.len());
                for (x, y) in xs.iter().zip(ys) {
                    out.push(f(x, y)?);
                }
                Ok(LabeledItems::Tup(out))
            },
            (LabeledItems::Named(xs), LabeledItems::Named(ys)) if xs.len() == ys.len() => {
                let mut out = IndexMap::with_capacity(xs.len());
                for (k, x) in xs {
                    match ys.get(k) {
                        Some(y) => { out.insert(k.clone(), f(x, y)?); },
                        None => compiler_err!("record field mismatch on {:?}", k),
                    }
                }
                Ok(LabeledItems::Named(out))
            },
            _ => compiler_err!("zipping records of different shape"),
        }
    }
}

/// Field selector for `RecGet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    At(usize),
    Field(String),
}

/// Index-range bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Limit {
    InclusiveLim(Atom),
    ExclusiveLim(Atom),
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fwd,
    Rev,
}

impl Direction {
    pub fn flipped(self) -> Direction {
        match self {
            Direction::Fwd => Direction::Rev,
            Direction::Rev => Direction::Fwd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectName {
    Reader,
    Writer,
    State,
}

/// An effect row: a mapping from region name to `(effect, value type)`,
/// with an optional row-polymorphism tail. Entry order is preserved for
/// printing but equality is order-insensitive (IndexMap compares by
/// key lookup, not position).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectRow {
    pub row : IndexMap<Name, (EffectName, Type)>,
    pub tail : Option<Name>,
}

pub fn pure_row() -> EffectRow {
    EffectRow { row : IndexMap::new(), tail : None }
}

pub fn one_eff(region : Name, eff : EffectName, ty : Type) -> EffectRow {
    let mut row = IndexMap::new();
    row.insert(region, (eff, ty));
    EffectRow { row, tail : None }
}

impl EffectRow {
    pub fn is_pure(&self) -> bool {
        self.row.is_empty() && self.tail.is_none()
    }

    /// Least upper bound of two rows. Colliding regions must agree on
    /// both the effect and the value type.
    pub fn union(&self, other : &EffectRow) -> TabResult<EffectRow> {
        let mut row = self.row.clone();
        for (k, v) in &other.row {
            match row.get(k) {
                Some(already) if already != v =>
                    compiler_err!("conflicting effects for region {:?}", k),
                Some(_) => (),
                None => { row.insert(k.clone(), v.clone()); }
            }
        }
        let tail = match (&self.tail, &other.tail) {
            (None, t) => t.clone(),
            (t, None) => t.clone(),
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            _ => compiler_err!("conflicting effect-row tails"),
        };
        Ok(EffectRow { row, tail })
    }

    /// Remove the entry for a region (used when the binding `RunX`
    /// scope closes over it).
    pub fn without(&self, region : &Name) -> EffectRow {
        let mut row = self.row.clone();
        row.shift_remove(region);
        EffectRow { row : row, tail : self.tail.clone() }
    }
}

/// The four arrow kinds a lambda or Pi can carry. Only `Plain` arrows
/// have an effect row of their own; tables and linear functions are
/// pure by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrow {
    Plain(EffectRow),
    Implicit,
    Tab,
    Lin,
}

impl Arrow {
    pub fn eff(&self) -> EffectRow {
        match self {
            Arrow::Plain(row) => row.clone(),
            _ => pure_row(),
        }
    }
}

/// Atoms used as types are the same ADT; downstream stages check the
/// kind dynamically where it matters.
pub type Type = Atom;

/// A variable occurrence: a name bound to an annotation. A `Binder` is
/// a `Var` in binding position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name : Name,
    pub ty : Type,
}

pub type Binder = Var;

impl Var {
    pub fn mk(name : Name, ty : Type) -> Self {
        Var { name, ty }
    }
}

/// A single-binder abstraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abs<T> {
    pub binder : Binder,
    pub body : T,
}

impl<T> Abs<T> {
    pub fn mk(binder : Binder, body : T) -> Self {
        Abs { binder, body }
    }
}

/// A nominal data definition: a name and its constructors. Shared by
/// reference from every `TypeCon`/`DataCon` atom that mentions it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDef {
    pub name : Name,
    pub param_binders : Vec<Binder>,
    pub cons : Vec<DataConDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConDef {
    pub name : Name,
    pub field_tys : Vec<Type>,
}

/// Arc wrapper around `InnerAtom`; atoms are values in weak head normal
/// form and are immutable once built. All construction goes through the
/// `mk_*` helpers below.
#[derive(Clone, PartialEq, Eq)]
pub struct Atom(Arc<InnerAtom>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerAtom {
    AVar(Var),
    Lam(Arrow, Abs<Block>),
    Pi(Arrow, Abs<(EffectRow, Type)>),
    Con(PrimCon),
    TC(PrimTC),
    Eff(EffectRow),
}

impl std::convert::AsRef<InnerAtom> for Atom {
    fn as_ref(&self) -> &InnerAtom {
        &self.0
    }
}

impl From<InnerAtom> for Atom {
    fn from(x : InnerAtom) -> Atom {
        Atom(Arc::new(x))
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimCon {
    Lit(LitVal),
    PairCon(Atom, Atom),
    UnitCon,
    RecCon(LabeledItems<Atom>),
    DataCon(Arc<DataDef>, Vec<Atom>, usize, Vec<Atom>),
    AnyValue(Type),
    IntRangeVal(Atom, Atom, Atom),
    IndexRangeVal(Type, Limit, Limit, Atom),
    SumAsProd(Type, Atom, Vec<Vec<Atom>>),
    /// A stored table whose elements are all the given atom; the body
    /// does not depend on the index.
    AFor(Type, Atom),
    CharCon(Atom),
    ArrayLit(Type, Vec<LitVal>),
    VariantCon(LabeledItems<Type>, String, usize, Atom),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimTC {
    BaseType(BaseTy),
    IntRange(Atom, Atom),
    IndexRange(Type, Limit, Limit),
    ArrayType(usize, BaseTy),
    RecType(LabeledItems<Type>),
    SumType(Type, Type),
    VariantType(LabeledItems<Type>),
    RefType(Atom, Type),
    TypeCon(Arc<DataDef>, Vec<Atom>),
    TypeKind,
    EffectKind,
    PairType(Type, Type),
    UnitType,
    CharType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    IAdd, ISub, IMul, IDiv, IRem,
    FAdd, FSub, FMul, FDiv,
    BAnd, BOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    FNeg,
    INeg,
    BNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectOp {
    MAsk,
    MTell(Atom),
    MGet,
    MPut(Atom),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimOp {
    ScalarBinOp(BinOp, Atom, Atom),
    ScalarUnOp(UnOp, Atom),
    Cmp(CmpOp, Type, Atom, Atom),
    Select(Atom, Atom, Atom),
    Fst(Atom),
    Snd(Atom),
    RecGet(Atom, Label),
    SumGet(Atom, bool),
    SumTag(Atom),
    IntAsIndex(Type, Atom),
    IndexAsInt(Atom),
    IdxSetSize(Type),
    PrimEffect(Atom, EffectOp),
    IndexRef(Atom, Atom),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimHof {
    For(Direction, Atom),
    While(Atom, Atom),
    RunReader(Atom, Atom),
    RunWriter(Atom),
    RunState(Atom, Atom),
    Linearize(Atom),
    Transpose(Atom),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alt {
    pub binders : Vec<Binder>,
    pub body : Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    App(Arrow, Atom, Atom),
    Op(PrimOp),
    Hof(PrimHof),
    Case(Atom, Vec<Alt>, Type),
    Atom(Atom),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LetAnn {
    Plain,
    /// Marks a top-level binding as the custom linearization rule for
    /// the named function.
    DerivRule(Name),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decl {
    Let(LetAnn, Binder, Expr),
    Unpack(Vec<Binder>, Expr),
}

impl Decl {
    pub fn binders(&self) -> Vec<&Binder> {
        match self {
            Decl::Let(_, b, _) => vec![b],
            Decl::Unpack(bs, _) => bs.iter().collect(),
        }
    }

    pub fn expr(&self) -> &Expr {
        match self {
            Decl::Let(_, _, e) => e,
            Decl::Unpack(_, e) => e,
        }
    }
}

/// A sequence of declarations followed by a result expression, plus the
/// effect row of the whole block (the least upper bound of the rows of
/// its declarations and its result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub decls : Vec<Decl>,
    pub result : Expr,
    pub effs : EffectRow,
}

impl Block {
    pub fn new(decls : Vec<Decl>, result : Expr) -> TabResult<Block> {
        let mut effs = result.effect_row()?;
        for d in &decls {
            effs = effs.union(&d.expr().effect_row()?)?;
        }
        Ok(Block { decls, result, effs })
    }

    pub fn from_atom(a : Atom) -> Block {
        Block { decls : Vec::new(), result : Expr::Atom(a), effs : pure_row() }
    }
}

// ----------------------------------------------------------------------
// constructors

pub fn mk_var(v : Var) -> Atom {
    AVar(v).into()
}

pub fn mk_var_nt(name : Name, ty : Type) -> Atom {
    AVar(Var::mk(name, ty)).into()
}

pub fn mk_lam(arrow : Arrow, binder : Binder, body : Block) -> Atom {
    Lam(arrow, Abs::mk(binder, body)).into()
}

pub fn mk_pi(arrow : Arrow, binder : Binder, eff : EffectRow, result : Type) -> Atom {
    Pi(arrow, Abs::mk(binder, (eff, result))).into()
}

/// The (pure) table type `binder:n => a`.
pub fn mk_tab_ty(binder : Binder, elem : Type) -> Atom {
    mk_pi(Arrow::Tab, binder, pure_row(), elem)
}

pub fn mk_con(c : PrimCon) -> Atom {
    Con(c).into()
}

pub fn mk_tc(tc : PrimTC) -> Atom {
    TC(tc).into()
}

pub fn mk_eff(row : EffectRow) -> Atom {
    Eff(row).into()
}

pub fn mk_int(i : i64) -> Atom {
    mk_con(PrimCon::Lit(LitVal::IntLit(i)))
}

pub fn mk_real(r : f64) -> Atom {
    mk_con(PrimCon::Lit(LitVal::RealLit(R64(r))))
}

pub fn mk_bool(b : bool) -> Atom {
    mk_con(PrimCon::Lit(LitVal::BoolLit(b)))
}

pub fn mk_unit() -> Atom {
    mk_con(PrimCon::UnitCon)
}

pub fn mk_pair(l : Atom, r : Atom) -> Atom {
    mk_con(PrimCon::PairCon(l, r))
}

static INT_TY : Lazy<Atom> = Lazy::new(|| mk_tc(PrimTC::BaseType(BaseTy::IntType)));
static REAL_TY : Lazy<Atom> = Lazy::new(|| mk_tc(PrimTC::BaseType(BaseTy::RealType)));
static BOOL_TY : Lazy<Atom> = Lazy::new(|| mk_tc(PrimTC::BaseType(BaseTy::BoolType)));
static UNIT_TY : Lazy<Atom> = Lazy::new(|| mk_tc(PrimTC::UnitType));

pub fn int_ty() -> Type {
    INT_TY.clone()
}

pub fn real_ty() -> Type {
    REAL_TY.clone()
}

pub fn bool_ty() -> Type {
    BOOL_TY.clone()
}

pub fn unit_ty() -> Type {
    UNIT_TY.clone()
}

pub fn pair_ty(l : Type, r : Type) -> Type {
    mk_tc(PrimTC::PairType(l, r))
}

/// `range(l, h)` as an index-set type.
pub fn int_range(l : Atom, h : Atom) -> Type {
    mk_tc(PrimTC::IntRange(l, h))
}

pub fn ref_ty(region : Atom, ty : Type) -> Type {
    mk_tc(PrimTC::RefType(region, ty))
}

/// The index representation type: every finite index set embeds into it.
pub fn idx_rep_ty() -> Type {
    int_ty()
}

// ----------------------------------------------------------------------
// scopes and substitution environments

/// What the scope records about a bound name: its annotation and, for
/// let-bound names, the bound expression (used by `reduce_scoped`).
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub ty : Type,
    pub expr : Option<Expr>,
}

pub type Scope = HashMap<Name, ScopeEntry>;
pub type SubstEnv = HashMap<Name, Atom>;

pub fn scope_entry(ty : Type) -> ScopeEntry {
    ScopeEntry { ty, expr : None }
}

/// Free variables of a term, with their annotations. Rebinding a name
/// subtracts it from the body's free set; annotations of the binders
/// themselves still contribute.
pub fn free_vars_atom(a : &Atom) -> HashMap<Name, Type> {
    let mut acc = HashMap::new();
    fv_atom(a, &mut acc, &mut Vec::new());
    acc
}

pub fn free_vars_expr(e : &Expr) -> HashMap<Name, Type> {
    let mut acc = HashMap::new();
    fv_expr(e, &mut acc, &mut Vec::new());
    acc
}

pub fn free_vars_block(b : &Block) -> HashMap<Name, Type> {
    let mut acc = HashMap::new();
    fv_block(b, &mut acc, &mut Vec::new());
    acc
}

fn is_bound(n : &Name, bound : &Vec<Name>) -> bool {
    bound.iter().any(|b| b == n)
}

fn fv_atom(a : &Atom, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match a.as_ref() {
        AVar(v) => {
            fv_atom(&v.ty, acc, bound);
            if !is_bound(&v.name, bound) && !v.name.is_top() {
                acc.insert(v.name.clone(), v.ty.clone());
            }
        },
        Lam(arrow, abs) => {
            fv_arrow(arrow, acc, bound);
            fv_atom(&abs.binder.ty, acc, bound);
            bound.push(abs.binder.name.clone());
            fv_block(&abs.body, acc, bound);
            bound.pop();
        },
        Pi(arrow, abs) => {
            fv_arrow(arrow, acc, bound);
            fv_atom(&abs.binder.ty, acc, bound);
            bound.push(abs.binder.name.clone());
            fv_row(&abs.body.0, acc, bound);
            fv_atom(&abs.body.1, acc, bound);
            bound.pop();
        },
        Con(con) => fv_con(con, acc, bound),
        TC(tc) => fv_tc(tc, acc, bound),
        Eff(row) => fv_row(row, acc, bound),
    }
}

fn fv_arrow(arrow : &Arrow, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    if let Arrow::Plain(row) = arrow {
        fv_row(row, acc, bound);
    }
}

fn fv_row(row : &EffectRow, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    for (region, (_, ty)) in &row.row {
        if !is_bound(region, bound) {
            acc.insert(region.clone(), mk_tc(PrimTC::TypeKind));
        }
        fv_atom(ty, acc, bound);
    }
    if let Some(t) = &row.tail {
        if !is_bound(t, bound) {
            acc.insert(t.clone(), mk_tc(PrimTC::EffectKind));
        }
    }
}

fn fv_limit(l : &Limit, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match l {
        Limit::InclusiveLim(a) | Limit::ExclusiveLim(a) => fv_atom(a, acc, bound),
        Limit::Unlimited => (),
    }
}

fn fv_con(con : &PrimCon, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match con {
        PrimCon::Lit(..) | PrimCon::UnitCon => (),
        PrimCon::PairCon(l, r) => { fv_atom(l, acc, bound); fv_atom(r, acc, bound); },
        PrimCon::RecCon(items) => for x in items.values() { fv_atom(x, acc, bound); },
        PrimCon::DataCon(_, params, _, args) => {
            for p in params { fv_atom(p, acc, bound); }
            for a in args { fv_atom(a, acc, bound); }
        },
        PrimCon::AnyValue(t) => fv_atom(t, acc, bound),
        PrimCon::IntRangeVal(l, h, i) => {
            fv_atom(l, acc, bound); fv_atom(h, acc, bound); fv_atom(i, acc, bound);
        },
        PrimCon::IndexRangeVal(t, l, h, i) => {
            fv_atom(t, acc, bound); fv_limit(l, acc, bound); fv_limit(h, acc, bound);
            fv_atom(i, acc, bound);
        },
        PrimCon::SumAsProd(t, tag, payloads) => {
            fv_atom(t, acc, bound); fv_atom(tag, acc, bound);
            for alt in payloads {
                for x in alt { fv_atom(x, acc, bound); }
            }
        },
        PrimCon::AFor(n, body) => { fv_atom(n, acc, bound); fv_atom(body, acc, bound); },
        PrimCon::CharCon(x) => fv_atom(x, acc, bound),
        PrimCon::ArrayLit(t, _) => fv_atom(t, acc, bound),
        PrimCon::VariantCon(tys, _, _, x) => {
            for t in tys.values() { fv_atom(t, acc, bound); }
            fv_atom(x, acc, bound);
        },
    }
}

fn fv_tc(tc : &PrimTC, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match tc {
        PrimTC::BaseType(..) | PrimTC::TypeKind | PrimTC::EffectKind
        | PrimTC::UnitType | PrimTC::CharType | PrimTC::ArrayType(..) => (),
        PrimTC::IntRange(l, h) => { fv_atom(l, acc, bound); fv_atom(h, acc, bound); },
        PrimTC::IndexRange(t, l, h) => {
            fv_atom(t, acc, bound); fv_limit(l, acc, bound); fv_limit(h, acc, bound);
        },
        PrimTC::RecType(items) | PrimTC::VariantType(items) =>
            for t in items.values() { fv_atom(t, acc, bound); },
        PrimTC::SumType(l, r) | PrimTC::PairType(l, r) => {
            fv_atom(l, acc, bound); fv_atom(r, acc, bound);
        },
        PrimTC::RefType(region, t) => { fv_atom(region, acc, bound); fv_atom(t, acc, bound); },
        PrimTC::TypeCon(_, params) => for p in params { fv_atom(p, acc, bound); },
    }
}

fn fv_expr(e : &Expr, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match e {
        Expr::App(arrow, f, x) => {
            fv_arrow(arrow, acc, bound);
            fv_atom(f, acc, bound);
            fv_atom(x, acc, bound);
        },
        Expr::Op(op) => fv_op(op, acc, bound),
        Expr::Hof(hof) => fv_hof(hof, acc, bound),
        Expr::Case(scrut, alts, ty) => {
            fv_atom(scrut, acc, bound);
            fv_atom(ty, acc, bound);
            for alt in alts {
                for b in &alt.binders { fv_atom(&b.ty, acc, bound); }
                let n_before = bound.len();
                for b in &alt.binders { bound.push(b.name.clone()); }
                fv_block(&alt.body, acc, bound);
                bound.truncate(n_before);
            }
        },
        Expr::Atom(a) => fv_atom(a, acc, bound),
    }
}

fn fv_op(op : &PrimOp, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match op {
        PrimOp::ScalarBinOp(_, x, y) => { fv_atom(x, acc, bound); fv_atom(y, acc, bound); },
        PrimOp::ScalarUnOp(_, x) => fv_atom(x, acc, bound),
        PrimOp::Cmp(_, t, x, y) => {
            fv_atom(t, acc, bound); fv_atom(x, acc, bound); fv_atom(y, acc, bound);
        },
        PrimOp::Select(p, x, y) => {
            fv_atom(p, acc, bound); fv_atom(x, acc, bound); fv_atom(y, acc, bound);
        },
        PrimOp::Fst(x) | PrimOp::Snd(x) | PrimOp::SumTag(x)
        | PrimOp::IndexAsInt(x) => fv_atom(x, acc, bound),
        PrimOp::RecGet(x, _) | PrimOp::SumGet(x, _) => fv_atom(x, acc, bound),
        PrimOp::IntAsIndex(t, x) => { fv_atom(t, acc, bound); fv_atom(x, acc, bound); },
        PrimOp::IdxSetSize(t) => fv_atom(t, acc, bound),
        PrimOp::PrimEffect(r, eop) => {
            fv_atom(r, acc, bound);
            match eop {
                EffectOp::MTell(x) | EffectOp::MPut(x) => fv_atom(x, acc, bound),
                EffectOp::MAsk | EffectOp::MGet => (),
            }
        },
        PrimOp::IndexRef(r, i) => { fv_atom(r, acc, bound); fv_atom(i, acc, bound); },
    }
}

fn fv_hof(hof : &PrimHof, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    match hof {
        PrimHof::For(_, lam) => fv_atom(lam, acc, bound),
        PrimHof::While(c, b) => { fv_atom(c, acc, bound); fv_atom(b, acc, bound); },
        PrimHof::RunReader(r, f) => { fv_atom(r, acc, bound); fv_atom(f, acc, bound); },
        PrimHof::RunWriter(f) => fv_atom(f, acc, bound),
        PrimHof::RunState(s, f) => { fv_atom(s, acc, bound); fv_atom(f, acc, bound); },
        PrimHof::Linearize(f) | PrimHof::Transpose(f) => fv_atom(f, acc, bound),
    }
}

fn fv_block(block : &Block, acc : &mut HashMap<Name, Type>, bound : &mut Vec<Name>) {
    let n_before = bound.len();
    for d in &block.decls {
        fv_expr(d.expr(), acc, bound);
        for b in d.binders() {
            fv_atom(&b.ty, acc, bound);
            bound.push(b.name.clone());
        }
    }
    fv_expr(&block.result, acc, bound);
    bound.truncate(n_before);
}

// ----------------------------------------------------------------------
// capture-avoiding substitution

/// Substitution context: the environment maps names to replacement
/// atoms; the scope is the set of names the result must not capture.
/// Crossing a binder renames it against `scope ∪ dom(env)` and extends
/// the environment with the rename.
struct SubstCtx<'s> {
    env : SubstEnv,
    scope : &'s Scope,
    /// binders introduced (and renamed) during this traversal
    local : HashMap<Name, ()>,
}

impl<'s> SubstCtx<'s> {
    fn taken(&self, n : &Name) -> bool {
        self.scope.contains_key(n) || self.env.contains_key(n) || self.local.contains_key(n)
    }

    /// Returns the renamed binder together with whatever env entry it
    /// shadowed, so `pop_binder` can reinstate it for the siblings that
    /// follow the binder's scope.
    fn push_binder(&mut self, b : &Binder) -> TabResult<(Binder, Option<Atom>)> {
        let ty = self.atom(&b.ty)?;
        let fresh = b.name.fresh_in(|n| self.taken(n));
        let saved = if fresh != b.name {
            self.env.insert(b.name.clone(), mk_var_nt(fresh.clone(), ty.clone()))
        } else {
            self.env.remove(&b.name)
        };
        self.local.insert(fresh.clone(), ());
        Ok((Var::mk(fresh, ty), saved))
    }

    fn pop_binder(&mut self, orig : &Binder, renamed : &Binder, saved : Option<Atom>) {
        self.local.remove(&renamed.name);
        match saved {
            Some(a) => { self.env.insert(orig.name.clone(), a); },
            None => { self.env.remove(&orig.name); },
        }
    }

    fn atom(&mut self, a : &Atom) -> TabResult<Atom> {
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || self.atom_inner(a))
    }

    fn atom_inner(&mut self, a : &Atom) -> TabResult<Atom> {
        Ok(match a.as_ref() {
            AVar(v) => match self.env.get(&v.name) {
                Some(replacement) => replacement.clone(),
                None => mk_var_nt(v.name.clone(), self.atom(&v.ty)?),
            },
            Lam(arrow, abs) => {
                let arrow = self.arrow(arrow)?;
                let (binder, saved) = self.push_binder(&abs.binder)?;
                let body = self.block(&abs.body)?;
                self.pop_binder(&abs.binder, &binder, saved);
                mk_lam(arrow, binder, body)
            },
            Pi(arrow, abs) => {
                let arrow = self.arrow(arrow)?;
                let (binder, saved) = self.push_binder(&abs.binder)?;
                let eff = self.row(&abs.body.0)?;
                let ty = self.atom(&abs.body.1)?;
                self.pop_binder(&abs.binder, &binder, saved);
                mk_pi(arrow, binder, eff, ty)
            },
            Con(con) => mk_con(self.con(con)?),
            TC(tc) => mk_tc(self.tc(tc)?),
            Eff(row) => mk_eff(self.row(row)?),
        })
    }

    fn arrow(&mut self, arrow : &Arrow) -> TabResult<Arrow> {
        Ok(match arrow {
            Arrow::Plain(row) => Arrow::Plain(self.row(row)?),
            owise => owise.clone(),
        })
    }

    /// Region keys are names, not atoms; map them through whatever
    /// renamings the env holds. The row is a set of labelled entries, so
    /// key order is preserved but never significant.
    fn row(&mut self, row : &EffectRow) -> TabResult<EffectRow> {
        let mut out = IndexMap::with_capacity(row.row.len());
        for (region, (eff, ty)) in &row.row {
            let region = self.rename_region(region)?;
            out.insert(region, (*eff, self.atom(ty)?));
        }
        let tail = match &row.tail {
            Some(t) => Some(self.rename_region(t)?),
            None => None,
        };
        Ok(EffectRow { row : out, tail })
    }

    fn rename_region(&mut self, region : &Name) -> TabResult<Name> {
        match self.env.get(region) {
            Some(a) => match a.as_ref() {
                AVar(v) => Ok(v.name.clone()),
                owise => compiler_err!("region substituted with a non-variable : {:?}", owise),
            },
            None => Ok(region.clone()),
        }
    }

    fn limit(&mut self, l : &Limit) -> TabResult<Limit> {
        Ok(match l {
            Limit::InclusiveLim(a) => Limit::InclusiveLim(self.atom(a)?),
            Limit::ExclusiveLim(a) => Limit::ExclusiveLim(self.atom(a)?),
            Limit::Unlimited => Limit::Unlimited,
        })
    }

    fn con(&mut self, con : &PrimCon) -> TabResult<PrimCon> {
        Ok(match con {
            PrimCon::Lit(l) => PrimCon::Lit(l.clone()),
            PrimCon::UnitCon => PrimCon::UnitCon,
            PrimCon::PairCon(l, r) => PrimCon::PairCon(self.atom(l)?, self.atom(r)?),
            PrimCon::RecCon(items) => PrimCon::RecCon(items.try_map(|x| self.atom(x))?),
            PrimCon::DataCon(def, params, ix, args) => {
                let params = params.iter().map(|p| self.atom(p)).collect::<TabResult<Vec<_>>>()?;
                let args = args.iter().map(|x| self.atom(x)).collect::<TabResult<Vec<_>>>()?;
                PrimCon::DataCon(def.clone(), params, *ix, args)
            },
            PrimCon::AnyValue(t) => PrimCon::AnyValue(self.atom(t)?),
            PrimCon::IntRangeVal(l, h, i) =>
                PrimCon::IntRangeVal(self.atom(l)?, self.atom(h)?, self.atom(i)?),
            PrimCon::IndexRangeVal(t, l, h, i) =>
                PrimCon::IndexRangeVal(self.atom(t)?, self.limit(l)?, self.limit(h)?, self.atom(i)?),
            PrimCon::SumAsProd(t, tag, payloads) => {
                let payloads = payloads.iter()
                    .map(|alt| alt.iter().map(|x| self.atom(x)).collect::<TabResult<Vec<_>>>())
                    .collect::<TabResult<Vec<_>>>()?;
                PrimCon::SumAsProd(self.atom(t)?, self.atom(tag)?, payloads)
            },
            PrimCon::AFor(n, body) => PrimCon::AFor(self.atom(n)?, self.atom(body)?),
            PrimCon::CharCon(x) => PrimCon::CharCon(self.atom(x)?),
            PrimCon::ArrayLit(t, xs) => PrimCon::ArrayLit(self.atom(t)?, xs.clone()),
            PrimCon::VariantCon(tys, label, ix, x) => {
                let tys = tys.try_map(|t| self.atom(t))?;
                PrimCon::VariantCon(tys, label.clone(), *ix, self.atom(x)?)
            },
        })
    }

    fn tc(&mut self, tc : &PrimTC) -> TabResult<PrimTC> {
        Ok(match tc {
            PrimTC::BaseType(b) => PrimTC::BaseType(*b),
            PrimTC::TypeKind => PrimTC::TypeKind,
            PrimTC::EffectKind => PrimTC::EffectKind,
            PrimTC::UnitType => PrimTC::UnitType,
            PrimTC::CharType => PrimTC::CharType,
            PrimTC::ArrayType(n, b) => PrimTC::ArrayType(*n, *b),
            PrimTC::IntRange(l, h) => PrimTC::IntRange(self.atom(l)?, self.atom(h)?),
            PrimTC::IndexRange(t, l, h) =>
                PrimTC::IndexRange(self.atom(t)?, self.limit(l)?, self.limit(h)?),
            PrimTC::RecType(items) => PrimTC::RecType(items.try_map(|t| self.atom(t))?),
            PrimTC::VariantType(items) => PrimTC::VariantType(items.try_map(|t| self.atom(t))?),
            PrimTC::SumType(l, r) => PrimTC::SumType(self.atom(l)?, self.atom(r)?),
            PrimTC::PairType(l, r) => PrimTC::PairType(self.atom(l)?, self.atom(r)?),
            PrimTC::RefType(region, t) => PrimTC::RefType(self.atom(region)?, self.atom(t)?),
            PrimTC::TypeCon(def, params) => {
                let params = params.iter().map(|p| self.atom(p)).collect::<TabResult<Vec<_>>>()?;
                PrimTC::TypeCon(def.clone(), params)
            },
        })
    }

    fn expr(&mut self, e : &Expr) -> TabResult<Expr> {
        Ok(match e {
            Expr::App(arrow, f, x) =>
                Expr::App(self.arrow(arrow)?, self.atom(f)?, self.atom(x)?),
            Expr::Op(op) => Expr::Op(self.op(op)?),
            Expr::Hof(hof) => Expr::Hof(self.hof(hof)?),
            Expr::Case(scrut, alts, ty) => {
                let scrut = self.atom(scrut)?;
                let ty = self.atom(ty)?;
                let mut new_alts = Vec::with_capacity(alts.len());
                for alt in alts {
                    let mut binders = Vec::with_capacity(alt.binders.len());
                    let mut saves = Vec::with_capacity(alt.binders.len());
                    for b in &alt.binders {
                        let (b2, saved) = self.push_binder(b)?;
                        binders.push(b2);
                        saves.push(saved);
                    }
                    let body = self.block(&alt.body)?;
                    for ((orig, renamed), saved) in
                        alt.binders.iter().zip(&binders).zip(saves).rev() {
                        self.pop_binder(orig, renamed, saved);
                    }
                    new_alts.push(Alt { binders, body });
                }
                Expr::Case(scrut, new_alts, ty)
            },
            Expr::Atom(a) => Expr::Atom(self.atom(a)?),
        })
    }

    fn op(&mut self, op : &PrimOp) -> TabResult<PrimOp> {
        Ok(match op {
            PrimOp::ScalarBinOp(o, x, y) => PrimOp::ScalarBinOp(*o, self.atom(x)?, self.atom(y)?),
            PrimOp::ScalarUnOp(o, x) => PrimOp::ScalarUnOp(*o, self.atom(x)?),
            PrimOp::Cmp(o, t, x, y) => PrimOp::Cmp(*o, self.atom(t)?, self.atom(x)?, self.atom(y)?),
            PrimOp::Select(p, x, y) => PrimOp::Select(self.atom(p)?, self.atom(x)?, self.atom(y)?),
            PrimOp::Fst(x) => PrimOp::Fst(self.atom(x)?),
            PrimOp::Snd(x) => PrimOp::Snd(self.atom(x)?),
            PrimOp::RecGet(x, l) => PrimOp::RecGet(self.atom(x)?, l.clone()),
            PrimOp::SumGet(x, left) => PrimOp::SumGet(self.atom(x)?, *left),
            PrimOp::SumTag(x) => PrimOp::SumTag(self.atom(x)?),
            PrimOp::IntAsIndex(t, x) => PrimOp::IntAsIndex(self.atom(t)?, self.atom(x)?),
            PrimOp::IndexAsInt(x) => PrimOp::IndexAsInt(self.atom(x)?),
            PrimOp::IdxSetSize(t) => PrimOp::IdxSetSize(self.atom(t)?),
            PrimOp::PrimEffect(r, eop) => {
                let eop = match eop {
                    EffectOp::MAsk => EffectOp::MAsk,
                    EffectOp::MGet => EffectOp::MGet,
                    EffectOp::MTell(x) => EffectOp::MTell(self.atom(x)?),
                    EffectOp::MPut(x) => EffectOp::MPut(self.atom(x)?),
                };
                PrimOp::PrimEffect(self.atom(r)?, eop)
            },
            PrimOp::IndexRef(r, i) => PrimOp::IndexRef(self.atom(r)?, self.atom(i)?),
        })
    }

    fn hof(&mut self, hof : &PrimHof) -> TabResult<PrimHof> {
        Ok(match hof {
            PrimHof::For(d, lam) => PrimHof::For(*d, self.atom(lam)?),
            PrimHof::While(c, b) => PrimHof::While(self.atom(c)?, self.atom(b)?),
            PrimHof::RunReader(r, f) => PrimHof::RunReader(self.atom(r)?, self.atom(f)?),
            PrimHof::RunWriter(f) => PrimHof::RunWriter(self.atom(f)?),
            PrimHof::RunState(s, f) => PrimHof::RunState(self.atom(s)?, self.atom(f)?),
            PrimHof::Linearize(f) => PrimHof::Linearize(self.atom(f)?),
            PrimHof::Transpose(f) => PrimHof::Transpose(self.atom(f)?),
        })
    }

    fn block(&mut self, block : &Block) -> TabResult<Block> {
        let mut decls = Vec::with_capacity(block.decls.len());
        let mut pushed : Vec<(Binder, Binder, Option<Atom>)> = Vec::new();
        for d in &block.decls {
            match d {
                Decl::Let(ann, b, e) => {
                    let e = self.expr(e)?;
                    let (b2, saved) = self.push_binder(b)?;
                    pushed.push((b.clone(), b2.clone(), saved));
                    decls.push(Decl::Let(ann.clone(), b2, e));
                },
                Decl::Unpack(bs, e) => {
                    let e = self.expr(e)?;
                    let mut bs2 = Vec::with_capacity(bs.len());
                    for b in bs {
                        let (b2, saved) = self.push_binder(b)?;
                        pushed.push((b.clone(), b2.clone(), saved));
                        bs2.push(b2);
                    }
                    decls.push(Decl::Unpack(bs2, e));
                },
            }
        }
        let result = self.expr(&block.result)?;
        let effs = self.row(&block.effs)?;
        while let Some((orig, renamed, saved)) = pushed.pop() {
            self.pop_binder(&orig, &renamed, saved);
        }
        Ok(Block { decls, result, effs })
    }
}

pub fn subst_atom(env : &SubstEnv, scope : &Scope, a : &Atom) -> TabResult<Atom> {
    let mut ctx = SubstCtx { env : env.clone(), scope, local : HashMap::new() };
    ctx.atom(a)
}

pub fn subst_expr(env : &SubstEnv, scope : &Scope, e : &Expr) -> TabResult<Expr> {
    let mut ctx = SubstCtx { env : env.clone(), scope, local : HashMap::new() };
    ctx.expr(e)
}

pub fn subst_block(env : &SubstEnv, scope : &Scope, b : &Block) -> TabResult<Block> {
    let mut ctx = SubstCtx { env : env.clone(), scope, local : HashMap::new() };
    ctx.block(b)
}

pub fn subst_row(env : &SubstEnv, scope : &Scope, row : &EffectRow) -> TabResult<EffectRow> {
    let mut ctx = SubstCtx { env : env.clone(), scope, local : HashMap::new() };
    ctx.row(row)
}

pub fn subst_arrow(env : &SubstEnv, scope : &Scope, arrow : &Arrow) -> TabResult<Arrow> {
    let mut ctx = SubstCtx { env : env.clone(), scope, local : HashMap::new() };
    ctx.arrow(arrow)
}

/// Rename bound variables so they cannot clash with an external scope.
pub fn deshadow_atom(a : &Atom, scope : &Scope) -> TabResult<Atom> {
    subst_atom(&SubstEnv::new(), scope, a)
}

/// `applyPi`: the effective (row, type) of applying a Pi to an argument.
pub fn apply_pi(pi : &Atom, x : &Atom) -> TabResult<(EffectRow, Type)> {
    match pi.as_ref() {
        Pi(_, abs) => {
            let mut env = SubstEnv::new();
            env.insert(abs.binder.name.clone(), x.clone());
            let scope : Scope = free_vars_atom(x)
                .into_iter()
                .map(|(n, t)| (n, scope_entry(t)))
                .collect();
            let mut ctx = SubstCtx { env, scope : &scope, local : HashMap::new() };
            let eff = ctx.row(&abs.body.0)?;
            let ty = ctx.atom(&abs.body.1)?;
            Ok((eff, ty))
        },
        owise => compiler_err!("applyPi expected a Pi type, got {:?}", owise),
    }
}

/// Beta-reduce a lambda's body against an argument, without evaluating.
pub fn apply_abs(lam : &Atom, x : &Atom) -> TabResult<Block> {
    match lam.as_ref() {
        Lam(_, abs) => {
            let mut env = SubstEnv::new();
            env.insert(abs.binder.name.clone(), x.clone());
            let scope : Scope = free_vars_atom(x)
                .into_iter()
                .map(|(n, t)| (n, scope_entry(t)))
                .collect();
            subst_block(&env, &scope, &abs.body)
        },
        owise => compiler_err!("applyAbs expected a lambda, got {:?}", owise),
    }
}

// ----------------------------------------------------------------------
// alpha-equality

/// Pi equality is alpha-equivalence: instantiate both bodies with the
/// same fresh skolem variable and compare the effective types. All other
/// atoms compare structurally.
pub fn alpha_eq_ty(a : &Atom, b : &Atom) -> bool {
    match (a.as_ref(), b.as_ref()) {
        (Pi(ar1, abs1), Pi(ar2, abs2)) => {
            if ar1 != ar2 && !arrows_alpha_eq(ar1, ar2) {
                return false
            }
            if !alpha_eq_ty(&abs1.binder.ty, &abs2.binder.ty) {
                return false
            }
            let mut taken = free_vars_atom(a);
            for (k, v) in free_vars_atom(b) {
                taken.insert(k, v);
            }
            let sk_name = mk_name(NameTag::Skolem, "sk", 0)
                .fresh_in(|n| taken.contains_key(n)
                          || *n == abs1.binder.name
                          || *n == abs2.binder.name);
            let sk = mk_var_nt(sk_name, abs1.binder.ty.clone());
            match (apply_pi(a, &sk), apply_pi(b, &sk)) {
                (Ok((e1, t1)), Ok((e2, t2))) => e1 == e2 && alpha_eq_ty(&t1, &t2),
                _ => false,
            }
        },
        (TC(PrimTC::PairType(l1, r1)), TC(PrimTC::PairType(l2, r2)))
        | (TC(PrimTC::SumType(l1, r1)), TC(PrimTC::SumType(l2, r2))) =>
            alpha_eq_ty(l1, l2) && alpha_eq_ty(r1, r2),
        (TC(PrimTC::RefType(g1, t1)), TC(PrimTC::RefType(g2, t2))) =>
            g1 == g2 && alpha_eq_ty(t1, t2),
        _ => a == b,
    }
}

fn arrows_alpha_eq(a : &Arrow, b : &Arrow) -> bool {
    match (a, b) {
        (Arrow::Plain(r1), Arrow::Plain(r2)) => r1 == r2,
        _ => a == b,
    }
}

// ----------------------------------------------------------------------
// typing

impl Atom {
    pub fn get_type(&self) -> TabResult<Type> {
        Ok(match self.as_ref() {
            AVar(v) => v.ty.clone(),
            Lam(arrow, abs) => mk_pi(arrow.clone(),
                                     abs.binder.clone(),
                                     abs.body.effs.clone(),
                                     abs.body.get_type()?),
            Pi(..) | TC(..) => mk_tc(PrimTC::TypeKind),
            Eff(..) => mk_tc(PrimTC::EffectKind),
            Con(con) => con_type(con)?,
        })
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self.as_ref() {
            AVar(v) => Some(v),
            _ => None,
        }
    }
}

fn con_type(con : &PrimCon) -> TabResult<Type> {
    Ok(match con {
        PrimCon::Lit(l) => mk_tc(PrimTC::BaseType(l.base_ty())),
        PrimCon::UnitCon => unit_ty(),
        PrimCon::PairCon(l, r) => pair_ty(l.get_type()?, r.get_type()?),
        PrimCon::RecCon(items) => mk_tc(PrimTC::RecType(items.try_map(|x| x.get_type())?)),
        PrimCon::DataCon(def, params, _, _) =>
            mk_tc(PrimTC::TypeCon(def.clone(), params.clone())),
        PrimCon::AnyValue(t) => t.clone(),
        PrimCon::IntRangeVal(l, h, _) => int_range(l.clone(), h.clone()),
        PrimCon::IndexRangeVal(t, l, h, _) =>
            mk_tc(PrimTC::IndexRange(t.clone(), l.clone(), h.clone())),
        PrimCon::SumAsProd(t, _, _) => t.clone(),
        PrimCon::AFor(n, body) => {
            let b = Var::mk(mk_name(NameTag::GenName, "_i", 0), n.clone());
            mk_tab_ty(b, body.get_type()?)
        },
        PrimCon::CharCon(..) => mk_tc(PrimTC::CharType),
        PrimCon::ArrayLit(t, _) => t.clone(),
        PrimCon::VariantCon(tys, _, _, _) => mk_tc(PrimTC::VariantType(tys.clone())),
    })
}

impl Expr {
    pub fn get_type(&self) -> TabResult<Type> {
        Ok(match self {
            Expr::App(_, f, x) => apply_pi(&f.get_type()?, x)?.1,
            Expr::Op(op) => op_type(op)?,
            Expr::Hof(hof) => hof_type(hof)?,
            Expr::Case(_, _, ty) => ty.clone(),
            Expr::Atom(a) => a.get_type()?,
        })
    }

    /// The effect row this expression may perform.
    pub fn effect_row(&self) -> TabResult<EffectRow> {
        Ok(match self {
            Expr::App(arrow, ..) => arrow.eff(),
            Expr::Atom(..) => pure_row(),
            Expr::Op(PrimOp::PrimEffect(r, eop)) => {
                let (region, ty) = ref_region_ty(r)?;
                let eff = match eop {
                    EffectOp::MAsk => EffectName::Reader,
                    EffectOp::MTell(..) => EffectName::Writer,
                    EffectOp::MGet | EffectOp::MPut(..) => EffectName::State,
                };
                one_eff(region, eff, ty)
            },
            Expr::Op(..) => pure_row(),
            Expr::Hof(hof) => hof_effect_row(hof)?,
            Expr::Case(_, alts, _) => {
                let mut row = pure_row();
                for alt in alts {
                    row = row.union(&alt.body.effs)?;
                }
                row
            },
        })
    }
}

/// The `(region name, value type)` of a reference atom.
pub fn ref_region_ty(r : &Atom) -> TabResult<(Name, Type)> {
    match r.get_type()?.as_ref() {
        TC(PrimTC::RefType(region, ty)) => match region.as_ref() {
            AVar(v) => Ok((v.name.clone(), ty.clone())),
            owise => compiler_err!("reference region is not a variable : {:?}", owise),
        },
        owise => compiler_err!("expected a reference type, got {:?}", owise),
    }
}

fn op_type(op : &PrimOp) -> TabResult<Type> {
    Ok(match op {
        PrimOp::ScalarBinOp(o, _, _) => match o {
            BinOp::IAdd | BinOp::ISub | BinOp::IMul | BinOp::IDiv | BinOp::IRem => int_ty(),
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv => real_ty(),
            BinOp::BAnd | BinOp::BOr => bool_ty(),
        },
        PrimOp::ScalarUnOp(o, _) => match o {
            UnOp::FNeg => real_ty(),
            UnOp::INeg => int_ty(),
            UnOp::BNot => bool_ty(),
        },
        PrimOp::Cmp(..) => bool_ty(),
        PrimOp::Select(_, x, _) => x.get_type()?,
        PrimOp::Fst(x) => match x.get_type()?.as_ref() {
            TC(PrimTC::PairType(l, _)) => l.clone(),
            owise => compiler_err!("Fst of a non-pair : {:?}", owise),
        },
        PrimOp::Snd(x) => match x.get_type()?.as_ref() {
            TC(PrimTC::PairType(_, r)) => r.clone(),
            owise => compiler_err!("Snd of a non-pair : {:?}", owise),
        },
        PrimOp::RecGet(x, label) => match x.get_type()?.as_ref() {
            TC(PrimTC::RecType(items)) => rec_field_ty(items, label)?,
            owise => compiler_err!("RecGet of a non-record : {:?}", owise),
        },
        PrimOp::SumGet(x, left) => match x.get_type()?.as_ref() {
            TC(PrimTC::SumType(l, r)) => if *left { l.clone() } else { r.clone() },
            owise => compiler_err!("SumGet of a non-sum : {:?}", owise),
        },
        PrimOp::SumTag(..) => bool_ty(),
        PrimOp::IntAsIndex(t, _) => t.clone(),
        PrimOp::IndexAsInt(..) => int_ty(),
        PrimOp::IdxSetSize(..) => int_ty(),
        PrimOp::PrimEffect(r, eop) => {
            let (_, ty) = ref_region_ty(r)?;
            match eop {
                EffectOp::MAsk | EffectOp::MGet => ty,
                EffectOp::MTell(..) | EffectOp::MPut(..) => unit_ty(),
            }
        },
        PrimOp::IndexRef(r, i) => match r.get_type()?.as_ref() {
            TC(PrimTC::RefType(region, tab)) => {
                let (_, elem) = apply_pi(tab, i)?;
                ref_ty(region.clone(), elem)
            },
            owise => compiler_err!("IndexRef of a non-reference : {:?}", owise),
        },
    })
}

pub fn rec_field_ty(items : &LabeledItems<Type>, label : &Label) -> TabResult<Type> {
    match (items, label) {
        (LabeledItems::Tup(xs), Label::At(i)) => match xs.get(*i) {
            Some(t) => Ok(t.clone()),
            None => compiler_err!("tuple index {} out of range", i),
        },
        (LabeledItems::Named(m), Label::Field(f)) => match m.get(f) {
            Some(t) => Ok(t.clone()),
            None => compiler_err!("missing record field {:?}", f),
        },
        _ => compiler_err!("record selector shape mismatch"),
    }
}

fn hof_type(hof : &PrimHof) -> TabResult<Type> {
    Ok(match hof {
        PrimHof::For(_, lam) => match lam.get_type()?.as_ref() {
            Pi(_, abs) => mk_tab_ty(abs.binder.clone(), abs.body.1.clone()),
            owise => compiler_err!("For of a non-lambda : {:?}", owise),
        },
        PrimHof::While(..) => unit_ty(),
        PrimHof::RunReader(_, f) => {
            let (_, _, _, body) = open_binary_fun(f)?;
            body.get_type()?
        },
        PrimHof::RunWriter(f) => {
            let (_, ref_b, _, body) = open_binary_fun(f)?;
            let w = match ref_b.ty.as_ref() {
                TC(PrimTC::RefType(_, w)) => w.clone(),
                owise => compiler_err!("writer ref of a non-ref type : {:?}", owise),
            };
            pair_ty(body.get_type()?, w)
        },
        PrimHof::RunState(s, f) => {
            let (_, _, _, body) = open_binary_fun(f)?;
            pair_ty(body.get_type()?, s.get_type()?)
        },
        PrimHof::Linearize(f) => match f.get_type()?.as_ref() {
            Pi(_, abs) => {
                let a = abs.binder.ty.clone();
                let b = abs.body.1.clone();
                let t = Var::mk(mk_name(NameTag::GenName, "t", 0), a.clone());
                let lin = mk_pi(Arrow::Lin, t, pure_row(), b.clone());
                let x = abs.binder.clone();
                mk_pi(Arrow::Plain(pure_row()), x, pure_row(), pair_ty(b, lin))
            },
            owise => compiler_err!("Linearize of a non-function : {:?}", owise),
        },
        PrimHof::Transpose(f) => match f.get_type()?.as_ref() {
            Pi(_, abs) => {
                let a = abs.binder.ty.clone();
                let b = abs.body.1.clone();
                let ct = Var::mk(mk_name(NameTag::GenName, "ct", 0), b);
                mk_pi(Arrow::Lin, ct, pure_row(), a)
            },
            owise => compiler_err!("Transpose of a non-function : {:?}", owise),
        },
    })
}

fn hof_effect_row(hof : &PrimHof) -> TabResult<EffectRow> {
    Ok(match hof {
        PrimHof::For(_, lam) => match lam.get_type()?.as_ref() {
            Pi(arrow, _) => arrow.eff(),
            owise => compiler_err!("For of a non-lambda : {:?}", owise),
        },
        PrimHof::While(c, b) => {
            let ce = match c.get_type()?.as_ref() {
                Pi(arrow, _) => arrow.eff(),
                _ => pure_row(),
            };
            let be = match b.get_type()?.as_ref() {
                Pi(arrow, _) => arrow.eff(),
                _ => pure_row(),
            };
            ce.union(&be)?
        },
        PrimHof::RunReader(_, f) | PrimHof::RunState(_, f) => {
            let (region_b, _, eff, _) = open_binary_fun(f)?;
            eff.without(&region_b.name)
        },
        PrimHof::RunWriter(f) => {
            let (region_b, _, eff, _) = open_binary_fun(f)?;
            eff.without(&region_b.name)
        },
        PrimHof::Linearize(..) | PrimHof::Transpose(..) => pure_row(),
    })
}

impl Block {
    pub fn get_type(&self) -> TabResult<Type> {
        self.result.get_type()
    }
}

// ----------------------------------------------------------------------
// effect functions

/// Build the nested effect-function shape consumed by the `RunX` hofs:
/// `Lam(Implicit, region ⇒ Lam(Plain(eff), ref ⇒ body))`.
pub fn mk_binary_fun(region : Binder, ref_b : Binder, eff : EffectRow, body : Block) -> Atom {
    let inner = mk_lam(Arrow::Plain(eff), ref_b, body);
    mk_lam(Arrow::Implicit, region, Block::from_atom(inner))
}

/// Destructure an effect function; anything else is a compiler error.
pub fn open_binary_fun(f : &Atom) -> TabResult<(Binder, Binder, EffectRow, Block)> {
    match f.as_ref() {
        Lam(Arrow::Implicit, abs) => {
            if !abs.body.decls.is_empty() {
                compiler_err!("effect function region lambda has declarations")
            }
            match &abs.body.result {
                Expr::Atom(inner) => match inner.as_ref() {
                    Lam(Arrow::Plain(eff), inner_abs) =>
                        Ok((abs.binder.clone(),
                            inner_abs.binder.clone(),
                            eff.clone(),
                            inner_abs.body.clone())),
                    owise => compiler_err!("effect function body is not a plain lambda : {:?}", owise),
                },
                owise => compiler_err!("effect function body is not an atom : {:?}", owise),
            }
        },
        owise => compiler_err!("expected an effect function, got {:?}", owise),
    }
}

// ----------------------------------------------------------------------
// data / singleton classification

/// Types whose values can flow through loops and memory: base types,
/// index types, refs, and products/tables/sums thereof.
pub fn is_data(ty : &Type) -> bool {
    match ty.as_ref() {
        TC(tc) => match tc {
            PrimTC::BaseType(..) | PrimTC::IntRange(..) | PrimTC::IndexRange(..)
            | PrimTC::UnitType | PrimTC::CharType | PrimTC::RefType(..)
            | PrimTC::ArrayType(..) => true,
            PrimTC::PairType(l, r) | PrimTC::SumType(l, r) => is_data(l) && is_data(r),
            PrimTC::RecType(items) | PrimTC::VariantType(items) =>
                items.values().iter().all(|t| is_data(t)),
            PrimTC::TypeCon(def, _) =>
                def.cons.iter().all(|c| c.field_tys.iter().all(|t| is_data(t))),
            PrimTC::TypeKind | PrimTC::EffectKind => false,
        },
        Pi(Arrow::Tab, abs) => is_data(&abs.body.1),
        _ => false,
    }
}

/// A singleton type has exactly one observationally distinct value.
pub fn is_singleton_ty(ty : &Type) -> bool {
    match ty.as_ref() {
        TC(PrimTC::UnitType) => true,
        TC(PrimTC::PairType(l, r)) => is_singleton_ty(l) && is_singleton_ty(r),
        TC(PrimTC::RecType(items)) => items.values().iter().all(|t| is_singleton_ty(t)),
        Pi(Arrow::Tab, abs) => is_singleton_ty(&abs.body.1),
        _ => false,
    }
}

/// The canonical value of a singleton type.
pub fn singleton_value(ty : &Type) -> TabResult<Atom> {
    match ty.as_ref() {
        TC(PrimTC::UnitType) => Ok(mk_unit()),
        TC(PrimTC::PairType(l, r)) => Ok(mk_pair(singleton_value(l)?, singleton_value(r)?)),
        TC(PrimTC::RecType(items)) =>
            Ok(mk_con(PrimCon::RecCon(items.try_map(|t| singleton_value(t))?))),
        Pi(Arrow::Tab, abs) =>
            Ok(mk_con(PrimCon::AFor(abs.binder.ty.clone(), singleton_value(&abs.body.1)?))),
        owise => compiler_err!("no singleton value at type {:?}", owise),
    }
}

/// Fabricate an arbitrary value of a type, structurally. Sums pick the
/// left side; tables are constant.
pub fn any_value(ty : &Type) -> TabResult<Atom> {
    Ok(match ty.as_ref() {
        TC(PrimTC::BaseType(BaseTy::IntType)) => mk_int(0),
        TC(PrimTC::BaseType(BaseTy::RealType)) => mk_real(0.0),
        TC(PrimTC::BaseType(BaseTy::BoolType)) => mk_bool(false),
        TC(PrimTC::UnitType) => mk_unit(),
        TC(PrimTC::CharType) => mk_con(PrimCon::CharCon(mk_int(0))),
        TC(PrimTC::IntRange(l, h)) =>
            mk_con(PrimCon::IntRangeVal(l.clone(), h.clone(), mk_int(0))),
        TC(PrimTC::IndexRange(t, l, h)) =>
            mk_con(PrimCon::IndexRangeVal(t.clone(), l.clone(), h.clone(), mk_int(0))),
        TC(PrimTC::PairType(l, r)) => mk_pair(any_value(l)?, any_value(r)?),
        TC(PrimTC::RecType(items)) =>
            mk_con(PrimCon::RecCon(items.try_map(|t| any_value(t))?)),
        TC(PrimTC::SumType(l, r)) =>
            mk_con(PrimCon::SumAsProd(ty.clone(),
                                      mk_bool(true),
                                      vec![vec![any_value(l)?], vec![any_value(r)?]])),
        Pi(Arrow::Tab, abs) =>
            mk_con(PrimCon::AFor(abs.binder.ty.clone(), any_value(&abs.body.1)?)),
        owise => compiler_err!("cannot fabricate a value at type {:?}", owise),
    })
}

#[cfg(test)]
mod expr_tests {
    use super::*;
    use crate::name::{ mk_gen_name, mk_src_name };

    fn var(hint : &str, ty : Type) -> (Binder, Atom) {
        let b = Var::mk(mk_src_name(hint), ty);
        let a = mk_var(b.clone());
        (b, a)
    }

    #[test]
    fn free_vars_subtract_binders() {
        // λx:Real. x + y  — free vars are exactly {y}
        let (xb, x) = var("x", real_ty());
        let (_, y) = var("y", real_ty());
        let body = Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, x, y)),
        ).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), xb, body);
        let fvs = free_vars_atom(&lam);
        assert!(fvs.contains_key(&mk_src_name("y")));
        assert!(!fvs.contains_key(&mk_src_name("x")));
        assert_eq!(fvs.len(), 1);
    }

    #[test]
    fn subst_is_capture_avoiding() {
        // substituting x := y under λy. (x, y) must rename the binder
        let (yb, y_atom) = var("y", real_ty());
        let (_, x_atom) = var("x", real_ty());
        let body = Block::new(
            Vec::new(),
            Expr::Atom(mk_pair(x_atom, mk_var(yb.clone()))),
        ).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), yb.clone(), body);

        let mut env = SubstEnv::new();
        env.insert(mk_src_name("x"), y_atom);
        let mut scope = Scope::new();
        scope.insert(mk_src_name("y"), scope_entry(real_ty()));

        let substd = subst_atom(&env, &scope, &lam).unwrap();
        match substd.as_ref() {
            InnerAtom::Lam(_, abs) => {
                // binder renamed away from the free `y` we substituted in
                assert_ne!(abs.binder.name, mk_src_name("y"));
                let fvs = free_vars_block(&abs.body);
                assert!(fvs.contains_key(&mk_src_name("y")));
            },
            owise => panic!("expected a lambda, got {:?}", owise),
        }
    }

    #[test]
    fn capture_avoidance_preserves_free_var_bound() {
        // freeVars(subst(ρ[b↦x], t)) ⊆ freeVars(t) \ {b} ∪ freeVars(x)
        let (_, b_atom) = var("b", int_ty());
        let (_, z_atom) = var("z", int_ty());
        let t = mk_pair(b_atom, z_atom.clone());
        let mut env = SubstEnv::new();
        env.insert(mk_src_name("b"), z_atom);
        let out = subst_atom(&env, &Scope::new(), &t).unwrap();
        let fvs = free_vars_atom(&out);
        assert!(fvs.contains_key(&mk_src_name("z")));
        assert!(!fvs.contains_key(&mk_src_name("b")));
    }

    #[test]
    fn pi_alpha_equivalence() {
        // (x:Int) -> Int  ==  (y:Int) -> Int
        let pi1 = mk_pi(Arrow::Plain(pure_row()),
                        Var::mk(mk_src_name("x"), int_ty()),
                        pure_row(),
                        int_ty());
        let pi2 = mk_pi(Arrow::Plain(pure_row()),
                        Var::mk(mk_src_name("y"), int_ty()),
                        pure_row(),
                        int_ty());
        assert!(alpha_eq_ty(&pi1, &pi2));
        assert_ne!(pi1, pi2); // structural equality still sees the names

        // dependent case: (x:Int) -> range(0, x) vs renamed copy
        let dep = |n : &str| {
            let b = Var::mk(mk_src_name(n), int_ty());
            let r = int_range(mk_int(0), mk_var(b.clone()));
            mk_pi(Arrow::Tab, b, pure_row(), r)
        };
        assert!(alpha_eq_ty(&dep("i"), &dep("j")));
    }

    #[test]
    fn singletons_and_data() {
        let tab_unit = {
            let b = Var::mk(mk_gen_name("i"), int_range(mk_int(0), mk_int(3)));
            mk_tab_ty(b, unit_ty())
        };
        assert!(is_singleton_ty(&unit_ty()));
        assert!(is_singleton_ty(&pair_ty(unit_ty(), unit_ty())));
        assert!(is_singleton_ty(&tab_unit));
        assert!(!is_singleton_ty(&real_ty()));

        assert!(is_data(&real_ty()));
        assert!(is_data(&pair_ty(int_ty(), real_ty())));
        assert!(!is_data(&mk_tc(PrimTC::TypeKind)));
    }

    #[test]
    fn effect_row_union_is_lub() {
        let region = mk_src_name("h");
        let r1 = one_eff(region.clone(), EffectName::Writer, real_ty());
        let r2 = one_eff(region.clone(), EffectName::Writer, real_ty());
        let u = r1.union(&r2).unwrap();
        assert_eq!(u.row.len(), 1);

        let r3 = one_eff(mk_src_name("h2"), EffectName::Reader, int_ty());
        let u2 = u.union(&r3).unwrap();
        assert_eq!(u2.row.len(), 2);

        let clash = one_eff(region, EffectName::Reader, real_ty());
        assert!(u.union(&clash).is_err());
    }
}
