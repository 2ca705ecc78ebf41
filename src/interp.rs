use hashbrown::HashMap;

use crate::name::Name;
use crate::expr::*;
use crate::algebra::{ self, ScalarEmitter };
use crate::errors::{ TabResult, Err, ErrKind };
use crate::compiler_err;

/// A reference interpreter for the core IR. It exists for two callers:
/// the `Interp` backend of the driver (evaluate instead of lowering to
/// native code) and the tests, which check the simplifier and the
/// autodiff transforms by value rather than by syntax. It is
/// deliberately slow: environments are cloned per closure, tables are
/// materialized vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    VLit(LitVal),
    VUnit,
    VPair(Box<Value>, Box<Value>),
    VRec(Vec<Value>),
    VTab(Vec<Value>),
    /// an index value: zero-based ordinal plus its index-set type
    VIndex(i64, Type),
    VClosure(Atom, ValEnv),
    VRef(RefPath),
}

/// A reference into the interpreter's effect cells; the path descends
/// into table cells produced by `IndexRef`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefPath {
    pub cell : usize,
    pub path : Vec<i64>,
}

pub type ValEnv = HashMap<Name, Value>;

impl Value {
    pub fn as_real(&self) -> TabResult<f64> {
        match self {
            Value::VLit(LitVal::RealLit(R64(r))) => Ok(*r),
            owise => compiler_err!("expected a real, got {:?}", owise),
        }
    }

    pub fn as_int(&self) -> TabResult<i64> {
        match self {
            Value::VLit(LitVal::IntLit(i)) => Ok(*i),
            Value::VIndex(i, _) => Ok(*i),
            owise => compiler_err!("expected an integer, got {:?}", owise),
        }
    }

    pub fn as_bool(&self) -> TabResult<bool> {
        match self {
            Value::VLit(LitVal::BoolLit(b)) => Ok(*b),
            owise => compiler_err!("expected a bool, got {:?}", owise),
        }
    }
}

#[derive(Default)]
pub struct Interp {
    cells : Vec<Value>,
}

/// Plain integer arithmetic over atoms resolvable in a value
/// environment; lets the interpreter share the size/offset algebra.
struct EnvSizes<'a, 'e> {
    interp : &'a mut Interp,
    env : &'e ValEnv,
}

impl<'a, 'e> ScalarEmitter for EnvSizes<'a, 'e> {
    type Val = i64;

    fn lit_int(&mut self, i : i64) -> i64 { i }
    fn iadd(&mut self, x : i64, y : i64) -> TabResult<i64> { Ok(x + y) }
    fn isub(&mut self, x : i64, y : i64) -> TabResult<i64> { Ok(x - y) }
    fn imul(&mut self, x : i64, y : i64) -> TabResult<i64> { Ok(x * y) }
    fn clamp0(&mut self, x : i64) -> TabResult<i64> { Ok(x.max(0)) }
    fn scalar(&mut self, a : &Atom) -> TabResult<i64> {
        self.interp.eval_atom(self.env, a)?.as_int()
    }
}

impl Interp {
    pub fn new() -> Self {
        Interp { cells : Vec::new() }
    }

    pub fn index_set_len(&mut self, env : &ValEnv, ty : &Type) -> TabResult<i64> {
        let mut sizes = EnvSizes { interp : self, env };
        algebra::index_set_size(&mut sizes, ty)
    }

    pub fn eval_block(&mut self, env : &ValEnv, block : &Block) -> TabResult<Value> {
        let mut env = env.clone();
        for d in &block.decls {
            match d {
                Decl::Let(_, binder, expr) => {
                    let v = self.eval_expr(&env, expr)?;
                    env.insert(binder.name.clone(), v);
                },
                Decl::Unpack(binders, expr) => {
                    let v = self.eval_expr(&env, expr)?;
                    let parts = match v {
                        Value::VRec(parts) => parts,
                        owise => compiler_err!("unpacking a non-record value {:?}", owise),
                    };
                    if parts.len() != binders.len() {
                        compiler_err!("unpack arity mismatch")
                    }
                    for (binder, part) in binders.iter().zip(parts) {
                        env.insert(binder.name.clone(), part);
                    }
                },
            }
        }
        self.eval_expr(&env, &block.result)
    }

    fn eval_atom(&mut self, env : &ValEnv, a : &Atom) -> TabResult<Value> {
        match a.as_ref() {
            InnerAtom::AVar(v) => match env.get(&v.name) {
                Some(val) => Ok(val.clone()),
                None => Err(Err::unbound(&v.name)),
            },
            InnerAtom::Lam(..) => Ok(Value::VClosure(a.clone(), env.clone())),
            InnerAtom::Con(con) => self.eval_con(env, con),
            owise => compiler_err!("cannot evaluate atom {:?}", owise),
        }
    }

    fn eval_con(&mut self, env : &ValEnv, con : &PrimCon) -> TabResult<Value> {
        Ok(match con {
            PrimCon::Lit(l) => Value::VLit(l.clone()),
            PrimCon::UnitCon => Value::VUnit,
            PrimCon::PairCon(l, r) => Value::VPair(
                Box::new(self.eval_atom(env, l)?),
                Box::new(self.eval_atom(env, r)?)),
            PrimCon::RecCon(items) => {
                let mut out = Vec::with_capacity(items.len());
                for x in items.values() {
                    out.push(self.eval_atom(env, x)?);
                }
                Value::VRec(out)
            },
            PrimCon::IntRangeVal(l, h, i) => {
                let l_ty = int_range(l.clone(), h.clone());
                Value::VIndex(self.eval_atom(env, i)?.as_int()?, l_ty)
            },
            PrimCon::IndexRangeVal(t, l, h, i) => {
                let ty = mk_tc(PrimTC::IndexRange(t.clone(), l.clone(), h.clone()));
                Value::VIndex(self.eval_atom(env, i)?.as_int()?, ty)
            },
            PrimCon::AFor(n, body) => {
                let len = self.index_set_len(env, n)?;
                let v = self.eval_atom(env, body)?;
                Value::VTab(vec![v; len.max(0) as usize])
            },
            owise => compiler_err!("cannot evaluate constructor {:?}", owise),
        })
    }

    fn apply(&mut self, f : Value, x : Value) -> TabResult<Value> {
        match f {
            Value::VClosure(lam, cenv) => match lam.as_ref() {
                InnerAtom::Lam(_, abs) => {
                    let mut env = cenv;
                    env.insert(abs.binder.name.clone(), x);
                    self.eval_block(&env, &abs.body)
                },
                owise => compiler_err!("closure holds a non-lambda {:?}", owise),
            },
            Value::VTab(items) => {
                let i = x.as_int()?;
                match items.get(i as usize) {
                    Some(v) => Ok(v.clone()),
                    None => compiler_err!("table index {} out of bounds ({})", i, items.len()),
                }
            },
            owise => compiler_err!("applying a non-function {:?}", owise),
        }
    }

    fn eval_expr(&mut self, env : &ValEnv, e : &Expr) -> TabResult<Value> {
        match e {
            Expr::Atom(a) => self.eval_atom(env, a),
            Expr::App(_, f, x) => {
                let f = self.eval_atom(env, f)?;
                let x = self.eval_atom(env, x)?;
                self.apply(f, x)
            },
            Expr::Op(op) => self.eval_op(env, op),
            Expr::Hof(hof) => self.eval_hof(env, hof),
            Expr::Case(..) => Err(Err::not_implemented("interpreting case expressions")),
        }
    }

    fn eval_op(&mut self, env : &ValEnv, op : &PrimOp) -> TabResult<Value> {
        use BinOp::*;
        match op {
            PrimOp::ScalarBinOp(o, x, y) => {
                let x = self.eval_atom(env, x)?;
                let y = self.eval_atom(env, y)?;
                Ok(match o {
                    FAdd => Value::VLit(LitVal::RealLit(R64(x.as_real()? + y.as_real()?))),
                    FSub => Value::VLit(LitVal::RealLit(R64(x.as_real()? - y.as_real()?))),
                    FMul => Value::VLit(LitVal::RealLit(R64(x.as_real()? * y.as_real()?))),
                    FDiv => Value::VLit(LitVal::RealLit(R64(x.as_real()? / y.as_real()?))),
                    IAdd => Value::VLit(LitVal::IntLit(x.as_int()? + y.as_int()?)),
                    ISub => Value::VLit(LitVal::IntLit(x.as_int()? - y.as_int()?)),
                    IMul => Value::VLit(LitVal::IntLit(x.as_int()? * y.as_int()?)),
                    IDiv => {
                        let d = y.as_int()?;
                        if d == 0 {
                            return Err(Err::new(ErrKind::Misc, "integer division by zero"))
                        }
                        Value::VLit(LitVal::IntLit(x.as_int()? / d))
                    },
                    IRem => {
                        let d = y.as_int()?;
                        if d == 0 {
                            return Err(Err::new(ErrKind::Misc, "integer remainder by zero"))
                        }
                        Value::VLit(LitVal::IntLit(x.as_int()? % d))
                    },
                    BAnd => Value::VLit(LitVal::BoolLit(x.as_bool()? && y.as_bool()?)),
                    BOr => Value::VLit(LitVal::BoolLit(x.as_bool()? || y.as_bool()?)),
                })
            },
            PrimOp::ScalarUnOp(o, x) => {
                let x = self.eval_atom(env, x)?;
                Ok(match o {
                    UnOp::FNeg => Value::VLit(LitVal::RealLit(R64(-x.as_real()?))),
                    UnOp::INeg => Value::VLit(LitVal::IntLit(-x.as_int()?)),
                    UnOp::BNot => Value::VLit(LitVal::BoolLit(!x.as_bool()?)),
                })
            },
            PrimOp::Cmp(cmp, ty, x, y) => {
                let x = self.eval_atom(env, x)?;
                let y = self.eval_atom(env, y)?;
                let b = match ty.as_ref() {
                    InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) =>
                        cmp_values(*cmp, x.as_real()?, y.as_real()?),
                    _ => cmp_values(*cmp, x.as_int()?, y.as_int()?),
                };
                Ok(Value::VLit(LitVal::BoolLit(b)))
            },
            PrimOp::Select(p, x, y) => {
                let p = self.eval_atom(env, p)?.as_bool()?;
                if p {
                    self.eval_atom(env, x)
                } else {
                    self.eval_atom(env, y)
                }
            },
            PrimOp::Fst(x) => match self.eval_atom(env, x)? {
                Value::VPair(l, _) => Ok(*l),
                owise => compiler_err!("Fst of {:?}", owise),
            },
            PrimOp::Snd(x) => match self.eval_atom(env, x)? {
                Value::VPair(_, r) => Ok(*r),
                owise => compiler_err!("Snd of {:?}", owise),
            },
            PrimOp::RecGet(x, label) => match self.eval_atom(env, x)? {
                Value::VRec(parts) => {
                    let ix = match (x.get_type()?.as_ref(), label) {
                        (_, Label::At(i)) => *i,
                        (InnerAtom::TC(PrimTC::RecType(LabeledItems::Named(m))), Label::Field(f)) =>
                            match m.get_index_of(f) {
                                Some(i) => i,
                                None => compiler_err!("missing field {:?}", f),
                            },
                        owise => compiler_err!("RecGet shape mismatch : {:?}", owise),
                    };
                    match parts.get(ix) {
                        Some(v) => Ok(v.clone()),
                        None => compiler_err!("record index {} out of range", ix),
                    }
                },
                owise => compiler_err!("RecGet of {:?}", owise),
            },
            PrimOp::IndexAsInt(x) => {
                let i = self.eval_atom(env, x)?.as_int()?;
                Ok(Value::VLit(LitVal::IntLit(i)))
            },
            PrimOp::IntAsIndex(ty, x) => {
                let i = self.eval_atom(env, x)?.as_int()?;
                let n = self.index_set_len(env, ty)?;
                if i < 0 || i >= n {
                    return Err(Err::new(ErrKind::Misc, format!(
                        "index {} out of range for a set of size {}", i, n)))
                }
                Ok(Value::VIndex(i, ty.clone()))
            },
            PrimOp::IdxSetSize(ty) => {
                let n = self.index_set_len(env, ty)?;
                Ok(Value::VLit(LitVal::IntLit(n)))
            },
            PrimOp::PrimEffect(r, eop) => {
                let r = match self.eval_atom(env, r)? {
                    Value::VRef(r) => r,
                    owise => compiler_err!("effect on a non-reference {:?}", owise),
                };
                match eop {
                    EffectOp::MAsk | EffectOp::MGet => self.read_ref(&r),
                    EffectOp::MTell(x) => {
                        let v = self.eval_atom(env, x)?;
                        let cur = self.read_ref(&r)?;
                        let new = add_values(&cur, &v)?;
                        self.write_ref(&r, new)?;
                        Ok(Value::VUnit)
                    },
                    EffectOp::MPut(x) => {
                        let v = self.eval_atom(env, x)?;
                        self.write_ref(&r, v)?;
                        Ok(Value::VUnit)
                    },
                }
            },
            PrimOp::IndexRef(r, i) => {
                let mut r = match self.eval_atom(env, r)? {
                    Value::VRef(r) => r,
                    owise => compiler_err!("IndexRef of a non-reference {:?}", owise),
                };
                r.path.push(self.eval_atom(env, i)?.as_int()?);
                Ok(Value::VRef(r))
            },
            owise => Err(Err::not_implemented(format!("interpreting op {:?}", owise))),
        }
    }

    fn eval_hof(&mut self, env : &ValEnv, hof : &PrimHof) -> TabResult<Value> {
        match hof {
            PrimHof::For(_, lam) => {
                let (ix_ty, _) = match lam.get_type()?.as_ref() {
                    InnerAtom::Pi(_, abs) => (abs.binder.ty.clone(), ()),
                    owise => compiler_err!("For of a non-lambda : {:?}", owise),
                };
                let f = self.eval_atom(env, lam)?;
                let n = self.index_set_len(env, &ix_ty)?;
                let mut out = Vec::with_capacity(n.max(0) as usize);
                for i in 0..n {
                    let v = self.apply(f.clone(), Value::VIndex(i, ix_ty.clone()))?;
                    out.push(v);
                }
                Ok(Value::VTab(out))
            },
            PrimHof::While(cond, body) => {
                let cond = self.eval_atom(env, cond)?;
                let body = self.eval_atom(env, body)?;
                loop {
                    let go = self.apply(cond.clone(), Value::VUnit)?.as_bool()?;
                    if !go {
                        break
                    }
                    self.apply(body.clone(), Value::VUnit)?;
                }
                Ok(Value::VUnit)
            },
            PrimHof::RunReader(r, f) => {
                let init = self.eval_atom(env, r)?;
                let (ans, _) = self.run_effect(env, f, init)?;
                Ok(ans)
            },
            PrimHof::RunWriter(f) => {
                let (_, ref_b, _, _) = open_binary_fun(f)?;
                let w_ty = match ref_b.ty.as_ref() {
                    InnerAtom::TC(PrimTC::RefType(_, w)) => w.clone(),
                    owise => compiler_err!("writer ref of a non-ref type : {:?}", owise),
                };
                let zero = self.zero_value(env, &w_ty)?;
                let (ans, total) = self.run_effect(env, f, zero)?;
                Ok(Value::VPair(Box::new(ans), Box::new(total)))
            },
            PrimHof::RunState(s, f) => {
                let init = self.eval_atom(env, s)?;
                let (ans, fin) = self.run_effect(env, f, init)?;
                Ok(Value::VPair(Box::new(ans), Box::new(fin)))
            },
            PrimHof::Linearize(..) | PrimHof::Transpose(..) =>
                compiler_err!("autodiff hof survived simplification"),
        }
    }

    /// Run an effect function against a fresh cell initialized to
    /// `init`; returns the body's answer and the cell's final value.
    fn run_effect(&mut self, env : &ValEnv, f : &Atom, init : Value) -> TabResult<(Value, Value)> {
        let (region_b, ref_b, _, body) = open_binary_fun(f)?;
        let cell = self.cells.len();
        self.cells.push(init);
        let mut env = env.clone();
        env.insert(region_b.name.clone(), Value::VUnit);
        env.insert(ref_b.name.clone(), Value::VRef(RefPath { cell, path : Vec::new() }));
        let ans = self.eval_block(&env, &body)?;
        let fin = self.cells[cell].clone();
        Ok((ans, fin))
    }

    fn read_ref(&mut self, r : &RefPath) -> TabResult<Value> {
        let mut cur = self.cells.get(r.cell)
            .cloned()
            .ok_or_else(|| Err::compiler(file!(), line!(), "dangling reference cell"))?;
        for i in &r.path {
            cur = match cur {
                Value::VTab(items) => match items.get(*i as usize) {
                    Some(v) => v.clone(),
                    None => compiler_err!("reference path out of bounds"),
                },
                owise => compiler_err!("reference path into {:?}", owise),
            };
        }
        Ok(cur)
    }

    fn write_ref(&mut self, r : &RefPath, v : Value) -> TabResult<()> {
        let cell = match self.cells.get_mut(r.cell) {
            Some(c) => c,
            None => compiler_err!("dangling reference cell"),
        };
        let mut cur = cell;
        for i in &r.path {
            cur = match cur {
                Value::VTab(items) => match items.get_mut(*i as usize) {
                    Some(slot) => slot,
                    None => compiler_err!("reference path out of bounds"),
                },
                owise => compiler_err!("reference path into {:?}", owise),
            };
        }
        *cur = v;
        Ok(())
    }

    pub fn zero_value(&mut self, env : &ValEnv, ty : &Type) -> TabResult<Value> {
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) =>
                Ok(Value::VLit(LitVal::RealLit(R64(0.0)))),
            InnerAtom::TC(PrimTC::BaseType(BaseTy::IntType)) =>
                Ok(Value::VLit(LitVal::IntLit(0))),
            InnerAtom::TC(PrimTC::UnitType) => Ok(Value::VUnit),
            InnerAtom::TC(PrimTC::PairType(l, r)) => Ok(Value::VPair(
                Box::new(self.zero_value(env, l)?),
                Box::new(self.zero_value(env, r)?))),
            InnerAtom::TC(PrimTC::RecType(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for t in items.values() {
                    out.push(self.zero_value(env, t)?);
                }
                Ok(Value::VRec(out))
            },
            InnerAtom::Pi(Arrow::Tab, abs) => {
                let n = self.index_set_len(env, &abs.binder.ty)?;
                let z = self.zero_value(env, &abs.body.1)?;
                Ok(Value::VTab(vec![z; n.max(0) as usize]))
            },
            owise => compiler_err!("no additive zero at type {:?}", owise),
        }
    }
}

fn cmp_values<T : PartialOrd>(cmp : CmpOp, x : T, y : T) -> bool {
    match cmp {
        CmpOp::Equal => x == y,
        CmpOp::Less => x < y,
        CmpOp::LessEqual => x <= y,
        CmpOp::Greater => x > y,
        CmpOp::GreaterEqual => x >= y,
    }
}

/// Pointwise addition for writer accumulation.
pub fn add_values(x : &Value, y : &Value) -> TabResult<Value> {
    match (x, y) {
        (Value::VLit(LitVal::RealLit(R64(a))), Value::VLit(LitVal::RealLit(R64(b)))) =>
            Ok(Value::VLit(LitVal::RealLit(R64(a + b)))),
        (Value::VLit(LitVal::IntLit(a)), Value::VLit(LitVal::IntLit(b))) =>
            Ok(Value::VLit(LitVal::IntLit(a + b))),
        (Value::VUnit, Value::VUnit) => Ok(Value::VUnit),
        (Value::VPair(a1, a2), Value::VPair(b1, b2)) => Ok(Value::VPair(
            Box::new(add_values(a1, b1)?),
            Box::new(add_values(a2, b2)?))),
        (Value::VRec(xs), Value::VRec(ys)) if xs.len() == ys.len() => {
            let mut out = Vec::with_capacity(xs.len());
            for (a, b) in xs.iter().zip(ys) {
                out.push(add_values(a, b)?);
            }
            Ok(Value::VRec(out))
        },
        (Value::VTab(xs), Value::VTab(ys)) if xs.len() == ys.len() => {
            let mut out = Vec::with_capacity(xs.len());
            for (a, b) in xs.iter().zip(ys) {
                out.push(add_values(a, b)?);
            }
            Ok(Value::VTab(out))
        },
        owise => compiler_err!("cannot add values {:?}", owise),
    }
}

pub fn vreal(r : f64) -> Value {
    Value::VLit(LitVal::RealLit(R64(r)))
}

pub fn vint(i : i64) -> Value {
    Value::VLit(LitVal::IntLit(i))
}

#[cfg(test)]
mod interp_tests {
    use super::*;
    use crate::name::mk_src_name;

    #[test]
    fn evaluates_scalar_blocks() {
        let x = Var::mk(mk_src_name("x"), real_ty());
        let block = Block::new(
            vec![Decl::Let(LetAnn::Plain, x.clone(),
                           Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_real(3.0), mk_real(4.0))))],
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, mk_var(x.clone()), mk_real(1.0))),
        ).unwrap();
        let v = Interp::new().eval_block(&ValEnv::new(), &block).unwrap();
        assert_eq!(v, vreal(13.0));
    }

    #[test]
    fn for_builds_tables() {
        let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(3)));
        let body = Block::new(Vec::new(), Expr::Op(PrimOp::IndexAsInt(mk_var(i.clone())))).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), i, body);
        let block = Block::new(
            Vec::new(), Expr::Hof(PrimHof::For(Direction::Fwd, lam))).unwrap();
        let v = Interp::new().eval_block(&ValEnv::new(), &block).unwrap();
        assert_eq!(v, Value::VTab(vec![vint(0), vint(1), vint(2)]));
    }

    #[test]
    fn run_writer_accumulates() {
        // runWriter λref. { tell ref 1.5; tell ref 2.0; () }  ==  ((), 3.5)
        let region = Var::mk(mk_src_name("h"), mk_tc(PrimTC::TypeKind));
        let r = Var::mk(mk_src_name("ref"),
                        ref_ty(mk_var(region.clone()), real_ty()));
        let row = one_eff(region.name.clone(), EffectName::Writer, real_ty());
        let body = Block::new(
            vec![
                Decl::Let(LetAnn::Plain, Var::mk(mk_src_name("u1"), unit_ty()),
                          Expr::Op(PrimOp::PrimEffect(mk_var(r.clone()),
                                                      EffectOp::MTell(mk_real(1.5))))),
                Decl::Let(LetAnn::Plain, Var::mk(mk_src_name("u2"), unit_ty()),
                          Expr::Op(PrimOp::PrimEffect(mk_var(r.clone()),
                                                      EffectOp::MTell(mk_real(2.0))))),
            ],
            Expr::Atom(mk_unit()),
        ).unwrap();
        let f = mk_binary_fun(region, r, row, body);
        let block = Block::new(Vec::new(), Expr::Hof(PrimHof::RunWriter(f))).unwrap();
        let v = Interp::new().eval_block(&ValEnv::new(), &block).unwrap();
        assert_eq!(v, Value::VPair(Box::new(Value::VUnit), Box::new(vreal(3.5))));
    }
}
