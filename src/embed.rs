use hashbrown::HashMap;

use crate::name::{ Name, mk_gen_name };
use crate::expr::*;
use crate::errors::TabResult;
use crate::compiler_err;

/// The embedding builder: the one mutable handle a pass carries while
/// it constructs a block. Tracks the fresh-name scope, the declarations
/// accumulated so far (in construction order), and the effect row the
/// block under construction is allowed to perform. Each pass makes its
/// own builder; nothing is shared across passes.
pub struct Builder {
    scope : Scope,
    decls : Vec<Decl>,
    allowed_effects : EffectRow,
}

impl Builder {
    pub fn new(scope : Scope, allowed_effects : EffectRow) -> Self {
        Builder { scope, decls : Vec::new(), allowed_effects }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn allowed_effects(&self) -> &EffectRow {
        &self.allowed_effects
    }

    /// Binders of the declarations emitted so far, in emission order.
    pub fn decl_binders(&self) -> Vec<Binder> {
        let mut out = Vec::new();
        for d in &self.decls {
            for b in d.binders() {
                out.push(b.clone());
            }
        }
        out
    }

    /// A name unique with respect to the current scope. The scope is the
    /// only freshness authority; there is no global counter.
    pub fn freshen(&self, hint : &str) -> Name {
        mk_gen_name(hint).fresh_in(|n| self.scope.contains_key(n))
    }

    fn bind(&mut self, binder : &Binder, expr : Option<Expr>) {
        self.scope.insert(binder.name.clone(),
                          ScopeEntry { ty : binder.ty.clone(), expr });
    }

    /// Emit a let-bound declaration and return the variable standing for
    /// it. Pure expressions of singleton type never hit the block: the
    /// canonical value is returned instead.
    pub fn emit(&mut self, expr : Expr) -> TabResult<Atom> {
        self.emit_hinted("v", expr)
    }

    pub fn emit_hinted(&mut self, hint : &str, expr : Expr) -> TabResult<Atom> {
        if let Expr::Atom(a) = &expr {
            return Ok(a.clone())
        }
        let ty = expr.get_type()?;
        if is_singleton_ty(&ty) && expr.effect_row()?.is_pure() {
            return singleton_value(&ty)
        }
        let binder = Var::mk(self.freshen(hint), ty);
        self.bind(&binder, Some(expr.clone()));
        self.decls.push(Decl::Let(LetAnn::Plain, binder.clone(), expr));
        Ok(mk_var(binder))
    }

    pub fn emit_op(&mut self, op : PrimOp) -> TabResult<Atom> {
        self.emit(Expr::Op(op))
    }

    /// Destructure a record (or single-constructor data) value into one
    /// variable per component via an `Unpack` declaration.
    pub fn emit_unpack(&mut self, expr : Expr) -> TabResult<Vec<Atom>> {
        let ty = expr.get_type()?;
        let field_tys : Vec<Type> = match ty.as_ref() {
            InnerAtom::TC(PrimTC::RecType(items)) =>
                items.values().into_iter().cloned().collect(),
            InnerAtom::TC(PrimTC::TypeCon(def, _)) if def.cons.len() == 1 =>
                def.cons[0].field_tys.clone(),
            owise => compiler_err!("cannot unpack a value of type {:?}", owise),
        };
        let mut binders = Vec::with_capacity(field_tys.len());
        for fty in field_tys {
            let b = Var::mk(self.freshen("u"), fty);
            self.bind(&b, None);
            binders.push(b);
        }
        self.decls.push(Decl::Unpack(binders.clone(), expr));
        Ok(binders.into_iter().map(mk_var).collect())
    }

    /// Run `f` against a child builder whose decl list starts empty and
    /// whose allowed effects are `effs`. The child sees (a copy of) the
    /// parent scope for freshness; its binders die with it.
    fn scoped_under<T>(&self,
                       effs : EffectRow,
                       f : impl FnOnce(&mut Builder) -> TabResult<T>)
                       -> TabResult<(T, Vec<Decl>)> {
        let mut sub = Builder::new(self.scope.clone(), effs);
        let t = f(&mut sub)?;
        Ok((t, sub.decls))
    }

    /// `buildScoped`: run a computation in a sub-scope and wrap whatever
    /// it emitted into a block.
    pub fn build_scoped(&self,
                        f : impl FnOnce(&mut Builder) -> TabResult<Atom>)
                        -> TabResult<Block> {
        let (result, decls) = self.scoped_under(self.allowed_effects.clone(), f)?;
        make_block(decls, Expr::Atom(result))
    }

    /// `buildLam`: fresh binder, sub-scope under the arrow's effect row,
    /// body run against the binder's variable, decls wrapped into the
    /// lambda's block.
    pub fn build_lam(&mut self,
                     hint : &str,
                     ty : Type,
                     arrow : Arrow,
                     f : impl FnOnce(&mut Builder, Atom) -> TabResult<Atom>)
                     -> TabResult<Atom> {
        let binder = Var::mk(self.freshen(hint), ty);
        let (result, decls) = {
            let mut sub = Builder::new(self.scope.clone(), arrow.eff());
            sub.bind(&binder, None);
            let r = f(&mut sub, mk_var(binder.clone()))?;
            (r, sub.decls)
        };
        let block = make_block(decls, Expr::Atom(result))?;
        Ok(mk_lam(arrow, binder, block))
    }

    /// `buildDepEffLam`: as `build_lam`, but the arrow may depend on the
    /// binder itself.
    pub fn build_dep_eff_lam(&mut self,
                             hint : &str,
                             ty : Type,
                             arr_fn : impl FnOnce(&Atom) -> TabResult<Arrow>,
                             f : impl FnOnce(&mut Builder, Atom) -> TabResult<Atom>)
                             -> TabResult<Atom> {
        let binder = Var::mk(self.freshen(hint), ty);
        let arrow = arr_fn(&mk_var(binder.clone()))?;
        let (result, decls) = {
            let mut sub = Builder::new(self.scope.clone(), arrow.eff());
            sub.bind(&binder, None);
            let r = f(&mut sub, mk_var(binder.clone()))?;
            (r, sub.decls)
        };
        let block = make_block(decls, Expr::Atom(result))?;
        Ok(mk_lam(arrow, binder, block))
    }

    /// `buildFor`: a `for` loop over an index set, emitted as a hof. The
    /// loop body runs under the builder's current effect row.
    pub fn build_for(&mut self,
                     dir : Direction,
                     hint : &str,
                     ix_ty : Type,
                     f : impl FnOnce(&mut Builder, Atom) -> TabResult<Atom>)
                     -> TabResult<Atom> {
        let eff = self.allowed_effects.clone();
        let lam = self.build_lam(hint, ix_ty, Arrow::Plain(eff), f)?;
        self.emit(Expr::Hof(PrimHof::For(dir, lam)))
    }

    /// `buildAbs`: run `f` in a sub-scope that must not emit anything;
    /// used where the body is known to reduce to an atom.
    pub fn build_abs(&mut self,
                     hint : &str,
                     ty : Type,
                     f : impl FnOnce(&mut Builder, Atom) -> TabResult<Atom>)
                     -> TabResult<Abs<Atom>> {
        let binder = Var::mk(self.freshen(hint), ty);
        let (result, decls) = {
            let mut sub = Builder::new(self.scope.clone(), pure_row());
            sub.bind(&binder, None);
            let r = f(&mut sub, mk_var(binder.clone()))?;
            (r, sub.decls)
        };
        if !decls.is_empty() {
            compiler_err!("buildAbs body emitted {} declaration(s); its body must reduce",
                          decls.len())
        }
        Ok(Abs::mk(binder, result))
    }

    /// Build a case alternative: fresh pattern binders over the given
    /// types, body run in a sub-scope against their variables.
    pub fn build_alt(&self,
                     binder_tys : &[Type],
                     f : impl FnOnce(&mut Builder, Vec<Atom>) -> TabResult<Atom>)
                     -> TabResult<(Vec<Binder>, Block)> {
        let mut sub = Builder::new(self.scope.clone(), self.allowed_effects.clone());
        let mut binders = Vec::with_capacity(binder_tys.len());
        let mut vars = Vec::with_capacity(binder_tys.len());
        for ty in binder_tys {
            let b = Var::mk(sub.freshen("p"), ty.clone());
            sub.bind(&b, None);
            vars.push(mk_var(b.clone()));
            binders.push(b);
        }
        let result = f(&mut sub, vars)?;
        let block = make_block(sub.decls, Expr::Atom(result))?;
        Ok((binders, block))
    }

    /// `reduceScoped`: run `f` in a sub-scope; if the result reduces to
    /// a single atom once the sub-scope's let-bindings are substituted
    /// through, return it. Otherwise `None`.
    pub fn reduce_scoped(&self,
                         f : impl FnOnce(&mut Builder) -> TabResult<Atom>)
                         -> TabResult<Option<Atom>> {
        let (result, decls) = self.scoped_under(self.allowed_effects.clone(), f)?;
        let mut env = SubstEnv::new();
        for d in decls {
            match d {
                Decl::Let(_, b, Expr::Atom(a)) => {
                    let a = subst_atom(&env, &self.scope, &a)?;
                    env.insert(b.name, a);
                },
                _ => return Ok(None),
            }
        }
        Ok(Some(subst_atom(&env, &self.scope, &result)?))
    }

    // ------------------------------------------------------------------
    // convenience emitters used by the passes

    pub fn app(&mut self, f : &Atom, x : &Atom) -> TabResult<Atom> {
        let arrow = match f.get_type()?.as_ref() {
            InnerAtom::Pi(arr, _) => arr.clone(),
            owise => compiler_err!("applying a non-function of type {:?}", owise),
        };
        self.emit(Expr::App(arrow, f.clone(), x.clone()))
    }

    /// Index into a table value.
    pub fn tab_get(&mut self, tab : &Atom, i : &Atom) -> TabResult<Atom> {
        match tab.as_ref() {
            InnerAtom::Con(PrimCon::AFor(_, body)) => Ok(body.clone()),
            _ => self.emit(Expr::App(Arrow::Tab, tab.clone(), i.clone())),
        }
    }

    pub fn binop(&mut self, op : BinOp, x : &Atom, y : &Atom) -> TabResult<Atom> {
        self.emit_op(PrimOp::ScalarBinOp(op, x.clone(), y.clone()))
    }

    pub fn fadd(&mut self, x : &Atom, y : &Atom) -> TabResult<Atom> {
        self.binop(BinOp::FAdd, x, y)
    }

    pub fn fsub(&mut self, x : &Atom, y : &Atom) -> TabResult<Atom> {
        self.binop(BinOp::FSub, x, y)
    }

    pub fn fmul(&mut self, x : &Atom, y : &Atom) -> TabResult<Atom> {
        self.binop(BinOp::FMul, x, y)
    }

    pub fn fdiv(&mut self, x : &Atom, y : &Atom) -> TabResult<Atom> {
        self.binop(BinOp::FDiv, x, y)
    }

    pub fn fneg(&mut self, x : &Atom) -> TabResult<Atom> {
        self.emit_op(PrimOp::ScalarUnOp(UnOp::FNeg, x.clone()))
    }

    /// First projection; statically projects literal pairs.
    pub fn fst(&mut self, p : &Atom) -> TabResult<Atom> {
        match p.as_ref() {
            InnerAtom::Con(PrimCon::PairCon(l, _)) => Ok(l.clone()),
            _ => self.emit_op(PrimOp::Fst(p.clone())),
        }
    }

    pub fn snd(&mut self, p : &Atom) -> TabResult<Atom> {
        match p.as_ref() {
            InnerAtom::Con(PrimCon::PairCon(_, r)) => Ok(r.clone()),
            _ => self.emit_op(PrimOp::Snd(p.clone())),
        }
    }
}

/// Wrap decls and a result into a block. If the result is exactly the
/// variable bound by the trailing let, elide it and promote the let's
/// expression to the result position.
pub fn make_block(mut decls : Vec<Decl>, result : Expr) -> TabResult<Block> {
    let result = match (&result, decls.last()) {
        (Expr::Atom(a), Some(Decl::Let(_, b, _))) => match a.as_var() {
            Some(v) if v.name == b.name => match decls.pop() {
                Some(Decl::Let(_, _, e)) => e,
                _ => unreachable!(),
            },
            _ => result,
        },
        _ => result,
    };
    Block::new(decls, result)
}

/// A substitution environment restricted to one binding.
pub fn single_subst(b : &Binder, x : Atom) -> SubstEnv {
    let mut env = HashMap::new();
    env.insert(b.name.clone(), x);
    env
}

#[cfg(test)]
mod embed_tests {
    use super::*;

    #[test]
    fn singleton_emission_is_elided() {
        let mut b = Builder::new(Scope::new(), pure_row());
        // a pure op of unit type never lands in the decl list
        let unit_rec = Expr::Atom(mk_unit());
        let out = b.emit(unit_rec).unwrap();
        assert_eq!(out, mk_unit());
        assert!(b.decls.is_empty());
    }

    #[test]
    fn emitted_decls_bind_fresh_names() {
        let mut b = Builder::new(Scope::new(), pure_row());
        let x = b.fadd(&mk_real(1.0), &mk_real(2.0)).unwrap();
        let y = b.fadd(&x, &mk_real(3.0)).unwrap();
        assert_eq!(b.decls.len(), 2);
        let xv = x.as_var().unwrap();
        let yv = y.as_var().unwrap();
        assert_ne!(xv.name, yv.name);
        assert!(b.scope.contains_key(&xv.name));
    }

    #[test]
    fn build_scoped_elides_trailing_let() {
        let b = Builder::new(Scope::new(), pure_row());
        let block = b.build_scoped(|sub| {
            sub.fadd(&mk_real(1.0), &mk_real(2.0))
        }).unwrap();
        // the single let collapsed into the result position
        assert!(block.decls.is_empty());
        match &block.result {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, _, _)) => (),
            owise => panic!("expected the add in result position, got {:?}", owise),
        }
    }

    #[test]
    fn build_for_emits_a_hof() {
        let mut b = Builder::new(Scope::new(), pure_row());
        let n = int_range(mk_int(0), mk_int(4));
        let tab = b.build_for(Direction::Fwd, "i", n, |sub, i| {
            let as_int = sub.emit_op(PrimOp::IndexAsInt(i))?;
            sub.binop(BinOp::IMul, &as_int, &as_int)
        }).unwrap();
        assert!(tab.as_var().is_some());
        match &b.decls[..] {
            [Decl::Let(_, _, Expr::Hof(PrimHof::For(Direction::Fwd, _)))] => (),
            owise => panic!("expected a single For decl, got {:?}", owise),
        }
    }

    #[test]
    fn build_dep_eff_lam_arrow_depends_on_the_binder() {
        // a region lambda whose own effect row names the region it
        // binds: the arrow is computed from the binder, and the body
        // runs under that row, not the outer one
        let mut b = Builder::new(Scope::new(), pure_row());
        let mut seen_row = None;
        let lam = b.build_dep_eff_lam(
            "h",
            mk_tc(PrimTC::TypeKind),
            |region| {
                let v = region.as_var().unwrap();
                Ok(Arrow::Plain(one_eff(v.name.clone(), EffectName::Writer, real_ty())))
            },
            |sub, _region| {
                seen_row = Some(sub.allowed_effects().clone());
                Ok(mk_unit())
            },
        ).unwrap();
        match lam.as_ref() {
            InnerAtom::Lam(Arrow::Plain(row), abs) => {
                assert!(row.row.contains_key(&abs.binder.name),
                        "arrow row should be keyed by the lambda's own binder");
                assert_eq!(row.row.get(&abs.binder.name),
                           Some(&(EffectName::Writer, real_ty())));
                assert_eq!(seen_row.as_ref(), Some(row));
            },
            owise => panic!("expected an effect-annotated lambda, got {:?}", owise),
        }
    }

    #[test]
    fn build_abs_rejects_emission() {
        let mut b = Builder::new(Scope::new(), pure_row());
        let bad = b.build_abs("x", real_ty(), |sub, x| {
            sub.fadd(&x, &x) // emits a decl; buildAbs must refuse
        });
        assert!(bad.is_err());
        let good = b.build_abs("x", real_ty(), |_, x| Ok(mk_pair(x.clone(), x)));
        assert!(good.is_ok());
    }

    #[test]
    fn reduce_scoped_sees_through_atom_lets() {
        let b = Builder::new(Scope::new(), pure_row());
        let reduced = b.reduce_scoped(|sub| {
            // an atom-only chain reduces
            let p = sub.emit(Expr::Atom(mk_pair(mk_real(1.0), mk_real(2.0))))?;
            sub.fst(&p)
        }).unwrap();
        assert_eq!(reduced, Some(mk_real(1.0)));

        let unreduced = b.reduce_scoped(|sub| {
            sub.fadd(&mk_real(1.0), &mk_real(2.0))
        }).unwrap();
        assert!(unreduced.is_none());
    }
}
