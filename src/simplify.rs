use hashbrown::HashMap;

use crate::name::Name;
use crate::expr::*;
use crate::embed::{ Builder, single_subst };
use crate::autodiff;
use crate::errors::{ TabResult, Err };
use crate::compiler_err;

/// The simplifier walks a block under a local substitution environment,
/// beta-reduces every application of a literal lambda, inlines
/// top-level atoms, and splits non-data lambda results into a data
/// component plus a reconstruction closure. It runs twice per module:
/// first preserving the functions the rules env knows derivatives for
/// (so the autodiff transforms can still see them by name), then again
/// with `preserve_rules` off to eliminate them.
pub struct SimplifyCtx<'t> {
    pub top : &'t HashMap<Name, Atom>,
    pub rules : &'t HashMap<Name, Atom>,
    pub preserve_rules : bool,
}

/// A reconstruction closure: the abstraction returned by
/// `separate_data_component`. Given replacement values for `binders`,
/// substituting them into `atom` rebuilds the original (non-data)
/// result.
#[derive(Debug, Clone)]
pub struct Recon {
    pub binders : Vec<Binder>,
    pub atom : Atom,
}

impl<'t> SimplifyCtx<'t> {
    /// Simplify a whole block in a fresh builder over `scope`.
    pub fn run(&self, scope : Scope, block : &Block) -> TabResult<Block> {
        let b = Builder::new(scope, block.effs.clone());
        b.build_scoped(|sub| self.simplify_block(sub, &SubstEnv::new(), block))
    }

    fn simplify_block(&self,
                      b : &mut Builder,
                      env : &SubstEnv,
                      block : &Block) -> TabResult<Atom> {
        let mut env = env.clone();
        for d in &block.decls {
            match d {
                Decl::Let(_, binder, expr) => {
                    let x = self.simplify_expr(b, &env, expr)?;
                    env.insert(binder.name.clone(), x);
                },
                Decl::Unpack(binders, expr) => {
                    let x = self.simplify_expr(b, &env, expr)?;
                    let parts = self.unpack_atom(b, &x, binders.len())?;
                    for (binder, part) in binders.iter().zip(parts) {
                        env.insert(binder.name.clone(), part);
                    }
                },
            }
        }
        self.simplify_expr(b, &env, &block.result)
    }

    fn unpack_atom(&self, b : &mut Builder, x : &Atom, n : usize) -> TabResult<Vec<Atom>> {
        match x.as_ref() {
            InnerAtom::Con(PrimCon::RecCon(items)) if items.len() == n =>
                Ok(items.values().into_iter().cloned().collect()),
            InnerAtom::Con(PrimCon::DataCon(_, _, _, args)) if args.len() == n =>
                Ok(args.clone()),
            _ => b.emit_unpack(Expr::Atom(x.clone())),
        }
    }

    // ------------------------------------------------------------------
    // atoms

    fn simplify_atom(&self, b : &mut Builder, env : &SubstEnv, atom : &Atom) -> TabResult<Atom> {
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || self.simplify_atom_inner(b, env, atom))
    }

    fn simplify_atom_inner(&self,
                           b : &mut Builder,
                           env : &SubstEnv,
                           atom : &Atom) -> TabResult<Atom> {
        match atom.as_ref() {
            InnerAtom::AVar(v) => {
                if let Some(x) = env.get(&v.name) {
                    return deshadow_atom(&x.clone(), b.scope())
                }
                if v.name.is_top() {
                    if self.preserve_rules && self.rules.contains_key(&v.name) {
                        return subst_atom(env, b.scope(), atom)
                    }
                    if let Some(top_atom) = self.top.get(&v.name) {
                        // top-level atoms are inlined fully, with a clean env
                        let top_atom = top_atom.clone();
                        return self.simplify_atom(b, &SubstEnv::new(), &top_atom)
                    }
                    return Err(Err::unbound(&v.name))
                }
                subst_atom(env, b.scope(), atom)
            },
            // lambdas are substitute-embedded without entering the body;
            // they get reduced at the next App (or via simplify_lam in
            // contexts that need data flow across them)
            InnerAtom::Lam(..) | InnerAtom::Pi(..) | InnerAtom::Eff(..) =>
                subst_atom(env, b.scope(), atom),
            InnerAtom::Con(PrimCon::AnyValue(ty)) => {
                let ty = self.simplify_atom(b, env, ty)?;
                any_value(&ty)
            },
            InnerAtom::Con(con) => Ok(mk_con(self.simplify_con(b, env, con)?)),
            InnerAtom::TC(tc) => Ok(mk_tc(self.simplify_tc(b, env, tc)?)),
        }
    }

    fn simplify_limit(&self, b : &mut Builder, env : &SubstEnv, l : &Limit) -> TabResult<Limit> {
        Ok(match l {
            Limit::InclusiveLim(a) => Limit::InclusiveLim(self.simplify_atom(b, env, a)?),
            Limit::ExclusiveLim(a) => Limit::ExclusiveLim(self.simplify_atom(b, env, a)?),
            Limit::Unlimited => Limit::Unlimited,
        })
    }

    fn simplify_con(&self, b : &mut Builder, env : &SubstEnv, con : &PrimCon) -> TabResult<PrimCon> {
        Ok(match con {
            PrimCon::Lit(l) => PrimCon::Lit(l.clone()),
            PrimCon::UnitCon => PrimCon::UnitCon,
            PrimCon::PairCon(l, r) =>
                PrimCon::PairCon(self.simplify_atom(b, env, l)?, self.simplify_atom(b, env, r)?),
            PrimCon::RecCon(items) =>
                PrimCon::RecCon(items.try_map(|x| self.simplify_atom(b, env, x))?),
            PrimCon::DataCon(def, params, ix, args) => {
                let params = params.iter()
                    .map(|p| self.simplify_atom(b, env, p))
                    .collect::<TabResult<Vec<_>>>()?;
                let args = args.iter()
                    .map(|x| self.simplify_atom(b, env, x))
                    .collect::<TabResult<Vec<_>>>()?;
                PrimCon::DataCon(def.clone(), params, *ix, args)
            },
            PrimCon::AnyValue(..) => unreachable!("handled by simplify_atom"),
            PrimCon::IntRangeVal(l, h, i) =>
                PrimCon::IntRangeVal(self.simplify_atom(b, env, l)?,
                                     self.simplify_atom(b, env, h)?,
                                     self.simplify_atom(b, env, i)?),
            PrimCon::IndexRangeVal(t, l, h, i) =>
                PrimCon::IndexRangeVal(self.simplify_atom(b, env, t)?,
                                       self.simplify_limit(b, env, l)?,
                                       self.simplify_limit(b, env, h)?,
                                       self.simplify_atom(b, env, i)?),
            PrimCon::SumAsProd(t, tag, payloads) => {
                let payloads = payloads.iter()
                    .map(|alt| alt.iter()
                         .map(|x| self.simplify_atom(b, env, x))
                         .collect::<TabResult<Vec<_>>>())
                    .collect::<TabResult<Vec<_>>>()?;
                PrimCon::SumAsProd(self.simplify_atom(b, env, t)?,
                                   self.simplify_atom(b, env, tag)?,
                                   payloads)
            },
            PrimCon::AFor(n, body) =>
                PrimCon::AFor(self.simplify_atom(b, env, n)?,
                              self.simplify_atom(b, env, body)?),
            PrimCon::CharCon(x) => PrimCon::CharCon(self.simplify_atom(b, env, x)?),
            PrimCon::ArrayLit(t, xs) =>
                PrimCon::ArrayLit(self.simplify_atom(b, env, t)?, xs.clone()),
            PrimCon::VariantCon(tys, label, ix, x) =>
                PrimCon::VariantCon(tys.try_map(|t| self.simplify_atom(b, env, t))?,
                                    label.clone(), *ix,
                                    self.simplify_atom(b, env, x)?),
        })
    }

    fn simplify_tc(&self, b : &mut Builder, env : &SubstEnv, tc : &PrimTC) -> TabResult<PrimTC> {
        Ok(match tc {
            PrimTC::BaseType(..) | PrimTC::TypeKind | PrimTC::EffectKind
            | PrimTC::UnitType | PrimTC::CharType | PrimTC::ArrayType(..) => tc.clone(),
            PrimTC::IntRange(l, h) =>
                PrimTC::IntRange(self.simplify_atom(b, env, l)?, self.simplify_atom(b, env, h)?),
            PrimTC::IndexRange(t, l, h) =>
                PrimTC::IndexRange(self.simplify_atom(b, env, t)?,
                                   self.simplify_limit(b, env, l)?,
                                   self.simplify_limit(b, env, h)?),
            PrimTC::RecType(items) =>
                PrimTC::RecType(items.try_map(|t| self.simplify_atom(b, env, t))?),
            PrimTC::VariantType(items) =>
                PrimTC::VariantType(items.try_map(|t| self.simplify_atom(b, env, t))?),
            PrimTC::SumType(l, r) =>
                PrimTC::SumType(self.simplify_atom(b, env, l)?, self.simplify_atom(b, env, r)?),
            PrimTC::PairType(l, r) =>
                PrimTC::PairType(self.simplify_atom(b, env, l)?, self.simplify_atom(b, env, r)?),
            PrimTC::RefType(region, t) =>
                PrimTC::RefType(self.simplify_atom(b, env, region)?,
                                self.simplify_atom(b, env, t)?),
            PrimTC::TypeCon(def, params) => {
                let params = params.iter()
                    .map(|p| self.simplify_atom(b, env, p))
                    .collect::<TabResult<Vec<_>>>()?;
                PrimTC::TypeCon(def.clone(), params)
            },
        })
    }

    // ------------------------------------------------------------------
    // expressions

    fn simplify_expr(&self, b : &mut Builder, env : &SubstEnv, expr : &Expr) -> TabResult<Atom> {
        match expr {
            Expr::Atom(a) => self.simplify_atom(b, env, a),
            Expr::App(arrow, f, x) => {
                let f = self.simplify_atom(b, env, f)?;
                let x = self.simplify_atom(b, env, x)?;
                match f.as_ref() {
                    InnerAtom::Lam(_, abs) => {
                        // beta: drop the local env, bind just the argument
                        let beta_env = single_subst(&abs.binder, x);
                        let body = abs.body.clone();
                        self.simplify_block(b, &beta_env, &body)
                    },
                    InnerAtom::Con(PrimCon::AFor(_, body)) => Ok(body.clone()),
                    _ => {
                        let arrow = subst_arrow(env, b.scope(), arrow)?;
                        b.emit(Expr::App(arrow, f, x))
                    },
                }
            },
            Expr::Op(op) => self.simplify_op(b, env, op),
            Expr::Hof(hof) => self.simplify_hof(b, env, hof),
            Expr::Case(scrut, alts, ty) => self.simplify_case(b, env, scrut, alts, ty),
        }
    }

    fn simplify_op(&self, b : &mut Builder, env : &SubstEnv, op : &PrimOp) -> TabResult<Atom> {
        match op {
            PrimOp::Cmp(CmpOp::Equal, t, x, y) => {
                let t = self.simplify_atom(b, env, t)?;
                let x = self.simplify_atom(b, env, x)?;
                let y = self.simplify_atom(b, env, y)?;
                self.structural_eq(b, &t, &x, &y)
            },
            PrimOp::Cmp(cmp, t, x, y) => {
                let t = self.simplify_atom(b, env, t)?;
                let x = self.simplify_atom(b, env, x)?;
                let y = self.simplify_atom(b, env, y)?;
                self.compare_at(b, *cmp, &t, &x, &y)
            },
            PrimOp::RecGet(x, label) => {
                let x = self.simplify_atom(b, env, x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::RecCon(items)) => rec_get(items, label),
                    _ => b.emit_op(PrimOp::RecGet(x, label.clone())),
                }
            },
            PrimOp::SumGet(x, left) => {
                let x = self.simplify_atom(b, env, x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::SumAsProd(_, _, payloads)) => {
                        let side = if *left { 0 } else { 1 };
                        match payloads.get(side).and_then(|p| p.first()) {
                            Some(payload) => Ok(payload.clone()),
                            None => compiler_err!("malformed sum payload"),
                        }
                    },
                    _ => b.emit_op(PrimOp::SumGet(x, *left)),
                }
            },
            PrimOp::SumTag(x) => {
                let x = self.simplify_atom(b, env, x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::SumAsProd(_, tag, _)) => Ok(tag.clone()),
                    _ => b.emit_op(PrimOp::SumTag(x)),
                }
            },
            PrimOp::Fst(x) => {
                let x = self.simplify_atom(b, env, x)?;
                b.fst(&x)
            },
            PrimOp::Snd(x) => {
                let x = self.simplify_atom(b, env, x)?;
                b.snd(&x)
            },
            PrimOp::Select(p, x, y) => {
                let p = self.simplify_atom(b, env, p)?;
                let x = self.simplify_atom(b, env, x)?;
                let y = self.simplify_atom(b, env, y)?;
                let ty = x.get_type()?;
                self.select_at(b, &ty, &p, &x, &y)
            },
            PrimOp::IndexAsInt(x) => {
                let x = self.simplify_atom(b, env, x)?;
                match x.as_ref() {
                    InnerAtom::Con(PrimCon::IntRangeVal(_, _, i))
                    | InnerAtom::Con(PrimCon::IndexRangeVal(_, _, _, i)) => Ok(i.clone()),
                    _ => b.emit_op(PrimOp::IndexAsInt(x)),
                }
            },
            owise => {
                let op = self.simplify_op_payload(b, env, owise)?;
                b.emit_op(op)
            },
        }
    }

    /// Structural map over the remaining op shapes.
    fn simplify_op_payload(&self, b : &mut Builder, env : &SubstEnv, op : &PrimOp) -> TabResult<PrimOp> {
        Ok(match op {
            PrimOp::ScalarBinOp(o, x, y) =>
                PrimOp::ScalarBinOp(*o,
                                    self.simplify_atom(b, env, x)?,
                                    self.simplify_atom(b, env, y)?),
            PrimOp::ScalarUnOp(o, x) =>
                PrimOp::ScalarUnOp(*o, self.simplify_atom(b, env, x)?),
            PrimOp::IntAsIndex(t, x) =>
                PrimOp::IntAsIndex(self.simplify_atom(b, env, t)?,
                                   self.simplify_atom(b, env, x)?),
            PrimOp::IdxSetSize(t) => PrimOp::IdxSetSize(self.simplify_atom(b, env, t)?),
            PrimOp::PrimEffect(r, eop) => {
                let eop = match eop {
                    EffectOp::MAsk => EffectOp::MAsk,
                    EffectOp::MGet => EffectOp::MGet,
                    EffectOp::MTell(x) => EffectOp::MTell(self.simplify_atom(b, env, x)?),
                    EffectOp::MPut(x) => EffectOp::MPut(self.simplify_atom(b, env, x)?),
                };
                PrimOp::PrimEffect(self.simplify_atom(b, env, r)?, eop)
            },
            PrimOp::IndexRef(r, i) =>
                PrimOp::IndexRef(self.simplify_atom(b, env, r)?,
                                 self.simplify_atom(b, env, i)?),
            owise => compiler_err!("op already handled : {:?}", owise),
        })
    }

    /// Structural equality, unfolded per type: records unpack and fold
    /// with `and`; sums compare tags then select a side; index types go
    /// through their integer ordinal.
    fn structural_eq(&self, b : &mut Builder, ty : &Type, x : &Atom, y : &Atom) -> TabResult<Atom> {
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::BaseType(BaseTy::IntType))
            | InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) =>
                b.emit_op(PrimOp::Cmp(CmpOp::Equal, ty.clone(), x.clone(), y.clone())),
            InnerAtom::TC(PrimTC::BaseType(BaseTy::BoolType))
            | InnerAtom::TC(PrimTC::IntRange(..))
            | InnerAtom::TC(PrimTC::IndexRange(..))
            | InnerAtom::TC(PrimTC::CharType) => {
                let xi = b.emit_op(PrimOp::IndexAsInt(x.clone()))?;
                let yi = b.emit_op(PrimOp::IndexAsInt(y.clone()))?;
                b.emit_op(PrimOp::Cmp(CmpOp::Equal, int_ty(), xi, yi))
            },
            InnerAtom::TC(PrimTC::RecType(items)) => {
                let xs = self.unpack_atom(b, x, items.len())?;
                let ys = self.unpack_atom(b, y, items.len())?;
                let mut acc = mk_bool(true);
                for ((fx, fy), fty) in xs.iter().zip(&ys).zip(items.values()) {
                    let field_eq = self.structural_eq(b, fty, fx, fy)?;
                    acc = self.fold_and(b, &acc, &field_eq)?;
                }
                Ok(acc)
            },
            InnerAtom::TC(PrimTC::PairType(lt, rt)) => {
                let xl = b.fst(x)?;
                let yl = b.fst(y)?;
                let xr = b.snd(x)?;
                let yr = b.snd(y)?;
                let l_eq = self.structural_eq(b, lt, &xl, &yl)?;
                let r_eq = self.structural_eq(b, rt, &xr, &yr)?;
                self.fold_and(b, &l_eq, &r_eq)
            },
            InnerAtom::TC(PrimTC::SumType(lt, rt)) => {
                let tag_x = b.emit_op(PrimOp::SumTag(x.clone()))?;
                let tag_y = b.emit_op(PrimOp::SumTag(y.clone()))?;
                let tags_eq = self.structural_eq(b, &bool_ty(), &tag_x, &tag_y)?;
                let xl = b.emit_op(PrimOp::SumGet(x.clone(), true))?;
                let yl = b.emit_op(PrimOp::SumGet(y.clone(), true))?;
                let xr = b.emit_op(PrimOp::SumGet(x.clone(), false))?;
                let yr = b.emit_op(PrimOp::SumGet(y.clone(), false))?;
                let l_eq = self.structural_eq(b, lt, &xl, &yl)?;
                let r_eq = self.structural_eq(b, rt, &xr, &yr)?;
                let side_eq = b.emit_op(PrimOp::Select(tag_x, l_eq, r_eq))?;
                self.fold_and(b, &tags_eq, &side_eq)
            },
            owise => Err(Err::not_implemented(
                format!("structural equality at type {:?}", owise))),
        }
    }

    fn fold_and(&self, b : &mut Builder, x : &Atom, y : &Atom) -> TabResult<Atom> {
        // true is the unit of the fold
        if *x == mk_bool(true) {
            return Ok(y.clone())
        }
        if *y == mk_bool(true) {
            return Ok(x.clone())
        }
        b.binop(BinOp::BAnd, x, y)
    }

    /// Non-equality comparisons: base types compare directly; index
    /// types compare their integer ordinals.
    fn compare_at(&self, b : &mut Builder, cmp : CmpOp, ty : &Type, x : &Atom, y : &Atom) -> TabResult<Atom> {
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::BaseType(..)) =>
                b.emit_op(PrimOp::Cmp(cmp, ty.clone(), x.clone(), y.clone())),
            InnerAtom::TC(PrimTC::IntRange(..))
            | InnerAtom::TC(PrimTC::IndexRange(..))
            | InnerAtom::TC(PrimTC::CharType) => {
                let xi = b.emit_op(PrimOp::IndexAsInt(x.clone()))?;
                let yi = b.emit_op(PrimOp::IndexAsInt(y.clone()))?;
                b.emit_op(PrimOp::Cmp(cmp, int_ty(), xi, yi))
            },
            owise => Err(Err::not_implemented(format!("comparison at type {:?}", owise))),
        }
    }

    /// `Select` distributes structurally down to base-type selects.
    fn select_at(&self, b : &mut Builder, ty : &Type, p : &Atom, x : &Atom, y : &Atom) -> TabResult<Atom> {
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::UnitType) => Ok(mk_unit()),
            InnerAtom::TC(PrimTC::PairType(lt, rt)) => {
                let xl = b.fst(x)?;
                let yl = b.fst(y)?;
                let xr = b.snd(x)?;
                let yr = b.snd(y)?;
                let l = self.select_at(b, lt, p, &xl, &yl)?;
                let r = self.select_at(b, rt, p, &xr, &yr)?;
                Ok(mk_pair(l, r))
            },
            InnerAtom::TC(PrimTC::RecType(items)) => {
                let xs = self.unpack_atom(b, x, items.len())?;
                let ys = self.unpack_atom(b, y, items.len())?;
                let mut picked = Vec::with_capacity(items.len());
                for ((fx, fy), fty) in xs.iter().zip(&ys).zip(items.values()) {
                    picked.push(self.select_at(b, fty, p, fx, fy)?);
                }
                Ok(mk_con(PrimCon::RecCon(match items {
                    LabeledItems::Tup(..) => LabeledItems::Tup(picked),
                    LabeledItems::Named(m) => {
                        let mut out = indexmap::IndexMap::new();
                        for (k, v) in m.keys().zip(picked) {
                            out.insert(k.clone(), v);
                        }
                        LabeledItems::Named(out)
                    },
                })))
            },
            InnerAtom::Pi(Arrow::Tab, abs) => {
                let ix_ty = abs.binder.ty.clone();
                let elem_ty = abs.body.1.clone();
                let p = p.clone();
                let x = x.clone();
                let y = y.clone();
                b.build_for(Direction::Fwd, "i", ix_ty, |sub, i| {
                    let xi = sub.tab_get(&x, &i)?;
                    let yi = sub.tab_get(&y, &i)?;
                    self.select_at(sub, &elem_ty, &p, &xi, &yi)
                })
            },
            _ => b.emit_op(PrimOp::Select(p.clone(), x.clone(), y.clone())),
        }
    }

    // ------------------------------------------------------------------
    // lambdas and hofs

    /// `simplifyLam`: substitute the binder's annotation, then either
    /// simplify the body in place (data result) or split the result into
    /// a data tuple plus a reconstruction closure.
    fn simplify_lam(&self,
                    b : &mut Builder,
                    env : &SubstEnv,
                    lam : &Atom) -> TabResult<(Atom, Option<Recon>)> {
        let (arrow, abs) = match lam.as_ref() {
            InnerAtom::Lam(arrow, abs) => (arrow.clone(), abs.clone()),
            owise => compiler_err!("simplifyLam on a non-lambda : {:?}", owise),
        };
        let arrow = subst_arrow(env, b.scope(), &arrow)?;
        let binder_ty = self.simplify_atom(b, env, &abs.binder.ty)?;
        let body_ty = subst_atom(env, b.scope(), &abs.body.get_type()?)?;

        if is_data(&body_ty) {
            let body = abs.body.clone();
            let env = env.clone();
            let hint = abs.binder.name.hint().to_string();
            let lam = b.build_lam(&hint, binder_ty, arrow, |sub, x| {
                let mut env = env.clone();
                env.insert(abs.binder.name.clone(), x);
                self.simplify_block(sub, &env, &body)
            })?;
            Ok((lam, None))
        } else {
            let body = abs.body.clone();
            let env = env.clone();
            let hint = abs.binder.name.hint().to_string();
            let mut recon_slot : Option<Recon> = None;
            let lam = b.build_lam(&hint, binder_ty, arrow, |sub, x| {
                let mut env = env.clone();
                env.insert(abs.binder.name.clone(), x);
                let result = self.simplify_block(sub, &env, &body)?;
                let (data_result, recon) = separate_data_component(sub, &result);
                recon_slot = Some(recon);
                Ok(data_result)
            })?;
            Ok((lam, recon_slot))
        }
    }

    fn apply_recon(&self, b : &mut Builder, recon : &Recon, packed : &Atom) -> TabResult<Atom> {
        let parts = self.unpack_atom(b, packed, recon.binders.len())?;
        let mut env = SubstEnv::new();
        for (binder, part) in recon.binders.iter().zip(parts) {
            env.insert(binder.name.clone(), part);
        }
        subst_atom(&env, b.scope(), &recon.atom)
    }

    /// Rebuild an effect function, pushing substitutions through the
    /// region binder and then the reference binder, and simplify the
    /// effect-annotated body inside.
    fn simplify_eff_fun(&self, b : &mut Builder, env : &SubstEnv, f : &Atom) -> TabResult<Atom> {
        let (region_b, ref_b, eff, body) = open_binary_fun(f)?;
        let env = env.clone();
        let region_hint = region_b.name.hint().to_string();
        let ref_hint = ref_b.name.hint().to_string();
        b.build_lam(&region_hint, mk_tc(PrimTC::TypeKind), Arrow::Implicit, |sub, region| {
            let mut env = env.clone();
            env.insert(region_b.name.clone(), region);
            let ref_ty = subst_atom(&env, sub.scope(), &ref_b.ty)?;
            let eff = subst_row(&env, sub.scope(), &eff)?;
            sub.build_lam(&ref_hint, ref_ty, Arrow::Plain(eff), |sub2, r| {
                let mut env = env.clone();
                env.insert(ref_b.name.clone(), r);
                self.simplify_block(sub2, &env, &body)
            })
        })
    }

    fn simplify_hof(&self, b : &mut Builder, env : &SubstEnv, hof : &PrimHof) -> TabResult<Atom> {
        match hof {
            PrimHof::For(d, lam) => {
                let (lam, recon) = self.simplify_lam(b, env, lam)?;
                let ans = b.emit(Expr::Hof(PrimHof::For(*d, lam)))?;
                match recon {
                    None => Ok(ans),
                    Some(recon) => {
                        let ix_ty = match ans.get_type()?.as_ref() {
                            InnerAtom::Pi(Arrow::Tab, abs) => abs.binder.ty.clone(),
                            owise => compiler_err!("For produced a non-table : {:?}", owise),
                        };
                        b.build_lam("i", ix_ty, Arrow::Tab, |sub, i| {
                            let packed = sub.tab_get(&ans, &i)?;
                            self.apply_recon(sub, &recon, &packed)
                        })
                    },
                }
            },
            PrimHof::While(cond, body) => {
                let (cond, _) = self.simplify_lam(b, env, cond)?;
                let (body, _) = self.simplify_lam(b, env, body)?;
                b.emit(Expr::Hof(PrimHof::While(cond, body)))
            },
            PrimHof::RunReader(r, f) => {
                let r = self.simplify_atom(b, env, r)?;
                let f = self.simplify_eff_fun(b, env, f)?;
                b.emit(Expr::Hof(PrimHof::RunReader(r, f)))
            },
            PrimHof::RunWriter(f) => {
                let f = self.simplify_eff_fun(b, env, f)?;
                b.emit(Expr::Hof(PrimHof::RunWriter(f)))
            },
            PrimHof::RunState(s, f) => {
                let s = self.simplify_atom(b, env, s)?;
                let f = self.simplify_eff_fun(b, env, f)?;
                b.emit(Expr::Hof(PrimHof::RunState(s, f)))
            },
            PrimHof::Linearize(lam) => {
                let (lam, recon) = self.simplify_lam(b, env, lam)?;
                if recon.is_some() {
                    return Err(Err::not_implemented(
                        "linearization of a function with a non-data result"))
                }
                autodiff::linearize(b, self.rules, &lam)
            },
            PrimHof::Transpose(lam) => {
                let (lam, recon) = self.simplify_lam(b, env, lam)?;
                if recon.is_some() {
                    return Err(Err::not_implemented(
                        "transposition of a function with a non-data result"))
                }
                autodiff::transpose_map(b, &lam)
            },
        }
    }

    fn simplify_case(&self,
                     b : &mut Builder,
                     env : &SubstEnv,
                     scrut : &Atom,
                     alts : &[Alt],
                     ty : &Type) -> TabResult<Atom> {
        let scrut = self.simplify_atom(b, env, scrut)?;
        match scrut.as_ref() {
            InnerAtom::Con(PrimCon::DataCon(_, _, con_ix, args)) => {
                let alt = match alts.get(*con_ix) {
                    Some(alt) => alt,
                    None => compiler_err!("case has no alternative {}", con_ix),
                };
                let mut env = env.clone();
                for (binder, arg) in alt.binders.iter().zip(args) {
                    env.insert(binder.name.clone(), arg.clone());
                }
                let body = alt.body.clone();
                self.simplify_block(b, &env, &body)
            },
            InnerAtom::Con(PrimCon::VariantCon(tys, label, sub_ix, payload)) => {
                let flat_ix = variant_alt_index(tys, label, *sub_ix)?;
                let alt = match alts.get(flat_ix) {
                    Some(alt) => alt,
                    None => compiler_err!("case has no alternative {}", flat_ix),
                };
                let mut env = env.clone();
                match &alt.binders[..] {
                    [binder] => { env.insert(binder.name.clone(), payload.clone()); },
                    owise => compiler_err!("variant alternative binds {} vars", owise.len()),
                }
                let body = alt.body.clone();
                self.simplify_block(b, &env, &body)
            },
            _ => {
                let mut new_alts = Vec::with_capacity(alts.len());
                for alt in alts {
                    let binder_tys = alt.binders.iter()
                        .map(|v| subst_atom(env, b.scope(), &v.ty))
                        .collect::<TabResult<Vec<_>>>()?;
                    let body = alt.body.clone();
                    let old_binders = alt.binders.clone();
                    let (binders, block) = b.build_alt(&binder_tys, |sub, vars| {
                        let mut env = env.clone();
                        for (ob, v) in old_binders.iter().zip(vars) {
                            env.insert(ob.name.clone(), v);
                        }
                        self.simplify_block(sub, &env, &body)
                    })?;
                    new_alts.push(Alt { binders, body : block });
                }
                let ty = self.simplify_atom(b, env, ty)?;
                b.emit(Expr::Case(scrut, new_alts, ty))
            },
        }
    }
}

/// Position of `(label, sub_ix)` in the flattened alternative list of a
/// variant type.
pub fn variant_alt_index(tys : &LabeledItems<Type>, label : &str, sub_ix : usize) -> TabResult<usize> {
    match tys {
        LabeledItems::Named(m) => {
            let mut flat = 0;
            for (k, _) in m {
                if k == label {
                    return Ok(flat + sub_ix)
                }
                flat += 1;
            }
            compiler_err!("variant label {:?} not found", label)
        },
        LabeledItems::Tup(..) => compiler_err!("variant types use named labels"),
    }
}

fn rec_get(items : &LabeledItems<Atom>, label : &Label) -> TabResult<Atom> {
    match (items, label) {
        (LabeledItems::Tup(xs), Label::At(i)) => match xs.get(*i) {
            Some(x) => Ok(x.clone()),
            None => compiler_err!("tuple index {} out of range", i),
        },
        (LabeledItems::Named(m), Label::Field(f)) => match m.get(f) {
            Some(x) => Ok(x.clone()),
            None => compiler_err!("missing record field {:?}", f),
        },
        _ => compiler_err!("record selector shape mismatch"),
    }
}

/// Walk the sub-scope's declarations that the result mentions, expose
/// them as a positional record, and return the closure that puts them
/// back. The closure's binders are exactly the exposed declarations.
pub fn separate_data_component(sub : &Builder, result : &Atom) -> (Atom, Recon) {
    let fvs = free_vars_atom(result);
    let exposed : Vec<Binder> = sub.decl_binders()
        .into_iter()
        .filter(|b| fvs.contains_key(&b.name))
        .collect();
    let tuple = mk_con(PrimCon::RecCon(LabeledItems::Tup(
        exposed.iter().cloned().map(mk_var).collect())));
    let recon = Recon { binders : exposed, atom : result.clone() };
    (tuple, recon)
}

#[cfg(test)]
mod simplify_tests {
    use super::*;
    use crate::name::{ mk_src_name, mk_top_name };

    fn empty_ctx<'a>(top : &'a HashMap<Name, Atom>,
                     rules : &'a HashMap<Name, Atom>) -> SimplifyCtx<'a> {
        SimplifyCtx { top, rules, preserve_rules : false }
    }

    fn contains_lam_app(block : &Block) -> bool {
        fn expr_has(e : &Expr) -> bool {
            match e {
                Expr::App(_, f, _) => matches!(f.as_ref(), InnerAtom::Lam(..)),
                _ => false,
            }
        }
        block.decls.iter().any(|d| expr_has(d.expr())) || expr_has(&block.result)
    }

    #[test]
    fn beta_reduces_literal_lambda_applications() {
        // let f = λx. x + 1 in f 2  — no App of a literal Lam survives
        let x = Var::mk(mk_src_name("x"), int_ty());
        let body = Block::new(Vec::new(), Expr::Op(PrimOp::ScalarBinOp(
            BinOp::IAdd, mk_var(x.clone()), mk_int(1)))).unwrap();
        let f_atom = mk_lam(Arrow::Plain(pure_row()), x, body);
        let f = Var::mk(mk_src_name("f"), f_atom.get_type().unwrap());

        let block = Block::new(
            vec![Decl::Let(LetAnn::Plain, f.clone(), Expr::Atom(f_atom))],
            Expr::App(Arrow::Plain(pure_row()), mk_var(f), mk_int(2)),
        ).unwrap();

        let top = HashMap::new();
        let rules = HashMap::new();
        let out = empty_ctx(&top, &rules).run(Scope::new(), &block).unwrap();
        assert!(!contains_lam_app(&out));
        // the residual computation is the inlined add
        match &out.result {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, a, _)) => assert_eq!(a, &mk_int(2)),
            owise => panic!("expected the inlined add, got {:?}", owise),
        }
    }

    #[test]
    fn top_level_atoms_are_inlined() {
        let mut top = HashMap::new();
        top.insert(mk_top_name("c"), mk_real(3.0));
        let rules = HashMap::new();

        let c = Var::mk(mk_top_name("c"), real_ty());
        let block = Block::new(Vec::new(), Expr::Op(PrimOp::ScalarBinOp(
            BinOp::FMul, mk_var(c), mk_real(2.0)))).unwrap();

        let out = empty_ctx(&top, &rules).run(Scope::new(), &block).unwrap();
        match &out.result {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, a, _)) => assert_eq!(a, &mk_real(3.0)),
            owise => panic!("expected inlined constant, got {:?}", owise),
        }
    }

    #[test]
    fn preserve_rules_keeps_the_reference() {
        let f_lam = {
            let x = Var::mk(mk_src_name("x"), real_ty());
            let body = Block::new(Vec::new(), Expr::Op(PrimOp::ScalarBinOp(
                BinOp::FMul, mk_var(x.clone()), mk_real(2.0)))).unwrap();
            mk_lam(Arrow::Plain(pure_row()), x, body)
        };
        let f_name = mk_top_name("f");
        let mut top = HashMap::new();
        top.insert(f_name.clone(), f_lam.clone());
        let mut rules = HashMap::new();
        rules.insert(f_name.clone(), mk_unit()); // payload irrelevant here

        let f = Var::mk(f_name.clone(), f_lam.get_type().unwrap());
        let block = Block::new(Vec::new(), Expr::App(
            Arrow::Plain(pure_row()), mk_var(f), mk_real(4.0))).unwrap();

        // preserving: the App of the named function survives
        let ctx = SimplifyCtx { top : &top, rules : &rules, preserve_rules : true };
        let out = ctx.run(Scope::new(), &block).unwrap();
        let saw_app = match &out.result {
            Expr::App(_, f_atom, _) => f_atom.as_var().map(|v| v.name.clone()) == Some(f_name),
            _ => false,
        };
        assert!(saw_app, "preserved rule function should remain applied by name");

        // not preserving: fully inlined and reduced
        let ctx2 = SimplifyCtx { top : &top, rules : &rules, preserve_rules : false };
        let out2 = ctx2.run(Scope::new(), &block).unwrap();
        assert!(!contains_lam_app(&out2));
        match &out2.result {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, a, _)) => assert_eq!(a, &mk_real(4.0)),
            owise => panic!("expected reduced body, got {:?}", owise),
        }
    }

    #[test]
    fn data_simplification_is_idempotent() {
        // a pure data computation: simplify twice, compare
        let x = Var::mk(mk_src_name("x"), real_ty());
        let body = Block::new(Vec::new(), Expr::Op(PrimOp::ScalarBinOp(
            BinOp::FAdd, mk_var(x.clone()), mk_var(x.clone())))).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), x, body);
        let block = Block::new(Vec::new(), Expr::App(
            Arrow::Plain(pure_row()), lam, mk_real(1.5))).unwrap();

        let top = HashMap::new();
        let rules = HashMap::new();
        let once = empty_ctx(&top, &rules).run(Scope::new(), &block).unwrap();
        let twice = empty_ctx(&top, &rules).run(Scope::new(), &once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn static_case_on_data_constructor() {
        let def = std::sync::Arc::new(DataDef {
            name : mk_src_name("Either"),
            param_binders : Vec::new(),
            cons : vec![
                DataConDef { name : mk_src_name("L"), field_tys : vec![int_ty()] },
                DataConDef { name : mk_src_name("R"), field_tys : vec![real_ty()] },
            ],
        });
        let scrut = mk_con(PrimCon::DataCon(def.clone(), Vec::new(), 0, vec![mk_int(7)]));
        let lb = Var::mk(mk_src_name("l"), int_ty());
        let rb = Var::mk(mk_src_name("r"), real_ty());
        let alts = vec![
            Alt { binders : vec![lb.clone()],
                  body : Block::from_atom(mk_var(lb)) },
            Alt { binders : vec![rb.clone()],
                  body : Block::from_atom(mk_int(0)) },
        ];
        let block = Block::new(Vec::new(), Expr::Case(scrut, alts, int_ty())).unwrap();
        let top = HashMap::new();
        let rules = HashMap::new();
        let out = empty_ctx(&top, &rules).run(Scope::new(), &block).unwrap();
        assert_eq!(out.result, Expr::Atom(mk_int(7)));
    }
}
