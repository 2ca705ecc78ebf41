use hashbrown::HashMap;

use crate::name::Name;
use crate::expr::*;
use crate::embed::Builder;
use crate::errors::{ TabResult, Err };
use crate::compiler_err;

/// Forward-mode linearization and reverse-mode transposition.
///
/// Linearization turns `λx. block` into `λx. (primal, λt. tangent)`:
/// the primal computation is rebuilt immediately while the tangent
/// computation is captured as a delayed thunk, forced either into the
/// trailing linear lambda (at the top level) or into a materialized
/// tangent closure (inside loops and effect scopes).
///
/// Transposition runs a linear body backwards, routing cotangents into
/// writer references: each linear let gets its own `RunWriter` region
/// whose accumulated value is the cotangent of the bound variable.

/// The tangent environment a delayed tangent computation runs under:
/// tangent values for the active variables and tangent references for
/// the effect references in scope, both keyed by their original names.
#[derive(Clone, Default)]
pub struct TangentEnv {
    pub vals : HashMap<Name, Atom>,
    pub refs : HashMap<Name, Atom>,
}

type TanThunk = Box<dyn FnOnce(&mut Builder, &TangentEnv) -> TabResult<Atom>>;

struct LinOut {
    primal : Atom,
    tangent : TanThunk,
}

/// Linearization context: what we are differentiating with respect to
/// (the ordered active set and the effect references crossed so far),
/// the effect row the linearized code runs under, and the primal
/// substitution from original names into the rebuilt program.
struct LinCtx<'r> {
    rules : &'r HashMap<Name, Atom>,
    subst : SubstEnv,
    active : Vec<(Name, Type)>,
    eff_refs : Vec<(Name, Type)>,
    effs : EffectRow,
}

impl<'r> LinCtx<'r> {
    fn child(&self) -> LinCtx<'r> {
        LinCtx {
            rules : self.rules,
            subst : self.subst.clone(),
            active : self.active.clone(),
            eff_refs : self.eff_refs.clone(),
            effs : self.effs.clone(),
        }
    }

    fn is_active_name(&self, n : &Name) -> bool {
        self.active.iter().any(|(a, _)| a == n)
            || self.eff_refs.iter().any(|(a, _)| a == n)
    }

    fn is_active_expr(&self, e : &Expr) -> bool {
        free_vars_expr(e).keys().any(|n| self.is_active_name(n))
    }

    fn is_active_atom(&self, a : &Atom) -> bool {
        free_vars_atom(a).keys().any(|n| self.is_active_name(n))
    }

    fn primal_atom(&self, b : &Builder, a : &Atom) -> TabResult<Atom> {
        subst_atom(&self.subst, b.scope(), a)
    }

    // ------------------------------------------------------------------
    // blocks

    fn lin_block(&mut self, b : &mut Builder, block : &Block) -> TabResult<LinOut> {
        let mut parts : Vec<(Name, TanThunk)> = Vec::new();
        for d in &block.decls {
            match d {
                Decl::Let(_, binder, expr) => {
                    if self.is_active_expr(expr) {
                        let out = self.lin_expr(b, expr)?;
                        self.subst.insert(binder.name.clone(), out.primal);
                        self.active.push((binder.name.clone(), binder.ty.clone()));
                        parts.push((binder.name.clone(), out.tangent));
                    } else {
                        let e = subst_expr(&self.subst, b.scope(), expr)?;
                        let x = b.emit(e)?;
                        self.subst.insert(binder.name.clone(), x);
                    }
                },
                Decl::Unpack(..) =>
                    return Err(Err::not_implemented("linearization of unpack declarations")),
            }
        }
        let result = self.lin_expr(b, &block.result)?;
        let primal = result.primal;
        let result_tangent = result.tangent;
        let tangent : TanThunk = Box::new(move |b, tenv| {
            let mut tenv = tenv.clone();
            for (name, thunk) in parts {
                let t = thunk(b, &tenv)?;
                tenv.vals.insert(name, t);
            }
            (result_tangent)(b, &tenv)
        });
        Ok(LinOut { primal, tangent })
    }

    // ------------------------------------------------------------------
    // atoms

    fn lin_atom(&self, b : &mut Builder, a : &Atom) -> TabResult<LinOut> {
        let primal = self.primal_atom(b, a)?;
        let tangent = self.atom_tangent(b, a)?;
        Ok(LinOut { primal, tangent })
    }

    /// The delayed tangent of an atom: active variables look their
    /// tangent up, everything else is the zero of its tangent type.
    fn atom_tangent(&self, b : &mut Builder, a : &Atom) -> TabResult<TanThunk> {
        match a.as_ref() {
            InnerAtom::AVar(v) => {
                let name = v.name.clone();
                let tan_ty = tangent_type(&self.primal_atom(b, &v.ty)?)?;
                Ok(Box::new(move |b, tenv| {
                    match tenv.vals.get(&name) {
                        Some(t) => Ok(t.clone()),
                        None => zero_at(b, &tan_ty),
                    }
                }))
            },
            InnerAtom::Con(PrimCon::PairCon(l, r)) => {
                let lt = self.atom_tangent(b, l)?;
                let rt = self.atom_tangent(b, r)?;
                Ok(Box::new(move |b, tenv| {
                    let l = lt(b, tenv)?;
                    let r = rt(b, tenv)?;
                    Ok(mk_pair(l, r))
                }))
            },
            InnerAtom::Con(PrimCon::AFor(n, body)) => {
                let n = self.primal_atom(b, n)?;
                let bt = self.atom_tangent(b, body)?;
                Ok(Box::new(move |b, tenv| {
                    let body = bt(b, tenv)?;
                    Ok(mk_con(PrimCon::AFor(n, body)))
                }))
            },
            InnerAtom::Lam(..) =>
                Err(Err::not_implemented("tangent of a function value")),
            _ => {
                let tan_ty = tangent_type(&self.primal_atom(b, &a.get_type()?)?)?;
                Ok(Box::new(move |b, _| zero_at(b, &tan_ty)))
            },
        }
    }

    // ------------------------------------------------------------------
    // expressions

    fn lin_expr(&mut self, b : &mut Builder, expr : &Expr) -> TabResult<LinOut> {
        match expr {
            Expr::Atom(a) => self.lin_atom(b, a),
            Expr::App(Arrow::Tab, tab, i) => {
                let tab_p = self.primal_atom(b, tab)?;
                let i_p = self.primal_atom(b, i)?;
                let primal = b.tab_get(&tab_p, &i_p)?;
                let tab_t = self.atom_tangent(b, tab)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let t_tab = tab_t(b, tenv)?;
                    b.tab_get(&t_tab, &i_p)
                });
                Ok(LinOut { primal, tangent })
            },
            Expr::App(arrow, f, x) => {
                // custom derivative rules short-circuit named applications
                if let Some(v) = f.as_var() {
                    if let Some(rule) = self.rules.get(&v.name) {
                        let rule = rule.clone();
                        let x_p = self.primal_atom(b, x)?;
                        let pair = b.app(&rule, &x_p)?;
                        let primal = b.fst(&pair)?;
                        let tan_fn = b.snd(&pair)?;
                        let x_t = self.atom_tangent(b, x)?;
                        let tangent : TanThunk = Box::new(move |b, tenv| {
                            let tx = x_t(b, tenv)?;
                            b.app(&tan_fn, &tx)
                        });
                        return Ok(LinOut { primal, tangent })
                    }
                }
                let _ = arrow;
                Err(Err::not_implemented("linearization of a higher-order application"))
            },
            Expr::Op(op) => self.lin_op(b, op),
            Expr::Hof(hof) => self.lin_hof(b, hof),
            Expr::Case(..) =>
                Err(Err::not_implemented("linearization of case expressions")),
        }
    }

    fn lin_op(&mut self, b : &mut Builder, op : &PrimOp) -> TabResult<LinOut> {
        use BinOp::*;
        match op {
            PrimOp::ScalarBinOp(o @ (FAdd | FSub), x, y) => {
                let x_p = self.primal_atom(b, x)?;
                let y_p = self.primal_atom(b, y)?;
                let primal = b.binop(*o, &x_p, &y_p)?;
                let xt = self.atom_tangent(b, x)?;
                let yt = self.atom_tangent(b, y)?;
                let o = *o;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tx = xt(b, tenv)?;
                    let ty = yt(b, tenv)?;
                    b.binop(o, &tx, &ty)
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::ScalarBinOp(FMul, x, y) => {
                let x_p = self.primal_atom(b, x)?;
                let y_p = self.primal_atom(b, y)?;
                let primal = b.fmul(&x_p, &y_p)?;
                let xt = self.atom_tangent(b, x)?;
                let yt = self.atom_tangent(b, y)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    // bilinear: x·ty + tx·y
                    let tx = xt(b, tenv)?;
                    let ty = yt(b, tenv)?;
                    let l = b.fmul(&x_p, &ty)?;
                    let r = b.fmul(&tx, &y_p)?;
                    b.fadd(&l, &r)
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::ScalarBinOp(FDiv, x, y) => {
                let x_p = self.primal_atom(b, x)?;
                let y_p = self.primal_atom(b, y)?;
                let primal = b.fdiv(&x_p, &y_p)?;
                let xt = self.atom_tangent(b, x)?;
                let yt = self.atom_tangent(b, y)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    // tx/y − x·ty/y²
                    let tx = xt(b, tenv)?;
                    let ty = yt(b, tenv)?;
                    let l = b.fdiv(&tx, &y_p)?;
                    let num = b.fmul(&x_p, &ty)?;
                    let y2 = b.fmul(&y_p, &y_p)?;
                    let r = b.fdiv(&num, &y2)?;
                    b.fsub(&l, &r)
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::ScalarUnOp(UnOp::FNeg, x) => {
                let x_p = self.primal_atom(b, x)?;
                let primal = b.fneg(&x_p)?;
                let xt = self.atom_tangent(b, x)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tx = xt(b, tenv)?;
                    b.fneg(&tx)
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::Fst(x) => {
                let x_p = self.primal_atom(b, x)?;
                let primal = b.fst(&x_p)?;
                let xt = self.atom_tangent(b, x)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tx = xt(b, tenv)?;
                    b.fst(&tx)
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::Snd(x) => {
                let x_p = self.primal_atom(b, x)?;
                let primal = b.snd(&x_p)?;
                let xt = self.atom_tangent(b, x)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tx = xt(b, tenv)?;
                    b.snd(&tx)
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::Select(p, x, y) => {
                let p_p = self.primal_atom(b, p)?;
                let x_p = self.primal_atom(b, x)?;
                let y_p = self.primal_atom(b, y)?;
                let primal = b.emit_op(PrimOp::Select(p_p.clone(), x_p, y_p))?;
                let xt = self.atom_tangent(b, x)?;
                let yt = self.atom_tangent(b, y)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tx = xt(b, tenv)?;
                    let ty = yt(b, tenv)?;
                    b.emit_op(PrimOp::Select(p_p, tx, ty))
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::PrimEffect(r, EffectOp::MTell(x)) => {
                let ref_name = match r.as_var() {
                    Some(v) => v.name.clone(),
                    None => compiler_err!("effect on a non-variable reference"),
                };
                let r_p = self.primal_atom(b, r)?;
                let x_p = self.primal_atom(b, x)?;
                let primal = b.emit_op(PrimOp::PrimEffect(r_p, EffectOp::MTell(x_p)))?;
                let xt = self.atom_tangent(b, x)?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tref = match tenv.refs.get(&ref_name) {
                        Some(r) => r.clone(),
                        None => compiler_err!("no tangent reference for {:?}", ref_name),
                    };
                    let tx = xt(b, tenv)?;
                    b.emit_op(PrimOp::PrimEffect(tref, EffectOp::MTell(tx)))
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::PrimEffect(r, EffectOp::MAsk) => {
                let ref_name = match r.as_var() {
                    Some(v) => v.name.clone(),
                    None => compiler_err!("effect on a non-variable reference"),
                };
                let r_p = self.primal_atom(b, r)?;
                let primal = b.emit_op(PrimOp::PrimEffect(r_p, EffectOp::MAsk))?;
                let tangent : TanThunk = Box::new(move |b, tenv| {
                    let tref = match tenv.refs.get(&ref_name) {
                        Some(r) => r.clone(),
                        None => compiler_err!("no tangent reference for {:?}", ref_name),
                    };
                    b.emit_op(PrimOp::PrimEffect(tref, EffectOp::MAsk))
                });
                Ok(LinOut { primal, tangent })
            },
            PrimOp::PrimEffect(..) =>
                Err(Err::not_implemented("linearization of state effects")),
            // discrete ops carry a zero tangent
            PrimOp::ScalarBinOp(o, x, y) => {
                let x_p = self.primal_atom(b, x)?;
                let y_p = self.primal_atom(b, y)?;
                let primal = b.binop(*o, &x_p, &y_p)?;
                self.zero_tangent_out(primal)
            },
            PrimOp::Cmp(..) | PrimOp::IndexAsInt(..) | PrimOp::IntAsIndex(..)
            | PrimOp::IdxSetSize(..) | PrimOp::ScalarUnOp(..) => {
                let op = self.primal_op(b, op)?;
                let primal = b.emit_op(op)?;
                self.zero_tangent_out(primal)
            },
            owise => Err(Err::not_implemented(
                format!("linearization of op {:?}", owise))),
        }
    }

    fn primal_op(&self, b : &Builder, op : &PrimOp) -> TabResult<PrimOp> {
        match subst_expr(&self.subst, b.scope(), &Expr::Op(op.clone()))? {
            Expr::Op(op) => Ok(op),
            _ => compiler_err!("substitution changed an op's shape"),
        }
    }

    fn zero_tangent_out(&self, primal : Atom) -> TabResult<LinOut> {
        let tan_ty = tangent_type(&primal.get_type()?)?;
        let tangent : TanThunk = Box::new(move |b, _| zero_at(b, &tan_ty));
        Ok(LinOut { primal, tangent })
    }

    // ------------------------------------------------------------------
    // hofs

    fn lin_hof(&mut self, b : &mut Builder, hof : &PrimHof) -> TabResult<LinOut> {
        match hof {
            PrimHof::For(d, lam) => self.lin_for(b, *d, lam),
            PrimHof::RunWriter(f) => self.lin_run_writer(b, f),
            PrimHof::RunReader(r, f) => self.lin_run_reader(b, r, f),
            owise => Err(Err::not_implemented(format!("linearization of {:?}", owise))),
        }
    }

    /// `for`: the primal loop stores, per index, the pair of the primal
    /// value and the materialized tangent closure. The primal result
    /// unzips the first components; the tangent pass rebuilds the loop
    /// and applies each stored closure under the supplied tangents.
    fn lin_for(&mut self, b : &mut Builder, d : Direction, lam : &Atom) -> TabResult<LinOut> {
        let abs = match lam.as_ref() {
            InnerAtom::Lam(_, abs) => abs.clone(),
            owise => compiler_err!("For of a non-lambda : {:?}", owise),
        };
        let ix_ty = self.primal_atom(b, &abs.binder.ty)?;

        let hint = abs.binder.name.hint().to_string();
        let parent = self.child();
        let body = abs.body.clone();
        let binder_name = abs.binder.name.clone();
        let pairs = b.build_for(d, &hint, ix_ty.clone(), move |sub, i| {
            let mut ctx = parent;
            ctx.subst.insert(binder_name, i);
            let out = ctx.lin_block(sub, &body)?;
            let tan_lam = ctx.tangent_fun_as_lambda(sub, out.tangent)?;
            Ok(mk_pair(out.primal, tan_lam))
        })?;

        let primal = {
            let pairs = pairs.clone();
            b.build_for(d, "i", ix_ty.clone(), move |sub, i| {
                let p = sub.tab_get(&pairs, &i)?;
                sub.fst(&p)
            })?
        };

        let actives = self.active.clone();
        let eff_refs = self.eff_refs.clone();
        let tangent : TanThunk = Box::new(move |b, tenv| {
            let tenv = tenv.clone();
            b.build_for(d, "i", ix_ty, move |sub, i| {
                let p = sub.tab_get(&pairs, &i)?;
                let tan_lam = sub.snd(&p)?;
                apply_linearized(sub, &tan_lam, &eff_refs, &actives, &tenv)
            })
        });
        Ok(LinOut { primal, tangent })
    }

    fn lin_run_writer(&mut self, b : &mut Builder, f : &Atom) -> TabResult<LinOut> {
        let (region_b, ref_b, _eff, body) = open_binary_fun(f)?;
        let w_ty = match ref_b.ty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(_, w)) => w.clone(),
            owise => compiler_err!("writer ref of a non-ref type : {:?}", owise),
        };
        let w_ty = self.primal_atom(b, &w_ty)?;

        // primal effect function: body linearized, tangent materialized
        let parent = self.child();
        let region_name = region_b.name.clone();
        let ref_name = ref_b.name.clone();
        let ref_orig_ty = ref_b.ty.clone();
        let body_c = body.clone();
        let w_ty_c = w_ty.clone();
        let outer_row = b.allowed_effects().clone();
        let pair_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let new_ref_ty = ref_ty(region.clone(), w_ty_c.clone());
            let row = one_eff(region_var, EffectName::Writer, w_ty_c.clone())
                .union(&outer_row)?;
            s1.build_lam("ref", new_ref_ty, Arrow::Plain(row.clone()), move |s2, r| {
                let mut ctx = parent;
                ctx.subst.insert(region_name, region);
                ctx.subst.insert(ref_name.clone(), r);
                ctx.eff_refs.push((ref_name, ref_orig_ty));
                ctx.effs = ctx.effs.union(&row)?;
                let out = ctx.lin_block(s2, &body_c)?;
                let tan_lam = ctx.tangent_fun_as_lambda(s2, out.tangent)?;
                Ok(mk_pair(out.primal, tan_lam))
            })
        })?;

        let res = b.emit(Expr::Hof(PrimHof::RunWriter(pair_fun)))?;
        let ans_pair = b.fst(&res)?;
        let w_primal = b.snd(&res)?;
        let primal_ans = b.fst(&ans_pair)?;
        let tan_lam = b.snd(&ans_pair)?;
        let primal = mk_pair(primal_ans, w_primal);

        // the tangent pass reruns RunWriter with the tangent region
        let actives = self.active.clone();
        let mut all_refs = self.eff_refs.clone();
        all_refs.push((ref_b.name.clone(), ref_b.ty.clone()));
        let ref_name = ref_b.name.clone();
        let tan_w_ty = tangent_type(&w_ty)?;
        let tangent : TanThunk = Box::new(move |b, tenv| {
            let tenv = tenv.clone();
            let outer_row = b.allowed_effects().clone();
            let tan_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
                let region_var = match region.as_var() {
                    Some(v) => v.name.clone(),
                    None => compiler_err!("region is not a variable"),
                };
                let t_ref_ty = ref_ty(region.clone(), tan_w_ty.clone());
                let row = one_eff(region_var, EffectName::Writer, tan_w_ty.clone())
                    .union(&outer_row)?;
                s1.build_lam("ref", t_ref_ty, Arrow::Plain(row), move |s2, r| {
                    let mut tenv = tenv.clone();
                    tenv.refs.insert(ref_name, r);
                    apply_linearized(s2, &tan_lam, &all_refs, &actives, &tenv)
                })
            })?;
            b.emit(Expr::Hof(PrimHof::RunWriter(tan_fun)))
        });
        Ok(LinOut { primal, tangent })
    }

    fn lin_run_reader(&mut self, b : &mut Builder, r : &Atom, f : &Atom) -> TabResult<LinOut> {
        let (region_b, ref_b, _eff, body) = open_binary_fun(f)?;
        let r_ty = match ref_b.ty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(_, t)) => t.clone(),
            owise => compiler_err!("reader ref of a non-ref type : {:?}", owise),
        };
        let r_ty = self.primal_atom(b, &r_ty)?;
        let r_primal = self.primal_atom(b, r)?;
        let r_tan = self.atom_tangent(b, r)?;

        let parent = self.child();
        let region_name = region_b.name.clone();
        let ref_name = ref_b.name.clone();
        let ref_orig_ty = ref_b.ty.clone();
        let body_c = body.clone();
        let r_ty_c = r_ty.clone();
        let outer_row = b.allowed_effects().clone();
        let pair_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let new_ref_ty = ref_ty(region.clone(), r_ty_c.clone());
            let row = one_eff(region_var, EffectName::Reader, r_ty_c.clone())
                .union(&outer_row)?;
            s1.build_lam("ref", new_ref_ty, Arrow::Plain(row.clone()), move |s2, rr| {
                let mut ctx = parent;
                ctx.subst.insert(region_name, region);
                ctx.subst.insert(ref_name.clone(), rr);
                ctx.eff_refs.push((ref_name, ref_orig_ty));
                ctx.effs = ctx.effs.union(&row)?;
                let out = ctx.lin_block(s2, &body_c)?;
                let tan_lam = ctx.tangent_fun_as_lambda(s2, out.tangent)?;
                Ok(mk_pair(out.primal, tan_lam))
            })
        })?;

        let res = b.emit(Expr::Hof(PrimHof::RunReader(r_primal, pair_fun)))?;
        let primal = b.fst(&res)?;
        let tan_lam = b.snd(&res)?;

        let actives = self.active.clone();
        let mut all_refs = self.eff_refs.clone();
        all_refs.push((ref_b.name.clone(), ref_b.ty.clone()));
        let ref_name = ref_b.name.clone();
        let tan_r_ty = tangent_type(&r_ty)?;
        let tangent : TanThunk = Box::new(move |b, tenv| {
            let rt = r_tan(b, tenv)?;
            let tenv = tenv.clone();
            let outer_row = b.allowed_effects().clone();
            let tan_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
                let region_var = match region.as_var() {
                    Some(v) => v.name.clone(),
                    None => compiler_err!("region is not a variable"),
                };
                let t_ref_ty = ref_ty(region.clone(), tan_r_ty.clone());
                let row = one_eff(region_var, EffectName::Reader, tan_r_ty.clone())
                    .union(&outer_row)?;
                s1.build_lam("ref", t_ref_ty, Arrow::Plain(row), move |s2, r2| {
                    let mut tenv = tenv.clone();
                    tenv.refs.insert(ref_name, r2);
                    apply_linearized(s2, &tan_lam, &all_refs, &actives, &tenv)
                })
            })?;
            b.emit(Expr::Hof(PrimHof::RunReader(rt, tan_fun)))
        });
        Ok(LinOut { primal, tangent })
    }

    /// Materialize a delayed tangent computation as an atom: nested
    /// lambdas over the tangent references, then the tangents of the
    /// active variables, then a trailing unit arrow carrying the tangent
    /// effect row, whose body forces the computation.
    fn tangent_fun_as_lambda(&self, b : &mut Builder, thunk : TanThunk) -> TabResult<Atom> {
        let refs : Vec<(Name, Type)> = self.eff_refs.clone();
        let actives : Vec<(Name, Type)> = self.active.clone();
        let mut tan_row = EffectRow { row : indexmap::IndexMap::new(), tail : None };
        for (region, (eff, w)) in &self.effs.row {
            tan_row.row.insert(region.clone(), (*eff, tangent_type(w)?));
        }
        build_tan_lams(b, refs, actives, tan_row,
                       TangentEnv::default(), thunk)
    }
}

fn build_tan_lams(b : &mut Builder,
                  mut refs : Vec<(Name, Type)>,
                  actives : Vec<(Name, Type)>,
                  tan_row : EffectRow,
                  collected : TangentEnv,
                  thunk : TanThunk) -> TabResult<Atom> {
    if !refs.is_empty() {
        let (name, rty) = refs.remove(0);
        let tan_ref_ty = match rty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(region, w)) =>
                ref_ty(region.clone(), tangent_type(w)?),
            owise => compiler_err!("tangent reference of a non-ref type : {:?}", owise),
        };
        return b.build_lam("tr", tan_ref_ty, Arrow::Plain(pure_row()), move |sub, r| {
            let mut collected = collected;
            collected.refs.insert(name, r);
            build_tan_lams(sub, refs, actives, tan_row, collected, thunk)
        })
    }
    let mut actives = actives;
    if !actives.is_empty() {
        let (name, ty) = actives.remove(0);
        let tan_ty = tangent_type(&ty)?;
        return b.build_lam("t", tan_ty, Arrow::Plain(pure_row()), move |sub, t| {
            let mut collected = collected;
            collected.vals.insert(name, t);
            build_tan_lams(sub, Vec::new(), actives, tan_row, collected, thunk)
        })
    }
    b.build_lam("_", unit_ty(), Arrow::Plain(tan_row), move |sub, _| {
        thunk(sub, &collected)
    })
}

/// Apply a materialized tangent function: references, then tangents of
/// the active variables, then unit.
fn apply_linearized(b : &mut Builder,
                    tan_lam : &Atom,
                    eff_refs : &[(Name, Type)],
                    actives : &[(Name, Type)],
                    tenv : &TangentEnv) -> TabResult<Atom> {
    let mut f = tan_lam.clone();
    for (name, _) in eff_refs {
        let r = match tenv.refs.get(name) {
            Some(r) => r.clone(),
            None => compiler_err!("no tangent reference supplied for {:?}", name),
        };
        f = b.app(&f, &r)?;
    }
    for (name, ty) in actives {
        let t = match tenv.vals.get(name) {
            Some(t) => t.clone(),
            None => {
                let tan_ty = tangent_type(ty)?;
                zero_at(b, &tan_ty)?
            },
        };
        f = b.app(&f, &t)?;
    }
    b.app(&f, &mk_unit())
}

// ----------------------------------------------------------------------
// tangent types and zeros

/// The type of tangents at a type. Reals carry real tangents, discrete
/// base and index types carry unit, tables and products go pointwise,
/// sums collapse to unit.
pub fn tangent_type(ty : &Type) -> TabResult<Type> {
    match ty.as_ref() {
        InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) => Ok(real_ty()),
        InnerAtom::TC(PrimTC::BaseType(..))
        | InnerAtom::TC(PrimTC::IntRange(..))
        | InnerAtom::TC(PrimTC::IndexRange(..))
        | InnerAtom::TC(PrimTC::CharType)
        | InnerAtom::TC(PrimTC::UnitType)
        | InnerAtom::TC(PrimTC::SumType(..))
        | InnerAtom::TC(PrimTC::VariantType(..))
        | InnerAtom::TC(PrimTC::TypeCon(..)) => Ok(unit_ty()),
        InnerAtom::TC(PrimTC::PairType(l, r)) =>
            Ok(pair_ty(tangent_type(l)?, tangent_type(r)?)),
        InnerAtom::TC(PrimTC::RecType(items)) =>
            Ok(mk_tc(PrimTC::RecType(items.try_map(|t| tangent_type(t))?))),
        InnerAtom::TC(PrimTC::RefType(region, t)) =>
            Ok(ref_ty(region.clone(), tangent_type(t)?)),
        InnerAtom::Pi(Arrow::Tab, abs) =>
            Ok(mk_pi(Arrow::Tab, abs.binder.clone(), pure_row(),
                     tangent_type(&abs.body.1)?)),
        owise => Err(Err::not_implemented(
            format!("differentiation at type {:?}", owise))),
    }
}

/// The zero of a tangent type.
pub fn zero_at(b : &mut Builder, ty : &Type) -> TabResult<Atom> {
    match ty.as_ref() {
        InnerAtom::TC(PrimTC::BaseType(BaseTy::RealType)) => Ok(mk_real(0.0)),
        InnerAtom::TC(PrimTC::UnitType) => Ok(mk_unit()),
        InnerAtom::TC(PrimTC::PairType(l, r)) => {
            let zl = zero_at(b, l)?;
            let zr = zero_at(b, r)?;
            Ok(mk_pair(zl, zr))
        },
        InnerAtom::TC(PrimTC::RecType(items)) =>
            Ok(mk_con(PrimCon::RecCon(items.try_map(|t| zero_at(b, t))?))),
        InnerAtom::Pi(Arrow::Tab, abs) => {
            let body = zero_at(b, &abs.body.1)?;
            Ok(mk_con(PrimCon::AFor(abs.binder.ty.clone(), body)))
        },
        owise => compiler_err!("no zero at type {:?}", owise),
    }
}

// ----------------------------------------------------------------------
// entry points

/// Forward-mode linearization: `λx. block` becomes
/// `λx. (primal, λt. tangent)` with the trailing function linear.
pub fn linearize(b : &mut Builder,
                 rules : &HashMap<Name, Atom>,
                 lam : &Atom) -> TabResult<Atom> {
    let (arrow, abs) = match lam.as_ref() {
        InnerAtom::Lam(arrow, abs) => (arrow.clone(), abs.clone()),
        owise => compiler_err!("linearize of a non-lambda : {:?}", owise),
    };
    if !arrow.eff().is_pure() {
        return Err(Err::not_implemented("linearization of an effectful function"))
    }
    let hint = abs.binder.name.hint().to_string();
    let binder_ty = abs.binder.ty.clone();
    b.build_lam(&hint, binder_ty.clone(), Arrow::Plain(pure_row()), move |sub, x| {
        let mut ctx = LinCtx {
            rules,
            subst : crate::embed::single_subst(&abs.binder, x),
            active : vec![(abs.binder.name.clone(), binder_ty.clone())],
            eff_refs : Vec::new(),
            effs : pure_row(),
        };
        let out = ctx.lin_block(sub, &abs.body)?;
        let primal = out.primal;
        let tangent = out.tangent;
        let tan_ty = tangent_type(&binder_ty)?;
        let name = abs.binder.name.clone();
        let lin_fn = sub.build_lam("t", tan_ty, Arrow::Lin, move |s2, t| {
            let mut tenv = TangentEnv::default();
            tenv.vals.insert(name, t);
            tangent(s2, &tenv)
        })?;
        Ok(mk_pair(primal, lin_fn))
    })
}

// ----------------------------------------------------------------------
// transposition

struct TransposeCtx {
    /// linear source variables → the writer reference accumulating
    /// their cotangent
    lin_vars : HashMap<Name, Atom>,
    /// effect references under transposition → the reversed reference
    lin_refs : HashMap<Name, Atom>,
    subst : SubstEnv,
}

impl TransposeCtx {
    fn is_linear_expr(&self, e : &Expr) -> bool {
        free_vars_expr(e).keys()
            .any(|n| self.lin_vars.contains_key(n) || self.lin_refs.contains_key(n))
    }

    fn is_linear_atom(&self, a : &Atom) -> bool {
        free_vars_atom(a).keys()
            .any(|n| self.lin_vars.contains_key(n) || self.lin_refs.contains_key(n))
    }

    fn nonlinear(&self, b : &Builder, a : &Atom) -> TabResult<Atom> {
        if self.is_linear_atom(a) {
            return Err(Err::linearity(format!(
                "expected a non-linear operand, got {:?}", a)))
        }
        subst_atom(&self.subst, b.scope(), a)
    }

    fn transpose_block(&mut self, b : &mut Builder, block : &Block, ct : Atom) -> TabResult<()> {
        let (first, rest) = match block.decls.split_first() {
            None => return self.transpose_expr(b, &block.result, ct),
            Some(x) => x,
        };
        let rest_block = Block {
            decls : rest.to_vec(),
            result : block.result.clone(),
            effs : block.effs.clone(),
        };
        match first {
            Decl::Let(_, binder, bound) => {
                if self.is_linear_expr(bound) {
                    // linear: collect the cotangent of the binder through
                    // a writer region, then transpose the bound expression
                    // against it
                    let ct_bound = self.with_lin_var(b, binder, &rest_block, ct)?;
                    self.transpose_expr(b, bound, ct_bound)
                } else {
                    let e = subst_expr(&self.subst, b.scope(), bound)?;
                    let x = b.emit(e)?;
                    self.subst.insert(binder.name.clone(), x);
                    self.transpose_block(b, &rest_block, ct)
                }
            },
            Decl::Unpack(..) =>
                Err(Err::not_implemented("transposition of unpack declarations")),
        }
    }

    /// Run the continuation with `binder` routed to a fresh writer
    /// reference; the region's accumulated value is the cotangent.
    fn with_lin_var(&mut self,
                    b : &mut Builder,
                    binder : &Binder,
                    rest : &Block,
                    ct : Atom) -> TabResult<Atom> {
        let val_ty = subst_atom(&self.subst, b.scope(), &binder.ty)?;
        let binder_name = binder.name.clone();
        // the nested closures take a copy of the context; nothing of it
        // needs to survive them — the cotangent escapes through the cell
        let mut carried = TransposeCtx {
            lin_vars : self.lin_vars.clone(),
            lin_refs : self.lin_refs.clone(),
            subst : self.subst.clone(),
        };
        let rest = rest.clone();
        let outer_row = b.allowed_effects().clone();
        let eff_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let rty = ref_ty(region.clone(), val_ty.clone());
            let row = one_eff(region_var, EffectName::Writer, val_ty).union(&outer_row)?;
            s1.build_lam("ref", rty, Arrow::Plain(row), move |s2, r| {
                carried.lin_vars.insert(binder_name, r);
                carried.transpose_block(s2, &rest, ct)?;
                Ok(mk_unit())
            })
        })?;
        let res = b.emit(Expr::Hof(PrimHof::RunWriter(eff_fun)))?;
        b.snd(&res)
    }

    fn transpose_expr(&mut self, b : &mut Builder, expr : &Expr, ct : Atom) -> TabResult<()> {
        use BinOp::*;
        match expr {
            Expr::Atom(a) => self.transpose_atom(b, a, ct),
            Expr::Op(PrimOp::ScalarBinOp(FAdd, x, y)) => {
                self.transpose_atom(b, x, ct.clone())?;
                self.transpose_atom(b, y, ct)
            },
            Expr::Op(PrimOp::ScalarBinOp(FSub, x, y)) => {
                self.transpose_atom(b, x, ct.clone())?;
                let neg = b.fneg(&ct)?;
                self.transpose_atom(b, y, neg)
            },
            Expr::Op(PrimOp::ScalarBinOp(FMul, x, y)) => {
                match (self.is_linear_atom(x), self.is_linear_atom(y)) {
                    (true, true) => Err(Err::linearity(
                        "product of two linear factors is not linear")),
                    (true, false) => {
                        let y = self.nonlinear(b, y)?;
                        let ct = b.fmul(&ct, &y)?;
                        self.transpose_atom(b, x, ct)
                    },
                    (false, true) => {
                        let x = self.nonlinear(b, x)?;
                        let ct = b.fmul(&ct, &x)?;
                        self.transpose_atom(b, y, ct)
                    },
                    (false, false) => compiler_err!(
                        "transposing a multiplication with no linear factor"),
                }
            },
            Expr::Op(PrimOp::ScalarBinOp(FDiv, x, y)) => {
                let y = self.nonlinear(b, y)?;
                let ct = b.fdiv(&ct, &y)?;
                self.transpose_atom(b, x, ct)
            },
            Expr::Op(PrimOp::ScalarUnOp(UnOp::FNeg, x)) => {
                let neg = b.fneg(&ct)?;
                self.transpose_atom(b, x, neg)
            },
            Expr::Op(PrimOp::Fst(x)) => {
                let (_, rt) = self.pair_component_tys(b, x)?;
                let zr = zero_at(b, &rt)?;
                self.transpose_atom(b, x, mk_pair(ct, zr))
            },
            Expr::Op(PrimOp::Snd(x)) => {
                let (lt, _) = self.pair_component_tys(b, x)?;
                let zl = zero_at(b, &lt)?;
                self.transpose_atom(b, x, mk_pair(zl, ct))
            },
            Expr::Op(PrimOp::PrimEffect(r, EffectOp::MAsk)) => {
                let tr = self.reversed_ref(r)?;
                b.emit_op(PrimOp::PrimEffect(tr, EffectOp::MTell(ct)))?;
                Ok(())
            },
            Expr::Op(PrimOp::PrimEffect(r, EffectOp::MTell(x))) => {
                let tr = self.reversed_ref(r)?;
                let ct_x = b.emit_op(PrimOp::PrimEffect(tr, EffectOp::MAsk))?;
                self.transpose_atom(b, x, ct_x)
            },
            Expr::App(Arrow::Tab, tab, i) => {
                let v = match tab.as_var() {
                    Some(v) => v.clone(),
                    None => compiler_err!("transposing an indexing of a non-variable table"),
                };
                let r = match self.lin_vars.get(&v.name) {
                    Some(r) => r.clone(),
                    None => return Err(Err::linearity(format!(
                        "indexed table {:?} is not linear", v.name))),
                };
                let i = subst_atom(&self.subst, b.scope(), i)?;
                let sub_ref = b.emit_op(PrimOp::IndexRef(r, i))?;
                b.emit_op(PrimOp::PrimEffect(sub_ref, EffectOp::MTell(ct)))?;
                Ok(())
            },
            Expr::Hof(PrimHof::For(d, lam)) => self.transpose_for(b, *d, lam, ct),
            Expr::Hof(PrimHof::RunReader(r, f)) => self.transpose_run_reader(b, r, f, ct),
            Expr::Hof(PrimHof::RunWriter(f)) => self.transpose_run_writer(b, f, ct),
            Expr::Hof(PrimHof::RunState(s, f)) => self.transpose_run_state(b, s, f, ct),
            owise => Err(Err::not_implemented(
                format!("transposition of {:?}", owise))),
        }
    }

    fn pair_component_tys(&self, b : &Builder, x : &Atom) -> TabResult<(Type, Type)> {
        let ty = subst_atom(&self.subst, b.scope(), &x.get_type()?)?;
        match ty.as_ref() {
            InnerAtom::TC(PrimTC::PairType(l, r)) => Ok((l.clone(), r.clone())),
            owise => compiler_err!("projecting a non-pair of type {:?}", owise),
        }
    }

    fn reversed_ref(&self, r : &Atom) -> TabResult<Atom> {
        let v = match r.as_var() {
            Some(v) => v.clone(),
            None => compiler_err!("effect on a non-variable reference"),
        };
        match self.lin_refs.get(&v.name) {
            Some(r) => Ok(r.clone()),
            None => compiler_err!("no reversed reference for {:?}", v.name),
        }
    }

    /// Loop in the reverse direction, transposing the body against the
    /// per-index slice of the cotangent.
    fn transpose_for(&mut self, b : &mut Builder, d : Direction, lam : &Atom, ct : Atom) -> TabResult<()> {
        let abs = match lam.as_ref() {
            InnerAtom::Lam(_, abs) => abs.clone(),
            owise => compiler_err!("For of a non-lambda : {:?}", owise),
        };
        let ix_ty = subst_atom(&self.subst, b.scope(), &abs.binder.ty)?;
        let mut carried = TransposeCtx {
            lin_vars : self.lin_vars.clone(),
            lin_refs : self.lin_refs.clone(),
            subst : self.subst.clone(),
        };
        let hint = abs.binder.name.hint().to_string();
        b.build_for(d.flipped(), &hint, ix_ty, move |sub, i| {
            let ct_i = sub.tab_get(&ct, &i)?;
            carried.subst.insert(abs.binder.name.clone(), i);
            carried.transpose_block(sub, &abs.body, ct_i)?;
            Ok(mk_unit())
        })?;
        Ok(())
    }

    /// `RunReader r` transposes to a `RunWriter` whose accumulated value
    /// is the cotangent of `r`.
    fn transpose_run_reader(&mut self, b : &mut Builder, r : &Atom, f : &Atom, ct : Atom) -> TabResult<()> {
        let (_, ref_b, _, body) = open_binary_fun(f)?;
        let val_ty = match ref_b.ty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(_, t)) =>
                subst_atom(&self.subst, b.scope(), t)?,
            owise => compiler_err!("reader ref of a non-ref type : {:?}", owise),
        };
        let mut carried = TransposeCtx {
            lin_vars : self.lin_vars.clone(),
            lin_refs : self.lin_refs.clone(),
            subst : self.subst.clone(),
        };
        let ref_name = ref_b.name.clone();
        let outer_row = b.allowed_effects().clone();
        let eff_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let rty = ref_ty(region.clone(), val_ty.clone());
            let row = one_eff(region_var, EffectName::Writer, val_ty).union(&outer_row)?;
            s1.build_lam("ref", rty, Arrow::Plain(row), move |s2, rr| {
                carried.lin_refs.insert(ref_name, rr);
                carried.transpose_block(s2, &body, ct)?;
                Ok(mk_unit())
            })
        })?;
        let res = b.emit(Expr::Hof(PrimHof::RunWriter(eff_fun)))?;
        let ct_r = b.snd(&res)?;
        self.transpose_atom(b, r, ct_r)
    }

    /// `RunWriter` transposes to a `RunReader` fed the writer half of
    /// the cotangent.
    fn transpose_run_writer(&mut self, b : &mut Builder, f : &Atom, ct : Atom) -> TabResult<()> {
        let (_, ref_b, _, body) = open_binary_fun(f)?;
        let val_ty = match ref_b.ty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(_, t)) =>
                subst_atom(&self.subst, b.scope(), t)?,
            owise => compiler_err!("writer ref of a non-ref type : {:?}", owise),
        };
        let ct_ans = b.fst(&ct)?;
        let ct_w = b.snd(&ct)?;
        let mut carried = TransposeCtx {
            lin_vars : self.lin_vars.clone(),
            lin_refs : self.lin_refs.clone(),
            subst : self.subst.clone(),
        };
        let ref_name = ref_b.name.clone();
        let outer_row = b.allowed_effects().clone();
        let eff_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let rty = ref_ty(region.clone(), val_ty.clone());
            let row = one_eff(region_var, EffectName::Reader, val_ty).union(&outer_row)?;
            s1.build_lam("ref", rty, Arrow::Plain(row), move |s2, rr| {
                carried.lin_refs.insert(ref_name, rr);
                carried.transpose_block(s2, &body, ct_ans)?;
                Ok(mk_unit())
            })
        })?;
        b.emit(Expr::Hof(PrimHof::RunReader(ct_w, eff_fun)))?;
        Ok(())
    }

    /// State transposition mirrors reader/writer: the loop runs with the
    /// state half of the cotangent, and the final state is the cotangent
    /// of the initial one.
    fn transpose_run_state(&mut self, b : &mut Builder, s : &Atom, f : &Atom, ct : Atom) -> TabResult<()> {
        let (_, ref_b, _, body) = open_binary_fun(f)?;
        let val_ty = match ref_b.ty.as_ref() {
            InnerAtom::TC(PrimTC::RefType(_, t)) =>
                subst_atom(&self.subst, b.scope(), t)?,
            owise => compiler_err!("state ref of a non-ref type : {:?}", owise),
        };
        let ct_ans = b.fst(&ct)?;
        let ct_s = b.snd(&ct)?;
        let mut carried = TransposeCtx {
            lin_vars : self.lin_vars.clone(),
            lin_refs : self.lin_refs.clone(),
            subst : self.subst.clone(),
        };
        let ref_name = ref_b.name.clone();
        let outer_row = b.allowed_effects().clone();
        let eff_fun = b.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let rty = ref_ty(region.clone(), val_ty.clone());
            let row = one_eff(region_var, EffectName::State, val_ty).union(&outer_row)?;
            s1.build_lam("ref", rty, Arrow::Plain(row), move |s2, rr| {
                carried.lin_refs.insert(ref_name, rr);
                carried.transpose_block(s2, &body, ct_ans)?;
                Ok(mk_unit())
            })
        })?;
        let res = b.emit(Expr::Hof(PrimHof::RunState(ct_s, eff_fun)))?;
        let s_ct = b.snd(&res)?;
        self.transpose_atom(b, s, s_ct)
    }

    fn transpose_atom(&mut self, b : &mut Builder, a : &Atom, ct : Atom) -> TabResult<()> {
        match a.as_ref() {
            InnerAtom::AVar(v) => {
                match self.lin_vars.get(&v.name) {
                    Some(r) => {
                        let r = r.clone();
                        b.emit_op(PrimOp::PrimEffect(r, EffectOp::MTell(ct)))?;
                        Ok(())
                    },
                    // non-linear variables absorb their cotangent
                    None => Ok(()),
                }
            },
            InnerAtom::Con(PrimCon::Lit(..)) | InnerAtom::Con(PrimCon::UnitCon) => Ok(()),
            InnerAtom::Con(PrimCon::PairCon(l, r)) => {
                let ct_l = b.fst(&ct)?;
                let ct_r = b.snd(&ct)?;
                self.transpose_atom(b, l, ct_l)?;
                self.transpose_atom(b, r, ct_r)
            },
            InnerAtom::Con(PrimCon::RecCon(items)) => {
                match items {
                    LabeledItems::Tup(xs) => {
                        for (i, x) in xs.iter().enumerate() {
                            let ct_i = b.emit_op(PrimOp::RecGet(ct.clone(), Label::At(i)))?;
                            self.transpose_atom(b, x, ct_i)?;
                        }
                        Ok(())
                    },
                    LabeledItems::Named(m) => {
                        for (k, x) in m {
                            let ct_k = b.emit_op(
                                PrimOp::RecGet(ct.clone(), Label::Field(k.clone())))?;
                            self.transpose_atom(b, x, ct_k)?;
                        }
                        Ok(())
                    },
                }
            },
            owise => Err(Err::not_implemented(
                format!("transposition of atom {:?}", owise))),
        }
    }
}

/// Reverse-mode transposition of a linear map: `λx. block` becomes
/// `λct. cotangent-of-x`, with the cotangent accumulated through a
/// writer region.
pub fn transpose_map(b : &mut Builder, lam : &Atom) -> TabResult<Atom> {
    let abs = match lam.as_ref() {
        InnerAtom::Lam(_, abs) => abs.clone(),
        owise => compiler_err!("transpose of a non-lambda : {:?}", owise),
    };
    let ct_ty = abs.body.get_type()?;
    let x_ty = abs.binder.ty.clone();
    b.build_lam("ct", ct_ty, Arrow::Lin, move |sub, ct| {
        let binder_name = abs.binder.name.clone();
        let body = abs.body.clone();
        let eff_fun = sub.build_lam("h", mk_tc(PrimTC::TypeKind), Arrow::Implicit, move |s1, region| {
            let region_var = match region.as_var() {
                Some(v) => v.name.clone(),
                None => compiler_err!("region is not a variable"),
            };
            let rty = ref_ty(region.clone(), x_ty.clone());
            let row = one_eff(region_var, EffectName::Writer, x_ty);
            s1.build_lam("ref", rty, Arrow::Plain(row), move |s2, r| {
                let mut ctx = TransposeCtx {
                    lin_vars : HashMap::new(),
                    lin_refs : HashMap::new(),
                    subst : SubstEnv::new(),
                };
                ctx.lin_vars.insert(binder_name, r);
                ctx.transpose_block(s2, &body, ct)?;
                Ok(mk_unit())
            })
        })?;
        let res = sub.emit(Expr::Hof(PrimHof::RunWriter(eff_fun)))?;
        sub.snd(&res)
    })
}

#[cfg(test)]
mod autodiff_tests {
    use super::*;
    use crate::name::mk_src_name;
    use crate::interp::{ Interp, ValEnv, Value, vreal };
    use crate::errors::ErrKind;

    fn real_lam(hint : &str, body : impl FnOnce(Var) -> Block) -> Atom {
        let x = Var::mk(mk_src_name(hint), real_ty());
        let block = body(x.clone());
        mk_lam(Arrow::Plain(pure_row()), x, block)
    }

    fn eval_closed(block : &Block) -> Value {
        Interp::new().eval_block(&ValEnv::new(), block).unwrap()
    }

    /// Evaluate `f x` for already-evaluated closures.
    fn apply_value(f : &Value, x : Value) -> Value {
        let mut interp = Interp::new();
        match f {
            Value::VClosure(lam, cenv) => match lam.as_ref() {
                InnerAtom::Lam(_, abs) => {
                    let mut env = cenv.clone();
                    env.insert(abs.binder.name.clone(), x);
                    interp.eval_block(&env, &abs.body).unwrap()
                },
                owise => panic!("not a lambda : {:?}", owise),
            },
            owise => panic!("not a closure : {:?}", owise),
        }
    }

    fn linearize_closed(lam : &Atom) -> Value {
        let mut b = Builder::new(Scope::new(), pure_row());
        let rules = HashMap::new();
        let out = linearize(&mut b, &rules, lam).unwrap();
        eval_closed(&Block::from_atom(out))
    }

    fn transpose_closed(lam : &Atom) -> Value {
        let mut b = Builder::new(Scope::new(), pure_row());
        let out = transpose_map(&mut b, lam).unwrap();
        eval_closed(&Block::from_atom(out))
    }

    #[test]
    fn linearize_scaling() {
        // λx. 3.0 * x  at x₀=4.0 : primal 12.0, tangent map t ↦ 3.0·t
        let lam = real_lam("x", |x| Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_real(3.0), mk_var(x))),
        ).unwrap());
        let lin = linearize_closed(&lam);
        let pair = apply_value(&lin, vreal(4.0));
        match pair {
            Value::VPair(primal, tan_fn) => {
                assert_eq!(*primal, vreal(12.0));
                assert_eq!(apply_value(&tan_fn, vreal(1.0)), vreal(3.0));
            },
            owise => panic!("expected a (primal, tangent-fn) pair, got {:?}", owise),
        }
    }

    #[test]
    fn linearize_square_is_bilinear() {
        // λx. x·x  at x₀=3.0 : primal 9.0, tangent map t ↦ 2·x₀·t
        let lam = real_lam("x", |x| Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_var(x.clone()), mk_var(x))),
        ).unwrap());
        let lin = linearize_closed(&lam);
        let pair = apply_value(&lin, vreal(3.0));
        match pair {
            Value::VPair(primal, tan_fn) => {
                assert_eq!(*primal, vreal(9.0));
                assert_eq!(apply_value(&tan_fn, vreal(1.0)), vreal(6.0));
                assert_eq!(apply_value(&tan_fn, vreal(0.5)), vreal(3.0));
            },
            owise => panic!("expected a (primal, tangent-fn) pair, got {:?}", owise),
        }
    }

    #[test]
    fn linearize_quotient_rule() {
        // λx. x / 2.0 : tangent is t/2
        let lam = real_lam("x", |x| Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FDiv, mk_var(x), mk_real(2.0))),
        ).unwrap());
        let lin = linearize_closed(&lam);
        match apply_value(&lin, vreal(8.0)) {
            Value::VPair(primal, tan_fn) => {
                assert_eq!(*primal, vreal(4.0));
                assert_eq!(apply_value(&tan_fn, vreal(1.0)), vreal(0.5));
            },
            owise => panic!("expected a pair, got {:?}", owise),
        }
    }

    #[test]
    fn transpose_duplication_adds() {
        // transpose(λx. x + x) at cotangent 1.0 gives 2.0
        let lam = real_lam("x", |x| Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, mk_var(x.clone()), mk_var(x))),
        ).unwrap());
        let tr = transpose_closed(&lam);
        assert_eq!(apply_value(&tr, vreal(1.0)), vreal(2.0));
    }

    #[test]
    fn transpose_of_scaling_scales() {
        // transpose(λx. c·x) applied to y equals c·y
        let lam = real_lam("x", |x| Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_real(3.0), mk_var(x))),
        ).unwrap());
        let tr = transpose_closed(&lam);
        assert_eq!(apply_value(&tr, vreal(5.0)), vreal(15.0));
        assert_eq!(apply_value(&tr, vreal(-2.0)), vreal(-6.0));
    }

    #[test]
    fn transpose_of_sum_fans_out() {
        // λp:(Real,Real). fst p + snd p; cotangent c yields (c, c)
        let p = Var::mk(mk_src_name("p"), pair_ty(real_ty(), real_ty()));
        let a = Var::mk(mk_src_name("a"), real_ty());
        let b2 = Var::mk(mk_src_name("b"), real_ty());
        let block = Block::new(
            vec![
                Decl::Let(LetAnn::Plain, a.clone(), Expr::Op(PrimOp::Fst(mk_var(p.clone())))),
                Decl::Let(LetAnn::Plain, b2.clone(), Expr::Op(PrimOp::Snd(mk_var(p.clone())))),
            ],
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, mk_var(a), mk_var(b2))),
        ).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), p, block);
        let tr = transpose_closed(&lam);
        assert_eq!(apply_value(&tr, vreal(4.0)),
                   Value::VPair(Box::new(vreal(4.0)), Box::new(vreal(4.0))));
    }

    #[test]
    fn transpose_rejects_nonlinear_products() {
        // x·x is not linear in x; transposition must say so
        let lam = real_lam("x", |x| Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_var(x.clone()), mk_var(x))),
        ).unwrap());
        let mut b = Builder::new(Scope::new(), pure_row());
        match transpose_map(&mut b, &lam) {
            Err(e) => assert_eq!(e.kind, ErrKind::Lin),
            Ok(..) => panic!("expected a linearity error"),
        }
    }

    #[test]
    fn tangent_types_follow_the_structure() {
        assert_eq!(tangent_type(&real_ty()).unwrap(), real_ty());
        assert_eq!(tangent_type(&int_ty()).unwrap(), unit_ty());
        assert_eq!(tangent_type(&pair_ty(real_ty(), int_ty())).unwrap(),
                   pair_ty(real_ty(), unit_ty()));
        let tab = {
            let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(4)));
            mk_tab_ty(i, real_ty())
        };
        match tangent_type(&tab).unwrap().as_ref() {
            InnerAtom::Pi(Arrow::Tab, abs) => assert_eq!(abs.body.1, real_ty()),
            owise => panic!("expected a table tangent, got {:?}", owise),
        }
        // non-differentiable types are reported, not mangled
        match tangent_type(&mk_tc(PrimTC::TypeKind)) {
            Err(e) => assert_eq!(e.kind, ErrKind::NotImplemented),
            Ok(..) => panic!("expected a not-implemented error"),
        }
    }

    #[test]
    fn linearize_through_for_loops() {
        // λx. for i in range(0,3). x * x  — tangent at x₀ is 2·x₀·t per slot
        let x = Var::mk(mk_src_name("x"), real_ty());
        let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(3)));
        let loop_body = Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_var(x.clone()), mk_var(x.clone()))),
        ).unwrap();
        let loop_lam = mk_lam(Arrow::Plain(pure_row()), i, loop_body);
        let block = Block::new(
            Vec::new(),
            Expr::Hof(PrimHof::For(Direction::Fwd, loop_lam)),
        ).unwrap();
        let lam = mk_lam(Arrow::Plain(pure_row()), x, block);

        let lin = linearize_closed(&lam);
        match apply_value(&lin, vreal(3.0)) {
            Value::VPair(primal, tan_fn) => {
                assert_eq!(*primal, Value::VTab(vec![vreal(9.0); 3]));
                assert_eq!(apply_value(&tan_fn, vreal(1.0)),
                           Value::VTab(vec![vreal(6.0); 3]));
            },
            owise => panic!("expected a pair, got {:?}", owise),
        }
    }
}
