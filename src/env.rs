use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::name::Name;
use crate::expr::*;
use crate::simplify::SimplifyCtx;
use crate::lower;
use crate::interp::{ Interp, ValEnv };
use crate::source::*;
use crate::errors::{ TabResult, Err, ErrKind };

/// The top-level environment: every name the prelude and the previous
/// modules bound, read by every pass and written only at pass
/// completion. Callers share it behind `Arc<RwLock<_>>`; passes take
/// the read lock, the driver takes the write lock once a module's
/// outputs are final.
#[derive(Clone, Default)]
pub struct TopEnv {
    pub atoms : HashMap<Name, Atom>,
    pub tys : HashMap<Name, Type>,
    pub rules : HashMap<Name, Atom>,
}

impl TopEnv {
    pub fn new() -> Self {
        TopEnv::default()
    }
}

pub fn new_shared_env() -> Arc<RwLock<TopEnv>> {
    Arc::new(RwLock::new(TopEnv::new()))
}

/// Run the pass pipeline over a module block: simplify preserving the
/// derivative-rule functions, simplify again without preserving them,
/// and return the fully reduced block.
pub fn simplify_module(top : &TopEnv, block : &Block) -> TabResult<Block> {
    let first = SimplifyCtx {
        top : &top.atoms,
        rules : &top.rules,
        preserve_rules : true,
    }.run(Scope::new(), block)?;
    SimplifyCtx {
        top : &top.atoms,
        rules : &top.rules,
        preserve_rules : false,
    }.run(Scope::new(), &first)
}

/// Evaluate one source block against the shared environment. All errors
/// abort the block and come back in the `Outcome`; nothing is thrown.
pub fn eval_source_block(env : &Arc<RwLock<TopEnv>>,
                         backend : Backend,
                         show_passes : bool,
                         block : &SourceBlock) -> Outcome {
    let pos = (block.line, block.offset);
    match &block.contents {
        SourceContents::RunModule(m) =>
            run_module(env, backend, show_passes, m, None)
                .unwrap_or_else(|e| Outcome::fail(Vec::new(), e.at(pos))),
        SourceContents::Command(cmd, m) =>
            run_module(env, backend, show_passes, m, Some(*cmd))
                .unwrap_or_else(|e| Outcome::fail(Vec::new(), e.at(pos))),
        SourceContents::GetNameType(n) => {
            let top = env.read();
            match top.tys.get(n) {
                Some(ty) => Outcome::ok(vec![Output::TextOut(format!("{:?} : {:?}", n, ty))]),
                None => Outcome::fail(Vec::new(), Err::unbound(n).at(pos)),
            }
        },
        SourceContents::IncludeSourceFile(path) =>
            Outcome::ok(vec![Output::MiscLog(format!("include {:?} handled by the driver", path))]),
        SourceContents::LoadData(path, fmt) =>
            Outcome::ok(vec![Output::MiscLog(format!("load {:?} ({}) handled by the driver", path, fmt))]),
        SourceContents::ProseBlock(..)
        | SourceContents::CommentLine
        | SourceContents::EmptyLines => Outcome::ok(Vec::new()),
        SourceContents::UnParseable(..) => Outcome::fail(
            Vec::new(),
            Err::new(ErrKind::Parse, "code block requires the external parser").at(pos)),
    }
}

fn run_module(env : &Arc<RwLock<TopEnv>>,
              backend : Backend,
              show_passes : bool,
              m : &Module,
              cmd : Option<EvalCmd>) -> TabResult<Outcome> {
    let mut outputs = Vec::new();

    let simplified = {
        let top = env.read();
        simplify_module(&top, &m.block)?
    };
    if show_passes || cmd == Some(EvalCmd::ShowSimp) {
        outputs.push(Output::PassInfo(PassName::SimpPass, format!("{:#?}", simplified)));
    }

    match backend {
        Backend::Interp => {
            if cmd == Some(EvalCmd::EvalExpr) || cmd.is_none() {
                let v = Interp::new().eval_block(&ValEnv::new(), &simplified)?;
                if cmd == Some(EvalCmd::EvalExpr) {
                    outputs.push(Output::TextOut(format!("{:?}", v)));
                }
            }
        },
        _ => {
            let (imp_module, _recon, _ptrs) = lower::lower_block(backend, &simplified)?;
            if show_passes || cmd == Some(EvalCmd::ShowImp) {
                outputs.push(Output::PassInfo(PassName::ImpPass, format!("{:#?}", imp_module)));
            }
        },
    }

    // bind the exports whose simplified form is a closed atom; anything
    // still depending on runtime results belongs to the code generator
    let export_atoms = module_export_atoms(&simplified, m)?;
    let rule_anns : HashMap<Name, Name> = m.block.decls.iter()
        .filter_map(|d| match d {
            Decl::Let(LetAnn::DerivRule(target), b, _) =>
                Some((b.name.clone(), target.clone())),
            _ => None,
        })
        .collect();

    let mut top = env.write();
    for (binder, atom) in m.exports.iter().zip(export_atoms) {
        match atom {
            Some(atom) => {
                let ty = atom.get_type()?;
                if let Some(target) = rule_anns.get(&binder.name) {
                    top.rules.insert(target.clone(), atom.clone());
                }
                top.tys.insert(binder.name.clone(), ty);
                top.atoms.insert(binder.name.clone(), atom);
            },
            None => outputs.push(Output::MiscLog(format!(
                "{} is not a normal form; its value is produced at run time",
                binder.name))),
        }
    }

    Ok(Outcome::ok(outputs))
}

/// Pick the per-export atoms out of the simplified module block. An
/// export is bindable when it no longer mentions the block's local
/// declarations.
fn module_export_atoms(simplified : &Block, m : &Module) -> TabResult<Vec<Option<Atom>>> {
    let locals : hashbrown::HashSet<Name> = simplified.decls.iter()
        .flat_map(|d| d.binders().into_iter().map(|b| b.name.clone()))
        .collect();
    let parts : Vec<Atom> = match &simplified.result {
        Expr::Atom(a) => match a.as_ref() {
            InnerAtom::Con(PrimCon::RecCon(LabeledItems::Tup(xs)))
                if xs.len() == m.exports.len() => xs.clone(),
            _ if m.exports.len() == 1 => vec![a.clone()],
            _ => return Ok(vec![None; m.exports.len()]),
        },
        _ => return Ok(vec![None; m.exports.len()]),
    };
    Ok(parts.into_iter()
        .map(|a| {
            let closed = free_vars_atom(&a).keys().all(|n| !locals.contains(n));
            if closed { Some(a) } else { None }
        })
        .collect())
}

#[cfg(test)]
mod env_tests {
    use super::*;
    use crate::name::{ mk_src_name, mk_top_name };
    use crate::interp::{ Value, vreal };

    fn module_of(block : Block, exports : Vec<Binder>) -> Module {
        Module { block, exports }
    }

    /// `runWriter λref. for i in range(0,3). tell ref 1.0` == ((), 3.0)
    #[test]
    fn for_under_run_writer_accumulates() {
        let region = Var::mk(mk_src_name("h"), mk_tc(PrimTC::TypeKind));
        let r = Var::mk(mk_src_name("ref"), ref_ty(mk_var(region.clone()), real_ty()));
        let row = one_eff(region.name.clone(), EffectName::Writer, real_ty());

        let i = Var::mk(mk_src_name("i"), int_range(mk_int(0), mk_int(3)));
        let loop_body = Block::new(Vec::new(), Expr::Op(PrimOp::PrimEffect(
            mk_var(r.clone()), EffectOp::MTell(mk_real(1.0))))).unwrap();
        let loop_lam = mk_lam(Arrow::Plain(row.clone()), i, loop_body);
        let eff_body = Block::new(
            vec![Decl::Let(LetAnn::Plain,
                           Var::mk(mk_src_name("t"), Expr::Hof(PrimHof::For(
                               Direction::Fwd, loop_lam.clone())).get_type().unwrap()),
                           Expr::Hof(PrimHof::For(Direction::Fwd, loop_lam)))],
            Expr::Atom(mk_unit()),
        ).unwrap();
        let f = mk_binary_fun(region, r, row, eff_body);
        let block = Block::new(Vec::new(), Expr::Hof(PrimHof::RunWriter(f))).unwrap();

        let top = TopEnv::new();
        let simplified = simplify_module(&top, &block).unwrap();
        let v = Interp::new().eval_block(&ValEnv::new(), &simplified).unwrap();
        assert_eq!(v, Value::VPair(Box::new(Value::VUnit), Box::new(vreal(3.0))));
    }

    #[test]
    fn module_exports_land_in_the_environment() {
        // module: c = 2.0 + 1.0, exported as "c"
        let c = Var::mk(mk_top_name("c"), real_ty());
        let local = Var::mk(mk_src_name("v"), real_ty());
        let block = Block::new(
            vec![Decl::Let(LetAnn::Plain, local.clone(),
                           Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, mk_real(2.0), mk_real(1.0))))],
            Expr::Atom(mk_con(PrimCon::RecCon(LabeledItems::Tup(vec![mk_var(local)])))),
        ).unwrap();
        let m = module_of(block, vec![c.clone()]);
        let env = new_shared_env();
        let outcome = eval_source_block(
            &env, Backend::Interp, false,
            &SourceBlock {
                line : 1, offset : 0,
                raw_text : String::new(),
                contents : SourceContents::RunModule(m),
            });
        assert!(outcome.result.is_ok());
        // the add is not a closed atom, so the export stays unbound but
        // the block itself succeeds with a log line
        assert!(outcome.outputs.iter().any(|o| matches!(o, Output::MiscLog(..))));

        // a literal export does land
        let d = Var::mk(mk_top_name("d"), real_ty());
        let block2 = Block::new(
            Vec::new(),
            Expr::Atom(mk_con(PrimCon::RecCon(LabeledItems::Tup(vec![mk_real(4.5)])))),
        ).unwrap();
        let m2 = module_of(block2, vec![d.clone()]);
        let outcome2 = eval_source_block(
            &env, Backend::Interp, false,
            &SourceBlock {
                line : 2, offset : 0,
                raw_text : String::new(),
                contents : SourceContents::RunModule(m2),
            });
        assert!(outcome2.result.is_ok());
        assert_eq!(env.read().atoms.get(&d.name), Some(&mk_real(4.5)));
    }

    /// The simplifier triggers linearization at the `Linearize` hof and
    /// beta-reduces the produced pair/tangent lambdas on the second
    /// pass; the residual block is plain arithmetic.
    #[test]
    fn linearize_hof_through_the_pipeline() {
        let x = Var::mk(mk_src_name("x"), real_ty());
        let square = mk_lam(Arrow::Plain(pure_row()), x.clone(), Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_var(x.clone()), mk_var(x))),
        ).unwrap());

        let lin = Var::mk(mk_src_name("lin"),
                          Expr::Hof(PrimHof::Linearize(square.clone())).get_type().unwrap());
        let pair = Var::mk(mk_src_name("pr"), pair_ty(
            real_ty(),
            {
                let t = Var::mk(mk_src_name("t"), real_ty());
                mk_pi(Arrow::Lin, t, pure_row(), real_ty())
            }));
        let tan_fn = Var::mk(mk_src_name("tf"), {
            let t = Var::mk(mk_src_name("t"), real_ty());
            mk_pi(Arrow::Lin, t, pure_row(), real_ty())
        });
        let block = Block::new(
            vec![
                Decl::Let(LetAnn::Plain, lin.clone(),
                          Expr::Hof(PrimHof::Linearize(square))),
                Decl::Let(LetAnn::Plain, pair.clone(),
                          Expr::App(Arrow::Plain(pure_row()), mk_var(lin), mk_real(3.0))),
                Decl::Let(LetAnn::Plain, tan_fn.clone(),
                          Expr::Op(PrimOp::Snd(mk_var(pair)))),
            ],
            Expr::App(Arrow::Lin, mk_var(tan_fn), mk_real(1.0)),
        ).unwrap();

        let top = TopEnv::new();
        let simplified = simplify_module(&top, &block).unwrap();
        let v = Interp::new().eval_block(&ValEnv::new(), &simplified).unwrap();
        assert_eq!(v, vreal(6.0)); // d/dx (x²) at 3.0
    }

    /// Transposition through the pipeline: transpose(λx. 3·x) is
    /// multiplication by 3 on the cotangent side.
    #[test]
    fn transpose_hof_through_the_pipeline() {
        let x = Var::mk(mk_src_name("x"), real_ty());
        let scale = mk_lam(Arrow::Lin, x.clone(), Block::new(
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, mk_real(3.0), mk_var(x))),
        ).unwrap());

        let tr = Var::mk(mk_src_name("tr"),
                         Expr::Hof(PrimHof::Transpose(scale.clone())).get_type().unwrap());
        let block = Block::new(
            vec![Decl::Let(LetAnn::Plain, tr.clone(),
                           Expr::Hof(PrimHof::Transpose(scale)))],
            Expr::App(Arrow::Lin, mk_var(tr), mk_real(5.0)),
        ).unwrap();

        let top = TopEnv::new();
        let simplified = simplify_module(&top, &block).unwrap();
        let v = Interp::new().eval_block(&ValEnv::new(), &simplified).unwrap();
        assert_eq!(v, vreal(15.0));
    }

    #[test]
    fn unparseable_blocks_report_parse_errors() {
        let env = new_shared_env();
        let outcome = eval_source_block(
            &env, Backend::LLVM, false,
            &SourceBlock {
                line : 7, offset : 100,
                raw_text : "x = ???".to_string(),
                contents : SourceContents::UnParseable("x = ???".to_string()),
            });
        match outcome.result {
            Err(e) => {
                assert_eq!(e.kind, ErrKind::Parse);
                assert_eq!(e.pos, Some((7, 100)));
            },
            Ok(()) => panic!("unparseable block must fail"),
        }
    }
}
