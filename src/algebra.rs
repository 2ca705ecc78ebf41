use crate::expr::*;
use crate::errors::TabResult;
use crate::compiler_err;

/// Offset arithmetic for nested index sets, kept exact: sizes are
/// clamped differences (`max(0, h - l)`), ordinals are zero-based, and
/// the flat offset of indices `i₁,…,iₖ` under index-set types
/// `n₁,…,nₖ` is `Σⱼ ordinal(iⱼ)·∏_{l>j} size(nₗ)` — computed here by
/// Horner's rule, which produces the same integer without materializing
/// the products.
///
/// The module is generic over the thing that actually emits the
/// arithmetic, so the Imp lowerer can emit instructions while tests run
/// the same computation over plain integers.
pub trait ScalarEmitter {
    type Val : Clone;

    fn lit_int(&mut self, i : i64) -> Self::Val;
    fn iadd(&mut self, x : Self::Val, y : Self::Val) -> TabResult<Self::Val>;
    fn isub(&mut self, x : Self::Val, y : Self::Val) -> TabResult<Self::Val>;
    fn imul(&mut self, x : Self::Val, y : Self::Val) -> TabResult<Self::Val>;
    /// `max(0, x)`
    fn clamp0(&mut self, x : Self::Val) -> TabResult<Self::Val>;
    /// Resolve a scalar atom (an integer literal, or a variable the
    /// emitter knows how to read) to a value.
    fn scalar(&mut self, a : &Atom) -> TabResult<Self::Val>;
}

/// Number of elements in a finite index set.
pub fn index_set_size<E : ScalarEmitter>(em : &mut E, ty : &Type) -> TabResult<E::Val> {
    match ty.as_ref() {
        InnerAtom::TC(PrimTC::IntRange(l, h)) => {
            let l = em.scalar(l)?;
            let h = em.scalar(h)?;
            let d = em.isub(h, l)?;
            em.clamp0(d)
        },
        InnerAtom::TC(PrimTC::IndexRange(base, low, high)) => {
            let hi = match high {
                Limit::InclusiveLim(a) => {
                    let o = index_ordinal(em, a)?;
                    let one = em.lit_int(1);
                    em.iadd(o, one)?
                },
                Limit::ExclusiveLim(a) => index_ordinal(em, a)?,
                Limit::Unlimited => index_set_size(em, base)?,
            };
            let lo = match low {
                Limit::InclusiveLim(a) => index_ordinal(em, a)?,
                Limit::ExclusiveLim(a) => {
                    let o = index_ordinal(em, a)?;
                    let one = em.lit_int(1);
                    em.iadd(o, one)?
                },
                Limit::Unlimited => em.lit_int(0),
            };
            let d = em.isub(hi, lo)?;
            em.clamp0(d)
        },
        InnerAtom::TC(PrimTC::BaseType(BaseTy::BoolType)) => Ok(em.lit_int(2)),
        InnerAtom::TC(PrimTC::UnitType) => Ok(em.lit_int(1)),
        InnerAtom::TC(PrimTC::PairType(a, b)) => {
            let sa = index_set_size(em, a)?;
            let sb = index_set_size(em, b)?;
            em.imul(sa, sb)
        },
        InnerAtom::TC(PrimTC::RecType(items)) => {
            let mut acc = em.lit_int(1);
            for t in items.values() {
                let s = index_set_size(em, t)?;
                acc = em.imul(acc, s)?;
            }
            Ok(acc)
        },
        InnerAtom::TC(PrimTC::SumType(a, b)) => {
            let sa = index_set_size(em, a)?;
            let sb = index_set_size(em, b)?;
            em.iadd(sa, sb)
        },
        owise => compiler_err!("not a finite index set : {:?}", owise),
    }
}

/// Zero-based position of an index value within its index set.
pub fn index_ordinal<E : ScalarEmitter>(em : &mut E, idx : &Atom) -> TabResult<E::Val> {
    match idx.as_ref() {
        InnerAtom::Con(PrimCon::IntRangeVal(_, _, i)) => em.scalar(i),
        InnerAtom::Con(PrimCon::IndexRangeVal(_, _, _, i)) => em.scalar(i),
        InnerAtom::Con(PrimCon::Lit(..)) => em.scalar(idx),
        InnerAtom::Con(PrimCon::PairCon(a, b)) => {
            let ty = idx.get_type()?;
            let b_ty = match ty.as_ref() {
                InnerAtom::TC(PrimTC::PairType(_, r)) => r.clone(),
                owise => compiler_err!("pair index of a non-pair type : {:?}", owise),
            };
            let oa = index_ordinal(em, a)?;
            let sb = index_set_size(em, &b_ty)?;
            let ob = index_ordinal(em, b)?;
            let scaled = em.imul(oa, sb)?;
            em.iadd(scaled, ob)
        },
        // a variable of index type stands for its (integer) ordinal
        InnerAtom::AVar(..) => em.scalar(idx),
        owise => compiler_err!("no ordinal for index value {:?}", owise),
    }
}

/// Total element count under a stack of enclosing index-set types.
pub fn elem_count<E : ScalarEmitter>(em : &mut E, idx_tys : &[Type]) -> TabResult<E::Val> {
    let mut acc = em.lit_int(1);
    for t in idx_tys {
        let s = index_set_size(em, t)?;
        acc = em.imul(acc, s)?;
    }
    Ok(acc)
}

/// Flat offset of a fully applied index stack, by Horner's rule:
/// `off := off * size(nⱼ) + ordinal(iⱼ)`.
pub fn flat_offset<E : ScalarEmitter>(em : &mut E,
                                      idxs : &[(Atom, Type)]) -> TabResult<E::Val> {
    let mut off = em.lit_int(0);
    for (idx, ix_ty) in idxs {
        let size = index_set_size(em, ix_ty)?;
        let ord = index_ordinal(em, idx)?;
        off = em.imul(off, size)?;
        off = em.iadd(off, ord)?;
    }
    Ok(off)
}

#[cfg(test)]
mod algebra_tests {
    use super::*;

    /// Pure integer emitter; variables are unresolvable on purpose.
    struct ConstEval;

    impl ScalarEmitter for ConstEval {
        type Val = i64;

        fn lit_int(&mut self, i : i64) -> i64 { i }
        fn iadd(&mut self, x : i64, y : i64) -> TabResult<i64> { Ok(x + y) }
        fn isub(&mut self, x : i64, y : i64) -> TabResult<i64> { Ok(x - y) }
        fn imul(&mut self, x : i64, y : i64) -> TabResult<i64> { Ok(x * y) }
        fn clamp0(&mut self, x : i64) -> TabResult<i64> { Ok(x.max(0)) }
        fn scalar(&mut self, a : &Atom) -> TabResult<i64> {
            match a.as_ref() {
                InnerAtom::Con(PrimCon::Lit(LitVal::IntLit(i))) => Ok(*i),
                owise => compiler_err!("not a constant : {:?}", owise),
            }
        }
    }

    fn rng(l : i64, h : i64) -> Type {
        int_range(mk_int(l), mk_int(h))
    }

    fn ix(l : i64, h : i64, i : i64) -> Atom {
        mk_con(PrimCon::IntRangeVal(mk_int(l), mk_int(h), mk_int(i)))
    }

    #[test]
    fn sizes_are_clamped() {
        let mut em = ConstEval;
        assert_eq!(index_set_size(&mut em, &rng(0, 4)).unwrap(), 4);
        assert_eq!(index_set_size(&mut em, &rng(3, 10)).unwrap(), 7);
        // an empty (inverted) range clamps to zero rather than going negative
        assert_eq!(index_set_size(&mut em, &rng(10, 3)).unwrap(), 0);
    }

    #[test]
    fn nested_offset_law() {
        // [n1=2, n2=3, n3=4]: offset(i1,i2,i3) = i1*12 + i2*4 + i3
        let mut em = ConstEval;
        for i1 in 0..2 {
            for i2 in 0..3 {
                for i3 in 0..4 {
                    let idxs = vec![
                        (ix(0, 2, i1), rng(0, 2)),
                        (ix(0, 3, i2), rng(0, 3)),
                        (ix(0, 4, i3), rng(0, 4)),
                    ];
                    let off = flat_offset(&mut em, &idxs).unwrap();
                    assert_eq!(off, i1 * 12 + i2 * 4 + i3);
                }
            }
        }
    }

    #[test]
    fn pair_indices_flatten_row_major() {
        let mut em = ConstEval;
        let pair_ty = crate::expr::pair_ty(rng(0, 3), rng(0, 5));
        assert_eq!(index_set_size(&mut em, &pair_ty).unwrap(), 15);
        let idx = mk_pair(ix(0, 3, 2), ix(0, 5, 1));
        assert_eq!(index_ordinal(&mut em, &idx).unwrap(), 2 * 5 + 1);
    }

    #[test]
    fn index_range_limits() {
        let mut em = ConstEval;
        let base = rng(0, 10);
        let t = mk_tc(PrimTC::IndexRange(
            base,
            Limit::InclusiveLim(ix(0, 10, 2)),
            Limit::ExclusiveLim(ix(0, 10, 7)),
        ));
        // indices 2,3,4,5,6
        assert_eq!(index_set_size(&mut em, &t).unwrap(), 5);
    }
}
