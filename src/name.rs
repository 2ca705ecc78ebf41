use std::sync::Arc;

use NameTag::*;

/// `Name` is an Arc wrapper for `InnerName`, a triple of origin tag,
/// printable hint, and disambiguation counter. Equality, ordering and
/// hashing are on the whole triple; printing uses the hint alone when
/// the counter is zero and `hint.N` otherwise. There is no global
/// counter anywhere: freshness is always relative to a scope handed in
/// by the caller (see `fresh_in`), which is what makes two compiler runs
/// on the same input produce byte-equal output.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(Arc<InnerName>);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InnerName {
    pub tag : NameTag,
    pub hint : Arc<str>,
    pub num : u64,
}

/// Where a name came from. `SrcName` is a user-written (free) name,
/// `GenName` is compiler-generated, `Skolem` only ever appears inside
/// alpha-equality checks, `TopName` refers to the top-level environment
/// and is never shadowed, and `TopFunName` names emitted Imp functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NameTag {
    SrcName,
    GenName,
    Skolem,
    TopName,
    TopFunName,
}

pub fn mk_name(tag : NameTag, hint : &str, num : u64) -> Name {
    Name(Arc::new(InnerName { tag, hint : Arc::from(hint), num }))
}

pub fn mk_src_name(hint : &str) -> Name {
    mk_name(SrcName, hint, 0)
}

pub fn mk_gen_name(hint : &str) -> Name {
    mk_name(GenName, hint, 0)
}

pub fn mk_top_name(hint : &str) -> Name {
    mk_name(TopName, hint, 0)
}

impl Name {
    pub fn tag(&self) -> NameTag {
        self.0.tag
    }

    pub fn hint(&self) -> &str {
        &self.0.hint
    }

    pub fn num(&self) -> u64 {
        self.0.num
    }

    pub fn is_top(&self) -> bool {
        match self.0.tag {
            TopName | TopFunName => true,
            _ => false,
        }
    }

    pub fn with_num(&self, num : u64) -> Name {
        Name(Arc::new(InnerName { tag : self.0.tag, hint : self.0.hint.clone(), num }))
    }

    /// Produce a name unique with respect to `taken`. If `self` is
    /// already free we keep it (counters stay small and stable);
    /// otherwise bump the counter to the first free value. Relies on the
    /// laziness of the iterator the same way the suggestion/collision
    /// dance usually does.
    pub fn fresh_in(&self, taken : impl Fn(&Name) -> bool) -> Name {
        if !taken(self) {
            return self.clone()
        }
        (self.0.num + 1..)
            .map(|n| self.with_num(n))
            .find(|candidate| !taken(candidate))
            .unwrap()
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.0.num == 0 {
            write!(f, "{}", self.0.hint)
        } else {
            write!(f, "{}.{}", self.0.hint, self.0.num)
        }
    }
}

impl std::fmt::Debug for Name {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.0.tag {
            Skolem => write!(f, "?{}", self),
            TopName | TopFunName => write!(f, "@{}", self),
            _ => write!(f, "{}", self),
        }
    }
}

#[cfg(test)]
mod name_tests {
    use super::*;
    use hashbrown::HashSet;

    #[test]
    fn fresh_avoids_collisions() {
        let mut taken = HashSet::new();
        taken.insert(mk_gen_name("x"));
        taken.insert(mk_gen_name("x").with_num(1));
        taken.insert(mk_gen_name("x").with_num(2));

        let fresh = mk_gen_name("x").fresh_in(|n| taken.contains(n));
        assert_eq!(fresh, mk_gen_name("x").with_num(3));

        // an unclaimed name survives untouched
        let free = mk_gen_name("y").fresh_in(|n| taken.contains(n));
        assert_eq!(free, mk_gen_name("y"));
    }

    #[test]
    fn display_suffix_only_when_nonzero() {
        assert_eq!(format!("{}", mk_src_name("acc")), "acc");
        assert_eq!(format!("{}", mk_src_name("acc").with_num(7)), "acc.7");
    }

    #[test]
    fn tags_discriminate() {
        assert_ne!(mk_src_name("x"), mk_gen_name("x"));
        assert!(mk_top_name("f").is_top());
        assert!(!mk_gen_name("f").is_top());
    }
}
