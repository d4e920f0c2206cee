use std::fmt;

/// Where a name came from. Equality and ordering include the tag, so a
/// generated `x` never collides with a source-level `x`.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum NameTag {
    /// Free in the source program.
    Free,
    /// Introduced by a compiler pass.
    Gen,
    /// Introduced to decide alpha-equality of dependent types.
    Skolem,
    /// Bound in the top-level environment.
    Top,
    /// Names a top-level Imp function.
    TopFun,
}

/// A name is a `(tag, hint, counter)` triple. The hint is what prints;
/// the counter disambiguates and prints as a suffix when nonzero.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Name {
    pub tag: NameTag,
    pub hint: String,
    pub num: usize,
}

impl Name {
    pub fn new(tag: NameTag, hint: impl Into<String>, num: usize) -> Self {
        Name { tag, hint: hint.into(), num }
    }
    pub fn free(hint: impl Into<String>) -> Self {
        Name::new(NameTag::Free, hint, 0)
    }
    pub fn gen(hint: impl Into<String>) -> Self {
        Name::new(NameTag::Gen, hint, 0)
    }
    pub fn top(hint: impl Into<String>) -> Self {
        Name::new(NameTag::Top, hint, 0)
    }
    pub fn skolem(hint: impl Into<String>) -> Self {
        Name::new(NameTag::Skolem, hint, 0)
    }

    /// The smallest counter bump that avoids every name `taken` claims.
    /// There is no global counter; freshness is always relative to a scope.
    pub fn freshen(&self, mut taken: impl FnMut(&Name) -> bool) -> Name {
        let mut cand = self.clone();
        while taken(&cand) {
            cand.num += 1;
        }
        cand
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num == 0 {
            write!(f, "{}", self.hint)
        } else {
            write!(f, "{}#{}", self.hint, self.num)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn freshen_bumps_past_taken() {
        let x = Name::gen("x");
        let taken = [Name::gen("x"), Name::new(NameTag::Gen, "x", 1)];
        let fresh = x.freshen(|n| taken.contains(n));
        assert_eq!(fresh, Name::new(NameTag::Gen, "x", 2));
        assert_eq!(fresh.to_string(), "x#2");
    }

    #[test]
    fn tags_do_not_collide() {
        let x = Name::free("x");
        let fresh = x.freshen(|n| *n == Name::gen("x"));
        assert_eq!(fresh, Name::free("x"));
    }
}
