use crate::syntax::*;
use derive_more::{Deref, DerefMut, From, Into};
use std::ops::{Add, AddAssign};

/// A persistent name-keyed environment. Extension clones in O(log n), so
/// passes thread environments by value the way the teacher passes are
/// written: extend on the way down, drop on the way out.
#[derive(Clone, Debug, From, Into, Deref, DerefMut)]
pub struct Env<T>(im::HashMap<Name, T>);

impl<T: Clone> Env<T> {
    pub fn new() -> Self {
        Env(im::HashMap::new())
    }
    pub fn singleton(name: Name, t: T) -> Self {
        Env(im::HashMap::unit(name, t))
    }
    pub fn lookup(&self, name: &Name) -> Option<&T> {
        self.0.get(name)
    }
}

impl<T: Clone> Default for Env<T> {
    fn default() -> Self {
        Env::new()
    }
}

impl<T: Clone, Iter: IntoIterator<Item = (Name, T)>> Add<Iter> for Env<T> {
    type Output = Self;
    fn add(self, iter: Iter) -> Self {
        let Env(mut map) = self;
        for (name, t) in iter {
            map.insert(name, t);
        }
        Env(map)
    }
}

impl<T: Clone, Iter: IntoIterator<Item = (Name, T)>> AddAssign<Iter> for Env<T> {
    fn add_assign(&mut self, iter: Iter) {
        for (name, t) in iter {
            self.0.insert(name, t);
        }
    }
}

impl<T: Clone> FromIterator<(Name, T)> for Env<T> {
    fn from_iter<I: IntoIterator<Item = (Name, T)>>(iter: I) -> Self {
        Env(iter.into_iter().collect())
    }
}

impl<T: Clone> IntoIterator for Env<T> {
    type Item = (Name, T);
    type IntoIter = im::hashmap::ConsumingIter<(Name, T)>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The substitution environment: names mapped to the atoms that replace
/// them.
pub type SubstEnv = Env<RcAtom>;

/// What a scope knows about each name: its type, and the expression it
/// was let-bound to when one exists (used by `reduce_scoped`).
#[derive(Clone, Debug)]
pub struct ScopeEntry {
    pub ty: RcTy,
    pub bound: Option<Expr>,
}

/// The set of names live at a program point. Binders must be freshened
/// against the scope before insertion.
pub type Scope = Env<ScopeEntry>;

impl Scope {
    pub fn knows(&self, name: &Name) -> bool {
        self.lookup(name).is_some()
    }
    pub fn binder(mut self, var: &Var) -> Self {
        self.insert(var.name.clone(), ScopeEntry { ty: var.ty.clone(), bound: None });
        self
    }
}
