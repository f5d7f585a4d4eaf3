//! Class name matchers used to route class-load events to transformers.
//!
//! Matching is a pure string comparison on the internal name of the class
//! being loaded; no class loader is ever consulted.

use crate::descriptor::java_name_to_internal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Exactly one class.
    ClassName(String),
    /// Every class whose internal name starts with the prefix.
    Prefix(String),
    AnyOf(Vec<Matcher>),
}

impl Matcher {
    /// Exact match on a class given in either `a.b.C` or `a/b/C` form.
    pub fn class_name(name: &str) -> Matcher {
        Matcher::ClassName(java_name_to_internal(name))
    }

    pub fn prefix(prefix: &str) -> Matcher {
        Matcher::Prefix(java_name_to_internal(prefix))
    }

    pub fn any_of(matchers: impl IntoIterator<Item = Matcher>) -> Matcher {
        Matcher::AnyOf(matchers.into_iter().collect())
    }

    pub fn matches(&self, internal_name: &str) -> bool {
        match self {
            Matcher::ClassName(name) => name == internal_name,
            Matcher::Prefix(prefix) => internal_name.starts_with(prefix.as_str()),
            Matcher::AnyOf(all) => all.iter().any(|m| m.matches(internal_name)),
        }
    }
}
