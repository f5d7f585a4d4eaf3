//! Predicates for [`InstrumentClass::get_nested_classes`](super::InstrumentClass::get_nested_classes).

use crate::descriptor::{java_name_to_internal, parse_java_names, JavaType};
use crate::error::InstrumentError;

use super::InstrumentClass;

pub trait ClassFilter {
    fn accept(&self, class: &InstrumentClass) -> bool;
}

impl<F> ClassFilter for F
where
    F: Fn(&InstrumentClass) -> bool,
{
    fn accept(&self, class: &InstrumentClass) -> bool {
        self(class)
    }
}

/// Declared inside the named method of the outer class.
#[derive(Debug, Clone)]
pub struct EnclosingMethodFilter {
    name: String,
    params: Vec<JavaType>,
}

impl ClassFilter for EnclosingMethodFilter {
    fn accept(&self, class: &InstrumentClass) -> bool {
        match class.enclosing_method() {
            Ok(Some((_, name, method_type))) => name == self.name && method_type.params == self.params,
            _ => false,
        }
    }
}

/// Directly implements the interface.
#[derive(Debug, Clone)]
pub struct InterfaceFilter {
    interface: String,
}

impl ClassFilter for InterfaceFilter {
    fn accept(&self, class: &InstrumentClass) -> bool {
        class.implements(&self.interface)
    }
}

/// Accepts a class only if every filter does.
pub struct ChainFilter {
    filters: Vec<Box<dyn ClassFilter>>,
}

impl ClassFilter for ChainFilter {
    fn accept(&self, class: &InstrumentClass) -> bool {
        self.filters.iter().all(|f| f.accept(class))
    }
}

pub struct ClassFilters;

impl ClassFilters {
    pub fn enclosing_method(name: &str, params: &[&str]) -> Result<EnclosingMethodFilter, InstrumentError> {
        Ok(EnclosingMethodFilter { name: name.to_string(), params: parse_java_names(params)? })
    }

    pub fn interface(name: &str) -> InterfaceFilter {
        InterfaceFilter { interface: java_name_to_internal(name) }
    }

    pub fn chain(filters: Vec<Box<dyn ClassFilter>>) -> ChainFilter {
        ChainFilter { filters }
    }

    pub fn accept_all() -> impl ClassFilter {
        |_: &InstrumentClass| true
    }
}
