//! Static module registry (spec §4.6, expanded in SPEC_FULL §4.6.A). Dynamic
//! shared-library loading is out of scope; embedders register modules ahead
//! of time and the parser resolves `ns::sym` against this table only.

use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::heap::Heap;
use crate::value::Value;

/// What a resolved `ns::sym` refers to.
#[derive(Debug, Clone)]
pub enum Symbol {
    Function { arity_min: usize, arity_max: Option<usize> },
    Int(i64),
    Float(f64),
}

/// A statically linked-in module. The registry holds a table of these;
/// `query` is the only thing the parser/runtime ever call on one.
pub trait HawkModule {
    fn name(&self) -> &str;
    fn query(&self, sym: &str) -> Option<Symbol>;
    /// Invokes `sym` as a function. Only reachable for symbols `query`
    /// reported as `Symbol::Function`.
    fn call(&self, sym: &str, args: &[Value], heap: &mut Heap) -> crate::error::HawkResult<Value>;
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: IndexMap<Rc<str>, Rc<dyn HawkModule>, RandomState>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry").field("modules", &self.modules.keys().collect::<Vec<_>>()).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Rc<dyn HawkModule>) {
        self.modules.insert(Rc::from(module.name()), module);
    }

    pub fn resolve(&self, ns: &str, sym: &str) -> Option<Symbol> {
        self.modules.get(ns)?.query(sym)
    }

    pub fn call(&self, ns: &str, sym: &str, args: &[Value], heap: &mut Heap) -> crate::error::HawkResult<Value> {
        match self.modules.get(ns) {
            Some(module) => module.call(sym, args, heap),
            None => Err(crate::error::HawkError::semantic(
                format!("unknown module {ns}"),
                crate::loc::SourceLoc::synthetic(),
            )),
        }
    }

    pub fn contains(&self, ns: &str) -> bool {
        self.modules.contains_key(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MathModule;

    impl HawkModule for MathModule {
        fn name(&self) -> &str {
            "math"
        }

        fn query(&self, sym: &str) -> Option<Symbol> {
            match sym {
                "pi" => Some(Symbol::Float(std::f64::consts::PI)),
                "abs" => Some(Symbol::Function { arity_min: 1, arity_max: Some(1) }),
                _ => None,
            }
        }

        fn call(&self, sym: &str, args: &[Value], heap: &mut Heap) -> crate::error::HawkResult<Value> {
            match (sym, args) {
                ("abs", [Value::Int(n)]) => Ok(Value::make_int(n.abs(), heap)),
                _ => Err(crate::error::HawkError::semantic("bad call", crate::loc::SourceLoc::synthetic())),
            }
        }
    }

    #[test]
    fn resolves_registered_symbol() {
        let mut reg = ModuleRegistry::new();
        reg.register(Rc::new(MathModule));
        assert!(matches!(reg.resolve("math", "pi"), Some(Symbol::Float(_))));
        assert!(reg.resolve("math", "nope").is_none());
        assert!(reg.resolve("nonexistent", "pi").is_none());
    }

    #[test]
    fn calls_registered_function() {
        let mut reg = ModuleRegistry::new();
        reg.register(Rc::new(MathModule));
        let mut heap = Heap::new();
        let result = reg.call("math", "abs", &[Value::Int(-5)], &mut heap).unwrap();
        assert!(matches!(result, Value::Int(5)));
    }
}
