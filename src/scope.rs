// The scope chain behind attribute resolution.
//
// A dotted name is parsed once into its namespace: the prior or
// current timeline of the evaluating entity, the containing patch
// (`here`), the simulation (`meta`), or a plain path the frame
// disambiguates between entity attribute and member collection.
// Local variables are not handled here: the machine consults its own
// bindings before asking the host scope at all, which puts locals
// first in the chain.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::convert::Converter;
use crate::error::{EngineResult, JoshError};
use crate::value::EngineValue;

/// What the machine asks of its surroundings while running a handler
/// chain. The runtime frames implement this against live entities;
/// LocalScope below is the bare implementation for detached
/// evaluation (conversion bodies, config defaults, tests).
pub trait HostScope {
    fn resolve(&mut self, name: &str) -> EngineResult<EngineValue>;

    /// Create `count` fresh instances of a prototype in the current
    /// patch. The result is the created count; the instances
    /// themselves are reachable through collection references.
    fn create(&mut self, prototype: &str, count: i64) -> EngineResult<EngineValue>;

    fn spatial_query(&mut self, target: &str, distance: EngineValue)
        -> EngineResult<EngineValue>;

    fn external_data(
        &mut self,
        name: &str,
        time: Option<EngineValue>,
    ) -> EngineResult<EngineValue>;

    /// A config lookup; None lets the compiled default apply.
    fn config_value(&mut self, name: &str) -> EngineResult<Option<EngineValue>>;

    fn converter(&self) -> &Converter;

    /// A uniform draw in [0, 1) from the synchronized generator.
    fn random_f64(&mut self) -> f64;
}

/// A parsed reference path.
#[derive(Clone, Debug, PartialEq)]
pub enum RefPath {
    /// `prior.<attr>` on the evaluating entity.
    Prior(String),
    /// `current.<attr>` on the evaluating entity (triggers
    /// evaluation).
    Current(String),
    /// `here` (None) or `here.<path>`: the containing patch.
    Here(Option<String>),
    /// `meta.<attr>` on the simulation.
    Meta(String),
    /// Bare or dotted path: entity attribute, or a member collection
    /// when the leading segment names a prototype.
    Plain(String),
}

pub fn parse_ref(name: &str) -> RefPath {
    match name.split_once('.') {
        Some(("prior", rest)) => RefPath::Prior(rest.to_string()),
        Some(("current", rest)) => RefPath::Current(rest.to_string()),
        Some(("here", rest)) => RefPath::Here(Some(rest.to_string())),
        Some(("meta", rest)) => RefPath::Meta(rest.to_string()),
        _ if name == "here" => RefPath::Here(None),
        _ => RefPath::Plain(name.to_string()),
    }
}

/// Detached evaluation scope: a converter and a private generator,
/// no entities. Everything entity-shaped resolves to an error and
/// config lookups are absent, so compiled defaults still work.
pub struct LocalScope {
    converter: Arc<Converter>,
    rng: SmallRng,
}

impl LocalScope {
    pub fn new(converter: Arc<Converter>) -> LocalScope {
        LocalScope {
            converter,
            rng: SmallRng::seed_from_u64(0),
        }
    }
}

impl HostScope for LocalScope {
    fn resolve(&mut self, name: &str) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(name.to_string()))
    }

    fn create(&mut self, prototype: &str, _count: i64) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(format!(
            "create {} outside a patch",
            prototype
        )))
    }

    fn spatial_query(
        &mut self,
        target: &str,
        _distance: EngineValue,
    ) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(format!(
            "{} within ... outside a patch",
            target
        )))
    }

    fn external_data(
        &mut self,
        name: &str,
        _time: Option<EngineValue>,
    ) -> EngineResult<EngineValue> {
        Err(JoshError::UnknownAttribute(format!("external[{}]", name)))
    }

    fn config_value(&mut self, _name: &str) -> EngineResult<Option<EngineValue>> {
        Ok(None)
    }

    fn converter(&self) -> &Converter {
        &self.converter
    }

    fn random_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref_namespaces() {
        assert_eq!(parse_ref("prior.age"), RefPath::Prior("age".into()));
        assert_eq!(
            parse_ref("prior.grid.size"),
            RefPath::Prior("grid.size".into())
        );
        assert_eq!(parse_ref("current.height"), RefPath::Current("height".into()));
        assert_eq!(parse_ref("here"), RefPath::Here(None));
        assert_eq!(
            parse_ref("here.Tree.height"),
            RefPath::Here(Some("Tree.height".into()))
        );
        assert_eq!(parse_ref("meta.steps.low"), RefPath::Meta("steps.low".into()));
        assert_eq!(parse_ref("age"), RefPath::Plain("age".into()));
        assert_eq!(
            parse_ref("Tree.height"),
            RefPath::Plain("Tree.height".into())
        );
    }

    #[test]
    fn test_local_scope_is_bare() {
        let mut scope = LocalScope::new(Arc::new(Converter::identity()));
        assert!(scope.resolve("age").is_err());
        assert_eq!(scope.config_value("anything").unwrap(), None);
        let r = scope.random_f64();
        assert!((0.0..1.0).contains(&r));
    }
}
