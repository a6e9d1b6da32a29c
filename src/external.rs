// Host collaborators: configuration sources and external resources.
//
// The engine only sees the two traits; the implementations here are
// the ones every run needs (the .jshc file format, script-level
// defaults, an in-memory table resource for tests and small runs).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;

use crate::distribution::{Distribution, RealizedDistribution};
use crate::error::{EngineResult, JoshError};
use crate::grid::Geometry;
use crate::units::Units;
use crate::value::EngineValue;

/// Keyed configuration values. Absent keys are not errors here; the
/// machine applies the compiled `else` default or raises
/// UnresolvedConfig itself.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    fn get(&self, name: &str) -> Option<EngineValue>;
}

/// External data keyed by name and geometry, optionally by time.
/// Pure and idempotent: same arguments, same distribution.
pub trait ExternalResource: Send + Sync + fmt::Debug {
    fn distribution_for(
        &self,
        name: &str,
        geometry: &Geometry,
        time: Option<i64>,
    ) -> EngineResult<Distribution>;
}

/// The empty resource: every lookup fails.
#[derive(Debug, Default)]
pub struct NullResource;

impl ExternalResource for NullResource {
    fn distribution_for(
        &self,
        name: &str,
        _geometry: &Geometry,
        _time: Option<i64>,
    ) -> EngineResult<Distribution> {
        Err(JoshError::UnknownAttribute(format!("external[{}]", name)))
    }
}

/// In-memory series resource: one vector of decimals per name, the
/// same at every geometry. `at t` indexes the series.
#[derive(Debug, Default)]
pub struct TableResource {
    series: HashMap<String, (Vec<BigDecimal>, Units)>,
}

impl TableResource {
    pub fn new() -> TableResource {
        TableResource::default()
    }

    pub fn insert(&mut self, name: &str, values: Vec<BigDecimal>, units: Units) {
        self.series.insert(name.to_string(), (values, units));
    }
}

impl ExternalResource for TableResource {
    fn distribution_for(
        &self,
        name: &str,
        _geometry: &Geometry,
        time: Option<i64>,
    ) -> EngineResult<Distribution> {
        let (values, units) = self
            .series
            .get(name)
            .ok_or_else(|| JoshError::UnknownAttribute(format!("external[{}]", name)))?;
        let selected: Vec<EngineValue> = match time {
            None => values
                .iter()
                .map(|v| EngineValue::Decimal(v.clone(), units.clone()))
                .collect(),
            Some(t) => {
                let index = usize::try_from(t).ok().filter(|i| *i < values.len());
                match index {
                    Some(i) => {
                        vec![EngineValue::Decimal(values[i].clone(), units.clone())]
                    }
                    None => {
                        return Err(JoshError::UnknownAttribute(format!(
                            "external[{}] at {}",
                            name, t
                        )))
                    }
                }
            }
        };
        Ok(Distribution::Realized(RealizedDistribution::new(
            selected,
            units.clone(),
        )?))
    }
}

/// An empty config: every key absent.
#[derive(Debug, Default)]
pub struct EmptyConfig;

impl ConfigSource for EmptyConfig {
    fn get(&self, _name: &str) -> Option<EngineValue> {
        None
    }
}

/// Plain map-backed config, the test workhorse.
#[derive(Debug, Default)]
pub struct MapConfig {
    values: HashMap<String, EngineValue>,
}

impl MapConfig {
    pub fn new() -> MapConfig {
        MapConfig::default()
    }

    pub fn insert(&mut self, name: &str, value: EngineValue) {
        self.values.insert(name.to_string(), value);
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, name: &str) -> Option<EngineValue> {
        self.values.get(name).cloned()
    }
}

/// Layered sources: the first layer holding a key wins. Hosts put
/// the .jshc file above the script's own `config` defaults.
#[derive(Debug, Default)]
pub struct LayeredConfig {
    layers: Vec<Arc<dyn ConfigSource>>,
}

impl LayeredConfig {
    pub fn new(layers: Vec<Arc<dyn ConfigSource>>) -> LayeredConfig {
        LayeredConfig { layers }
    }
}

impl ConfigSource for LayeredConfig {
    fn get(&self, name: &str) -> Option<EngineValue> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }
}

/// The .jshc file format: line-oriented, `identifier = number
/// [unit]`, `#` comments, blank lines. Units absent means
/// dimensionless.
#[derive(Debug, Default)]
pub struct JshcConfig {
    values: HashMap<String, EngineValue>,
}

impl JshcConfig {
    pub fn parse(text: &str) -> EngineResult<JshcConfig> {
        lazy_static! {
            static ref LINE: Regex = Regex::new(
                r"^([A-Za-z_][A-Za-z0-9_.]*)\s*=\s*(-?[0-9]+(?:\.[0-9]+)?)\s*(.*)$"
            )
            .unwrap();
        }

        let mut values = HashMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let captures = LINE.captures(line).ok_or_else(|| JoshError::Parse {
                line: index + 1,
                col: 1,
                message: format!("invalid config line '{}'", line),
            })?;
            let name = captures[1].to_string();
            let number = BigDecimal::from_str(&captures[2]).map_err(|_| {
                JoshError::Parse {
                    line: index + 1,
                    col: 1,
                    message: format!("invalid number in config line '{}'", line),
                }
            })?;
            let units = Units::parse(captures[3].trim())?;
            values.insert(name, EngineValue::Decimal(number, units));
        }
        Ok(JshcConfig { values })
    }
}

impl ConfigSource for JshcConfig {
    fn get(&self, name: &str) -> Option<EngineValue> {
        self.values.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GeoMoment;

    fn geometry() -> Geometry {
        Geometry::from_moment(GeoMoment { col: 0, row: 0 }, 10.0)
    }

    #[test]
    fn test_jshc_parses_lines() {
        let config = JshcConfig::parse(
            "# a comment\n\nmaxAge = 100 year\nrate = 0.25\nspeed = 3 m / s\n",
        )
        .unwrap();
        assert_eq!(
            config.get("maxAge").unwrap(),
            EngineValue::Decimal(BigDecimal::from(100), Units::atom("year"))
        );
        assert_eq!(
            config.get("rate").unwrap().units(),
            Units::empty()
        );
        assert_eq!(
            config.get("speed").unwrap().units(),
            Units::parse("m / s").unwrap()
        );
        assert!(config.get("missing").is_none());
    }

    #[test]
    fn test_jshc_rejects_garbage() {
        let err = JshcConfig::parse("what even\n").unwrap_err();
        assert!(matches!(err, JoshError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_layered_precedence() {
        let mut over = MapConfig::new();
        over.insert("x", EngineValue::dimensionless(1));
        let mut under = MapConfig::new();
        under.insert("x", EngineValue::dimensionless(2));
        under.insert("y", EngineValue::dimensionless(3));
        let layered =
            LayeredConfig::new(vec![Arc::new(over), Arc::new(under)]);
        assert_eq!(layered.get("x").unwrap(), EngineValue::dimensionless(1));
        assert_eq!(layered.get("y").unwrap(), EngineValue::dimensionless(3));
        assert!(layered.get("z").is_none());
    }

    #[test]
    fn test_table_resource() {
        let mut table = TableResource::new();
        table.insert(
            "rainfall",
            vec![BigDecimal::from(10), BigDecimal::from(20)],
            Units::atom("mm"),
        );
        let whole = table
            .distribution_for("rainfall", &geometry(), None)
            .unwrap();
        assert_eq!(whole.realize().unwrap().len(), 2);
        let at = table
            .distribution_for("rainfall", &geometry(), Some(1))
            .unwrap();
        let realized = at.realize().unwrap();
        assert_eq!(realized.len(), 1);
        assert_eq!(
            realized.values()[0],
            EngineValue::Decimal(BigDecimal::from(20), Units::atom("mm"))
        );
        assert!(table
            .distribution_for("rainfall", &geometry(), Some(9))
            .is_err());
        assert!(NullResource
            .distribution_for("rainfall", &geometry(), None)
            .is_err());
    }
}
