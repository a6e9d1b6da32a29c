// Unit conversion: direct entries from unit stanzas, aliases as
// identities, and transitive chains discovered by breadth-first
// search over the conversion graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use bigdecimal::BigDecimal;

use crate::error::{unit_mismatch, EngineResult, JoshError};
use crate::units::Units;
use crate::value::EngineValue;

/// Computes a destination-units value from a source-units value. The
/// transform only produces the number; the owning Conversion stamps
/// the destination units.
pub trait UnitTransform: Send + Sync + fmt::Debug {
    fn apply(&self, value: EngineValue) -> EngineResult<EngineValue>;
}

/// The alias transform: same number, new label.
#[derive(Debug)]
pub struct IdentityTransform;

impl UnitTransform for IdentityTransform {
    fn apply(&self, value: EngineValue) -> EngineResult<EngineValue> {
        Ok(value)
    }
}

/// Multiply by a constant factor.
#[derive(Debug)]
pub struct FactorTransform(pub BigDecimal);

impl UnitTransform for FactorTransform {
    fn apply(&self, value: EngineValue) -> EngineResult<EngineValue> {
        let units = value.units();
        Ok(EngineValue::Decimal(value.to_decimal()? * &self.0, units))
    }
}

#[derive(Clone, Debug)]
enum ConversionKind {
    Noop,
    Direct(Arc<dyn UnitTransform>),
    Chain(Vec<Conversion>),
}

#[derive(Clone, Debug)]
pub struct Conversion {
    src: Units,
    dst: Units,
    kind: ConversionKind,
}

impl Conversion {
    pub fn noop(units: Units) -> Conversion {
        Conversion {
            src: units.clone(),
            dst: units,
            kind: ConversionKind::Noop,
        }
    }

    pub fn direct(src: Units, dst: Units, transform: Arc<dyn UnitTransform>) -> Conversion {
        Conversion {
            src,
            dst,
            kind: ConversionKind::Direct(transform),
        }
    }

    pub fn source_units(&self) -> &Units {
        &self.src
    }

    pub fn destination_units(&self) -> &Units {
        &self.dst
    }

    /// Compose two conversions. The intermediate units must agree.
    pub fn then(self, second: Conversion) -> EngineResult<Conversion> {
        if second.src != self.dst {
            return Err(unit_mismatch(&self.dst, &second.src));
        }
        let src = self.src.clone();
        let dst = second.dst.clone();
        let mut steps = match self.kind {
            ConversionKind::Chain(steps) => steps,
            _ => vec![self],
        };
        match second.kind {
            ConversionKind::Chain(more) => steps.extend(more),
            _ => steps.push(second),
        }
        Ok(Conversion {
            src,
            dst,
            kind: ConversionKind::Chain(steps),
        })
    }

    pub fn apply(&self, value: EngineValue) -> EngineResult<EngineValue> {
        match &self.kind {
            ConversionKind::Noop => Ok(value),
            ConversionKind::Direct(transform) => {
                let out = transform.apply(value)?;
                relabel(out, &self.dst)
            }
            ConversionKind::Chain(steps) => {
                let mut out = value;
                for step in steps {
                    out = step.apply(out)?;
                }
                Ok(out)
            }
        }
    }
}

fn relabel(value: EngineValue, units: &Units) -> EngineResult<EngineValue> {
    value.cast(units, true, &Converter::identity())
}

#[derive(Default)]
pub struct ConverterBuilder {
    direct: HashMap<(Units, Units), Conversion>,
}

impl ConverterBuilder {
    pub fn new() -> ConverterBuilder {
        ConverterBuilder::default()
    }

    pub fn add_conversion(
        &mut self,
        src: Units,
        dst: Units,
        transform: Arc<dyn UnitTransform>,
    ) {
        self.direct.insert(
            (src.clone(), dst.clone()),
            Conversion::direct(src, dst, transform),
        );
    }

    /// An alias is an identity conversion in both directions.
    pub fn add_alias(&mut self, a: Units, b: Units) {
        self.add_conversion(a.clone(), b.clone(), Arc::new(IdentityTransform));
        self.add_conversion(b, a, Arc::new(IdentityTransform));
    }

    pub fn build(self) -> Converter {
        Converter {
            direct: self.direct,
        }
    }
}

#[derive(Default, Debug)]
pub struct Converter {
    direct: HashMap<(Units, Units), Conversion>,
}

impl fmt::Debug for ConverterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConverterBuilder({} entries)", self.direct.len())
    }
}

impl Converter {
    /// A converter with no entries; only same-units noops succeed.
    pub fn identity() -> Converter {
        Converter::default()
    }

    pub fn get_conversion(&self, src: &Units, dst: &Units) -> EngineResult<Conversion> {
        if src == dst {
            return Ok(Conversion::noop(src.clone()));
        }
        if let Some(conversion) = self.direct.get(&(src.clone(), dst.clone())) {
            return Ok(conversion.clone());
        }
        self.search(src, dst)
    }

    pub fn convert(&self, value: EngineValue, dst: &Units) -> EngineResult<EngineValue> {
        let conversion = self.get_conversion(&value.units(), dst)?;
        conversion.apply(value)
    }

    // Breadth-first search over direct edges, composing the shortest
    // chain found. Edges are explored in canonical unit order so the
    // chosen chain is the same on every run.
    fn search(&self, src: &Units, dst: &Units) -> EngineResult<Conversion> {
        let unreachable = || JoshError::UnknownConversion {
            from: src.to_string(),
            to: dst.to_string(),
        };
        let mut edges: Vec<&(Units, Units)> = self.direct.keys().collect();
        edges.sort_by_key(|(from, to)| (from.to_string(), to.to_string()));

        let mut visited: HashSet<Units> = HashSet::new();
        let mut queue: VecDeque<(Units, Option<(Units, Units)>)> = VecDeque::new();
        let mut parent: HashMap<Units, (Units, Units)> = HashMap::new();
        visited.insert(src.clone());
        queue.push_back((src.clone(), None));
        while let Some((at, via)) = queue.pop_front() {
            if let Some(edge) = via {
                parent.insert(at.clone(), edge);
            }
            if &at == dst {
                return self.compose_path(src, dst, &parent);
            }
            for (from, to) in edges.iter() {
                if *from == at && !visited.contains(to) {
                    visited.insert(to.clone());
                    queue.push_back((to.clone(), Some((from.clone(), to.clone()))));
                }
            }
        }
        Err(unreachable())
    }

    fn compose_path(
        &self,
        src: &Units,
        dst: &Units,
        parent: &HashMap<Units, (Units, Units)>,
    ) -> EngineResult<Conversion> {
        let mut edges = Vec::new();
        let mut at = dst.clone();
        while &at != src {
            let (from, to) = parent
                .get(&at)
                .ok_or_else(|| JoshError::UnknownConversion {
                    from: src.to_string(),
                    to: dst.to_string(),
                })?
                .clone();
            edges.push((from.clone(), to));
            at = from;
        }
        edges.reverse();
        let mut chain: Option<Conversion> = None;
        for (from, to) in edges {
            let step = self.direct[&(from, to)].clone();
            chain = Some(match chain {
                None => step,
                Some(prefix) => prefix.then(step)?,
            });
        }
        chain.ok_or_else(|| JoshError::UnknownConversion {
            from: src.to_string(),
            to: dst.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn u(text: &str) -> Units {
        Units::parse(text).unwrap()
    }

    fn factor(f: &str) -> Arc<dyn UnitTransform> {
        Arc::new(FactorTransform(BigDecimal::from_str(f).unwrap()))
    }

    fn metric() -> Converter {
        let mut builder = ConverterBuilder::new();
        builder.add_conversion(u("km"), u("m"), factor("1000"));
        builder.add_conversion(u("m"), u("cm"), factor("100"));
        builder.add_conversion(u("m"), u("km"), factor("0.001"));
        builder.build()
    }

    fn dec(text: &str, units: &str) -> EngineValue {
        EngineValue::Decimal(BigDecimal::from_str(text).unwrap(), u(units))
    }

    #[test]
    fn test_noop_is_identity() {
        let conv = metric();
        let noop = conv.get_conversion(&u("m"), &u("m")).unwrap();
        assert_eq!(noop.source_units(), &u("m"));
        assert_eq!(noop.destination_units(), &u("m"));
        let value = EngineValue::Int(7, u("m"));
        assert_eq!(noop.apply(value.clone()).unwrap(), value);
    }

    #[test]
    fn test_direct() {
        let conv = metric();
        let km_to_m = conv.get_conversion(&u("km"), &u("m")).unwrap();
        assert_eq!(
            km_to_m.apply(EngineValue::Int(2, u("km"))).unwrap(),
            dec("2000", "m")
        );
    }

    #[test]
    fn test_transitive() {
        let conv = metric();
        let km_to_cm = conv.get_conversion(&u("km"), &u("cm")).unwrap();
        assert_eq!(km_to_cm.source_units(), &u("km"));
        assert_eq!(km_to_cm.destination_units(), &u("cm"));
        assert_eq!(
            km_to_cm.apply(EngineValue::Int(1, u("km"))).unwrap(),
            dec("100000", "cm")
        );
    }

    #[test]
    fn test_then_matches_transitive() {
        let conv = metric();
        let composed = conv
            .get_conversion(&u("km"), &u("m"))
            .unwrap()
            .then(conv.get_conversion(&u("m"), &u("cm")).unwrap())
            .unwrap();
        let direct = conv.get_conversion(&u("km"), &u("cm")).unwrap();
        let input = EngineValue::Int(3, u("km"));
        assert_eq!(
            composed.apply(input.clone()).unwrap(),
            direct.apply(input).unwrap()
        );
    }

    #[test]
    fn test_then_rejects_mismatched_intermediate() {
        let conv = metric();
        let km_to_m = conv.get_conversion(&u("km"), &u("m")).unwrap();
        let km_to_cm = conv.get_conversion(&u("km"), &u("cm")).unwrap();
        assert!(km_to_m.then(km_to_cm).is_err());
    }

    #[test]
    fn test_unreachable() {
        let conv = metric();
        let err = conv.get_conversion(&u("m"), &u("year")).unwrap_err();
        assert!(matches!(err, JoshError::UnknownConversion { .. }));
    }

    #[test]
    fn test_alias_round_trip() {
        let mut builder = ConverterBuilder::new();
        builder.add_alias(u("year"), u("yr"));
        let conv = builder.build();
        let value = EngineValue::Int(5, u("year"));
        let out = conv.convert(value, &u("yr")).unwrap();
        assert_eq!(out, EngineValue::Int(5, u("yr")));
    }

    #[test]
    fn test_identity_converter_rejects_everything_else() {
        let conv = Converter::identity();
        assert!(conv.get_conversion(&u("m"), &u("km")).is_err());
        assert!(conv.get_conversion(&u("m"), &u("m")).is_ok());
    }
}
