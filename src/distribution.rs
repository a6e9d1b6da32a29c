// Ordered multisets of values with uniform units.
//
// A realized distribution owns its values. A virtual distribution
// defers to an external source (typically an external-resource
// query) and realizes on first use. Construction of an empty
// distribution fails everywhere; aggregation contracts below assume
// at least one element.

use std::fmt;
use std::sync::Arc;

use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive, Zero};

use crate::error::{arithmetic, EngineResult};
use crate::units::Units;
use crate::value::{EngineValue, FunctionOp};

/// A deferred distribution: realized on demand, pure and idempotent.
pub trait DistributionSource: Send + Sync + fmt::Debug {
    fn realize(&self) -> EngineResult<RealizedDistribution>;
    fn units(&self) -> Units;
}

#[derive(Clone, Debug)]
pub enum Distribution {
    Realized(RealizedDistribution),
    Virtual(Arc<dyn DistributionSource>),
}

impl Distribution {
    pub fn realize(&self) -> EngineResult<RealizedDistribution> {
        match self {
            Distribution::Realized(d) => Ok(d.clone()),
            Distribution::Virtual(source) => source.realize(),
        }
    }

    pub fn units(&self) -> Units {
        match self {
            Distribution::Realized(d) => d.units.clone(),
            Distribution::Virtual(source) => source.units(),
        }
    }

    pub fn relabeled(self, units: Units) -> EngineResult<Distribution> {
        let realized = self.realize()?;
        let values = realized
            .values
            .iter()
            .map(|v| v.cast(&units, true, &crate::convert::Converter::identity()))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Distribution::Realized(RealizedDistribution::new(
            values, units,
        )?))
    }
}

impl PartialEq for Distribution {
    fn eq(&self, other: &Distribution) -> bool {
        match (self.realize(), other.realize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.realize() {
            Ok(d) => write!(f, "{}", d),
            Err(_) => write!(f, "<virtual>"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RealizedDistribution {
    values: Vec<EngineValue>,
    units: Units,
}

impl RealizedDistribution {
    pub fn new(values: Vec<EngineValue>, units: Units) -> EngineResult<RealizedDistribution> {
        if values.is_empty() {
            return Err(arithmetic("empty distribution"));
        }
        Ok(RealizedDistribution { values, units })
    }

    /// Build from values, taking the units of the first element. All
    /// elements must agree.
    pub fn from_values(values: Vec<EngineValue>) -> EngineResult<RealizedDistribution> {
        if values.is_empty() {
            return Err(arithmetic("empty distribution"));
        }
        let units = values[0].units();
        for value in &values[1..] {
            if value.units() != units {
                return Err(crate::error::unit_mismatch(&units, value.units()));
            }
        }
        Ok(RealizedDistribution { values, units })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn units(&self) -> Units {
        self.units.clone()
    }

    pub fn values(&self) -> &[EngineValue] {
        &self.values
    }

    pub fn into_value(self) -> EngineValue {
        EngineValue::Distribution(Distribution::Realized(self))
    }

    /// Pointwise transform; the result's units follow the first
    /// transformed element.
    pub fn map<F>(&self, f: F) -> EngineResult<Distribution>
    where
        F: Fn(&EngineValue) -> EngineResult<EngineValue>,
    {
        let values = self
            .values
            .iter()
            .map(f)
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Distribution::Realized(RealizedDistribution::from_values(
            values,
        )?))
    }

    /// Pointwise combination with another distribution of identical
    /// length.
    pub fn zip<F>(&self, other: &RealizedDistribution, f: F) -> EngineResult<Distribution>
    where
        F: Fn(&EngineValue, &EngineValue) -> EngineResult<EngineValue>,
    {
        if self.len() != other.len() {
            return Err(arithmetic(format!(
                "distribution lengths differ: {} vs {}",
                self.len(),
                other.len()
            )));
        }
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| f(a, b))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Distribution::Realized(RealizedDistribution::from_values(
            values,
        )?))
    }

    /// Draw `n` elements. With replacement the vector cycles
    /// (indices i mod len); without, the first min(n, len) elements
    /// come back in stable order.
    pub fn contents(&self, n: usize, with_replacement: bool) -> Vec<EngineValue> {
        if with_replacement {
            (0..n)
                .map(|i| self.values[i % self.values.len()].clone())
                .collect()
        } else {
            self.values.iter().take(n).cloned().collect()
        }
    }

    pub fn aggregate(&self, op: FunctionOp) -> EngineResult<EngineValue> {
        match op {
            FunctionOp::Count => Ok(EngineValue::dimensionless(self.len() as i64)),
            FunctionOp::Sum => self.sum(),
            FunctionOp::Mean => self
                .mean()?
                .ok_or_else(|| arithmetic("mean of empty distribution")),
            FunctionOp::Min => self.extremum(true),
            FunctionOp::Max => self.extremum(false),
            FunctionOp::Std => self.std(),
            other => Err(arithmetic(format!("{:?} is not an aggregation", other))),
        }
    }

    fn numeric(&self) -> EngineResult<Vec<BigDecimal>> {
        self.values.iter().map(|v| v.to_decimal()).collect()
    }

    pub fn sum(&self) -> EngineResult<EngineValue> {
        let mut total = BigDecimal::zero();
        for v in self.numeric()? {
            total += v;
        }
        Ok(EngineValue::Decimal(total, self.units.clone()))
    }

    /// The arithmetic mean, units preserved. None only for the
    /// (unreachable) empty case; the Option keeps the signature
    /// shared with min/max/std.
    pub fn mean(&self) -> EngineResult<Option<EngineValue>> {
        let values = self.numeric()?;
        if values.is_empty() {
            return Ok(None);
        }
        let mut total = BigDecimal::zero();
        for v in &values {
            total += v;
        }
        let mean = total / BigDecimal::from(values.len() as i64);
        Ok(Some(EngineValue::Decimal(mean, self.units.clone())))
    }

    fn extremum(&self, take_min: bool) -> EngineResult<EngineValue> {
        let values = self.numeric()?;
        let mut best = values[0].clone();
        for v in &values[1..] {
            let better = if take_min { v < &best } else { v > &best };
            if better {
                best = v.clone();
            }
        }
        Ok(EngineValue::Decimal(best, self.units.clone()))
    }

    /// Population standard deviation, units preserved. Computed
    /// through f64: the variance square root is not exact anyway.
    pub fn std(&self) -> EngineResult<EngineValue> {
        let values = self.numeric()?;
        let n = values.len() as f64;
        let floats: Vec<f64> = values
            .iter()
            .map(|v| v.to_f64().ok_or_else(|| arithmetic("value out of range")))
            .collect::<EngineResult<Vec<_>>>()?;
        let mean = floats.iter().sum::<f64>() / n;
        let variance = floats.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = BigDecimal::from_f64(variance.sqrt())
            .ok_or_else(|| arithmetic("standard deviation out of range"))?;
        Ok(EngineValue::Decimal(
            std.with_scale(12),
            self.units.clone(),
        ))
    }
}

impl fmt::Display for RealizedDistribution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let body = self
            .values
            .iter()
            .map(|v| match v {
                EngineValue::Int(x, _) => x.to_string(),
                EngineValue::Decimal(x, _) => x.to_string(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if self.units.is_empty() {
            write!(f, "[{}]", body)
        } else {
            write!(f, "[{}] {}", body, self.units)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::Converter;
    use std::str::FromStr;

    fn meters(values: &[i64]) -> RealizedDistribution {
        let units = Units::parse("m").unwrap();
        RealizedDistribution::new(
            values
                .iter()
                .map(|v| EngineValue::Int(*v, units.clone()))
                .collect(),
            units,
        )
        .unwrap()
    }

    fn dec(text: &str, units: &str) -> EngineValue {
        EngineValue::Decimal(
            BigDecimal::from_str(text).unwrap(),
            Units::parse(units).unwrap(),
        )
    }

    #[test]
    fn test_empty_fails() {
        assert!(RealizedDistribution::new(vec![], Units::empty()).is_err());
        assert!(RealizedDistribution::from_values(vec![]).is_err());
    }

    #[test]
    fn test_broadcast_add() {
        let d = meters(&[1, 2, 3, 4, 5]).into_value();
        let scalar = EngineValue::Int(10, Units::parse("m").unwrap());
        let conv = Converter::identity();
        let left = d.add(&scalar, &conv).unwrap();
        let right = scalar.add(&d, &conv).unwrap();
        assert_eq!(left, meters(&[11, 12, 13, 14, 15]).into_value());
        assert_eq!(left, right);
    }

    #[test]
    fn test_pointwise_requires_equal_length() {
        let a = meters(&[1, 2, 3]).into_value();
        let b = meters(&[1, 2]).into_value();
        assert!(a.add(&b, &Converter::identity()).is_err());
    }

    #[test]
    fn test_mean() {
        let d = meters(&[1, 2, 3, 4, 5]);
        assert_eq!(d.mean().unwrap().unwrap(), dec("3.0", "m"));
    }

    #[test]
    fn test_aggregates() {
        let d = meters(&[4, 1, 3]);
        assert_eq!(
            d.aggregate(FunctionOp::Count).unwrap(),
            EngineValue::dimensionless(3)
        );
        assert_eq!(d.aggregate(FunctionOp::Sum).unwrap(), dec("8", "m"));
        assert_eq!(d.aggregate(FunctionOp::Min).unwrap(), dec("1", "m"));
        assert_eq!(d.aggregate(FunctionOp::Max).unwrap(), dec("4", "m"));
    }

    #[test]
    fn test_contents_with_replacement_cycles() {
        let d = meters(&[1, 2, 3]);
        let drawn: Vec<i64> = d
            .contents(5, true)
            .iter()
            .map(|v| v.as_integer().unwrap())
            .collect();
        assert_eq!(drawn, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_contents_without_replacement_truncates() {
        let d = meters(&[1, 2, 3]);
        let drawn: Vec<i64> = d
            .contents(5, false)
            .iter()
            .map(|v| v.as_integer().unwrap())
            .collect();
        assert_eq!(drawn, vec![1, 2, 3]);
        let drawn: Vec<i64> = d
            .contents(2, false)
            .iter()
            .map(|v| v.as_integer().unwrap())
            .collect();
        assert_eq!(drawn, vec![1, 2]);
    }

    #[derive(Debug)]
    struct Fixed;

    impl DistributionSource for Fixed {
        fn realize(&self) -> EngineResult<RealizedDistribution> {
            let units = Units::parse("m").unwrap();
            RealizedDistribution::new(
                vec![
                    EngineValue::Int(1, units.clone()),
                    EngineValue::Int(2, units.clone()),
                ],
                units,
            )
        }

        fn units(&self) -> Units {
            Units::parse("m").unwrap()
        }
    }

    #[test]
    fn test_virtual_realizes_on_demand() {
        let virtual_ = Distribution::Virtual(std::sync::Arc::new(Fixed));
        assert_eq!(virtual_.units(), Units::parse("m").unwrap());
        let realized = virtual_.realize().unwrap();
        assert_eq!(realized.len(), 2);
        assert_eq!(
            realized.mean().unwrap().unwrap(),
            dec("1.5", "m")
        );
    }

    #[test]
    fn test_std() {
        let d = meters(&[2, 4, 4, 4, 5, 5, 7, 9]);
        match d.std().unwrap() {
            EngineValue::Decimal(v, _) => {
                assert_eq!(v.with_scale(4).to_string(), "2.0000");
            }
            other => panic!("expected decimal, got {:?}", other),
        }
    }
}
