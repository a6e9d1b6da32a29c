// The polymorphic value type flowing through the engine.
//
// Every value carries its dimensional units. Arithmetic between two
// values goes through a widening caster: Int widens to Decimal when
// the representations differ, a scalar broadcasts over a
// distribution, and two distributions combine pointwise (equal
// lengths required). Add and subtract demand equal units after a
// conversion attempt; multiply and divide combine units
// algebraically; power requires a dimensionless integer exponent.
//
// The set of value kinds is a bitset so type errors can name several
// acceptable kinds at once.

use std::fmt;
use std::sync::Arc;

use bigdecimal::{BigDecimal, FromPrimitive, One, RoundingMode, ToPrimitive, Zero};
use enumflags2::{bitflags, BitFlags};

use crate::convert::Converter;
use crate::distribution::Distribution;
use crate::entity::FrozenEntity;
use crate::error::{arithmetic, type_mismatch, unit_mismatch, EngineResult, JoshError};
use crate::units::Units;

#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LanguageType {
    Int = 0b000001,
    Decimal = 0b000010,
    Boolean = 0b000100,
    Str = 0b001000,
    Entity = 0b010000,
    Distribution = 0b100000,
}

pub type TypeSet = BitFlags<LanguageType>;

// All valid values.
#[derive(Clone, Debug)]
pub enum EngineValue {
    Int(i64, Units),
    Decimal(BigDecimal, Units),
    Bool(bool),
    Str(String),
    Entity(Arc<FrozenEntity>),
    Distribution(Distribution),
}

// Construct a type error from a value that missed the expected set.
pub fn expected(expect: TypeSet, got: &EngineValue) -> JoshError {
    type_mismatch(format!("{:?}", expect), got.type_name())
}

impl EngineValue {
    pub fn int(v: i64, units: Units) -> EngineValue {
        EngineValue::Int(v, units)
    }

    pub fn decimal(v: BigDecimal, units: Units) -> EngineValue {
        EngineValue::Decimal(v, units)
    }

    pub fn dimensionless(v: i64) -> EngineValue {
        EngineValue::Int(v, Units::empty())
    }

    pub fn language_type(&self) -> LanguageType {
        match self {
            EngineValue::Int(..) => LanguageType::Int,
            EngineValue::Decimal(..) => LanguageType::Decimal,
            EngineValue::Bool(_) => LanguageType::Boolean,
            EngineValue::Str(_) => LanguageType::Str,
            EngineValue::Entity(_) => LanguageType::Entity,
            EngineValue::Distribution(_) => LanguageType::Distribution,
        }
    }

    /// The user-facing type tag: entities report their own name.
    pub fn type_name(&self) -> String {
        match self {
            EngineValue::Int(..) => "int".to_string(),
            EngineValue::Decimal(..) => "decimal".to_string(),
            EngineValue::Bool(_) => "boolean".to_string(),
            EngineValue::Str(_) => "string".to_string(),
            EngineValue::Entity(e) => e.name.clone(),
            EngineValue::Distribution(_) => "RealizedDistribution".to_string(),
        }
    }

    pub fn units(&self) -> Units {
        match self {
            EngineValue::Int(_, u) | EngineValue::Decimal(_, u) => u.clone(),
            EngineValue::Bool(_) | EngineValue::Str(_) => Units::empty(),
            EngineValue::Entity(e) => Units::atom(&e.name),
            EngineValue::Distribution(d) => d.units(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, EngineValue::Int(..) | EngineValue::Decimal(..))
    }

    /// The numeric payload, widened to a decimal.
    pub fn to_decimal(&self) -> EngineResult<BigDecimal> {
        match self {
            EngineValue::Int(v, _) => Ok(BigDecimal::from(*v)),
            EngineValue::Decimal(v, _) => Ok(v.clone()),
            other => Err(expected(
                LanguageType::Int | LanguageType::Decimal,
                other,
            )),
        }
    }

    /// Integer payload; decimals qualify only when they hold an
    /// integral value.
    pub fn as_integer(&self) -> EngineResult<i64> {
        match self {
            EngineValue::Int(v, _) => Ok(*v),
            EngineValue::Decimal(v, _) if v.is_integer() => v
                .to_i64()
                .ok_or_else(|| arithmetic("integer out of range")),
            other => Err(expected(
                LanguageType::Int | LanguageType::Decimal,
                other,
            )),
        }
    }

    pub fn as_bool(&self) -> EngineResult<bool> {
        match self {
            EngineValue::Bool(v) => Ok(*v),
            other => Err(expected(LanguageType::Boolean.into(), other)),
        }
    }

    /// True only for a dimensionless integer, or a dimensionless
    /// decimal holding an integral value.
    pub fn can_be_power(&self) -> bool {
        match self {
            EngineValue::Int(_, u) => u.is_empty(),
            EngineValue::Decimal(v, u) => u.is_empty() && v.is_integer(),
            _ => false,
        }
    }

    // Bring `other` into this value's units, converting if they
    // differ and a conversion exists.
    fn reconciled(&self, other: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        let mine = self.units();
        if other.units() == mine {
            Ok(other.clone())
        } else {
            conv.convert(other.clone(), &mine)
                .map_err(|_| unit_mismatch(mine, other.units()))
        }
    }

    // Distribution-aware dispatch: broadcast a scalar over a
    // distribution, combine two distributions pointwise, or hand a
    // scalar pair to `f`.
    fn numeric_binary<F>(
        &self,
        other: &EngineValue,
        conv: &Converter,
        f: F,
    ) -> EngineResult<EngineValue>
    where
        F: Fn(&EngineValue, &EngineValue, &Converter) -> EngineResult<EngineValue> + Copy,
    {
        match (self, other) {
            (EngineValue::Distribution(a), EngineValue::Distribution(b)) => {
                let a = a.realize()?;
                let b = b.realize()?;
                Ok(EngineValue::Distribution(a.zip(&b, |x, y| f(x, y, conv))?))
            }
            (EngineValue::Distribution(a), b) => {
                let a = a.realize()?;
                Ok(EngineValue::Distribution(a.map(|x| f(x, b, conv))?))
            }
            (a, EngineValue::Distribution(b)) => {
                let b = b.realize()?;
                Ok(EngineValue::Distribution(b.map(|y| f(a, y, conv))?))
            }
            (a, b) => f(a, b, conv),
        }
    }

    pub fn add(&self, other: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        self.numeric_binary(other, conv, scalar_add)
    }

    pub fn sub(&self, other: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        self.numeric_binary(other, conv, scalar_sub)
    }

    pub fn mul(&self, other: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        self.numeric_binary(other, conv, scalar_mul)
    }

    pub fn div(&self, other: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        self.numeric_binary(other, conv, scalar_div)
    }

    /// Raise to a power. The exponent must be a dimensionless
    /// integer; the base's units are raised along with the value.
    pub fn pow(&self, exponent: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        if !exponent.can_be_power() {
            return Err(unit_mismatch(
                format!("exponent {}", exponent),
                "dimensionless integer",
            ));
        }
        let n = exponent.as_integer()?;
        self.numeric_binary(
            &EngineValue::dimensionless(n),
            conv,
            move |base, _, _| scalar_pow(base, n),
        )
    }

    // The ordered comparisons share one macro-generated template
    // below; they all reduce to decimal comparison after unit
    // reconciliation.
    fn comparable(
        &self,
        other: &EngineValue,
        conv: &Converter,
    ) -> EngineResult<(BigDecimal, BigDecimal)> {
        let rhs = self.reconciled(other, conv)?;
        Ok((self.to_decimal()?, rhs.to_decimal()?))
    }

    pub fn equals(&self, other: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
        let result = match (self, other) {
            (EngineValue::Bool(a), EngineValue::Bool(b)) => a == b,
            (EngineValue::Str(a), EngineValue::Str(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                match a.comparable(b, conv) {
                    Ok((x, y)) => x == y,
                    // Unconvertible units compare unequal.
                    Err(_) => false,
                }
            }
            // Evaluate to false on kind mismatch.
            _ => false,
        };
        Ok(EngineValue::Bool(result))
    }

    pub fn and(&self, other: &EngineValue) -> EngineResult<EngineValue> {
        Ok(EngineValue::Bool(self.as_bool()? & other.as_bool()?))
    }

    pub fn or(&self, other: &EngineValue) -> EngineResult<EngineValue> {
        Ok(EngineValue::Bool(self.as_bool()? | other.as_bool()?))
    }

    pub fn xor(&self, other: &EngineValue) -> EngineResult<EngineValue> {
        Ok(EngineValue::Bool(self.as_bool()? ^ other.as_bool()?))
    }

    pub fn not(&self) -> EngineResult<EngineValue> {
        Ok(EngineValue::Bool(!self.as_bool()?))
    }

    pub fn neg(&self) -> EngineResult<EngineValue> {
        match self {
            EngineValue::Int(v, u) => {
                let v = v
                    .checked_neg()
                    .ok_or_else(|| arithmetic("integer overflow"))?;
                Ok(EngineValue::Int(v, u.clone()))
            }
            EngineValue::Decimal(v, u) => Ok(EngineValue::Decimal(-v.clone(), u.clone())),
            EngineValue::Distribution(d) => {
                Ok(EngineValue::Distribution(d.realize()?.map(|v| v.neg())?))
            }
            other => Err(expected(
                LanguageType::Int | LanguageType::Decimal | LanguageType::Distribution,
                other,
            )),
        }
    }

    /// Cast to destination units. A plain cast converts through the
    /// converter; a forced cast relabels the units untouched.
    pub fn cast(&self, to: &Units, force: bool, conv: &Converter) -> EngineResult<EngineValue> {
        if force {
            return Ok(match self.clone() {
                EngineValue::Int(v, _) => EngineValue::Int(v, to.clone()),
                EngineValue::Decimal(v, _) => EngineValue::Decimal(v, to.clone()),
                EngineValue::Distribution(d) => {
                    EngineValue::Distribution(Distribution::relabeled(d, to.clone())?)
                }
                other => other,
            });
        }
        if self.units() == *to {
            return Ok(self.clone());
        }
        match self {
            EngineValue::Distribution(d) => {
                let realized = d.realize()?;
                Ok(EngineValue::Distribution(
                    realized.map(|v| conv.convert(v.clone(), to))?,
                ))
            }
            _ => conv
                .convert(self.clone(), to)
                .map_err(|_| unit_mismatch(self.units(), to.clone())),
        }
    }
}

macro_rules! comparison {
    ($name:ident, $op:tt) => {
        impl EngineValue {
            pub fn $name(
                &self,
                other: &EngineValue,
                conv: &Converter,
            ) -> EngineResult<EngineValue> {
                let (a, b) = self.comparable(other, conv)?;
                Ok(EngineValue::Bool(a $op b))
            }
        }
    };
}

comparison! { lt, < }
comparison! { gt, > }
comparison! { lte, <= }
comparison! { gte, >= }

// Scalar arithmetic behind the caster. Integer math stays integral
// and checked; anything mixed widens to decimal.

fn scalar_add(a: &EngineValue, b: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
    let b = a.reconciled(b, conv)?;
    match (a, &b) {
        (EngineValue::Int(x, u), EngineValue::Int(y, _)) => {
            let v = x
                .checked_add(*y)
                .ok_or_else(|| arithmetic("integer overflow"))?;
            Ok(EngineValue::Int(v, u.clone()))
        }
        _ => Ok(EngineValue::Decimal(
            a.to_decimal()? + b.to_decimal()?,
            a.units(),
        )),
    }
}

fn scalar_sub(a: &EngineValue, b: &EngineValue, conv: &Converter) -> EngineResult<EngineValue> {
    let b = a.reconciled(b, conv)?;
    match (a, &b) {
        (EngineValue::Int(x, u), EngineValue::Int(y, _)) => {
            let v = x
                .checked_sub(*y)
                .ok_or_else(|| arithmetic("integer overflow"))?;
            Ok(EngineValue::Int(v, u.clone()))
        }
        _ => Ok(EngineValue::Decimal(
            a.to_decimal()? - b.to_decimal()?,
            a.units(),
        )),
    }
}

fn scalar_mul(a: &EngineValue, b: &EngineValue, _: &Converter) -> EngineResult<EngineValue> {
    let units = a.units().multiply(&b.units());
    match (a, b) {
        (EngineValue::Int(x, _), EngineValue::Int(y, _)) => {
            let v = x
                .checked_mul(*y)
                .ok_or_else(|| arithmetic("integer overflow"))?;
            Ok(EngineValue::Int(v, units))
        }
        _ => Ok(EngineValue::Decimal(
            a.to_decimal()? * b.to_decimal()?,
            units,
        )),
    }
}

fn scalar_div(a: &EngineValue, b: &EngineValue, _: &Converter) -> EngineResult<EngineValue> {
    let units = a.units().divide(&b.units());
    match (a, b) {
        (EngineValue::Int(x, _), EngineValue::Int(y, _)) => {
            if *y == 0 {
                return Err(arithmetic("division by zero"));
            }
            // Integer division truncates toward zero.
            Ok(EngineValue::Int(x / y, units))
        }
        _ => {
            let divisor = b.to_decimal()?;
            if divisor.is_zero() {
                return Err(arithmetic("division by zero"));
            }
            Ok(EngineValue::Decimal(a.to_decimal()? / divisor, units))
        }
    }
}

fn scalar_pow(base: &EngineValue, n: i64) -> EngineResult<EngineValue> {
    let units = base.units().raise(n);
    let value = base.to_decimal()?;
    if n < 0 && value.is_zero() {
        return Err(arithmetic("zero raised to a negative power"));
    }
    let mut out = BigDecimal::one();
    for _ in 0..n.unsigned_abs() {
        out *= &value;
    }
    if n < 0 {
        out = BigDecimal::one() / out;
    }
    Ok(EngineValue::Decimal(out, units))
}

// The single-argument builtins: pointwise transforms and
// distribution aggregations.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FunctionOp {
    Abs,
    Ceil,
    Floor,
    Round,
    Log10,
    Ln,
    Count,
    Max,
    Min,
    Mean,
    Std,
    Sum,
}

impl FunctionOp {
    pub fn from_name(name: &str) -> Option<FunctionOp> {
        let op = match name {
            "abs" => FunctionOp::Abs,
            "ceil" => FunctionOp::Ceil,
            "floor" => FunctionOp::Floor,
            "round" => FunctionOp::Round,
            "log10" => FunctionOp::Log10,
            "ln" => FunctionOp::Ln,
            "count" => FunctionOp::Count,
            "max" => FunctionOp::Max,
            "min" => FunctionOp::Min,
            "mean" => FunctionOp::Mean,
            "std" => FunctionOp::Std,
            "sum" => FunctionOp::Sum,
            _ => return None,
        };
        Some(op)
    }

    fn is_aggregate(self) -> bool {
        matches!(
            self,
            FunctionOp::Count
                | FunctionOp::Max
                | FunctionOp::Min
                | FunctionOp::Mean
                | FunctionOp::Std
                | FunctionOp::Sum
        )
    }
}

impl EngineValue {
    pub fn call(&self, op: FunctionOp) -> EngineResult<EngineValue> {
        match self {
            EngineValue::Distribution(d) => {
                let realized = d.realize()?;
                if op.is_aggregate() {
                    realized.aggregate(op)
                } else {
                    Ok(EngineValue::Distribution(
                        realized.map(|v| v.call(op))?,
                    ))
                }
            }
            // A scalar behaves as a singleton distribution under the
            // aggregates.
            scalar => match op {
                FunctionOp::Count => Ok(EngineValue::dimensionless(1)),
                FunctionOp::Sum | FunctionOp::Min | FunctionOp::Max => Ok(scalar.clone()),
                FunctionOp::Mean => Ok(EngineValue::Decimal(
                    scalar.to_decimal()?,
                    scalar.units(),
                )),
                FunctionOp::Std => Ok(EngineValue::Decimal(
                    BigDecimal::zero(),
                    scalar.units(),
                )),
                FunctionOp::Abs => scalar.abs(),
                FunctionOp::Ceil => scalar.round_with(RoundingMode::Ceiling),
                FunctionOp::Floor => scalar.round_with(RoundingMode::Floor),
                FunctionOp::Round => scalar.round_with(RoundingMode::HalfUp),
                FunctionOp::Log10 => scalar.logarithm(10.0),
                FunctionOp::Ln => scalar.logarithm(std::f64::consts::E),
            },
        }
    }

    fn abs(&self) -> EngineResult<EngineValue> {
        match self {
            EngineValue::Int(v, u) => Ok(EngineValue::Int(v.abs(), u.clone())),
            EngineValue::Decimal(v, u) => Ok(EngineValue::Decimal(v.abs(), u.clone())),
            other => Err(expected(
                LanguageType::Int | LanguageType::Decimal,
                other,
            )),
        }
    }

    fn round_with(&self, mode: RoundingMode) -> EngineResult<EngineValue> {
        match self {
            EngineValue::Int(..) => Ok(self.clone()),
            EngineValue::Decimal(v, u) => Ok(EngineValue::Decimal(
                v.with_scale_round(0, mode),
                u.clone(),
            )),
            other => Err(expected(
                LanguageType::Int | LanguageType::Decimal,
                other,
            )),
        }
    }

    // Logarithms run through f64; the engine's decimals carry more
    // precision than a transcendental result can.
    fn logarithm(&self, base: f64) -> EngineResult<EngineValue> {
        let v = self
            .to_decimal()?
            .to_f64()
            .ok_or_else(|| arithmetic("value out of logarithm range"))?;
        if v <= 0.0 {
            return Err(arithmetic(format!("logarithm of non-positive {}", v)));
        }
        let out = v.ln() / base.ln();
        let out = BigDecimal::from_f64(out)
            .ok_or_else(|| arithmetic("logarithm out of range"))?;
        Ok(EngineValue::Decimal(out.with_scale(12), Units::empty()))
    }
}

impl PartialEq for EngineValue {
    fn eq(&self, rhs: &EngineValue) -> bool {
        match (self, rhs) {
            (EngineValue::Int(a, u), EngineValue::Int(b, v)) => a == b && u == v,
            (EngineValue::Decimal(a, u), EngineValue::Decimal(b, v)) => a == b && u == v,
            (EngineValue::Int(a, u), EngineValue::Decimal(b, v))
            | (EngineValue::Decimal(b, v), EngineValue::Int(a, u)) => {
                &BigDecimal::from(*a) == b && u == v
            }
            (EngineValue::Bool(a), EngineValue::Bool(b)) => a == b,
            (EngineValue::Str(a), EngineValue::Str(b)) => a == b,
            (EngineValue::Entity(a), EngineValue::Entity(b)) => Arc::ptr_eq(a, b),
            (EngineValue::Distribution(a), EngineValue::Distribution(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let with_units = |f: &mut fmt::Formatter, text: String, units: &Units| {
            if units.is_empty() {
                write!(f, "{}", text)
            } else {
                write!(f, "{} {}", text, units)
            }
        };
        match self {
            EngineValue::Int(v, u) => with_units(f, v.to_string(), u),
            EngineValue::Decimal(v, u) => with_units(f, v.to_string(), u),
            EngineValue::Bool(v) => write!(f, "{}", v),
            EngineValue::Str(v) => write!(f, "{}", v),
            EngineValue::Entity(e) => write!(f, "<{}>", e.name),
            EngineValue::Distribution(d) => write!(f, "{}", d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn conv() -> Converter {
        Converter::identity()
    }

    fn u(text: &str) -> Units {
        Units::parse(text).unwrap()
    }

    fn dec(text: &str, units: &str) -> EngineValue {
        EngineValue::Decimal(BigDecimal::from_str(text).unwrap(), u(units))
    }

    fn int(v: i64, units: &str) -> EngineValue {
        EngineValue::Int(v, u(units))
    }

    #[test]
    fn test_widening_symmetry() {
        let a = int(2, "m");
        let b = dec("3.5", "m");
        let left = a.add(&b, &conv()).unwrap();
        let right = b.add(&a, &conv()).unwrap();
        assert_eq!(left, dec("5.5", "m"));
        assert_eq!(left, right);
    }

    #[test]
    fn test_add_requires_units() {
        let err = int(1, "m").add(&int(1, "s"), &conv()).unwrap_err();
        assert!(matches!(err, JoshError::UnitMismatch { .. }));
    }

    #[test]
    fn test_unit_multiply() {
        let product = dec("10.5", "m").mul(&dec("2.0", "s"), &conv()).unwrap();
        assert_eq!(product, dec("21.00", "m * s"));
    }

    #[test]
    fn test_division_units_and_truncation() {
        let quotient = int(10, "m").div(&int(2, "s"), &conv()).unwrap();
        assert_eq!(quotient, int(5, "m / s"));
        assert_eq!(
            int(7, "").div(&int(2, ""), &conv()).unwrap(),
            int(3, "")
        );
        assert_eq!(
            int(-7, "").div(&int(2, ""), &conv()).unwrap(),
            int(-3, "")
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = int(1, "").div(&int(0, ""), &conv()).unwrap_err();
        assert!(matches!(err, JoshError::Arithmetic(_)));
        let err = dec("1.0", "").div(&dec("0.0", ""), &conv()).unwrap_err();
        assert!(matches!(err, JoshError::Arithmetic(_)));
    }

    #[test]
    fn test_integer_power() {
        let result = int(2, "m").pow(&int(3, ""), &conv()).unwrap();
        assert_eq!(result, dec("8", "m * m * m"));
    }

    #[test]
    fn test_power_rejects_united_exponent() {
        let err = int(2, "m").pow(&int(3, "s"), &conv()).unwrap_err();
        assert!(matches!(err, JoshError::UnitMismatch { .. }));
    }

    #[test]
    fn test_power_rejects_fractional_exponent_on_united_base() {
        assert!(!dec("1.5", "").can_be_power());
        let err = int(2, "m").pow(&dec("1.5", ""), &conv()).unwrap_err();
        assert!(matches!(err, JoshError::UnitMismatch { .. }));
    }

    #[test]
    fn test_negative_power() {
        let result = int(2, "m").pow(&int(-1, ""), &conv()).unwrap();
        assert_eq!(result, dec("0.5", "/ m"));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            int(2, "m").lt(&int(3, "m"), &conv()).unwrap(),
            EngineValue::Bool(true)
        );
        assert_eq!(
            int(2, "m").gte(&dec("2.0", "m"), &conv()).unwrap(),
            EngineValue::Bool(true)
        );
        assert!(int(2, "m").lt(&int(3, "s"), &conv()).is_err());
    }

    #[test]
    fn test_equality_across_kinds() {
        assert_eq!(
            EngineValue::Str("a".into())
                .equals(&int(1, ""), &conv())
                .unwrap(),
            EngineValue::Bool(false)
        );
        assert_eq!(
            int(2, "m").equals(&dec("2", "m"), &conv()).unwrap(),
            EngineValue::Bool(true)
        );
    }

    #[test]
    fn test_logic() {
        let t = EngineValue::Bool(true);
        let f = EngineValue::Bool(false);
        assert_eq!(t.and(&f).unwrap(), EngineValue::Bool(false));
        assert_eq!(t.or(&f).unwrap(), EngineValue::Bool(true));
        assert_eq!(t.xor(&t).unwrap(), EngineValue::Bool(false));
        assert!(t.and(&int(1, "")).is_err());
    }

    #[test]
    fn test_rounding_family() {
        assert_eq!(
            dec("2.5", "m").call(FunctionOp::Floor).unwrap(),
            dec("2", "m")
        );
        assert_eq!(
            dec("2.5", "m").call(FunctionOp::Ceil).unwrap(),
            dec("3", "m")
        );
        assert_eq!(
            dec("2.5", "m").call(FunctionOp::Round).unwrap(),
            dec("3", "m")
        );
        assert_eq!(int(-3, "m").call(FunctionOp::Abs).unwrap(), int(3, "m"));
    }

    #[test]
    fn test_scalar_aggregates() {
        assert_eq!(
            int(4, "m").call(FunctionOp::Count).unwrap(),
            int(1, "")
        );
        assert_eq!(int(4, "m").call(FunctionOp::Sum).unwrap(), int(4, "m"));
        assert_eq!(
            int(4, "m").call(FunctionOp::Mean).unwrap(),
            dec("4", "m")
        );
    }

    #[test]
    fn test_force_cast_relabels() {
        let cast = int(5, "m").cast(&u("km"), true, &conv()).unwrap();
        assert_eq!(cast, int(5, "km"));
    }

    #[test]
    fn test_plain_cast_needs_conversion() {
        let err = int(5, "m").cast(&u("km"), false, &conv()).unwrap_err();
        assert!(matches!(err, JoshError::UnitMismatch { .. }));
        let noop = int(5, "m").cast(&u("m"), false, &conv()).unwrap();
        assert_eq!(noop, int(5, "m"));
    }
}
