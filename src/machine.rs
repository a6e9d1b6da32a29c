// The push-down machine that runs compiled handler chains.
//
// A handler body compiles to a chain of actions over a value stack.
// Almost every action pops operands and pushes a result; the
// exceptions reach out through the HostScope seam (attribute
// resolution, entity creation, spatial queries, external data,
// config). End marks the handler's return: the caller takes the top
// of stack as the handler's value, and a chain that runs dry without
// End is an error.
//
// The stack is per-invocation; it never crosses handler calls.

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::{BigDecimal, FromPrimitive};

use crate::distribution::RealizedDistribution;
use crate::error::{arithmetic, EngineResult, JoshError};
use crate::scope::HostScope;
use crate::units::Units;
use crate::value::{EngineValue, FunctionOp};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    And,
    Or,
    Xor,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Curve {
    Linear,
    Quadratic,
    Sqrt,
}

impl Curve {
    pub fn from_name(name: &str) -> Option<Curve> {
        match name {
            "linear" => Some(Curve::Linear),
            "quadratic" => Some(Curve::Quadratic),
            "sqrt" => Some(Curve::Sqrt),
            _ => None,
        }
    }

    fn apply(self, fraction: f64) -> f64 {
        match self {
            Curve::Linear => fraction,
            Curve::Quadratic => fraction * fraction,
            Curve::Sqrt => fraction.abs().sqrt(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SampleOp {
    /// Pop a distribution, push one random element.
    Draw,
    /// Pop source then count, push a drawn sub-distribution.
    Take { with_replacement: bool },
    /// Pop high then low, push a uniform draw between them.
    Uniform,
    /// Pop std then mean, push a normal draw.
    Normal,
}

/// An if/elif/else compiled for the machine: each arm is a condition
/// chain and a body chain; the first true condition wins.
#[derive(Clone, Debug)]
pub struct ConditionalChain {
    pub arms: Vec<(Vec<Action>, Vec<Action>)>,
    pub otherwise: Option<Vec<Action>>,
}

// The in-memory action format. A handler body is a Vec<Action>;
// sub-chains (conditional arms, config defaults) nest inside.
#[derive(Clone, Debug)]
pub enum Action {
    Push(EngineValue),
    Binary(BinaryOp),
    Unary(UnaryOp),
    Function(FunctionOp),
    Concat,
    Slice,
    Cast { to: Units, force: bool },
    Save(String),
    Resolve(String),
    Limit,
    MapRange { curve: Curve },
    Sample(SampleOp),
    Create { prototype: String, counted: bool },
    Query { target: String },
    External { name: String, timed: bool },
    Config { name: String, default: Option<Arc<Vec<Action>>> },
    Branch(Arc<ConditionalChain>),
    Dup,
    Swap,
    Drop,
    End,
}

pub struct Machine<'a> {
    stack: Vec<EngineValue>,
    locals: HashMap<String, EngineValue>,
    ended: bool,
    scope: &'a mut dyn HostScope,
}

impl<'a> Machine<'a> {
    pub fn new(scope: &'a mut dyn HostScope) -> Machine<'a> {
        Machine::with_locals(scope, HashMap::new())
    }

    /// A machine with pre-bound locals; conversion callables get
    /// `current` this way.
    pub fn with_locals(
        scope: &'a mut dyn HostScope,
        locals: HashMap<String, EngineValue>,
    ) -> Machine<'a> {
        Machine {
            stack: Vec::new(),
            locals,
            ended: false,
            scope,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: EngineValue) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> EngineResult<EngineValue> {
        self.stack.pop().ok_or(JoshError::Underflow)
    }

    fn pop_integer(&mut self) -> EngineResult<i64> {
        self.pop()?.as_integer()
    }

    fn pop_bool(&mut self) -> EngineResult<bool> {
        self.pop()?.as_bool()
    }

    /// Run a chain until it ends or runs dry.
    pub fn run(&mut self, chain: &[Action]) -> EngineResult<()> {
        for action in chain {
            if self.ended {
                break;
            }
            self.apply(action)?;
        }
        Ok(())
    }

    /// Run a full handler body and take its return value.
    pub fn execute(mut self, chain: &[Action]) -> EngineResult<EngineValue> {
        self.run(chain)?;
        if !self.ended {
            return Err(JoshError::NoReturn);
        }
        self.pop()
    }

    /// Run a bare expression chain (no End) and take the result.
    pub fn evaluate(mut self, chain: &[Action]) -> EngineResult<EngineValue> {
        self.run(chain)?;
        self.pop()
    }

    fn apply(&mut self, action: &Action) -> EngineResult<()> {
        match action {
            Action::Push(value) => {
                self.push(value.clone());
                Ok(())
            }
            Action::Binary(op) => self.binary(*op),
            Action::Unary(op) => self.unary(*op),
            Action::Function(op) => {
                let value = self.pop()?;
                self.push(value.call(*op)?);
                Ok(())
            }
            Action::Concat => self.concat(),
            Action::Slice => self.slice(),
            Action::Cast { to, force } => {
                let value = self.pop()?;
                let out = value.cast(to, *force, self.scope.converter())?;
                self.push(out);
                Ok(())
            }
            Action::Save(name) => {
                let value = self.pop()?;
                self.locals.insert(name.clone(), value);
                Ok(())
            }
            Action::Resolve(name) => {
                // Locals shadow everything else in the chain.
                let value = match self.locals.get(name) {
                    Some(value) => value.clone(),
                    None => self.scope.resolve(name)?,
                };
                self.push(value);
                Ok(())
            }
            Action::Limit => self.limit(),
            Action::MapRange { curve } => self.map_range(*curve),
            Action::Sample(op) => self.sample(*op),
            Action::Create { prototype, counted } => {
                let count = if *counted { self.pop_integer()? } else { 1 };
                if count < 0 {
                    return Err(arithmetic(format!("create with negative count {}", count)));
                }
                let created = self.scope.create(prototype, count)?;
                self.push(created);
                Ok(())
            }
            Action::Query { target } => {
                let distance = self.pop()?;
                let found = self.scope.spatial_query(target, distance)?;
                self.push(found);
                Ok(())
            }
            Action::External { name, timed } => {
                let time = if *timed { Some(self.pop()?) } else { None };
                let data = self.scope.external_data(name, time)?;
                self.push(data);
                Ok(())
            }
            Action::Config { name, default } => {
                match self.scope.config_value(name)? {
                    Some(value) => self.push(value),
                    None => match default {
                        Some(chain) => self.run(chain)?,
                        None => {
                            return Err(JoshError::UnresolvedConfig(name.clone()))
                        }
                    },
                }
                Ok(())
            }
            Action::Branch(chain) => self.branch(chain),
            Action::Dup => {
                let top = self.pop()?;
                self.push(top.clone());
                self.push(top);
                Ok(())
            }
            Action::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(a);
                Ok(())
            }
            Action::Drop => {
                self.pop()?;
                Ok(())
            }
            Action::End => {
                self.ended = true;
                Ok(())
            }
        }
    }

    fn binary(&mut self, op: BinaryOp) -> EngineResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let conv = self.scope.converter();
        let out = match op {
            BinaryOp::Add => a.add(&b, conv),
            BinaryOp::Sub => a.sub(&b, conv),
            BinaryOp::Mul => a.mul(&b, conv),
            BinaryOp::Div => a.div(&b, conv),
            BinaryOp::Pow => a.pow(&b, conv),
            BinaryOp::And => a.and(&b),
            BinaryOp::Or => a.or(&b),
            BinaryOp::Xor => a.xor(&b),
            BinaryOp::Lt => a.lt(&b, conv),
            BinaryOp::Gt => a.gt(&b, conv),
            BinaryOp::Lte => a.lte(&b, conv),
            BinaryOp::Gte => a.gte(&b, conv),
            BinaryOp::Eq => a.equals(&b, conv),
            BinaryOp::Neq => a.equals(&b, conv)?.not(),
        }?;
        self.push(out);
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp) -> EngineResult<()> {
        let value = self.pop()?;
        let out = match op {
            UnaryOp::Neg => value.neg(),
            UnaryOp::Not => value.not(),
        }?;
        self.push(out);
        Ok(())
    }

    // Pop high, low, value; clamp value into [low, high] after
    // bringing the bounds into its units.
    fn limit(&mut self) -> EngineResult<()> {
        let high = self.pop()?;
        let low = self.pop()?;
        let value = self.pop()?;
        let conv = self.scope.converter();
        let out = if value.lt(&low, conv)?.as_bool()? {
            low.cast(&value.units(), false, conv)?
        } else if value.gt(&high, conv)?.as_bool()? {
            high.cast(&value.units(), false, conv)?
        } else {
            value
        };
        self.push(out);
        Ok(())
    }

    // Pop to-high, to-low, from-high, from-low, value; rescale the
    // value's position in the source interval onto the target one.
    fn map_range(&mut self, curve: Curve) -> EngineResult<()> {
        let to_high = self.pop()?;
        let to_low = self.pop()?;
        let from_high = self.pop()?;
        let from_low = self.pop()?;
        let value = self.pop()?;
        let conv = self.scope.converter();

        let v = to_f64(&value)?;
        let a = to_f64(&from_low.cast(&value.units(), false, conv)?)?;
        let b = to_f64(&from_high.cast(&value.units(), false, conv)?)?;
        if (b - a).abs() < f64::EPSILON {
            return Err(arithmetic("map with an empty source interval"));
        }
        let fraction = curve.apply((v - a) / (b - a));

        let units = to_low.units();
        let c = to_f64(&to_low)?;
        let d = to_f64(&to_high.cast(&units, false, conv)?)?;
        let out = c + fraction * (d - c);
        let out = BigDecimal::from_f64(out)
            .ok_or_else(|| arithmetic("map result out of range"))?;
        self.push(EngineValue::Decimal(out.with_scale(12), units));
        Ok(())
    }

    fn sample(&mut self, op: SampleOp) -> EngineResult<()> {
        let out = match op {
            SampleOp::Draw => {
                let value = self.pop()?;
                match value {
                    EngineValue::Distribution(d) => {
                        let realized = d.realize()?;
                        let r = self.scope.random_f64();
                        let index =
                            ((r * realized.len() as f64) as usize).min(realized.len() - 1);
                        realized.values()[index].clone()
                    }
                    scalar => scalar,
                }
            }
            SampleOp::Take { with_replacement } => {
                let source = self.pop()?;
                let count = self.pop_integer()?;
                if count <= 0 {
                    return Err(arithmetic(format!("sample of {} elements", count)));
                }
                let realized = match source {
                    EngineValue::Distribution(d) => d.realize()?,
                    scalar => RealizedDistribution::from_values(vec![scalar])?,
                };
                let drawn = realized.contents(count as usize, with_replacement);
                RealizedDistribution::new(drawn, realized.units())?.into_value()
            }
            SampleOp::Uniform => {
                let high = self.pop()?;
                let low = self.pop()?;
                let units = low.units();
                let high = high.cast(&units, false, self.scope.converter())?;
                let a = to_f64(&low)?;
                let b = to_f64(&high)?;
                let r = self.scope.random_f64();
                let out = BigDecimal::from_f64(a + r * (b - a))
                    .ok_or_else(|| arithmetic("uniform sample out of range"))?;
                EngineValue::Decimal(out.with_scale(12), units)
            }
            SampleOp::Normal => {
                let std = self.pop()?;
                let mean = self.pop()?;
                let units = mean.units();
                let std = std.cast(&units, false, self.scope.converter())?;
                let m = to_f64(&mean)?;
                let s = to_f64(&std)?;
                // Box-Muller from two uniform draws.
                let u1 = self.scope.random_f64().max(f64::MIN_POSITIVE);
                let u2 = self.scope.random_f64();
                let z = (-2.0 * u1.ln()).sqrt()
                    * (2.0 * std::f64::consts::PI * u2).cos();
                let out = BigDecimal::from_f64(m + z * s)
                    .ok_or_else(|| arithmetic("normal sample out of range"))?;
                EngineValue::Decimal(out.with_scale(12), units)
            }
        };
        self.push(out);
        Ok(())
    }

    // Pop b, a; append b's elements after a's, in a's units.
    fn concat(&mut self) -> EngineResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let left = as_realized(a)?;
        let right = as_realized(b)?;
        let units = left.units();
        let mut values = left.values().to_vec();
        let conv = self.scope.converter();
        for value in right.values() {
            values.push(if value.units() == units {
                value.clone()
            } else {
                conv.convert(value.clone(), &units)?
            });
        }
        self.push(RealizedDistribution::new(values, units)?.into_value());
        Ok(())
    }

    // Pop end, start, distribution; push the [start, end) slice.
    fn slice(&mut self) -> EngineResult<()> {
        let end = self.pop_integer()?;
        let start = self.pop_integer()?;
        let source = self.pop()?;
        let realized = as_realized(source)?;
        let len = realized.len() as i64;
        if start < 0 || end > len || start >= end {
            return Err(arithmetic(format!(
                "slice [{}, {}) out of bounds for length {}",
                start, end, len
            )));
        }
        let values = realized.values()[start as usize..end as usize].to_vec();
        self.push(RealizedDistribution::new(values, realized.units())?.into_value());
        Ok(())
    }

    fn branch(&mut self, chain: &Arc<ConditionalChain>) -> EngineResult<()> {
        for (cond, body) in &chain.arms {
            self.run(cond)?;
            if self.pop_bool()? {
                return self.run(body);
            }
        }
        match &chain.otherwise {
            Some(body) => self.run(body),
            None => Err(JoshError::NoReturn),
        }
    }
}

fn as_realized(value: EngineValue) -> EngineResult<RealizedDistribution> {
    match value {
        EngineValue::Distribution(d) => d.realize(),
        scalar => RealizedDistribution::from_values(vec![scalar]),
    }
}

fn to_f64(value: &EngineValue) -> EngineResult<f64> {
    use bigdecimal::ToPrimitive;
    value
        .to_decimal()?
        .to_f64()
        .ok_or_else(|| arithmetic("value out of range"))
}
