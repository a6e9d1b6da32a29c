// The dimensional algebra carried by every engine value.
//
// A unit is an ordered pair of multisets over atomic symbol strings:
// numerator atoms and denominator atoms, each with a positive integer
// exponent. BTreeMap keeps the atoms sorted, which gives structural
// equality, hashing, and a canonical serialization for free.
//
// Invariants, maintained by simplify():
//  - numerator and denominator share no atom;
//  - every stored exponent is >= 1;
//  - EMPTY (both maps empty) is the multiplicative identity.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineResult, JoshError};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Units {
    numer: BTreeMap<String, u32>,
    denom: BTreeMap<String, u32>,
}

impl Units {
    /// The dimensionless identity.
    pub fn empty() -> Units {
        Units::default()
    }

    /// A single numerator atom with exponent one.
    pub fn atom(name: &str) -> Units {
        let mut numer = BTreeMap::new();
        numer.insert(name.to_string(), 1);
        Units {
            numer,
            denom: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.numer.is_empty() && self.denom.is_empty()
    }

    /// Parse the canonical grammar: `a * b * ... / x * y * ...`, with
    /// at most one `/`. A single token is a unit alias. `%` is an
    /// ordinary atom.
    pub fn parse(text: &str) -> EngineResult<Units> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Units::empty());
        }
        let mut halves = text.split('/');
        let numer = halves.next().unwrap_or("");
        let denom = halves.next();
        if halves.next().is_some() {
            return Err(JoshError::Parse {
                line: 0,
                col: 0,
                message: format!("unit '{}' has more than one '/'", text),
            });
        }
        let mut units = Units::empty();
        for atom in Self::parse_product(numer)? {
            *units.numer.entry(atom).or_insert(0) += 1;
        }
        if let Some(denom) = denom {
            let atoms = Self::parse_product(denom)?;
            if atoms.is_empty() {
                return Err(JoshError::Parse {
                    line: 0,
                    col: 0,
                    message: format!("unit '{}' has an empty denominator", text),
                });
            }
            for atom in atoms {
                *units.denom.entry(atom).or_insert(0) += 1;
            }
        }
        Ok(units.simplify())
    }

    fn parse_product(text: &str) -> EngineResult<Vec<String>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        text.split('*')
            .map(|atom| {
                let atom = atom.trim();
                let valid = atom == "%"
                    || (!atom.is_empty()
                        && atom
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
                if valid {
                    Ok(atom.to_string())
                } else {
                    Err(JoshError::Parse {
                        line: 0,
                        col: 0,
                        message: format!("invalid unit atom '{}'", atom),
                    })
                }
            })
            .collect()
    }

    /// Cancel atoms shared by numerator and denominator.
    pub fn simplify(mut self) -> Units {
        let shared: Vec<String> = self
            .numer
            .keys()
            .filter(|k| self.denom.contains_key(*k))
            .cloned()
            .collect();
        for atom in shared {
            let n = self.numer[&atom];
            let d = self.denom[&atom];
            if n > d {
                self.numer.insert(atom.clone(), n - d);
                self.denom.remove(&atom);
            } else if d > n {
                self.denom.insert(atom.clone(), d - n);
                self.numer.remove(&atom);
            } else {
                self.numer.remove(&atom);
                self.denom.remove(&atom);
            }
        }
        self.numer.retain(|_, e| *e > 0);
        self.denom.retain(|_, e| *e > 0);
        self
    }

    pub fn multiply(&self, other: &Units) -> Units {
        let mut out = self.clone();
        for (atom, exp) in &other.numer {
            *out.numer.entry(atom.clone()).or_insert(0) += exp;
        }
        for (atom, exp) in &other.denom {
            *out.denom.entry(atom.clone()).or_insert(0) += exp;
        }
        out.simplify()
    }

    pub fn divide(&self, other: &Units) -> Units {
        self.multiply(&other.invert())
    }

    pub fn invert(&self) -> Units {
        Units {
            numer: self.denom.clone(),
            denom: self.numer.clone(),
        }
    }

    /// Raise to an integer power. Zero collapses to EMPTY; negative
    /// powers invert.
    pub fn raise(&self, power: i64) -> Units {
        if power == 0 {
            return Units::empty();
        }
        let base = if power < 0 { self.invert() } else { self.clone() };
        let n = power.unsigned_abs() as u32;
        let scale = |map: &BTreeMap<String, u32>| {
            map.iter()
                .map(|(atom, exp)| (atom.clone(), exp * n))
                .collect()
        };
        Units {
            numer: scale(&base.numer),
            denom: scale(&base.denom),
        }
    }
}

impl fmt::Display for Units {
    /// Canonical form `a * b / x * y`. An empty numerator omits the
    /// product, a missing denominator omits the `/`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let side = |map: &BTreeMap<String, u32>| {
            map.iter()
                .flat_map(|(atom, exp)| std::iter::repeat(atom.clone()).take(*exp as usize))
                .collect::<Vec<_>>()
                .join(" * ")
        };
        if self.numer.is_empty() && self.denom.is_empty() {
            return Ok(());
        }
        write!(f, "{}", side(&self.numer))?;
        if !self.denom.is_empty() {
            if !self.numer.is_empty() {
                write!(f, " ")?;
            }
            write!(f, "/ {}", side(&self.denom))?;
        }
        Ok(())
    }
}
