//! Ion types written as `[M+Na]+`, `[M-H2O+H]+` or `[M-H]-`.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;

use chemical_elements::{ChemicalComposition, ElementSpecification};
use thiserror::Error;

use crate::scan::Polarity;

pub const ELECTRON_MASS: f64 = 0.00054857990946;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IonTypeParseError {
    #[error("Ion type {0:?} is not of the form [M...]z")]
    MalformedNotation(String),
    #[error("Ion type {0:?} has an empty formula term")]
    EmptyTerm(String),
    #[error("Unknown element {1:?} in ion type {0:?}")]
    UnknownElement(String, String),
    #[error("Ion type {0:?} has an invalid charge")]
    InvalidCharge(String),
}

/// An adduct or in-source modification of a neutral molecule carrying a charge.
///
/// Ion types compare by their canonical notation.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(into = "String", try_from = "String")
)]
pub struct IonType {
    name: String,
    charge: i32,
    adduct_mass: f64,
    unknown: bool,
}

impl IonType {
    /// The placeholder type of an ion whose adduct could not be determined. Masses are
    /// computed as if it were protonated or deprotonated.
    pub fn unknown(polarity: Polarity) -> Self {
        let charge = polarity.charge();
        let name = if charge < 0 { "[M+?]-" } else { "[M+?]+" };
        Self {
            name: name.to_string(),
            charge,
            adduct_mass: charge as f64 * chemical_elements::PROTON,
            unknown: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn charge(&self) -> i32 {
        self.charge
    }

    pub fn polarity(&self) -> Polarity {
        Polarity::from_charge(self.charge)
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    /// Whether this is the plain protonated or deprotonated ion
    pub fn is_common(&self) -> bool {
        self.name == "[M+H]+" || self.name == "[M-H]-"
    }

    /// The mass added to the neutral molecule, electrons included
    pub fn adduct_mass(&self) -> f64 {
        self.adduct_mass
    }

    pub fn mz(&self, neutral_mass: f64) -> f64 {
        (neutral_mass + self.adduct_mass) / self.charge.unsigned_abs().max(1) as f64
    }

    pub fn neutral_mass(&self, mz: f64) -> f64 {
        mz * self.charge.unsigned_abs().max(1) as f64 - self.adduct_mass
    }
}

fn parse_charge(notation: &str, suffix: &str) -> Result<i32, IonTypeParseError> {
    let invalid = || IonTypeParseError::InvalidCharge(notation.to_string());
    let sign = match suffix.chars().last() {
        Some('+') => 1,
        Some('-') => -1,
        _ => return Err(invalid()),
    };
    let digits = &suffix[..suffix.len() - 1];
    let magnitude = if digits.is_empty() {
        1
    } else {
        digits.parse::<i32>().map_err(|_| invalid())?
    };
    if magnitude == 0 {
        return Err(invalid());
    }
    Ok(sign * magnitude)
}

fn add_formula(
    notation: &str,
    formula: &str,
    sign: i32,
    counts: &mut BTreeMap<String, i32>,
) -> Result<(), IonTypeParseError> {
    let split = formula
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(formula.len());
    let (multiplier, formula) = formula.split_at(split);
    let sign = if multiplier.is_empty() {
        sign
    } else {
        sign * multiplier
            .parse::<i32>()
            .map_err(|_| IonTypeParseError::EmptyTerm(notation.to_string()))?
    };
    if formula.is_empty() {
        return Err(IonTypeParseError::EmptyTerm(notation.to_string()));
    }
    let mut chars = formula.chars().peekable();
    while let Some(c) = chars.next() {
        if !c.is_ascii_uppercase() {
            return Err(IonTypeParseError::UnknownElement(
                notation.to_string(),
                c.to_string(),
            ));
        }
        let mut symbol = c.to_string();
        while let Some(l) = chars.next_if(|l| l.is_ascii_lowercase()) {
            symbol.push(l);
        }
        let mut digits = String::new();
        while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
            digits.push(d);
        }
        let count = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<i32>()
                .map_err(|_| IonTypeParseError::EmptyTerm(notation.to_string()))?
        };
        *counts.entry(symbol).or_default() += sign * count;
    }
    Ok(())
}

fn formula_mass(notation: &str, counts: &BTreeMap<String, i32>) -> Result<f64, IonTypeParseError> {
    let mut composition = ChemicalComposition::new();
    for (symbol, count) in counts {
        let element = ElementSpecification::parse(symbol).map_err(|_| {
            IonTypeParseError::UnknownElement(notation.to_string(), symbol.clone())
        })?;
        composition.set(element, *count);
    }
    Ok(composition.mass())
}

impl FromStr for IonType {
    type Err = IonTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let notation = s.trim();
        let malformed = || IonTypeParseError::MalformedNotation(notation.to_string());
        let body = notation.strip_prefix("[M").ok_or_else(malformed)?;
        let (terms, charge) = body.split_once(']').ok_or_else(malformed)?;
        let charge = parse_charge(notation, charge)?;

        let mut counts = BTreeMap::new();
        let mut unknown = false;
        let mut rest = terms;
        while !rest.is_empty() {
            let sign = match rest.as_bytes()[0] {
                b'+' => 1,
                b'-' => -1,
                _ => return Err(malformed()),
            };
            rest = &rest[1..];
            let end = rest.find(['+', '-']).unwrap_or(rest.len());
            let term = &rest[..end];
            if term == "?" {
                unknown = true;
            } else {
                add_formula(notation, term, sign, &mut counts)?;
            }
            rest = &rest[end..];
        }
        if unknown {
            return Ok(IonType::unknown(Polarity::from_charge(charge)));
        }
        let delta = formula_mass(notation, &counts)?;
        Ok(Self {
            name: notation.to_string(),
            charge,
            adduct_mass: delta - charge as f64 * ELECTRON_MASS,
            unknown: false,
        })
    }
}

impl TryFrom<String> for IonType {
    type Error = IonTypeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IonType> for String {
    fn from(value: IonType) -> Self {
        value.name
    }
}

impl Display for IonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl PartialEq for IonType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for IonType {}

impl Hash for IonType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for IonType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IonType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

/// Parse a list of ion type notations, failing on the first invalid one
pub fn parse_ion_types<S: AsRef<str>>(notations: &[S]) -> Result<Vec<IonType>, IonTypeParseError> {
    notations.iter().map(|s| s.as_ref().parse()).collect()
}
