use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// Hartree expressed in each unit.
const CM_INV: f64 = 219_474.631_363_20;
const EV: f64 = 27.211_386_245_988;
const KCAL_MOL: f64 = 627.509_474_063_1;
const KJ_MOL: f64 = 2_625.499_639_479_9;
const KELVIN: f64 = 315_775.024_804_07;

/// Energy units understood by the sampler. Hartree is canonical: backends
/// report hartree and every threshold comparison happens in hartree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EnergyUnit {
    Hartree,
    #[default]
    Wavenumber,
    ElectronVolt,
    KcalPerMol,
    KjPerMol,
    Kelvin,
}

impl EnergyUnit {
    /// Size of one hartree in this unit.
    fn per_hartree(self) -> f64 {
        match self {
            EnergyUnit::Hartree => 1.0,
            EnergyUnit::Wavenumber => CM_INV,
            EnergyUnit::ElectronVolt => EV,
            EnergyUnit::KcalPerMol => KCAL_MOL,
            EnergyUnit::KjPerMol => KJ_MOL,
            EnergyUnit::Kelvin => KELVIN,
        }
    }

    pub fn to_hartree(self, value: f64) -> f64 {
        value / self.per_hartree()
    }

    pub fn from_hartree(self, value: f64) -> f64 {
        value * self.per_hartree()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnergyUnit::Hartree => "hartree",
            EnergyUnit::Wavenumber => "cm-1",
            EnergyUnit::ElectronVolt => "eV",
            EnergyUnit::KcalPerMol => "kcal/mol",
            EnergyUnit::KjPerMol => "kJ/mol",
            EnergyUnit::Kelvin => "K",
        }
    }
}

pub fn convert(value: f64, from: EnergyUnit, to: EnergyUnit) -> f64 {
    to.from_hartree(from.to_hartree(value))
}

impl FromStr for EnergyUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim().to_ascii_lowercase().as_str() {
            "hartree" | "eh" | "au" => EnergyUnit::Hartree,
            "cm-1" | "cm^-1" | "cm⁻¹" => EnergyUnit::Wavenumber,
            "ev" => EnergyUnit::ElectronVolt,
            "kcal/mol" => EnergyUnit::KcalPerMol,
            "kj/mol" => EnergyUnit::KjPerMol,
            "k" => EnergyUnit::Kelvin,
            _ => return Err(ConfigError::UnknownUnit(s.to_string())),
        };
        Ok(unit)
    }
}

impl TryFrom<String> for EnergyUnit {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EnergyUnit> for String {
    fn from(u: EnergyUnit) -> Self {
        u.as_str().to_string()
    }
}

impl fmt::Display for EnergyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
