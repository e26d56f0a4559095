// =============================================================================
// Shared types used across the openrange trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a trade or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Used by the shared excursion math.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Which of the two breakout families produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    /// Standard Order — evaluated once at open+45m.
    So,
    /// Opening Range Reversal — V-shaped recovery, bullish only.
    Orr,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::So => write!(f, "SO"),
            Self::Orr => write!(f, "ORR"),
        }
    }
}

/// Broker environment the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Prod,
}

impl Environment {
    /// Short identifier used in state file names (`tokens_{env}.json`).
    pub fn key(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(format!("unknown environment '{other}' (expected sandbox|prod)")),
        }
    }
}

/// Whether orders reach the broker or a local simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Demo,
    Live,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

impl std::str::FromStr for TradeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "demo" => Ok(Self::Demo),
            "live" => Ok(Self::Live),
            other => Err(format!("unknown trade mode '{other}' (expected demo|live)")),
        }
    }
}

/// Trailing regime a position is tagged with at entry. Controls the trailing
/// distance profile in the exit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeRegime {
    /// Fast movers — tight trail that compresses as profit grows.
    Explosive,
    /// Let-it-run profile — wide trail, staged tightening at +7% and +15%.
    Moon,
    /// Constant-distance default.
    Balanced,
}

impl Default for TradeRegime {
    fn default() -> Self {
        Self::Balanced
    }
}

impl std::fmt::Display for TradeRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explosive => write!(f, "explosive"),
            Self::Moon => write!(f, "moon"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction_and_opposite() {
        assert_eq!(Side::Long.direction(), 1.0);
        assert_eq!(Side::Short.direction(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn environment_parses_both_spellings() {
        assert_eq!("sandbox".parse::<Environment>().unwrap(), Environment::Sandbox);
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("paper".parse::<Environment>().is_err());
    }

    #[test]
    fn display_matches_wire_labels() {
        assert_eq!(SignalType::So.to_string(), "SO");
        assert_eq!(SignalType::Orr.to_string(), "ORR");
        assert_eq!(Side::Long.to_string(), "LONG");
        assert_eq!(Environment::Prod.to_string(), "prod");
    }
}
