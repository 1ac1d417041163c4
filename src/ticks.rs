// =============================================================================
// Tick-Economics Registry — symbol root -> tick size / tick value
// =============================================================================
//
// Static table built from configuration at startup. Lookups never return a
// default: an unknown root is a hard UnitsError carrying the set of known
// roots, which is how config gaps surface instead of silently pricing P&L
// at zero.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::domain::TickEconomics;
use crate::errors::RiskError;

/// Broker symbol aliases. Some feeds use exchange-native roots (e.g. CQG's
/// `ENQ` for the E-mini Nasdaq) while the tick table is keyed by the common
/// root.
const SYMBOL_ALIASES: &[(&str, &str)] = &[("ENQ", "NQ"), ("EP", "ES")];

/// Immutable registry of tick economics, keyed by normalized symbol root.
#[derive(Debug, Clone)]
pub struct TickRegistry {
    table: HashMap<String, TickEconomics>,
    aliases: HashMap<String, String>,
}

impl TickRegistry {
    /// Build a registry from the configured tick table.
    ///
    /// Zero tick sizes or values are refused here as well as at config
    /// validation, so a registry can never hand out unusable economics.
    pub fn new(table: HashMap<String, TickEconomics>) -> Result<Self, RiskError> {
        for (root, econ) in &table {
            if econ.tick_size <= Decimal::ZERO {
                return Err(RiskError::config(format!(
                    "tick_values.{root}: tick size must be positive, got {}",
                    econ.tick_size
                )));
            }
            if econ.tick_value.amount() <= Decimal::ZERO {
                return Err(RiskError::config(format!(
                    "tick_values.{root}: tick value must be positive, got {}",
                    econ.tick_value
                )));
            }
        }

        let aliases = SYMBOL_ALIASES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();

        Ok(Self { table, aliases })
    }

    /// Resolve an already-uppercased root through the alias table.
    pub fn resolve_alias<'a>(&'a self, root: &'a str) -> &'a str {
        self.aliases.get(root).map(String::as_str).unwrap_or(root)
    }

    /// Look up tick economics for a root (alias-resolved). Never defaults.
    pub fn get(&self, root: &str) -> Result<TickEconomics, RiskError> {
        let resolved = self.resolve_alias(root);
        self.table.get(resolved).copied().ok_or_else(|| RiskError::Units {
            symbol: root.to_string(),
            known: self.known_roots().join(", "),
        })
    }

    /// Whether a root (after aliasing) is known to the table.
    pub fn contains(&self, root: &str) -> bool {
        self.table.contains_key(self.resolve_alias(root))
    }

    /// Sorted list of known roots, used in UnitsError messages.
    pub fn known_roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self.table.keys().cloned().collect();
        roots.sort();
        roots
    }
}
