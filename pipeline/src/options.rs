//! Process-wide engine options with snapshot/restore semantics.
//!
//! `set` operations mutate these for the remainder of the in-flight
//! program only: a [`crate::program::Program`] snapshots the current
//! values on construction and restores them when dropped, isolating
//! sequential programs in the same process.

use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{PipelineError, Result};

/// Auxiliary climatology source used by derivations.
#[derive(
    Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum ClimatologySource {
    #[default]
    Disabled,
    Afgl86,
    Usstd76,
}

/// How uncertainties aggregate when samples are combined.
#[derive(
    Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum UncertaintyPropagation {
    #[default]
    Uncorrelated,
    Correlated,
}

/// What regridding writes for target points outside the source axis.
#[derive(
    Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum RegridOutOfBounds {
    #[default]
    Nan,
    Edge,
    Extrapolate,
}

/// The full engine option block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    pub climatology: ClimatologySource,
    pub collocation_datetime: bool,
    pub propagate_uncertainty: UncertaintyPropagation,
    pub regrid_out_of_bounds: RegridOutOfBounds,
}

static OPTIONS: Lazy<Mutex<EngineOptions>> = Lazy::new(|| Mutex::new(EngineOptions::default()));

/// Read the current process-wide options.
pub fn current() -> EngineOptions {
    *OPTIONS.lock().expect("engine options lock poisoned")
}

/// Replace the process-wide options wholesale (snapshot restore).
pub fn restore(options: EngineOptions) {
    *OPTIONS.lock().expect("engine options lock poisoned") = options;
}

/// Apply one `set(option, value)` mutation. Unknown options and values
/// are operation errors.
pub fn apply_set(option: &str, value: &str) -> Result<()> {
    let mut options = OPTIONS.lock().expect("engine options lock poisoned");
    match option {
        "afgl86" => {
            options.climatology = match value {
                "enabled" => ClimatologySource::Afgl86,
                "disabled" => ClimatologySource::Disabled,
                "usstd76" => ClimatologySource::Usstd76,
                _ => return Err(invalid_value(option, value)),
            };
        }
        "collocation_datetime" => {
            options.collocation_datetime = match value {
                "enabled" => true,
                "disabled" => false,
                _ => return Err(invalid_value(option, value)),
            };
        }
        "propagate_uncertainty" => {
            options.propagate_uncertainty = UncertaintyPropagation::from_str(value)
                .map_err(|_| invalid_value(option, value))?;
        }
        "regrid_out_of_bounds" => {
            options.regrid_out_of_bounds =
                RegridOutOfBounds::from_str(value).map_err(|_| invalid_value(option, value))?;
        }
        _ => {
            return Err(PipelineError::operation(format!("invalid option '{option}'")));
        }
    }
    Ok(())
}

fn invalid_value(option: &str, value: &str) -> PipelineError {
    PipelineError::operation(format!("invalid value '{value}' for option '{option}'"))
}

/// Serializes tests that touch the process-wide option cell.
#[cfg(test)]
pub(crate) static TEST_GUARD: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_mutates_and_restore_rolls_back() {
        let _guard = TEST_GUARD.lock().unwrap();
        let snapshot = current();

        apply_set("afgl86", "usstd76").unwrap();
        apply_set("regrid_out_of_bounds", "edge").unwrap();
        apply_set("collocation_datetime", "enabled").unwrap();
        apply_set("propagate_uncertainty", "correlated").unwrap();
        let mutated = current();
        assert_eq!(mutated.climatology, ClimatologySource::Usstd76);
        assert_eq!(mutated.regrid_out_of_bounds, RegridOutOfBounds::Edge);
        assert!(mutated.collocation_datetime);
        assert_eq!(
            mutated.propagate_uncertainty,
            UncertaintyPropagation::Correlated
        );

        assert!(apply_set("afgl86", "sometimes").is_err());
        assert!(apply_set("gravity", "off").is_err());

        restore(snapshot);
        assert_eq!(current(), snapshot);
    }
}
