//! Concrete host populations and the small name-based registry that selects
//! one for `promemu-cli`.
//!
//! Each population is a `HostPopulation` that builds a ready-to-run
//! `MixerConfig` from a set of overridable defaults, replacing a reflective
//! module-inspection loader with an explicit match over known names.

pub mod populations;

use promemu_core::mixer::MixerConfig;
use promemu_core::ConfigError;

/// Knobs a caller can override when building a population. Every field left
/// `None` falls back to that population's own default.
#[derive(Debug, Clone, Default)]
pub struct PopulationOverrides {
    pub hosts_count: Option<usize>,
    pub host_ttl: Option<f64>,
    pub host_interval_range: Option<(f64, f64)>,
    pub metrics_interval: Option<f64>,
    pub split_jobs: Option<bool>,
}

impl PopulationOverrides {
    pub fn none() -> Self {
        Self::default()
    }
}

/// A named, parameterized way to build a `MixerConfig`.
pub trait HostPopulation: Send + Sync {
    /// The name this population is registered under, used in CLI help and
    /// error messages.
    fn name(&self) -> &'static str;

    /// A short description for `--help` / listing output.
    fn description(&self) -> &'static str;

    fn build(&self, overrides: &PopulationOverrides) -> MixerConfig;
}

const AVAILABLE: &[&str] = &[
    populations::single_host_load::NAME,
    populations::hosts_load_with_peaks::NAME,
];

pub fn available_populations() -> &'static [&'static str] {
    AVAILABLE
}

/// Resolves a population by name, replacing the reflective
/// import-module/inspect-classes/pick-one pipeline with an explicit match.
pub fn load_population(name: &str) -> Result<Box<dyn HostPopulation>, ConfigError> {
    match name {
        populations::single_host_load::NAME => Ok(Box::new(populations::single_host_load::SingleHostLoad)),
        populations::hosts_load_with_peaks::NAME => {
            Ok(Box::new(populations::hosts_load_with_peaks::HostsLoadWithPeaks))
        }
        other => Err(ConfigError::UnknownPopulation {
            name: other.to_string(),
            available: AVAILABLE.join(", "),
        }),
    }
}
