// ABOUTME: TOML configuration for simulations - times, solver, allocation, logging, results
// ABOUTME: Unknown keys are rejected; defaults mirror what a bare simulation needs

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::allocation::model::{AllocationOptions, SourcePriorities};
use crate::engine::core::error::HydronetError;
use crate::engine::network::builder::ModelSpec;
use crate::engine::solver::integrator::{Algorithm, SolverOptions};

/// Complete simulation configuration as read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Simulation start, ISO-8601 without timezone.
    pub starttime: String,
    /// Simulation end, ISO-8601 without timezone.
    pub endtime: String,
    /// Coordinate reference system tag carried into results metadata.
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Version the file was written for; mismatch warns, never fails.
    #[serde(default)]
    pub hydronet_version: Option<String>,
    #[serde(default)]
    pub interpolation: InterpolationConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub experimental: ExperimentalConfig,
    /// The network itself, written inline as data tables.
    #[serde(default)]
    pub model: ModelSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InterpolationConfig {
    /// "linear" or "block".
    pub flow_boundary: String,
    /// Smoothing window [s] after each breakpoint in block mode.
    pub block_transition_period: f64,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            flow_boundary: "linear".to_string(),
            block_transition_period: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AllocationConfig {
    /// Seconds between allocation solves.
    pub timestep: f64,
    pub source_priority: SourcePriorityConfig,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            timestep: 86_400.0,
            source_priority: SourcePriorityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SourcePriorityConfig {
    pub user_demand: u32,
    pub flow_boundary: u32,
    pub level_boundary: u32,
    pub basin: u32,
    pub subnetwork_inlet: u32,
}

impl Default for SourcePriorityConfig {
    fn default() -> Self {
        let defaults = SourcePriorities::default();
        Self {
            user_demand: defaults.user_demand,
            flow_boundary: defaults.flow_boundary,
            level_boundary: defaults.level_boundary,
            basin: defaults.basin,
            subnetwork_inlet: defaults.subnetwork_inlet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SolverConfig {
    /// "bdf2" (default) or "implicit_euler".
    pub algorithm: String,
    /// Save interval [s]; 0 saves at every accepted step.
    pub saveat: f64,
    pub dt: Option<f64>,
    pub dtmin: f64,
    pub dtmax: f64,
    pub force_dtmin: bool,
    pub abstol: f64,
    pub reltol: f64,
    pub water_balance_abstol: f64,
    pub water_balance_reltol: f64,
    pub maxiters: u64,
    pub sparse: bool,
    pub autodiff: bool,
    /// Whether evaporation removes tracer mass; consumed by the
    /// experimental concentration layer.
    pub evaporate_mass: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            algorithm: "bdf2".to_string(),
            saveat: 86_400.0,
            dt: None,
            dtmin: 1e-4,
            dtmax: 86_400.0,
            force_dtmin: false,
            abstol: 1e-6,
            reltol: 1e-6,
            water_balance_abstol: 1e-3,
            water_balance_reltol: 1e-2,
            maxiters: 1_000_000,
            sparse: true,
            autodiff: true,
            evaporate_mass: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// One of "error", "warn", "info", "debug", "trace".
    pub verbosity: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResultsConfig {
    pub compression: bool,
    pub compression_level: u8,
    pub subgrid: bool,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            compression: false,
            compression_level: 6,
            subgrid: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExperimentalConfig {
    pub concentration: bool,
    pub allocation: bool,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Config {
    pub fn from_str(text: &str) -> Result<Self, HydronetError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, HydronetError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    fn validate(&self) -> Result<(), HydronetError> {
        let start = self.start()?;
        let end = self.end()?;
        if end <= start {
            return Err(HydronetError::Config(format!(
                "endtime {} must be after starttime {}",
                self.endtime, self.starttime
            )));
        }
        if self.solver.dtmin <= 0.0 || self.solver.dtmax <= self.solver.dtmin {
            return Err(HydronetError::Config(format!(
                "solver step bounds invalid: dtmin = {}, dtmax = {}",
                self.solver.dtmin, self.solver.dtmax
            )));
        }
        if !matches!(self.solver.algorithm.as_str(), "bdf2" | "implicit_euler") {
            return Err(HydronetError::Config(format!(
                "unknown solver.algorithm '{}'",
                self.solver.algorithm
            )));
        }
        if !matches!(self.interpolation.flow_boundary.as_str(), "linear" | "block") {
            return Err(HydronetError::Config(format!(
                "interpolation.flow_boundary must be 'linear' or 'block', got '{}'",
                self.interpolation.flow_boundary
            )));
        }
        if let Some(version) = &self.hydronet_version {
            if version != env!("CARGO_PKG_VERSION") {
                warn!(
                    file_version = version.as_str(),
                    crate_version = env!("CARGO_PKG_VERSION"),
                    "configuration was written for a different version"
                );
            }
        }
        Ok(())
    }

    fn parse_time(text: &str) -> Result<NaiveDateTime, HydronetError> {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap())
            })
            .map_err(|e| HydronetError::Config(format!("cannot parse time '{text}': {e}")))
    }

    pub fn start(&self) -> Result<NaiveDateTime, HydronetError> {
        Self::parse_time(&self.starttime)
    }

    pub fn end(&self) -> Result<NaiveDateTime, HydronetError> {
        Self::parse_time(&self.endtime)
    }

    /// Simulated duration [s].
    pub fn duration_seconds(&self) -> Result<f64, HydronetError> {
        Ok((self.end()? - self.start()?).num_seconds() as f64)
    }

    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            algorithm: match self.solver.algorithm.as_str() {
                "implicit_euler" => Algorithm::ImplicitEuler,
                _ => Algorithm::Bdf2,
            },
            abstol: self.solver.abstol,
            reltol: self.solver.reltol,
            dt: self.solver.dt,
            dtmin: self.solver.dtmin,
            dtmax: self.solver.dtmax,
            force_dtmin: self.solver.force_dtmin,
            maxiters: self.solver.maxiters,
            autodiff: self.solver.autodiff,
            sparse: self.solver.sparse,
        }
    }

    pub fn allocation_options(&self) -> AllocationOptions {
        AllocationOptions {
            timestep: self.allocation.timestep,
            source_priorities: SourcePriorities {
                user_demand: self.allocation.source_priority.user_demand,
                flow_boundary: self.allocation.source_priority.flow_boundary,
                level_boundary: self.allocation.source_priority.level_boundary,
                basin: self.allocation.source_priority.basin,
                subnetwork_inlet: self.allocation.source_priority.subnetwork_inlet,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_str(
            r#"
starttime = "2020-01-01T00:00:00"
endtime = "2020-02-01T00:00:00"
"#,
        )
        .unwrap();
        assert_eq!(config.solver.saveat, 86_400.0);
        assert_eq!(config.logging.verbosity, "info");
        assert!((config.duration_seconds().unwrap() - 31.0 * 86_400.0).abs() < 1.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = Config::from_str(
            r#"
starttime = "2020-01-01T00:00:00"
endtime = "2020-02-01T00:00:00"
not_a_real_key = 4
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn backwards_time_window_is_rejected() {
        let result = Config::from_str(
            r#"
starttime = "2020-02-01T00:00:00"
endtime = "2020-01-01T00:00:00"
"#,
        );
        assert!(matches!(result, Err(HydronetError::Config(_))));
    }

    #[test]
    fn solver_algorithm_is_checked() {
        let result = Config::from_str(
            r#"
starttime = "2020-01-01T00:00:00"
endtime = "2020-02-01T00:00:00"
[solver]
algorithm = "rk4"
"#,
        );
        assert!(matches!(result, Err(HydronetError::Config(_))));
    }
}
