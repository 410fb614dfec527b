// ABOUTME: Accounting of cumulative volumes and the append-only result stream
// ABOUTME: Snapshots difference cumulative state into mean rates; the CSV backend is the reference writer

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;

use nalgebra::DVector;
use serde::Serialize;

use crate::engine::core::error::HydronetError;

/// One row of the `basin` result table.
#[derive(Debug, Clone, Serialize)]
pub struct BasinRow {
    pub time: f64,
    pub node_id: i32,
    pub level: f64,
    pub storage: f64,
    pub inflow_rate: f64,
    pub outflow_rate: f64,
    pub storage_rate: f64,
    pub precipitation: f64,
    pub evaporation: f64,
    pub drainage: f64,
    pub infiltration: f64,
    pub balance_error: f64,
    pub relative_error: f64,
    pub convergence: f64,
}

/// One row of the `flow` result table.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRow {
    pub time: f64,
    pub link_id: usize,
    pub from_node_id: i32,
    pub to_node_id: i32,
    pub flow_rate: f64,
    pub convergence: f64,
}

/// One row of the `control` result table.
#[derive(Debug, Clone, Serialize)]
pub struct ControlRow {
    pub time: f64,
    pub control_node_id: i32,
    pub truth_state: String,
    pub control_state: String,
}

/// One row of the `allocation` result table.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationRow {
    pub time: f64,
    pub subnetwork_id: u32,
    pub node_type: String,
    pub node_id: i32,
    pub demand_priority: u32,
    pub demand: f64,
    pub allocated: f64,
    pub realized: f64,
}

/// One row of the `allocation_flow` result table.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationFlowRow {
    pub time: f64,
    pub link_id: usize,
    pub from_node_id: i32,
    pub from_node_type: String,
    pub to_node_id: i32,
    pub to_node_type: String,
    pub subnetwork_id: u32,
    pub flow_rate: f64,
    pub optimization_type: String,
}

/// One row of the `solver_stats` result table.
#[derive(Debug, Clone, Serialize)]
pub struct SolverStatsRow {
    pub time: f64,
    pub computation_time: f64,
    pub rhs_calls: u64,
    pub linear_solves: u64,
    pub accepted_timesteps: u64,
    pub rejected_timesteps: u64,
}

/// One row of the `subgrid_level` result table.
#[derive(Debug, Clone, Serialize)]
pub struct SubgridRow {
    pub time: f64,
    pub subgrid_id: i32,
    pub subgrid_level: f64,
}

/// Final basin state, used for warm restarts.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct BasinStateRow {
    pub node_id: i32,
    pub storage: f64,
    pub level: f64,
}

/// Where result rows go: append-only CSV files, or memory for tests and
/// embedded use.
#[derive(Debug)]
pub enum OutputStream {
    Disk { results_dir: PathBuf },
    Memory(Box<MemoryOutput>),
}

/// In-memory capture of every result table.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    pub basin: Vec<BasinRow>,
    pub flow: Vec<FlowRow>,
    pub control: Vec<ControlRow>,
    pub allocation: Vec<AllocationRow>,
    pub allocation_flow: Vec<AllocationFlowRow>,
    pub solver_stats: Vec<SolverStatsRow>,
    pub subgrid_level: Vec<SubgridRow>,
    pub basin_state: Vec<BasinStateRow>,
}

impl OutputStream {
    pub fn memory() -> Self {
        OutputStream::Memory(Box::default())
    }

    pub fn disk(results_dir: PathBuf) -> Result<Self, HydronetError> {
        std::fs::create_dir_all(&results_dir)?;
        // Version metadata travels with every result set.
        std::fs::write(
            results_dir.join("metadata.toml"),
            format!("hydronet_version = \"{}\"\n", env!("CARGO_PKG_VERSION")),
        )?;
        Ok(OutputStream::Disk { results_dir })
    }

    pub fn memory_output(&self) -> Option<&MemoryOutput> {
        match self {
            OutputStream::Memory(memory) => Some(memory),
            OutputStream::Disk { .. } => None,
        }
    }

    /// Append rows to a table; files open per save and flush on drop.
    fn append<T: Serialize>(
        results_dir: &std::path::Path,
        table: &str,
        rows: &[T],
    ) -> Result<(), HydronetError> {
        if rows.is_empty() {
            return Ok(());
        }
        let path = results_dir.join(format!("{table}.csv"));
        let write_headers = !path.exists()
            || std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_headers)
            .from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn write_basin(&mut self, rows: Vec<BasinRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => Self::append(results_dir, "basin", &rows),
            OutputStream::Memory(memory) => {
                memory.basin.extend(rows);
                Ok(())
            }
        }
    }

    pub fn write_flow(&mut self, rows: Vec<FlowRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => Self::append(results_dir, "flow", &rows),
            OutputStream::Memory(memory) => {
                memory.flow.extend(rows);
                Ok(())
            }
        }
    }

    pub fn write_control(&mut self, rows: Vec<ControlRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => Self::append(results_dir, "control", &rows),
            OutputStream::Memory(memory) => {
                memory.control.extend(rows);
                Ok(())
            }
        }
    }

    pub fn write_allocation(&mut self, rows: Vec<AllocationRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => Self::append(results_dir, "allocation", &rows),
            OutputStream::Memory(memory) => {
                memory.allocation.extend(rows);
                Ok(())
            }
        }
    }

    pub fn write_allocation_flow(
        &mut self,
        rows: Vec<AllocationFlowRow>,
    ) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => {
                Self::append(results_dir, "allocation_flow", &rows)
            }
            OutputStream::Memory(memory) => {
                memory.allocation_flow.extend(rows);
                Ok(())
            }
        }
    }

    pub fn write_solver_stats(&mut self, rows: Vec<SolverStatsRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => Self::append(results_dir, "solver_stats", &rows),
            OutputStream::Memory(memory) => {
                memory.solver_stats.extend(rows);
                Ok(())
            }
        }
    }

    pub fn write_subgrid(&mut self, rows: Vec<SubgridRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => {
                Self::append(results_dir, "subgrid_level", &rows)
            }
            OutputStream::Memory(memory) => {
                memory.subgrid_level.extend(rows);
                Ok(())
            }
        }
    }

    /// Rewrite (not append) the warm-restart state file.
    pub fn write_basin_state(&mut self, rows: Vec<BasinStateRow>) -> Result<(), HydronetError> {
        match self {
            OutputStream::Disk { results_dir } => {
                let path = results_dir.join("basin_state.csv");
                let mut writer = csv::Writer::from_path(&path)?;
                for row in &rows {
                    writer.serialize(row)?;
                }
                writer.flush().map_err(std::io::Error::from)?;
                Ok(())
            }
            OutputStream::Memory(memory) => {
                memory.basin_state = rows;
                Ok(())
            }
        }
    }

    /// Dump allocation infeasibility analysis next to the results.
    pub fn write_allocation_analysis(
        &mut self,
        infeasibility: &str,
        scaling: &str,
    ) -> Result<(), HydronetError> {
        if let OutputStream::Disk { results_dir } = self {
            std::fs::write(
                results_dir.join("allocation_analysis_infeasibility.log"),
                infeasibility,
            )?;
            std::fs::write(results_dir.join("allocation_analysis_scaling.log"), scaling)?;
        }
        Ok(())
    }
}

/// Load a previous run's final basin state for a warm restart.
pub fn read_basin_state(path: &std::path::Path) -> Result<BTreeMap<i32, f64>, HydronetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut storages = BTreeMap::new();
    for row in reader.deserialize::<BasinStateRow>() {
        let row = row?;
        storages.insert(row.node_id, row.storage);
    }
    Ok(storages)
}

/// Lifetime cumulative volumes per state entry. The state vector resets
/// at each save; this absorbs those interval volumes so windows longer
/// than a save interval (allocation, realized rates) can still be
/// differenced.
#[derive(Debug, Default)]
pub struct CumulativeTracker {
    totals: Vec<f64>,
    snapshots: BTreeMap<String, Vec<f64>>,
}

impl CumulativeTracker {
    pub fn new(n: usize) -> Self {
        Self {
            totals: vec![0.0; n],
            snapshots: BTreeMap::new(),
        }
    }

    /// Fold a save interval's volumes into the lifetime totals.
    pub fn absorb(&mut self, u: &DVector<f64>) {
        for (total, value) in self.totals.iter_mut().zip(u.iter()) {
            *total += value;
        }
    }

    /// Lifetime totals including the not-yet-absorbed running interval.
    pub fn current_with(&self, u: &DVector<f64>) -> Vec<f64> {
        self.totals
            .iter()
            .zip(u.iter())
            .map(|(total, value)| total + value)
            .collect()
    }

    /// Remember the current totals under a label (e.g. "allocation").
    pub fn snapshot(&mut self, label: &str, u: &DVector<f64>) {
        let current = self.current_with(u);
        self.snapshots.insert(label.to_string(), current);
    }

    /// Volumes accumulated since the labelled snapshot; zeros when the
    /// label has never been snapped.
    pub fn since_snapshot(&self, label: &str, u: &DVector<f64>) -> Vec<f64> {
        let current = self.current_with(u);
        match self.snapshots.get(label) {
            Some(reference) => current
                .iter()
                .zip(reference.iter())
                .map(|(c, r)| c - r)
                .collect(),
            None => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_survives_save_resets() {
        let mut tracker = CumulativeTracker::new(2);
        let interval1 = DVector::from_vec(vec![1.0, 2.0]);
        tracker.snapshot("allocation", &DVector::zeros(2));
        tracker.absorb(&interval1);
        // State reset to zero after a save, more volume accrues.
        let interval2 = DVector::from_vec(vec![0.5, 0.5]);
        let since = tracker.since_snapshot("allocation", &interval2);
        assert_eq!(since, vec![1.5, 2.5]);
    }
}
