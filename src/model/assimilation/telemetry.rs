/*
Copyright 2021 Jakub Lewandowski

This file is part of Diffusion Data Assimilation (DiffDA).

Diffusion Data Assimilation (DiffDA) is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

Diffusion Data Assimilation (DiffDA) is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with Diffusion Data Assimilation (DiffDA). If not, see https://www.gnu.org/licenses/.
*/

//! Sinks receiving per-step metrics.
//!
//! Telemetry is opt-in: the model writes CSV tables into the output
//! directory only when asked to, otherwise metrics only reach the log
//! and the progress bar.

use super::metrics::RmseTable;
use crate::errors::TelemetryError;
use crate::Float;
use log::debug;
use std::{collections::BTreeMap, fs::File, path::Path};

pub trait TelemetrySink: Send {
    fn log_scalars(
        &mut self,
        step: usize,
        scalars: &BTreeMap<String, Float>,
    ) -> Result<(), TelemetryError>;

    fn log_tables(
        &mut self,
        step: usize,
        pressure: &RmseTable,
        surface: &RmseTable,
    ) -> Result<(), TelemetryError>;

    fn flush(&mut self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Sink discarding everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn log_scalars(&mut self, _: usize, _: &BTreeMap<String, Float>) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn log_tables(&mut self, _: usize, _: &RmseTable, _: &RmseTable) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Sink writing `scalars.csv`, `rmse_pressure_level.csv`
/// and `rmse_surface_level.csv` in long format.
pub struct CsvTelemetry {
    scalars: csv::Writer<File>,
    pressure: TableWriter,
    surface: TableWriter,
}

impl CsvTelemetry {
    pub fn new(directory: &Path) -> Result<Self, TelemetryError> {
        debug!("Creating telemetry files in {}", directory.display());

        let mut scalars = csv::Writer::from_path(directory.join("scalars.csv"))?;
        scalars.write_record(&["step", "key", "value"])?;

        Ok(CsvTelemetry {
            scalars,
            pressure: TableWriter::new(&directory.join("rmse_pressure_level.csv"))?,
            surface: TableWriter::new(&directory.join("rmse_surface_level.csv"))?,
        })
    }
}

impl TelemetrySink for CsvTelemetry {
    fn log_scalars(
        &mut self,
        step: usize,
        scalars: &BTreeMap<String, Float>,
    ) -> Result<(), TelemetryError> {
        for (key, value) in scalars {
            self.scalars
                .write_record(&[step.to_string(), key.clone(), value.to_string()])?;
        }

        Ok(())
    }

    fn log_tables(
        &mut self,
        step: usize,
        pressure: &RmseTable,
        surface: &RmseTable,
    ) -> Result<(), TelemetryError> {
        self.pressure.write(step, pressure)?;
        self.surface.write(step, surface)?;

        Ok(())
    }

    fn flush(&mut self) -> Result<(), TelemetryError> {
        self.scalars.flush()?;
        self.pressure.writer.flush()?;
        self.surface.writer.flush()?;

        Ok(())
    }
}

/// Table writer with one row per level and variable, so steps
/// with different variable sets share one header.
struct TableWriter {
    writer: csv::Writer<File>,
}

impl TableWriter {
    fn new(path: &Path) -> Result<Self, TelemetryError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&["step", "data_type", "level", "variable", "value"])?;

        Ok(TableWriter { writer })
    }

    fn write(&mut self, step: usize, table: &RmseTable) -> Result<(), TelemetryError> {
        for (row, level) in table.levels.iter().enumerate() {
            for (var, values) in &table.columns {
                self.writer.write_record(&[
                    step.to_string(),
                    table.data_type.clone(),
                    level.to_string(),
                    var.name().to_string(),
                    values[row].to_string(),
                ])?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CsvTelemetry, TelemetrySink};
    use crate::model::assimilation::metrics::calculate_stat_rmse;
    use crate::model::state::{Grid, State, Variable};
    use ndarray::Array3;
    use std::{collections::BTreeMap, fs};

    #[test]
    fn writes_tables() {
        let directory = std::env::temp_dir().join(format!("diffda-telemetry-{}", std::process::id()));
        fs::create_dir_all(&directory).unwrap();

        let grid = Grid::regular(3, 4, &[500, 850]);
        let diff = State::new()
            .with(Variable::Temperature, Array3::from_elem((2, 3, 4), 2.0))
            .with(Variable::Temperature2m, Array3::from_elem((1, 3, 4), 1.0));
        let (pressure, surface) = calculate_stat_rmse(&diff, &grid, "GraphCast_Pred").unwrap();

        let mut scalars = BTreeMap::new();
        scalars.insert("val/graphcast_rmse500hPa/temperature".to_string(), 2.0);

        let mut sink = CsvTelemetry::new(&directory).unwrap();
        sink.log_scalars(1, &scalars).unwrap();
        sink.log_tables(1, &pressure, &surface).unwrap();
        sink.log_tables(2, &pressure, &surface).unwrap();
        sink.flush().unwrap();

        let pressure_csv = fs::read_to_string(directory.join("rmse_pressure_level.csv")).unwrap();
        let lines: Vec<&str> = pressure_csv.lines().collect();

        assert_eq!(lines[0], "step,data_type,level,variable,value");
        assert_eq!(lines[1], "1,GraphCast_Pred,500,temperature,2");
        assert_eq!(lines.len(), 5);

        let scalars_csv = fs::read_to_string(directory.join("scalars.csv")).unwrap();
        assert!(scalars_csv.contains("1,val/graphcast_rmse500hPa/temperature,2"));

        let surface_csv = fs::read_to_string(directory.join("rmse_surface_level.csv")).unwrap();
        assert!(surface_csv
            .starts_with("step,data_type,level,variable,value\n1,GraphCast_Pred,0,2m_temperature,1"));

        fs::remove_dir_all(&directory).unwrap();
    }
}
