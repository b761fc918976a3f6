//! Result collection and export.
//!
//! Sweep drivers append one [`SweepPoint`] per grid cell; the finished table
//! goes to disk as a tab-separated text file plus a raw little-endian binary
//! companion, with an optional JSON sidecar describing the run settings.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use log::info;
use ndarray::Array2;
use serde::Serialize;

use crate::error::LockinError;
use crate::types::SweepPoint;

/// Column header of the exported text table.
pub const TEXT_HEADER: &str = "Amplitude\tFrequency\tR\tTheta";

#[derive(Debug, Default, Clone)]
pub struct ResultTable {
    points: Vec<SweepPoint>,
}

impl ResultTable {
    pub fn new() -> Self {
        ResultTable { points: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ResultTable {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, point: SweepPoint) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[SweepPoint] {
        &self.points
    }

    /// The exported columns as an `n x 4` array in acquisition order.
    pub fn to_array(&self) -> Array2<f64> {
        let mut array = Array2::zeros((self.points.len(), 4));
        for (i, point) in self.points.iter().enumerate() {
            for (j, value) in point.row().iter().enumerate() {
                array[[i, j]] = *value;
            }
        }
        array
    }

    pub fn write_text<P: AsRef<Path>>(&self, path: P) -> Result<(), LockinError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", TEXT_HEADER)?;
        for point in &self.points {
            let row = point.row();
            writeln!(
                writer,
                "{:.4e}\t{:.4e}\t{:.4e}\t{:.4e}",
                row[0], row[1], row[2], row[3]
            )?;
        }
        writer.flush()?;
        info!("Wrote {} rows to {:?}", self.points.len(), path.as_ref());
        Ok(())
    }

    /// Raw dump for numeric tooling: two little-endian u64 dimensions, then
    /// the table row-major as f64.
    pub fn write_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), LockinError> {
        let array = self.to_array();
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writer.write_u64::<LittleEndian>(array.nrows() as u64)?;
        writer.write_u64::<LittleEndian>(array.ncols() as u64)?;
        for value in array.iter() {
            writer.write_f64::<LittleEndian>(*value)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Text table at `<base>.txt` with the binary companion at `<base>.dat`.
    pub fn export<P: AsRef<Path>>(&self, base: P) -> Result<(), LockinError> {
        let base = base.as_ref();
        self.write_text(base.with_extension("txt"))?;
        self.write_binary(base.with_extension("dat"))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SettingsRecord<'a, T: Serialize> {
    saved_at: DateTime<Utc>,
    settings: &'a T,
}

/// Write a JSON sidecar describing how a data set was taken.
pub fn write_settings_json<P: AsRef<Path>, T: Serialize>(
    path: P,
    settings: &T,
) -> Result<(), LockinError> {
    let record = SettingsRecord {
        saved_at: Utc::now(),
        settings,
    };
    std::fs::write(path.as_ref(), serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

/// File stem carrying a UTC timestamp, e.g. `sweep_2026-08-25T14-02-11`.
pub fn timestamped_stem(prefix: &str) -> String {
    format!("{}_{}", prefix, Utc::now().format("%Y-%m-%dT%H-%M-%S"))
}
