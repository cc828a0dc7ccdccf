// src/processing/csv_sink.rs

//! Row tables as `<out>/<entity>.csv`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::EntityType;
use crate::processing::RowSink;
use crate::processing::normalize::{Cell, NormalizedRow, columns};

pub struct CsvSink {
    writers: BTreeMap<EntityType, csv::Writer<File>>,
}

impl CsvSink {
    /// Create (or truncate) one table per entity type, each starting with its header.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut writers = BTreeMap::new();
        for entity in EntityType::ALL {
            let mut writer = csv::Writer::from_path(table_path(&dir, entity))?;
            writer.write_record(columns(entity))?;
            writers.insert(entity, writer);
        }
        Ok(Self { writers })
    }
}

pub fn table_path(dir: &Path, entity: EntityType) -> PathBuf {
    dir.join(format!("{}.csv", entity.as_str()))
}

impl RowSink for CsvSink {
    fn write(&mut self, row: &NormalizedRow) -> Result<()> {
        if let Some(writer) = self.writers.get_mut(&row.entity) {
            writer.write_record(row.cells.iter().map(field))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

fn field(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Int(i) => i.to_string(),
        Cell::Float(f) => f.to_string(),
        Cell::Text(s) => s.clone(),
        Cell::Bool(b) => b.to_string(),
    }
}
