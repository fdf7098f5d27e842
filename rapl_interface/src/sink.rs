use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::Context;
use csv::Writer;
use energy_probes::CounterMeta;
use log::warn;

use crate::sampler::EnergyReading;

/// Accumulates the completed readings, in completion order.
///
/// The in-memory log is the source of truth: a reading is pushed there
/// first, then appended to the CSV file if one is configured. A failing
/// file write falls back to a line on stderr and never drops the reading.
pub struct ReportSink {
    readings: Vec<EnergyReading>,
    csv: Option<CsvOutput>,
}

struct CsvOutput {
    writer: Writer<std::fs::File>,
    path: PathBuf,
}

impl ReportSink {
    pub fn in_memory() -> ReportSink {
        ReportSink {
            readings: Vec::new(),
            csv: None,
        }
    }

    /// Opens `path` in append mode and writes the header if the file is
    /// empty. The header columns are derived from the opened counters, so
    /// appending readings from a source with different counters to the same
    /// file produces misaligned columns; use one file per counter setup.
    pub fn with_csv(path: impl AsRef<Path>, counters: &[CounterMeta]) -> anyhow::Result<ReportSink> {
        let path = path.as_ref().to_path_buf();
        let file_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        let mut writer = Writer::from_writer(file);
        if file_len == 0 {
            let mut header = vec!["duration_ms".to_owned(), "total_joules".to_owned()];
            for meta in counters {
                header.push(format!("{}-{}_joules", meta.domain, meta.socket));
            }
            writer.write_record(&header)?;
            writer.flush()?;
        }

        Ok(ReportSink {
            readings: Vec::new(),
            csv: Some(CsvOutput { writer, path }),
        })
    }

    /// Appends a completed reading.
    pub fn record(&mut self, reading: EnergyReading) {
        if let Some(csv) = &mut self.csv {
            if let Err(e) = csv.append(&reading) {
                warn!("failed to append to {}: {e}", csv.path.display());
                eprintln!(
                    "{} {}",
                    reading.duration.as_millis(),
                    reading.total_joules
                );
            }
        }
        self.readings.push(reading);
    }

    /// Takes the accumulated readings, in the order they were recorded.
    pub fn drain(&mut self) -> Vec<EnergyReading> {
        std::mem::take(&mut self.readings)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl CsvOutput {
    fn append(&mut self, reading: &EnergyReading) -> csv::Result<()> {
        let mut record = Vec::with_capacity(2 + reading.domains.len());
        record.push(reading.duration.as_millis().to_string());
        record.push(reading.total_joules.to_string());
        for d in &reading.domains {
            record.push(d.joules.to_string());
        }
        self.writer.write_record(&record)?;
        // one reading per row, flushed immediately: a crash between
        // iterations cannot lose completed measurements
        self.writer.flush()?;
        Ok(())
    }
}
