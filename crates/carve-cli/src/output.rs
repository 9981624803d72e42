use std::collections::BTreeSet;
use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use serde_json::Value;

use carve_core::ExtractedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Csv,
}

/// Write records as a JSON array of their data, or as CSV with one column
/// per top-level key.
pub fn write_records<W: Write>(records: &[ExtractedRecord], format: Format, out: W) -> Result<()> {
    match format {
        Format::Json => write_json(records, out),
        Format::Csv => write_csv(records, out),
    }
}

fn write_json<W: Write>(records: &[ExtractedRecord], mut out: W) -> Result<()> {
    let data: Vec<&Value> = records.iter().map(|r| &r.data).collect();
    serde_json::to_writer_pretty(&mut out, &data)?;
    writeln!(out)?;
    Ok(())
}

fn write_csv<W: Write>(records: &[ExtractedRecord], out: W) -> Result<()> {
    // Union of keys so sparse records still line up.
    let columns: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.data.as_object())
        .flat_map(|obj| obj.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(&columns)?;
    for record in records {
        let row = columns.iter().map(|col| cell(record.data.get(*col)));
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
