//! Turning loaded file contents into frames.

use std::collections::BTreeMap;

use csv::{ReaderBuilder, Trim};
use dataviser_ipc::message::LoadedFile;
use serde_json::{Map, Value};

use super::{DataError, Dataframe};

/// Parse a delimited table: the first row names the columns, the first column names
/// the rows. Empty cells read as 0.
pub fn parse_delimited(text: &str, delimiter: u8) -> Result<Dataframe, DataError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(|e| DataError::Csv(e.to_string()))?.clone();
    let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    if columns.is_empty() {
        return Err(DataError::Malformed("table has no value columns".into()));
    }

    let mut data: BTreeMap<String, BTreeMap<String, f64>> =
        columns.iter().map(|c| (c.clone(), BTreeMap::new())).collect();
    for record in reader.records() {
        let record = record.map_err(|e| DataError::Csv(e.to_string()))?;
        let Some(row) = record.get(0) else { continue };
        if row.is_empty() && record.iter().all(str::is_empty) {
            continue;
        }
        for (column, cell) in columns.iter().zip(record.iter().skip(1)) {
            let value = if cell.is_empty() {
                0.0
            } else {
                cell.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| DataError::NonNumeric {
                        column: column.clone(),
                        row: row.to_string(),
                        value: cell.to_string(),
                    })?
            };
            if let Some(cells) = data.get_mut(column) {
                cells.insert(row.to_string(), value);
            }
        }
    }
    Ok(Dataframe::from(data))
}

pub fn parse_json(text: &str) -> Result<Dataframe, DataError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DataError::Malformed(e.to_string()))?;
    Dataframe::from_json(&value)
}

/// Parse a file by extension and collect the metadata kept alongside its frame.
pub fn parse_loaded(file: &LoadedFile) -> Result<(Dataframe, Map<String, Value>), DataError> {
    let frame = match file.extension.as_str() {
        "csv" => parse_delimited(&file.data, b',')?,
        "tsv" => parse_delimited(&file.data, b'\t')?,
        "json" => parse_json(&file.data)?,
        other => return Err(DataError::UnsupportedFormat(other.to_string())),
    };
    let mut meta = file.metadata.clone();
    meta.insert("filepath".into(), Value::String(file.filepath.clone()));
    meta.insert("filename".into(), Value::String(file.filename.clone()));
    meta.insert("extension".into(), Value::String(file.extension.clone()));
    Ok((frame, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn csv_header_and_label_column() {
        let frame = parse_delimited("label,A,B\nr1,2,5\nr2, 3 ,\n", b',').unwrap();
        assert_eq!(frame.to_json(), json!({"A": {"r1": 2.0, "r2": 3.0}, "B": {"r1": 5.0, "r2": 0.0}}));
    }

    #[test]
    fn csv_rejects_text_cells() {
        let err = parse_delimited(",A\nr1,x\n", b',').unwrap_err();
        assert_eq!(
            err,
            DataError::NonNumeric { column: "A".into(), row: "r1".into(), value: "x".into() }
        );
    }

    #[test]
    fn loaded_file_keeps_metadata() {
        let file = LoadedFile {
            filepath: "/d/f.json".into(),
            filename: "f.json".into(),
            metadata: Map::from_iter([("size".to_string(), json!(10))]),
            data: r#"{"A": {"r1": 1}}"#.into(),
            extension: "json".into(),
        };
        let (frame, meta) = parse_loaded(&file).unwrap();
        assert_eq!(frame.get("A", "r1"), Some(1.0));
        assert_eq!(meta["filename"], "f.json");
        assert_eq!(meta["size"], 10);

        let xlsx = LoadedFile { extension: "xlsx".into(), ..file };
        assert_eq!(parse_loaded(&xlsx).unwrap_err(), DataError::UnsupportedFormat("xlsx".into()));
    }
}
