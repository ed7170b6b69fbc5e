use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::DataError;

/// Reductions of one axis, with the extremes across the reduced values. The extremes
/// sit beside `values`, so a label named `min` or `max` is never shadowed.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Sums {
    pub values: BTreeMap<String, f64>,
    pub min: f64,
    pub max: f64,
}

impl Sums {
    /// Empty input gives `min == max == 0.0`. A reduction that overflowed is rejected.
    pub fn from_values(values: BTreeMap<String, f64>) -> Result<Self, DataError> {
        if let Some((label, _)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(DataError::Overflow(format!("`{label}`")));
        }
        let (min, max) = if values.is_empty() {
            (0.0, 0.0)
        } else {
            values.values().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            })
        };
        Ok(Self { values, min, max })
    }

    /// `{"values": {label: sum, ..}, "min": .., "max": ..}`
    pub fn to_json(&self) -> Value {
        json!({ "values": self.values, "min": self.min, "max": self.max })
    }
}

/// `column → row → value`. Frames are never mutated after construction, so the
/// derived fields are computed at most once per instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataframe {
    data: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(skip)]
    rows: OnceCell<Vec<String>>,
    #[serde(skip)]
    row_sums: OnceCell<Sums>,
    #[serde(skip)]
    col_sums: OnceCell<Sums>,
}

impl PartialEq for Dataframe {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl From<BTreeMap<String, BTreeMap<String, f64>>> for Dataframe {
    fn from(data: BTreeMap<String, BTreeMap<String, f64>>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

impl Dataframe {
    /// Build a frame from `{column: {row: number}}`. `null` cells read as 0 and numeric
    /// strings are accepted; anything else is rejected.
    pub fn from_json(value: &Value) -> Result<Self, DataError> {
        let columns = value
            .as_object()
            .ok_or_else(|| DataError::Malformed(format!("expected an object of columns, got {value}")))?;
        let mut data = BTreeMap::new();
        for (column, rows) in columns {
            let rows = rows
                .as_object()
                .ok_or_else(|| DataError::Malformed(format!("column `{column}` is not an object of rows")))?;
            let mut cells = BTreeMap::new();
            for (row, cell) in rows {
                cells.insert(row.clone(), cell_value(column, row, cell)?);
            }
            data.insert(column.clone(), cells);
        }
        Ok(Self::from(data))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.data).unwrap_or(Value::Null)
    }

    pub fn data(&self) -> &BTreeMap<String, BTreeMap<String, f64>> {
        &self.data
    }

    pub fn into_data(self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(BTreeMap::is_empty)
    }

    pub fn get(&self, column: &str, row: &str) -> Option<f64> {
        self.data.get(column)?.get(row).copied()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Every row label appearing in any column, in label order.
    pub fn rows(&self) -> &[String] {
        self.rows.get_or_init(|| {
            let rows: BTreeSet<&String> = self.data.values().flat_map(BTreeMap::keys).collect();
            rows.into_iter().cloned().collect()
        })
    }

    pub fn row_sums(&self) -> Result<&Sums, DataError> {
        self.row_sums.get_or_try_init(|| {
            let mut sums = BTreeMap::new();
            for rows in self.data.values() {
                for (row, v) in rows {
                    *sums.entry(row.clone()).or_insert(0.0) += v;
                }
            }
            Sums::from_values(sums)
        })
    }

    pub fn col_sums(&self) -> Result<&Sums, DataError> {
        self.col_sums.get_or_try_init(|| {
            let sums = self
                .data
                .iter()
                .map(|(column, rows)| (column.clone(), rows.values().sum()))
                .collect();
            Sums::from_values(sums)
        })
    }

    /// Extremes over every cell. An empty frame reports `(0.0, 0.0)`.
    pub fn min_max(&self) -> (f64, f64) {
        let mut cells = self.data.values().flat_map(BTreeMap::values).peekable();
        if cells.peek().is_none() {
            return (0.0, 0.0);
        }
        cells.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
    }
}

fn cell_value(column: &str, row: &str, cell: &Value) -> Result<f64, DataError> {
    let non_numeric = || DataError::NonNumeric {
        column: column.to_string(),
        row: row.to_string(),
        value: cell.to_string(),
    };
    let v = match cell {
        Value::Null => 0.0,
        Value::Number(n) => n.as_f64().ok_or_else(non_numeric)?,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| non_numeric())?,
        _ => return Err(non_numeric()),
    };
    if v.is_finite() { Ok(v) } else { Err(non_numeric()) }
}
