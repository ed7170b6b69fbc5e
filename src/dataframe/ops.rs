//! Pure operations over frames. None of them mutate their inputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::{DataError, Dataframe};

/// Elementwise sum; a cell missing from some frame counts as 0. A cell that overflows
/// is an error rather than an infinity.
pub fn sum<'a>(frames: impl IntoIterator<Item = &'a Dataframe>) -> Result<Dataframe, DataError> {
    let mut data: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for frame in frames {
        for (column, rows) in frame.data() {
            let target = data.entry(column.clone()).or_default();
            for (row, v) in rows {
                *target.entry(row.clone()).or_insert(0.0) += v;
            }
        }
    }
    for (column, rows) in &data {
        if let Some((row, _)) = rows.iter().find(|(_, v)| !v.is_finite()) {
            return Err(DataError::Overflow(format!("({column}, {row})")));
        }
    }
    Ok(Dataframe::from(data))
}

/// Inclusion allow-lists. An empty list lets every label of that axis through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisFilter {
    pub rows: Vec<String>,
    pub cols: Vec<String>,
}

impl AxisFilter {
    pub fn new(rows: Vec<String>, cols: Vec<String>) -> Self {
        Self { rows, cols }
    }

    fn keeps_row(&self, row: &str) -> bool {
        self.rows.is_empty() || self.rows.iter().any(|r| r == row)
    }

    fn keeps_col(&self, col: &str) -> bool {
        self.cols.is_empty() || self.cols.iter().any(|c| c == col)
    }
}

/// Keep the cells whose row and column both pass. Columns left without cells are dropped.
pub fn filter(frame: &Dataframe, by: &AxisFilter) -> Dataframe {
    let data: BTreeMap<String, BTreeMap<String, f64>> = frame
        .data()
        .iter()
        .filter(|(column, _)| by.keeps_col(column))
        .filter_map(|(column, rows)| {
            let kept: BTreeMap<String, f64> = rows
                .iter()
                .filter(|(row, _)| by.keeps_row(row))
                .map(|(row, v)| (row.clone(), *v))
                .collect();
            (!kept.is_empty()).then(|| (column.clone(), kept))
        })
        .collect();
    Dataframe::from(data)
}

/// A canonical label order shared by both matrix axes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisOrder {
    labels: Vec<String>,
}

impl AxisOrder {
    pub fn new(labels: Vec<String>) -> Self {
        let mut order = Self::default();
        order.extend(labels);
        order
    }

    /// Rows and columns of `frame` in label order.
    pub fn discover(frame: &Dataframe) -> Self {
        let labels: BTreeSet<&str> = frame
            .columns()
            .chain(frame.rows().iter().map(String::as_str))
            .collect();
        Self::new(labels.into_iter().map(str::to_string).collect())
    }

    /// Append labels not seen yet; existing positions never move.
    pub fn extend(&mut self, labels: impl IntoIterator<Item = String>) {
        for label in labels {
            if !self.labels.contains(&label) {
                self.labels.push(label);
            }
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Square matrix indexed by `order`: `m[row][col]` holds the cell at `(col, row)`.
/// Without an explicit order the frame's own labels are used. Labels missing from the
/// order are left out; positions without a cell are 0.
pub fn to_matrix(frame: &Dataframe, order: Option<&AxisOrder>) -> Vec<Vec<f64>> {
    let discovered;
    let order = match order {
        Some(order) => order,
        None => {
            discovered = AxisOrder::discover(frame);
            &discovered
        }
    };
    let index: HashMap<&str, usize> = order
        .labels()
        .iter()
        .enumerate()
        .map(|(i, label)| (label.as_str(), i))
        .collect();

    let n = order.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for (column, rows) in frame.data() {
        let Some(&j) = index.get(column.as_str()) else { continue };
        for (row, v) in rows {
            if let Some(&i) = index.get(row.as_str()) {
                matrix[i][j] = *v;
            }
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> Dataframe {
        Dataframe::from_json(&value).unwrap()
    }

    #[test]
    fn sum_treats_missing_cells_as_zero() {
        let a = frame(json!({"A": {"r1": 1, "r2": 2}}));
        let b = frame(json!({"A": {"r1": 10}, "B": {"r3": 4}}));
        let total = sum([&a, &b]).unwrap();
        assert_eq!(total, frame(json!({"A": {"r1": 11, "r2": 2}, "B": {"r3": 4}})));
        assert_eq!(sum([&a, &b]), sum([&b, &a]));
        assert!(sum(std::iter::empty()).unwrap().is_empty());
    }

    #[test]
    fn overflowing_sum_is_an_error() {
        let big = frame(json!({"A": {"r1": 1e308}}));
        let err = sum([&big, &big]).unwrap_err();
        assert!(matches!(err, DataError::Overflow(ref cell) if cell == "(A, r1)"), "{err}");
    }

    #[test]
    fn empty_allow_list_keeps_the_axis() {
        let f = frame(json!({"A": {"r1": 1, "r2": 2}, "B": {"r1": 3}}));
        assert_eq!(filter(&f, &AxisFilter::default()), f);
        assert_eq!(
            filter(&f, &AxisFilter::new(vec!["r2".into()], vec![])),
            frame(json!({"A": {"r2": 2}}))
        );
        assert_eq!(
            filter(&f, &AxisFilter::new(vec![], vec!["B".into()])),
            frame(json!({"B": {"r1": 3}}))
        );
    }

    #[test]
    fn matrix_uses_the_given_order() {
        let f = frame(json!({"x": {"y": 2}, "y": {"x": 3}}));
        let order = AxisOrder::new(vec!["y".into(), "x".into()]);
        assert_eq!(to_matrix(&f, Some(&order)), vec![vec![0.0, 2.0], vec![3.0, 0.0]]);
        // discovered order is x, y
        assert_eq!(to_matrix(&f, None), vec![vec![0.0, 3.0], vec![2.0, 0.0]]);
    }

    #[test]
    fn matrix_positions_survive_new_labels() {
        let mut order = AxisOrder::new(vec!["a".into(), "b".into()]);
        let before = to_matrix(&frame(json!({"a": {"b": 1}})), Some(&order));
        order.extend(["0".to_string(), "a".to_string()]);
        assert_eq!(order.labels(), ["a", "b", "0"]);
        let after = to_matrix(&frame(json!({"a": {"b": 1}})), Some(&order));
        assert_eq!(before[1][0], after[1][0]);
    }
}
