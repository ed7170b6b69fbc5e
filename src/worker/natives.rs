//! Native frame functions exposed to scripts. Scripts pass frames around as plain
//! `#{column: #{row: value}}` maps; the heavy lifting happens here.

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map};
use serde_json::Value;

use crate::dataframe::{AxisFilter, Dataframe, ops};

type NativeResult<T> = Result<T, Box<EvalAltResult>>;

/// Column (or row) label the orientation transforms reduce into.
pub const SUM_LABEL: &str = "sum";

pub(super) fn register(engine: &mut Engine) {
    engine
        .register_fn("df_sum", df_sum)
        .register_fn("df_filter", df_filter)
        .register_fn("df_row_sums", df_row_sums)
        .register_fn("df_col_sums", df_col_sums)
        .register_fn("dump_json", dump_json);
}

fn frame_of(value: Dynamic) -> NativeResult<Dataframe> {
    let json: Value = from_dynamic(&value)?;
    Dataframe::from_json(&json).map_err(|e| e.to_string().into())
}

fn labels(values: Array) -> NativeResult<Vec<String>> {
    values
        .into_iter()
        .map(|v| {
            let type_name = v.type_name();
            v.into_string()
                .map_err(|_| format!("labels must be strings, got {type_name}").into())
        })
        .collect()
}

/// `df_sum(#{id: frame, ..})`: elementwise sum of every frame in the map.
fn df_sum(frames: Map) -> NativeResult<Dynamic> {
    let frames = frames.into_values().map(frame_of).collect::<NativeResult<Vec<_>>>()?;
    let total = ops::sum(frames.iter()).map_err(|e| e.to_string())?;
    to_dynamic(total)
}

/// `df_filter(frame, rows, cols)`: empty arrays keep the whole axis.
fn df_filter(frame: Dynamic, rows: Array, cols: Array) -> NativeResult<Dynamic> {
    let by = AxisFilter::new(labels(rows)?, labels(cols)?);
    to_dynamic(ops::filter(&frame_of(frame)?, &by))
}

/// Collapse the columns into a single `sum` column of row sums.
fn df_row_sums(frame: Dynamic) -> NativeResult<Dynamic> {
    let frame = frame_of(frame)?;
    let mut out = Map::new();
    let sums = frame.row_sums().map_err(|e| e.to_string())?;
    out.insert(SUM_LABEL.into(), to_dynamic(&sums.values)?);
    Ok(Dynamic::from_map(out))
}

/// Collapse the rows into a single `sum` row of column sums.
fn df_col_sums(frame: Dynamic) -> NativeResult<Dynamic> {
    let frame = frame_of(frame)?;
    let mut out = Map::new();
    let sums = frame.col_sums().map_err(|e| e.to_string())?;
    for (column, total) in &sums.values {
        let mut cell = Map::new();
        cell.insert(SUM_LABEL.into(), Dynamic::from_float(*total));
        out.insert(column.as_str().into(), Dynamic::from_map(cell));
    }
    Ok(Dynamic::from_map(out))
}

/// Serialize any value to compact JSON text.
fn dump_json(value: Dynamic) -> NativeResult<String> {
    let json: Value = from_dynamic(&value)?;
    serde_json::to_string(&json).map_err(|e| e.to_string().into())
}
