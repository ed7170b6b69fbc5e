//! The built-in script catalogue and the small scripts generated per derivation.

use dataviser_ipc::message::ScriptCatalogue;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{DataviserError, Result};
use crate::group::Orientation;

/// Run at startup, in this order, before any other task.
pub const BOOTSTRAP_SCRIPTS: &[&str] = &["df", "df_filters", "df_transformers"];
/// Installs `dfs` / `dfs_meta` as the loaded dataset.
pub const PREPROCESS_SCRIPT: &str = "df_preprocess";
/// Packages the working selection into `OUT`.
pub const OUTPUT_SCRIPT: &str = "df_out";

/// Interpreter globals written by the derivation context.
pub mod globals {
    pub const IDS: &str = "IDS";
    pub const EXCLUDE: &str = "EXC";
    pub const ROWS: &str = "ROWS";
    pub const COLS: &str = "COLS";
    pub const META_FILTER: &str = "MFILTER";
    pub const OUT: &str = "OUT";
    pub const FRAMES: &str = "dfs";
    pub const FRAMES_META: &str = "dfs_meta";
}

const BUILTIN: &[(&str, &str)] = &[
    ("df", include_str!("../scripts/df.rhai")),
    ("df_filters", include_str!("../scripts/df_filters.rhai")),
    ("df_transformers", include_str!("../scripts/df_transformers.rhai")),
    ("df_preprocess", include_str!("../scripts/df_preprocess.rhai")),
    ("df_out", include_str!("../scripts/df_out.rhai")),
];

pub fn builtin_catalogue() -> ScriptCatalogue {
    BUILTIN
        .iter()
        .map(|(name, source)| (name.to_string(), source.to_string()))
        .collect()
}

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

const KEYWORDS: &[&str] = &[
    "let", "const", "if", "else", "switch", "do", "while", "until", "loop", "for", "in", "continue",
    "break", "return", "throw", "try", "catch", "fn", "private", "import", "export", "as", "global",
    "true", "false", "this", "is_def_var", "is_def_fn", "is_shared", "Fn", "call", "curry", "type_of",
    "print", "debug", "eval",
];

/// Whether `name` can be used as an interpreter variable.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name) && !KEYWORDS.contains(&name)
}

pub fn check_identifier(name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(DataviserError::InvalidIdentifier(name.to_string()))
    }
}

/// Select, metadata-filter and row/column-filter the loaded frames into `DFS`.
pub fn filter_fragment(with_meta_filter: bool) -> String {
    use globals::*;
    let mut script = format!("DFS = select_frames(REF, {IDS}, {EXCLUDE});\n");
    if with_meta_filter {
        script.push_str(&format!("DFS = filter_meta(DFS, META, {META_FILTER});\n"));
    }
    script.push_str(&format!("DFS = filter_frames(DFS, {ROWS}, {COLS});\n"));
    script
}

/// Add the `sum` frame, then reduce every frame along `orient`.
pub fn aggregation_fragment(orient: Orientation) -> String {
    let mut script = String::from("DFS = with_sum(DFS);\n");
    match orient {
        Orientation::Row => script.push_str("DFS = row_sums(DFS);\n"),
        Orientation::Col => script.push_str("DFS = col_sums(DFS);\n"),
        Orientation::None => {}
    }
    script
}

/// A script evaluating to the JSON text of `#{name: name, ..}`.
pub fn extraction_script(names: &[&str]) -> Result<String> {
    let mut fields = Vec::with_capacity(names.len());
    for name in names {
        check_identifier(name)?;
        fields.push(format!("{name}: {name}"));
    }
    Ok(format!("dump_json(#{{ {} }})", fields.join(", ")))
}

/// Parse the text an extraction script produced.
pub fn parse_extraction(output: &Value) -> Result<Map<String, Value>> {
    let text = output
        .as_str()
        .ok_or_else(|| DataviserError::Extraction(format!("expected text, got {output}")))?;
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DataviserError::Extraction(format!("expected an object, got {other}"))),
        Err(e) => Err(DataviserError::Extraction(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers() {
        assert!(is_identifier("DFS"));
        assert!(is_identifier("_tmp1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier("let"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn extraction_script_rejects_bad_names() {
        assert_eq!(extraction_script(&["OUT", "META"]).unwrap(), "dump_json(#{ OUT: OUT, META: META })");
        assert!(matches!(
            extraction_script(&["OUT", "x y"]),
            Err(DataviserError::InvalidIdentifier(name)) if name == "x y"
        ));
    }

    #[test]
    fn extraction_output_must_be_an_object() {
        let parsed = parse_extraction(&json!(r#"{"OUT": {"a": 1}}"#)).unwrap();
        assert_eq!(parsed["OUT"]["a"], 1);
        assert!(parse_extraction(&json!("[1]")).is_err());
        assert!(parse_extraction(&json!(3)).is_err());
    }

    #[test]
    fn fragments_follow_the_parameters() {
        assert!(!filter_fragment(false).contains("filter_meta"));
        assert!(filter_fragment(true).contains("filter_meta(DFS, META, MFILTER)"));
        assert!(aggregation_fragment(Orientation::Row).contains("row_sums"));
        assert!(aggregation_fragment(Orientation::Col).contains("col_sums"));
        assert_eq!(aggregation_fragment(Orientation::None), "DFS = with_sum(DFS);\n");
    }

    #[test]
    fn builtin_catalogue_covers_bootstrap() {
        let catalogue = builtin_catalogue();
        for name in BOOTSTRAP_SCRIPTS.iter().chain([&PREPROCESS_SCRIPT, &OUTPUT_SCRIPT]) {
            assert!(catalogue.contains_key(*name), "missing {name}");
        }
    }
}
