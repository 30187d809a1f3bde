//! Parameter files for the forward model.
//!
//! Each active run path gets one file per parameter with an output file,
//! formatted according to its kind, plus a flat `<name>.txt` and a nested
//! `<name>.json` export of all GEN_KW values. Existing exports are moved
//! aside with a timestamp suffix before being rewritten.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::{EnsembleResult, ExecutionError, FileSystemError, ValidationError};
use crate::parameter::{EnsembleConfig, ParameterConfig, ParameterKind};
use crate::run::RunArg;
use crate::storage::{write_bytes, CaseStore};

/// Exported values: parameter key to `(name, value)` pairs, in declaration order.
pub type Exports = Vec<(String, Vec<(String, f64)>)>;

/// Format like C's `%g`: six significant digits, trailing zeros trimmed.
///
/// The exponent that picks fixed or scientific notation is taken after
/// rounding, so `999999.5` prints as `1e+06`.
#[must_use]
pub fn format_g(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }
    let rounded = format!("{value:.5e}");
    let (mantissa, exp) = rounded.split_once('e').unwrap_or((rounded.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if (-4..6).contains(&exp) {
        let decimals = usize::try_from(5 - exp).unwrap_or(0);
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Move `path` aside as `<name>_backup_<timestamp>` if it exists.
///
/// A second backup within the same second gets a `_<n>` suffix.
fn backup_if_existing(path: &Path) -> EnsembleResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("export");
    let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%SZ");
    let base = format!("{name}_backup_{stamp}");
    let mut backup = path.with_file_name(&base);
    let mut n = 0;
    while backup.exists() {
        n += 1;
        backup = path.with_file_name(format!("{base}_{n}"));
    }
    fs::rename(path, &backup).map_err(|e| FileSystemError::io(path, e))?;
    debug!(from = %path.display(), to = %backup.display(), "backed up export");
    Ok(())
}

fn write_text(path: &Path, text: &str) -> EnsembleResult<()> {
    write_bytes(path, text.as_bytes(), false).map_err(|e| FileSystemError::io(path, e))?;
    Ok(())
}

fn check_finite(exports: &Exports, realization: usize) -> Result<(), ExecutionError> {
    for (key, values) in exports {
        if let Some((name, _)) = values.iter().find(|(_, v)| v.is_nan()) {
            return Err(ExecutionError::NanInExport {
                key: format!("{key}:{name}"),
                realization,
            });
        }
    }
    Ok(())
}

/// Write `<name>.txt` with one `key:param value` line per exported value.
pub fn value_export_txt(dir: &Path, name: &str, exports: &Exports) -> EnsembleResult<()> {
    let path = dir.join(format!("{name}.txt"));
    backup_if_existing(&path)?;
    if exports.is_empty() {
        return Ok(());
    }
    let mut out = String::new();
    for (key, values) in exports {
        for (param, value) in values {
            out.push_str(&format!("{key}:{param} {}\n", format_g(*value)));
        }
    }
    write_text(&path, &out)
}

/// Write `<name>.json`: hierarchical `{key: {param: value}}` plus flat
/// `"key:param": value` entries. NaN is refused.
pub fn value_export_json(dir: &Path, name: &str, exports: &Exports, realization: usize) -> EnsembleResult<()> {
    let path = dir.join(format!("{name}.json"));
    backup_if_existing(&path)?;
    if exports.is_empty() {
        return Ok(());
    }
    check_finite(exports, realization)?;

    let number = |key: &str, param: &str, v: f64| {
        Number::from_f64(v).map(Value::Number).ok_or_else(|| ExecutionError::NanInExport {
            key: format!("{key}:{param}"),
            realization,
        })
    };

    let mut root = Map::new();
    for (key, values) in exports {
        let mut nested = Map::new();
        for (param, v) in values {
            nested.insert(param.clone(), number(key, param, *v)?);
        }
        root.insert(key.clone(), Value::Object(nested));
    }
    for (key, values) in exports {
        for (param, v) in values {
            root.insert(format!("{key}:{param}"), number(key, param, *v)?);
        }
    }
    let text = serde_json::to_string_pretty(&Value::Object(root))?;
    write_text(&path, &text)
}

/// Render one parameter file; GEN_KW values are also added to `exports`.
///
/// EXT_PARAM values must all be present and finite.
fn render_parameter(
    param: &ParameterConfig,
    values: &[f64],
    realization: usize,
    exports: &mut Exports,
) -> EnsembleResult<String> {
    match &param.kind {
        ParameterKind::GenKw { keys } => {
            if keys.len() != values.len() {
                return Err(ValidationError::ValueCountMismatch {
                    key: param.key.clone(),
                    expected: keys.len(),
                    actual: values.len(),
                }
                .into());
            }
            let transformed: Vec<(String, f64)> = keys
                .iter()
                .zip(values)
                .map(|(k, z)| (k.name.clone(), k.distribution.transform(*z)))
                .collect();
            let text: String = transformed
                .iter()
                .map(|(name, v)| format!("{name} {}\n", format_g(*v)))
                .collect();
            exports.push((param.key.clone(), transformed));
            Ok(text)
        }
        ParameterKind::Field { .. } | ParameterKind::Surface { .. } => {
            Ok(values.iter().map(|v| format!("{}\n", format_g(*v))).collect())
        }
        ParameterKind::ExtParam { keys } => {
            let mut it = values.iter().copied();
            let mut number = |name: String| {
                it.next()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or(ExecutionError::NanInExport { key: name, realization })
            };
            let mut root = Map::new();
            for key in keys {
                if key.suffixes.is_empty() {
                    let v = number(format!("{}:{}", param.key, key.name))?;
                    root.insert(key.name.clone(), v);
                } else {
                    let mut nested = Map::new();
                    for suffix in &key.suffixes {
                        let v = number(format!("{}:{}:{suffix}", param.key, key.name))?;
                        nested.insert(suffix.clone(), v);
                    }
                    root.insert(key.name.clone(), Value::Object(nested));
                }
            }
            Ok(Value::Object(root).to_string())
        }
    }
}

/// Write all parameter files and value exports for one realization.
///
/// Forward-init and externally populated parameters without stored values
/// are skipped; any other missing parameter is an error.
pub fn generate_parameter_files(
    case: &CaseStore,
    ensemble: &EnsembleConfig,
    run_arg: &RunArg,
    export_name: &str,
) -> EnsembleResult<Vec<PathBuf>> {
    let iens = run_arg.realization();
    let dir = run_arg.runpath();
    let mut exports = Exports::new();
    let mut written = Vec::new();

    for param in ensemble.parameters() {
        let optional = param.forward_init || !param.kind.is_sampled();
        if optional && !case.has_parameter(&param.key, iens) {
            continue;
        }
        let values = case.load_parameter(&param.key, iens)?;
        let text = render_parameter(param, &values, iens, &mut exports)?;
        if let Some(file) = &param.output_file {
            let path = dir.join(file);
            write_text(&path, &text)?;
            written.push(path);
        }
    }

    check_finite(&exports, iens)?;
    value_export_txt(dir, export_name, &exports)?;
    value_export_json(dir, export_name, &exports, iens)?;
    Ok(written)
}
