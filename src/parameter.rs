//! Parameter definitions.
//!
//! Parameter kinds form a closed set; sampling, init-file parsing and
//! parameter-file generation all `match` on [`ParameterKind`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

use crate::error::{ConfigurationError, ValidationError};

/// Prior distribution of a single scalar keyword.
///
/// Stored values are standard-normal; the distribution is applied when the
/// value is exported for the forward model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Distribution {
    /// Always `value`.
    Const { value: f64 },
    /// `mean + std * z`.
    Normal { mean: f64, std: f64 },
    /// `exp(mean + std * z)`.
    LogNormal { mean: f64, std: f64 },
    /// Uniform on `[min, max]`.
    Uniform { min: f64, max: f64 },
    /// Log-uniform on `[min, max]`, both positive.
    LogUniform { min: f64, max: f64 },
}

impl Distribution {
    /// Map a standard-normal draw onto this distribution.
    #[must_use]
    pub fn transform(&self, z: f64) -> f64 {
        match *self {
            Self::Const { value } => value,
            Self::Normal { mean, std } => mean + std * z,
            Self::LogNormal { mean, std } => (mean + std * z).exp(),
            Self::Uniform { min, max } => min + (max - min) * normal_cdf(z),
            Self::LogUniform { min, max } => {
                let (lo, hi) = (min.ln(), max.ln());
                (lo + (hi - lo) * normal_cdf(z)).exp()
            }
        }
    }

    fn validate(&self, name: &str) -> Result<(), ValidationError> {
        let bad = |reason: &str| ValidationError::InvalidConfig {
            field: name.to_string(),
            reason: reason.to_string(),
        };
        match *self {
            Self::Const { value } if !value.is_finite() => Err(bad("constant must be finite")),
            Self::Normal { std, .. } | Self::LogNormal { std, .. } if !(std >= 0.0) => {
                Err(bad("std must be non-negative"))
            }
            Self::Uniform { min, max } if !(min < max) => Err(bad("min must be below max")),
            Self::LogUniform { min, max } if !(min > 0.0 && min < max) => {
                Err(bad("log-uniform needs 0 < min < max"))
            }
            _ => Ok(()),
        }
    }
}

/// Standard normal CDF.
fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// One named scalar of a GEN_KW parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenKwKey {
    /// Keyword name.
    pub name: String,
    /// Prior distribution.
    pub distribution: Distribution,
}

impl GenKwKey {
    /// Create a keyword.
    pub fn new(name: impl Into<String>, distribution: Distribution) -> Self {
        Self {
            name: name.into(),
            distribution,
        }
    }
}

/// One key of an externally populated parameter, with optional suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtKey {
    /// Key name.
    pub name: String,
    /// Suffixes; empty means a single scalar.
    #[serde(default)]
    pub suffixes: Vec<String>,
}

impl ExtKey {
    fn width(&self) -> usize {
        self.suffixes.len().max(1)
    }
}

/// The closed set of parameter kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterKind {
    /// Named scalars with prior distributions.
    GenKw { keys: Vec<GenKwKey> },
    /// A gridded field, flattened.
    Field { size: usize },
    /// A surface, flattened.
    Surface { size: usize },
    /// Keys populated by an external tool.
    ExtParam { keys: Vec<ExtKey> },
}

impl ParameterKind {
    /// Number of values per realization.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::GenKw { keys } => keys.len(),
            Self::Field { size } | Self::Surface { size } => *size,
            Self::ExtParam { keys } => keys.iter().map(ExtKey::width).sum(),
        }
    }

    /// Short kind name, as used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GenKw { .. } => "GEN_KW",
            Self::Field { .. } => "FIELD",
            Self::Surface { .. } => "SURFACE",
            Self::ExtParam { .. } => "EXT_PARAM",
        }
    }

    /// Whether values may be drawn from the random stream.
    ///
    /// External parameters are only ever read from files.
    #[must_use]
    pub const fn is_sampled(&self) -> bool {
        !matches!(self, Self::ExtParam { .. })
    }

    /// Flat value names: keyword names, `key:suffix` pairs, or indices.
    #[must_use]
    pub fn value_names(&self) -> Vec<String> {
        match self {
            Self::GenKw { keys } => keys.iter().map(|k| k.name.clone()).collect(),
            Self::Field { size } | Self::Surface { size } => (0..*size).map(|i| i.to_string()).collect(),
            Self::ExtParam { keys } => keys
                .iter()
                .flat_map(|k| {
                    if k.suffixes.is_empty() {
                        vec![k.name.clone()]
                    } else {
                        k.suffixes.iter().map(|s| format!("{}:{s}", k.name)).collect()
                    }
                })
                .collect(),
        }
    }

    /// Parse init-file text into a flat value vector.
    ///
    /// - GEN_KW: one value per line, either `value` or `NAME value`.
    /// - FIELD / SURFACE: whitespace separated values.
    /// - EXT_PARAM: a JSON object of `key: value` or `key: {suffix: value}`.
    pub fn parse_values(&self, text: &str) -> Result<Vec<f64>, String> {
        let values = match self {
            Self::GenKw { keys } => parse_gen_kw(keys, text)?,
            Self::Field { .. } | Self::Surface { .. } => text
                .split_whitespace()
                .map(|tok| tok.parse::<f64>().map_err(|e| format!("bad value '{tok}': {e}")))
                .collect::<Result<Vec<_>, _>>()?,
            Self::ExtParam { keys } => parse_ext_param(keys, text)?,
        };
        if values.len() != self.size() {
            return Err(format!("expected {} values, found {}", self.size(), values.len()));
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(format!("value {pos} is not finite"));
        }
        Ok(values)
    }

    fn validate(&self, key: &str) -> Result<(), ValidationError> {
        if self.size() == 0 {
            return Err(ValidationError::InvalidConfig {
                field: key.to_string(),
                reason: format!("{} parameter must have at least one value", self.name()),
            });
        }
        if let Self::GenKw { keys } = self {
            for k in keys {
                k.distribution.validate(&format!("{key}:{}", k.name))?;
            }
        }
        Ok(())
    }
}

fn parse_gen_kw(keys: &[GenKwKey], text: &str) -> Result<Vec<f64>, String> {
    let mut ordered = Vec::new();
    let mut named = BTreeMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(value), None) => ordered.push(
                value
                    .parse::<f64>()
                    .map_err(|e| format!("bad value '{value}': {e}"))?,
            ),
            (Some(name), Some(value)) => {
                let v = value
                    .parse::<f64>()
                    .map_err(|e| format!("bad value '{value}' for {name}: {e}"))?;
                named.insert(name.to_string(), v);
            }
            _ => {}
        }
    }
    if named.is_empty() {
        return Ok(ordered);
    }
    if !ordered.is_empty() {
        return Err("mixes named and positional values".to_string());
    }
    keys.iter()
        .map(|k| named.get(&k.name).copied().ok_or_else(|| format!("missing keyword {}", k.name)))
        .collect()
}

fn parse_ext_param(keys: &[ExtKey], text: &str) -> Result<Vec<f64>, String> {
    let doc: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    for key in keys {
        let entry = doc.get(&key.name).ok_or_else(|| format!("missing key {}", key.name))?;
        if key.suffixes.is_empty() {
            out.push(entry.as_f64().ok_or_else(|| format!("{} is not a number", key.name))?);
        } else {
            for suffix in &key.suffixes {
                let v = entry
                    .get(suffix)
                    .and_then(serde_json::Value::as_f64)
                    .ok_or_else(|| format!("missing number {}:{suffix}", key.name))?;
                out.push(v);
            }
        }
    }
    Ok(out)
}

/// One configured parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// Unique key.
    pub key: String,
    /// Kind and shape.
    pub kind: ParameterKind,
    /// Populated by the forward model instead of by prior sampling.
    #[serde(default)]
    pub forward_init: bool,
    /// Init-file template (`<IENS>` or `%d` for the realization).
    ///
    /// For forward-init parameters this is resolved inside the run path.
    #[serde(default)]
    pub init_files: Option<String>,
    /// File name written into each run path for the forward model.
    #[serde(default)]
    pub output_file: Option<String>,
}

impl ParameterConfig {
    /// Parameter with no init files or output file.
    pub fn new(key: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            key: key.into(),
            kind,
            forward_init: false,
            init_files: None,
            output_file: None,
        }
    }

    /// Set the init-file template.
    #[must_use]
    pub fn with_init_files(mut self, template: impl Into<String>) -> Self {
        self.init_files = Some(template.into());
        self
    }

    /// Mark as forward-init.
    #[must_use]
    pub fn with_forward_init(mut self) -> Self {
        self.forward_init = true;
        self
    }

    /// Set the output file name.
    #[must_use]
    pub fn with_output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = Some(name.into());
        self
    }

    /// Values per realization.
    #[must_use]
    pub fn size(&self) -> usize {
        self.kind.size()
    }

    /// Validate this parameter.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.trim().is_empty() {
            return Err(ValidationError::InvalidConfig {
                field: "parameter.key".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        self.kind.validate(&self.key)?;
        if self.forward_init && self.init_files.is_none() {
            return Err(ValidationError::InvalidConfig {
                field: self.key.clone(),
                reason: "forward-init parameters need an init-file template".to_string(),
            });
        }
        Ok(())
    }
}

/// Ensemble definition: parameters (in declaration order) and response keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    parameters: Vec<ParameterConfig>,
    #[serde(default)]
    responses: Vec<String>,
}

impl EnsembleConfig {
    /// Empty ensemble definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter; keys must be unique.
    pub fn add_parameter(&mut self, config: ParameterConfig) -> Result<(), ValidationError> {
        config.validate()?;
        if self.parameters.iter().any(|p| p.key == config.key) {
            return Err(ValidationError::InvalidConfig {
                field: config.key,
                reason: "duplicate parameter key".to_string(),
            });
        }
        self.parameters.push(config);
        Ok(())
    }

    /// Builder-style [`Self::add_parameter`].
    pub fn with_parameter(mut self, config: ParameterConfig) -> Result<Self, ValidationError> {
        self.add_parameter(config)?;
        Ok(self)
    }

    /// Declare a response key.
    pub fn add_response(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.responses.contains(&key) {
            self.responses.push(key);
        }
    }

    /// Builder-style [`Self::add_response`].
    #[must_use]
    pub fn with_response(mut self, key: impl Into<String>) -> Self {
        self.add_response(key);
        self
    }

    /// Look up a parameter.
    pub fn parameter(&self, key: &str) -> Result<&ParameterConfig, ConfigurationError> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .ok_or_else(|| ConfigurationError::UnknownParameter { key: key.to_string() })
    }

    /// All parameters in declaration order.
    #[must_use]
    pub fn parameters(&self) -> &[ParameterConfig] {
        &self.parameters
    }

    /// Parameter keys in declaration order.
    #[must_use]
    pub fn parameter_keys(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.key.clone()).collect()
    }

    /// Declared response keys.
    #[must_use]
    pub fn response_keys(&self) -> &[String] {
        &self.responses
    }

    /// Returns true if `key` is a declared response.
    #[must_use]
    pub fn has_response(&self, key: &str) -> bool {
        self.responses.iter().any(|r| r == key)
    }

    /// Returns true if any parameter is forward-init.
    #[must_use]
    pub fn has_forward_init(&self) -> bool {
        self.parameters.iter().any(|p| p.forward_init)
    }
}
