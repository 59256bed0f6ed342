//! Model price models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, FieldError, Result};

/// Price of a model, in currency units per one million tokens
///
/// `model` may end with `*` to match every model sharing that prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Literal model name or trailing-wildcard pattern
    pub model: String,
    /// Prompt token price
    #[serde(rename = "inputPricePer1M")]
    pub input_price_per_1m: f64,
    /// Cached prompt token price
    #[serde(rename = "cachedInputPricePer1M", default)]
    pub cached_input_price_per_1m: f64,
    /// Completion token price
    #[serde(rename = "outputPricePer1M")]
    pub output_price_per_1m: f64,
}

impl ModelPrice {
    /// Create a price entry
    pub fn new(model: impl Into<String>, input: f64, cached_input: f64, output: f64) -> Self {
        Self {
            model: model.into(),
            input_price_per_1m: input,
            cached_input_price_per_1m: cached_input,
            output_price_per_1m: output,
        }
    }

    /// Validate an untrusted JSON body, reporting every bad field
    pub fn from_json(body: &Value) -> Result<Self> {
        let Some(obj) = body.as_object() else {
            return Err(Error::validation("", "expected an object"));
        };

        let mut errors = Vec::new();

        let model = match obj.get("model") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::String(_)) => {
                errors.push(FieldError::new("model", "must not be empty"));
                String::new()
            }
            _ => {
                errors.push(FieldError::new("model", "required string"));
                String::new()
            }
        };

        let input = price_field(obj.get("inputPricePer1M"), "inputPricePer1M", None, &mut errors);
        let cached = price_field(
            obj.get("cachedInputPricePer1M"),
            "cachedInputPricePer1M",
            Some(0.0),
            &mut errors,
        );
        let output = price_field(obj.get("outputPricePer1M"), "outputPricePer1M", None, &mut errors);

        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }
        Ok(Self::new(model, input, cached, output))
    }
}

fn price_field(
    value: Option<&Value>,
    path: &str,
    default: Option<f64>,
    errors: &mut Vec<FieldError>,
) -> f64 {
    match (value, default) {
        (None | Some(Value::Null), Some(d)) => d,
        (None | Some(Value::Null), None) => {
            errors.push(FieldError::new(path, "required number"));
            0.0
        }
        (Some(v), _) => match v.as_f64() {
            Some(n) if n.is_finite() && n >= 0.0 => n,
            Some(_) => {
                errors.push(FieldError::new(path, "must be a non-negative number"));
                0.0
            }
            None => {
                errors.push(FieldError::new(path, "expected number"));
                0.0
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_from_json_defaults_cached_price() {
        let price = ModelPrice::from_json(&json!({
            "model": "gpt-4o",
            "inputPricePer1M": 2.5,
            "outputPricePer1M": 10
        }))
        .unwrap();
        assert_eq!(price, ModelPrice::new("gpt-4o", 2.5, 0.0, 10.0));
    }

    #[test]
    fn test_from_json_reports_each_field() {
        let err = ModelPrice::from_json(&json!({
            "model": "",
            "inputPricePer1M": -1,
            "outputPricePer1M": "ten"
        }))
        .unwrap_err();

        let Error::Validation(fields) = err else {
            panic!("expected validation error");
        };
        let paths: Vec<_> = fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["model", "inputPricePer1M", "outputPricePer1M"]);
    }

    #[test]
    fn test_serde_names() {
        let value = serde_json::to_value(ModelPrice::new("gemini-2*", 1.25, 0.3, 5.0)).unwrap();
        assert_eq!(
            value,
            json!({
                "model": "gemini-2*",
                "inputPricePer1M": 1.25,
                "cachedInputPricePer1M": 0.3,
                "outputPricePer1M": 5.0
            })
        );
    }
}
