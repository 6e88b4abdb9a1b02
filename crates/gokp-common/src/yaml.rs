//! YAML parsing into `serde_json::Value` using yaml-rust2
//!
//! Manifests are parsed with yaml-rust2 and converted to JSON values so the
//! rest of the code only deals with one dynamic representation, the same one
//! kube's `DynamicObject` serializes to.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// A YAML document could not be parsed or converted
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// Parse a single-document YAML string.
///
/// Returns `None` for empty input or a document that is only `null`, which
/// is what kustomize emits for comment-only fragments.
pub fn parse_document(input: &str) -> Result<Option<Value>, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => match yaml_to_json(doc)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        },
        None => Ok(None),
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(raw) => {
            let f: f64 = raw
                .parse()
                .map_err(|e| YamlError(format!("invalid float {raw}: {e}")))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Yaml::Hash(hash) => {
            let mut map = Map::with_capacity(hash.len());
            for (key, value) in hash {
                let key = match key {
                    Yaml::String(s) | Yaml::Real(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    other => return Err(YamlError(format!("unsupported mapping key {other:?}"))),
                };
                map.insert(key, yaml_to_json(value)?);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) => return Err(YamlError("YAML aliases are not supported".to_string())),
        Yaml::BadValue => return Err(YamlError("bad YAML value".to_string())),
    })
}
