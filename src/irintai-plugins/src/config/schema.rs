//! Settings schema rendered by the host's configuration form.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConfigMap;

/// Widget kind for a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFieldType {
    #[default]
    String,
    Text,
    Multiline,
    Password,
    Color,
    Boolean,
    Integer,
    Float,
    Choice,
}

/// One configuration field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigField {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    #[serde(rename = "type", default)]
    pub field_type: ConfigFieldType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Allowed values for `choice` fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment: Option<f64>,
}

impl ConfigField {
    pub fn new(field_type: ConfigFieldType) -> Self {
        Self {
            field_type,
            ..Default::default()
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn options<I, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Field inferred from an existing value.
    pub fn inferred(key: &str, value: &Value) -> Self {
        let field_type = match value {
            Value::Bool(_) => ConfigFieldType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ConfigFieldType::Integer,
            Value::Number(_) => ConfigFieldType::Float,
            _ => ConfigFieldType::String,
        };

        Self {
            label: title_case(&key.replace('_', " ")),
            field_type,
            default: Some(value.clone()),
            description: format!("Configuration value for {key}"),
            ..Default::default()
        }
    }

    /// Describe why `value` does not fit this field, if it doesn't.
    pub fn check(&self, value: &Value) -> Option<String> {
        match self.field_type {
            ConfigFieldType::Boolean if !value.is_boolean() => {
                Some("expected a boolean".to_string())
            }
            ConfigFieldType::Integer if !(value.is_i64() || value.is_u64()) => {
                Some("expected an integer".to_string())
            }
            ConfigFieldType::Float if !value.is_number() => Some("expected a number".to_string()),
            ConfigFieldType::Integer | ConfigFieldType::Float => {
                let n = value.as_f64()?;
                match (self.min, self.max) {
                    (Some(min), _) if n < min => Some(format!("must be at least {min}")),
                    (_, Some(max)) if n > max => Some(format!("must be at most {max}")),
                    _ => None,
                }
            }
            ConfigFieldType::Choice if !self.options.is_empty() && !self.options.contains(value) => {
                Some("not one of the allowed options".to_string())
            }
            _ => None,
        }
    }
}

/// Ordered map of field name to field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    fields: IndexMap<String, ConfigField>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field: ConfigField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, field: ConfigField) {
        self.fields.insert(name.into(), field);
    }

    pub fn get(&self, name: &str) -> Option<&ConfigField> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigField)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Schema inferred from current values; `None` when there are none.
    pub fn infer(config: &ConfigMap) -> Option<Self> {
        if config.is_empty() {
            return None;
        }
        let fields = config
            .iter()
            .map(|(key, value)| (key.clone(), ConfigField::inferred(key, value)))
            .collect();
        Some(Self { fields })
    }

    /// Declared defaults; fields without one default to an empty string.
    pub fn defaults(&self) -> ConfigMap {
        self.fields
            .iter()
            .map(|(name, field)| {
                let value = field
                    .default
                    .clone()
                    .unwrap_or_else(|| Value::String(String::new()));
                (name.clone(), value)
            })
            .collect()
    }

    /// Problems with `values`, as `(field, message)` pairs. Unknown keys
    /// are accepted.
    pub fn validate(&self, values: &ConfigMap) -> Vec<(String, String)> {
        values
            .iter()
            .filter_map(|(key, value)| {
                let problem = self.fields.get(key)?.check(value)?;
                Some((key.clone(), problem))
            })
            .collect()
    }
}

/// Capitalize each run of letters and lowercase the rest of it.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}
