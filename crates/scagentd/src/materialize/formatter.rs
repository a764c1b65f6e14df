//! Secret formatters: render a fetched secret map into file bytes.

use sc_shared::ScError;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretFormatter {
    Yaml,
    Json,
    Env,
    Template(String),
}

impl SecretFormatter {
    /// `template` needs the template text; the other discriminators
    /// stand alone. Unknown discriminators fail configuration load.
    pub fn parse(name: &str, template: Option<&str>) -> Result<Self, ScError> {
        match name {
            "yaml" => Ok(SecretFormatter::Yaml),
            "json" => Ok(SecretFormatter::Json),
            "env" => Ok(SecretFormatter::Env),
            "template" => template
                .map(|t| SecretFormatter::Template(t.to_string()))
                .ok_or_else(|| ScError::Config("template formatter needs a template".into())),
            other => Err(ScError::Config(format!("unknown formatter {other:?}"))),
        }
    }

    pub fn render(&self, secret: &Map<String, Value>) -> Result<Vec<u8>, ScError> {
        match self {
            SecretFormatter::Yaml => serde_yaml::to_string(secret)
                .map(String::into_bytes)
                .map_err(|e| ScError::Internal(e.to_string())),
            SecretFormatter::Json => {
                let mut out = serde_json::to_vec_pretty(secret)?;
                out.push(b'\n');
                Ok(out)
            }
            SecretFormatter::Env => {
                // Sorted for a stable digest across fetches.
                let mut keys: Vec<&String> = secret.keys().collect();
                keys.sort();
                let mut out = String::new();
                for key in keys {
                    let value = render_scalar(&secret[key]);
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
                    out.push_str("\"\n");
                }
                Ok(out.into_bytes())
            }
            SecretFormatter::Template(template) => {
                let mut out = template.clone();
                for (key, value) in secret {
                    let rendered = render_scalar(value);
                    out = out
                        .replace(&format!("{{{{ {key} }}}}"), &rendered)
                        .replace(&format!("{{{{{key}}}}}"), &rendered);
                }
                Ok(out.into_bytes())
            }
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
