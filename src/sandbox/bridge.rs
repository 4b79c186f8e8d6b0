//! Host <-> sandbox data marshaling.
//!
//! The sandbox context is built without the engine's native `JSON` object.
//! Data enters as plain strings (header values, or JSON text parsed in-sandbox
//! by the shim below) and leaves as the text produced by the shim's
//! `stringify`. Nothing else crosses: no host functions, no object handles.

use rquickjs::{Ctx, Object};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::SandboxError;

/// In-sandbox JSON micro-protocol, version 1.
///
/// Operator scripts may rely on its quirks, so the encoding rules are frozen:
/// strings are quoted verbatim (the `replace` substitutes `"` with itself, so
/// nothing is escaped), object keys are emitted unescaped, functions and
/// `undefined` encode to `undefined`, and `parse` evaluates its input as a JS
/// expression.
pub const JSON_SHIM: &str = r#"
const JSON = {
  parse: (str) => eval('(' + str + ')'),
  stringify: (obj) => {
    if (obj === null) return 'null';
    if (typeof obj === 'string') return '"' + obj.replace(/"/g, '\"') + '"';
    if (typeof obj === 'number' || typeof obj === 'boolean') return String(obj);
    if (Array.isArray(obj)) return '[' + obj.map(v => JSON.stringify(v)).join(',') + ']';
    if (typeof obj === 'object') {
      const pairs = [];
      for (const key in obj) {
        if (obj.hasOwnProperty(key)) {
          pairs.push('"' + key + '":' + JSON.stringify(obj[key]));
        }
      }
      return '{' + pairs.join(',') + '}';
    }
    return undefined;
  }
};
"#;

/// One named global made available to the script.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A flat string map, built as a native object of string properties.
    Strings {
        name: &'static str,
        entries: BTreeMap<String, String>,
    },
    /// Arbitrary JSON, copied in as text and parsed inside the sandbox.
    Json { name: &'static str, value: Value },
}

impl Binding {
    pub fn strings(name: &'static str, entries: BTreeMap<String, String>) -> Self {
        Binding::Strings { name, entries }
    }

    pub fn json(name: &'static str, value: Value) -> Self {
        Binding::Json { name, value }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Binding::Strings { name, .. } | Binding::Json { name, .. } => name,
        }
    }
}

/// Copy every binding into the context's globals and return the prelude
/// script that installs the shim and decodes the JSON bindings.
pub fn install(ctx: &Ctx<'_>, bindings: &[Binding]) -> Result<String, SandboxError> {
    let globals = ctx.globals();
    let mut prelude = String::from(JSON_SHIM);

    for binding in bindings {
        match binding {
            Binding::Strings { name, entries } => {
                let obj = Object::new(ctx.clone()).map_err(setup_error)?;
                for (key, value) in entries {
                    obj.set(key.as_str(), value.as_str()).map_err(setup_error)?;
                }
                globals.set(*name, obj).map_err(setup_error)?;
            }
            Binding::Json { name, value } => {
                let carrier = format!("_{name}Str");
                let text = serde_json::to_string(value)
                    .map_err(|e| SandboxError::Setup(format!("encode {name}: {e}")))?;
                globals.set(carrier.as_str(), text).map_err(setup_error)?;
                prelude.push_str(&format!("const {name} = JSON.parse({carrier});\n"));
            }
        }
    }

    Ok(prelude)
}

/// Wrap an entry expression so its value leaves through the shim encoder.
pub fn encode_entry(entry: &str) -> String {
    format!("JSON.stringify(({entry}))")
}

/// Decode the shim's output. `None` means the script produced `undefined`.
pub fn decode(encoded: Option<String>) -> Result<Option<Value>, SandboxError> {
    match encoded {
        None => Ok(None),
        Some(text) if text == "undefined" => Ok(None),
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            SandboxError::Decode(format!("{e} in {}", preview(&text)))
        }),
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX).collect();
    format!("{head}...")
}

fn setup_error(e: rquickjs::Error) -> SandboxError {
    SandboxError::Setup(e.to_string())
}
