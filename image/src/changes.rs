//! Dockerfile-style change directives applied to an image config
//! (`CMD /start`, `ENV A=b`, `LABEL k=v`, ...).

use serde_json::{json, Map, Value};
use stevedore_core::error::{ImageError, Result};

/// Apply each directive in order to `config["config"]`.
pub fn apply_changes(config: &mut Value, changes: &[String]) -> Result<()> {
    if !config["config"].is_object() {
        config["config"] = json!({});
    }
    for change in changes {
        apply_change(config, change)?;
    }
    Ok(())
}

fn apply_change(config: &mut Value, change: &str) -> Result<()> {
    let trimmed = change.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let (directive, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((d, r)) => (d, r.trim()),
        None => (trimmed, ""),
    };
    if rest.is_empty() {
        return Err(invalid(change, "missing value"));
    }

    let c = &mut config["config"];
    match directive.to_ascii_uppercase().as_str() {
        "CMD" => c["Cmd"] = command_form(rest),
        "ENTRYPOINT" => c["Entrypoint"] = command_form(rest),
        "WORKDIR" => c["WorkingDir"] = json!(rest),
        "USER" => c["User"] = json!(rest),
        "STOPSIGNAL" => c["StopSignal"] = json!(rest),
        "ENV" => {
            for (key, value) in key_values(rest, change)? {
                set_env(c, &key, &value);
            }
        }
        "LABEL" => {
            let pairs = key_values(rest, change)?;
            update_object(c, "Labels", |labels| {
                for (key, value) in pairs {
                    labels.insert(key, json!(value));
                }
            });
        }
        "EXPOSE" => update_object(c, "ExposedPorts", |ports| {
            for port in rest.split_whitespace() {
                let port = if port.contains('/') {
                    port.to_string()
                } else {
                    format!("{}/tcp", port)
                };
                ports.insert(port, json!({}));
            }
        }),
        "VOLUME" => {
            let paths = match serde_json::from_str::<Vec<String>>(rest) {
                Ok(paths) => paths,
                Err(_) => rest.split_whitespace().map(str::to_string).collect(),
            };
            update_object(c, "Volumes", |volumes| {
                for path in paths {
                    volumes.insert(path, json!({}));
                }
            });
        }
        _ => return Err(invalid(change, "unsupported directive")),
    }
    Ok(())
}

/// JSON exec form is kept as-is; anything else runs under `/bin/sh -c`.
fn command_form(rest: &str) -> Value {
    match serde_json::from_str::<Vec<String>>(rest) {
        Ok(args) => json!(args),
        Err(_) => json!(["/bin/sh", "-c", rest]),
    }
}

/// `k=v k2="v 2"` pairs, or the legacy single `k v` form.
fn key_values(rest: &str, change: &str) -> Result<Vec<(String, String)>> {
    if !rest.contains('=') {
        return match rest.split_once(char::is_whitespace) {
            Some((k, v)) => Ok(vec![(k.to_string(), v.trim().to_string())]),
            None => Err(invalid(change, "expected key=value")),
        };
    }

    let mut pairs = Vec::new();
    for word in shell_words(rest) {
        match word.split_once('=') {
            Some((k, v)) if !k.is_empty() => pairs.push((k.to_string(), v.to_string())),
            _ => return Err(invalid(change, "expected key=value")),
        }
    }
    Ok(pairs)
}

/// Split on whitespace, honouring double and single quotes.
pub(crate) fn shell_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in s.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub(crate) fn set_env(c: &mut Value, key: &str, value: &str) {
    let mut env: Vec<Value> = c["Env"].as_array().cloned().unwrap_or_default();
    let prefix = format!("{}=", key);
    env.retain(|e| !e.as_str().map_or(false, |s| s.starts_with(&prefix)));
    env.push(json!(format!("{}={}", key, value)));
    c["Env"] = json!(env);
}

pub(crate) fn update_object(c: &mut Value, key: &str, f: impl FnOnce(&mut Map<String, Value>)) {
    let mut map = c[key].as_object().cloned().unwrap_or_default();
    f(&mut map);
    c[key] = Value::Object(map);
}

fn invalid(change: &str, reason: &str) -> ImageError {
    ImageError::InvalidArgument(format!("Invalid change '{}': {}", change, reason))
}
