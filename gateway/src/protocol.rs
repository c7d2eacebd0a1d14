//! Wire messages: one JSON object per line.
//!
//! A call is `{"method": "...", "parameters": {...}, "more": bool}`. Replies
//! are `{"parameters": {...}}`, with `"continues": true` on partial replies,
//! or `{"error": "<FaultKind>", "parameters": {"reason": "..."}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stevedore_core::error::ImageError;

use crate::fault::{Fault, FaultKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub parameters: Value,
    /// Caller accepts partial replies
    #[serde(default)]
    pub more: bool,
}

impl Call {
    pub fn new(method: impl Into<String>, parameters: Value) -> Self {
        Self {
            method: method.into(),
            parameters,
            more: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.more = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continues: bool,
}

impl Reply {
    /// Terminal success reply.
    pub fn ok(parameters: Value) -> Self {
        Self {
            error: None,
            parameters,
            continues: false,
        }
    }

    /// Partial reply; more follow.
    pub fn partial(parameters: Value) -> Self {
        Self {
            error: None,
            parameters,
            continues: true,
        }
    }

    pub fn fault(err: &ImageError) -> Self {
        let fault = Fault::from(err);
        let mut parameters = json!({ "reason": fault.reason });
        if !fault.pruned.is_empty() {
            parameters["pruned"] = json!(fault.pruned);
        }
        Self {
            error: Some(fault.kind.as_str().to_string()),
            parameters,
            continues: false,
        }
    }

    /// Caller-side view: the parameters, or the fault.
    pub fn into_result(self) -> Result<Value, Fault> {
        let Some(error) = self.error else {
            return Ok(self.parameters);
        };
        let kind = FaultKind::parse(&error).unwrap_or(FaultKind::StoreUnavailable);
        let pruned = self.parameters["pruned"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Err(Fault {
            kind,
            reason: self.parameters["reason"]
                .as_str()
                .unwrap_or(&error)
                .to_string(),
            pruned,
        })
    }
}
