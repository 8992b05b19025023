use serde::{Deserialize, Serialize};

use crate::error::FedeError;

pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FedeRequest {
    Ping,
    Health,
    Chat {
        user_id: uuid::Uuid,
        session_id: Option<uuid::Uuid>,
        message: String,
        #[serde(default)]
        category: Option<String>,
    },
    SelectFooter {
        #[serde(default)]
        key_phrase: Option<String>,
    },
    Ingest {
        payload: serde_json::Value,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FedeResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Machine-readable error code, see [`FedeError::code`].
    #[serde(default)]
    pub code: Option<String>,
    pub version: String,
}

impl FedeResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            code: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn err(code: &str, msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            code: Some(code.to_string()),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn from_error(e: &FedeError) -> Self {
        Self::err(e.code(), e.to_string())
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
