use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// The lifecycle stages a handled studio request reports to `events.jsonl`.
///
/// Not every operation passes through every stage: text-only operations skip
/// `Preprocessed`, and `Failed` replaces `Delivered` on the error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Preprocessed,
    ModelCompleted,
    Delivered,
    Failed,
}

impl RequestStage {
    pub fn event_type(self) -> &'static str {
        match self {
            RequestStage::Received => "request_received",
            RequestStage::Preprocessed => "upload_preprocessed",
            RequestStage::ModelCompleted => "model_completed",
            RequestStage::Delivered => "payload_delivered",
            RequestStage::Failed => "request_failed",
        }
    }
}

/// Append-only log for one handled request.
///
/// Every line is a compact JSON object carrying the stage's event type, the
/// operation, the request id, and an RFC3339 timestamp; the caller payload is
/// merged last and may override those defaults. Appends are serialized with a
/// mutex so interleaved stages of concurrent requests stay line-atomic.
#[derive(Debug)]
pub struct RequestLog {
    path: PathBuf,
    op: String,
    request_id: String,
    lock: Mutex<()>,
}

impl RequestLog {
    pub fn new(
        path: impl Into<PathBuf>,
        op: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            op: op.into(),
            request_id: request_id.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn emit(&self, stage: RequestStage, payload: EventPayload) -> Result<Value> {
        let mut event = EventPayload::new();
        event.insert(
            "type".to_string(),
            Value::String(stage.event_type().to_string()),
        );
        event.insert("op".to_string(), Value::String(self.op.clone()));
        event.insert(
            "request_id".to_string(),
            Value::String(self.request_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(payload);
        self.append_line(&event)?;
        Ok(Value::Object(event))
    }

    fn append_line(&self, event: &EventPayload) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(event)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("request log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
