//! Action log: the structured record of one unit of work.
//!
//! # Lifecycle
//! ```text
//! begin(action, type) → put_context / stat (via the scope) → end → output(sink)
//!                                   ↑
//!               record_failure (on abnormal termination)
//! ```
//!
//! A record is emitted once. After `output` its context and stats are
//! released and further `output` calls emit nothing.

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::observability::metrics;
use crate::observability::sink::RecordSink;
use crate::trace::id::next_id;
use crate::trace::mask::{filter, masked_fields};
use crate::trace::scope::{ScopeLink, TraceScope};

/// Outcome of a unit of work, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    #[default]
    Ok,
    Warn,
    Error,
}

impl ActionResult {
    /// Serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionResult::Ok => "ok",
            ActionResult::Warn => "warn",
            ActionResult::Error => "error",
        }
    }
}

/// Structured record of one unit of work.
#[derive(Debug)]
pub struct ActionLog {
    date: DateTime<Utc>,
    started: Instant,
    action_type: String,
    scope: TraceScope,
    ref_id: Option<String>,
    client: Option<String>,
    request_body: Option<String>,
    response_body: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    stack_trace: Option<String>,
    result: ActionResult,
    elapsed_nanos: Option<u64>,
    emitted: bool,
}

impl ActionLog {
    /// Start a new root record.
    pub fn begin(action: impl Into<String>, action_type: impl Into<String>) -> Self {
        let action_type = action_type.into();
        let mut scope = TraceScope::new(next_id(), action.into());
        scope.put_context("action_type", [action_type.clone()]);

        Self {
            date: Utc::now(),
            started: Instant::now(),
            action_type,
            scope,
            ref_id: None,
            client: None,
            request_body: None,
            response_body: None,
            error_code: None,
            error_message: None,
            stack_trace: None,
            result: ActionResult::Ok,
            elapsed_nanos: None,
            emitted: false,
        }
    }

    /// Inert stand-in for a record that was moved out. Never emits.
    pub(crate) fn vacant() -> Self {
        Self {
            date: Utc::now(),
            started: Instant::now(),
            action_type: String::new(),
            scope: TraceScope::detached(),
            ref_id: None,
            client: None,
            request_body: None,
            response_body: None,
            error_code: None,
            error_message: None,
            stack_trace: None,
            result: ActionResult::Ok,
            elapsed_nanos: None,
            emitted: true,
        }
    }

    /// Start a record caused by the unit that produced `parent`.
    ///
    /// With a non-empty parent action the new action is chained as
    /// `<parent>:task:<action>` and `ref_id` points at the parent record.
    pub fn begin_child(parent: &ScopeLink, action: &str, action_type: impl Into<String>) -> Self {
        if !parent.has_root() {
            return Self::begin(action, action_type);
        }
        let mut log = Self::begin(format!("{}:task:{}", parent.action, action), action_type);
        log.ref_id = Some(parent.id.clone());
        log
    }

    /// Trace id, fixed at `begin`.
    pub fn id(&self) -> &str {
        self.scope.id()
    }

    /// Hierarchical action name.
    pub fn action(&self) -> &str {
        self.scope.action()
    }

    /// Kind of unit, e.g. `web`, `task`.
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Id of the parent record, if any.
    pub fn ref_id(&self) -> Option<&str> {
        self.ref_id.as_deref()
    }

    /// Current result.
    pub fn result(&self) -> ActionResult {
        self.result
    }

    /// Wall-clock start time.
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    /// Nanoseconds between `begin` and `end`; `None` until ended.
    pub fn elapsed_nanos(&self) -> Option<u64> {
        self.elapsed_nanos
    }

    /// Whether `output` already emitted the record.
    pub fn is_emitted(&self) -> bool {
        self.emitted
    }

    /// The carrier for nested work within this unit.
    pub fn scope(&self) -> &TraceScope {
        &self.scope
    }

    /// Scope handed to nested calls.
    pub fn scope_mut(&mut self) -> &mut TraceScope {
        &mut self.scope
    }

    /// Replace the action name.
    pub fn rename(&mut self, action: impl Into<String>) {
        self.scope.set_action(action.into());
    }

    /// Caller of the unit of work.
    pub fn set_client(&mut self, client: impl Into<String>) {
        self.client = Some(client.into());
    }

    /// Request body, masked on output.
    pub fn set_request_body(&mut self, body: impl Into<String>) {
        self.request_body = Some(body.into());
    }

    /// Response body, masked on output.
    pub fn set_response_body(&mut self, body: impl Into<String>) {
        self.response_body = Some(body.into());
    }

    /// Append context values; see [`TraceScope::put_context`].
    pub fn put_context<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.put_context(key, values);
    }

    /// Overwrite a stat.
    pub fn stat(&mut self, key: &str, value: f64) {
        self.scope.stat(key, value);
    }

    /// Raise the result to `result` if it is more severe than the current one.
    pub fn escalate(&mut self, result: ActionResult) {
        self.result = self.result.max(result);
    }

    /// Mark the record failed with the given error details.
    pub fn fail(&mut self, code: impl Into<String>, message: impl Into<String>, stack_trace: String) {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.stack_trace = Some(stack_trace);
        self.escalate(ActionResult::Error);
    }

    /// Error code, set by a failure.
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// Error message, set by a failure.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Stack trace captured at the failure.
    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    /// Close the record. Only the first call computes the elapsed time.
    pub fn end(&mut self) {
        if self.elapsed_nanos.is_none() {
            self.elapsed_nanos = Some(self.started.elapsed().as_nanos() as u64);
        }
    }

    /// Close the record with an explicit result.
    pub fn end_with(&mut self, result: ActionResult) {
        self.escalate(result);
        self.end();
    }

    /// Serialize the record as one flat JSON object.
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("id".into(), self.id().into());
        fields.insert(
            "date".into(),
            self.date.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
        );
        fields.insert("action".into(), self.action().into());
        fields.insert("action_type".into(), self.action_type.clone().into());
        fields.insert("result".into(), self.result.as_str().into());
        insert_opt(&mut fields, "ref_id", &self.ref_id);
        insert_opt(&mut fields, "client", &self.client);
        insert_opt(&mut fields, "error_code", &self.error_code);
        insert_opt(&mut fields, "error_message", &self.error_message);
        fields.insert("elapsed".into(), self.elapsed_nanos.unwrap_or_default().into());

        let masked = masked_fields();
        if let Some(body) = &self.request_body {
            fields.insert("request_body".into(), filter(body, masked.iter()).into());
        }
        if let Some(body) = &self.response_body {
            fields.insert("response_body".into(), filter(body, masked.iter()).into());
        }
        insert_opt(&mut fields, "stack_trace", &self.stack_trace);

        for (key, values) in self.scope.context_map() {
            let value = match values.as_slice() {
                [single] => Value::String(single.clone()),
                many => Value::from(many.to_vec()),
            };
            fields.insert(format!("context.{}", key), value);
        }
        for (key, value) in self.scope.stat_map() {
            fields.insert(format!("stat.{}", key), Value::from(*value));
        }

        Value::Object(fields)
    }

    /// Emit the record to `sink` and release its accumulators.
    pub fn output(&mut self, sink: &dyn RecordSink) {
        if self.emitted {
            tracing::debug!(id = %self.id(), "Action log already emitted");
            return;
        }
        self.end();
        let line = self.to_json().to_string();
        sink.emit(&line);
        metrics::record_action_log(self.result.as_str());

        self.emitted = true;
        self.scope.take_maps();
    }
}

fn insert_opt(fields: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
        fields.insert(key.to_string(), v.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::sink::MemorySink;
    use crate::trace::mask::register_masked_fields;

    #[test]
    fn test_begin_assigns_identity_and_action_type() {
        let log = ActionLog::begin("api:get:/users", "web");
        assert_eq!(log.id().len(), crate::trace::id::ID_LEN);
        assert_eq!(log.action(), "api:get:/users");
        assert_eq!(log.scope().context("action_type").unwrap(), ["web"]);
        assert!(log.elapsed_nanos().is_none());
        assert_eq!(log.result(), ActionResult::Ok);
    }

    #[test]
    fn test_child_chains_action_and_links_parent() {
        let parent = ActionLog::begin("root", "job");
        let child = ActionLog::begin_child(&parent.scope().link(), "sync", "task");
        assert_eq!(child.action(), "root:task:sync");
        assert_eq!(child.ref_id(), Some(parent.id()));
        assert_ne!(child.id(), parent.id());

        let orphan = ActionLog::begin_child(&TraceScope::detached().link(), "sync", "task");
        assert_eq!(orphan.action(), "sync");
        assert!(orphan.ref_id().is_none());
    }

    #[test]
    fn test_output_flattens_context_and_stats() {
        let sink = MemorySink::default();
        let mut log = ActionLog::begin("job:cleanup", "job");
        log.put_context("table", ["users"]);
        log.put_context("table", ["orders"]);
        log.stat("rows", 12.0);
        log.end();
        log.output(&sink);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let json = &records[0];
        assert_eq!(json["action"], "job:cleanup");
        assert_eq!(json["result"], "ok");
        assert_eq!(json["context.action_type"], "job");
        assert_eq!(json["context.table"], serde_json::json!(["users", "orders"]));
        assert_eq!(json["stat.rows"], 12.0);
        assert!(json["elapsed"].as_u64().is_some());
        assert!(json.get("ref_id").is_none());
    }

    #[test]
    fn test_output_masks_bodies() {
        register_masked_fields(["password"]);
        let sink = MemorySink::default();
        let mut log = ActionLog::begin("api:post:/login", "web");
        log.set_request_body(r#"{"user":"ann","password":"hunter2"}"#);
        log.output(&sink);

        let json = &sink.records()[0];
        assert_eq!(json["request_body"], r#"{"user":"ann","password":"******"}"#);
    }

    #[test]
    fn test_output_masks_mixed_case_fields_in_bodies_and_context() {
        register_masked_fields(["accessToken"]);
        let sink = MemorySink::default();
        let mut log = ActionLog::begin("api:post:/tokens", "web");
        log.set_request_body(r#"{"accessToken":"s3cret"}"#);
        log.set_response_body(r#"{"AccessToken":"s3cret","scope":"read"}"#);
        log.put_context("accessToken", ["s3cret"]);
        log.output(&sink);

        let json = &sink.records()[0];
        assert_eq!(json["request_body"], r#"{"accessToken":"******"}"#);
        assert_eq!(json["response_body"], r#"{"AccessToken":"******","scope":"read"}"#);
        assert_eq!(json["context.accessToken"], "******");
        assert!(!json.to_string().contains("s3cret"));
    }

    #[test]
    fn test_output_is_emit_once_and_releases_maps() {
        let sink = MemorySink::default();
        let mut log = ActionLog::begin("a", "task");
        log.stat("n", 1.0);
        log.output(&sink);
        log.output(&sink);

        assert_eq!(sink.records().len(), 1);
        assert!(log.is_emitted());
        assert!(log.scope().context_map().is_empty());
        assert!(log.scope().stat_map().is_empty());
    }

    #[test]
    fn test_result_only_escalates() {
        let mut log = ActionLog::begin("a", "task");
        log.escalate(ActionResult::Error);
        log.end_with(ActionResult::Warn);
        assert_eq!(log.result(), ActionResult::Error);
        assert!(log.elapsed_nanos().is_some());
    }
}
