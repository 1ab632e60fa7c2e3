use std::collections::VecDeque;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dbbat::common::Result;
use crate::dbbat::config::QueryStorageSettings;
use crate::dbbat::pg::protocol::{rows_affected, FieldDescription, Message, PostgresError};
use crate::dbbat::pg::rows::{decode_value, split_data_row};
use crate::dbbat::pg::sql::{classify, CopyDirection, CopyFormat};
use crate::dbbat::store::{NewQuery, NewQueryRow, QueryParameters};

/// The result-capture limits a session operates under, snapshotted from the
/// settings when the session starts.
#[derive(Copy, Clone, Debug)]
pub struct CaptureLimits {
    pub store_results: bool,
    pub max_result_rows: u64,
    pub max_result_bytes: u64,
}

impl From<QueryStorageSettings> for CaptureLimits {
    fn from(settings: QueryStorageSettings) -> Self {
        CaptureLimits {
            store_results: settings.store_results,
            max_result_rows: settings.max_result_rows,
            max_result_bytes: settings.max_result_bytes,
        }
    }
}

/// A prepared statement registered by Parse, keyed by its (possibly empty) name.
pub struct PreparedStatement {
    pub sql: String,
    pub type_oids: Vec<i32>,
}

/// A portal created by Bind.
pub struct Portal {
    pub statement: String,
    pub parameters: QueryParameters,
}

/// An in-progress COPY subprotocol on this session.
pub struct CopyState {
    pub direction: CopyDirection,
    pub format: CopyFormat,
    pub columns: Vec<String>,
}

/// A Query row under construction: everything observed about one statement
/// execution between its submission and the ReadyForQuery that settles it.
pub struct PendingQuery {
    pub sql: String,
    pub started: Instant,
    pub executed_at: DateTime<Utc>,
    pub parameters: Option<QueryParameters>,
    pub fields: Vec<FieldDescription>,
    rows: Vec<NewQueryRow>,
    captured_bytes: u64,
    /// every result/COPY byte relayed for this query, capture or not
    pub data_bytes: u64,
    pub truncated: bool,
    pub rows_affected: Option<i64>,
    pub error: Option<String>,
    pub copy_direction: Option<CopyDirection>,
    pub copy_format: Option<CopyFormat>,
}

impl PendingQuery {
    pub fn new(sql: String, parameters: Option<QueryParameters>) -> Self {
        PendingQuery {
            sql,
            started: Instant::now(),
            executed_at: Utc::now(),
            parameters,
            fields: Vec::new(),
            rows: Vec::new(),
            captured_bytes: 0,
            data_bytes: 0,
            truncated: false,
            rows_affected: None,
            error: None,
            copy_direction: None,
            copy_format: None,
        }
    }

    /// Capture one DataRow: bytes always count, rows are kept only while both
    /// limits hold, and the first overflow discards everything captured so
    /// far (all-or-nothing).
    fn capture_data_row(&mut self, msg: &Message, limits: &CaptureLimits) -> Result<()> {
        let split = split_data_row(msg)?;
        self.data_bytes += split.total_bytes;
        if !limits.store_results || self.truncated {
            return Ok(());
        }
        if self.rows.len() as u64 + 1 > limits.max_result_rows
            || self.captured_bytes + split.total_bytes > limits.max_result_bytes
        {
            self.truncate();
            return Ok(());
        }
        let mut row_data = serde_json::Map::with_capacity(split.values.len());
        for (i, raw) in split.values.iter().enumerate() {
            let (name, value) = match self.fields.get(i) {
                Some(field) => (field.name.clone(), decode_value(field, *raw)),
                // DataRow without a usable RowDescription; keep the value anyway
                None => (
                    format!("column_{}", i),
                    raw.map(|b| Value::String(BASE64.encode(b)))
                        .unwrap_or(Value::Null),
                ),
            };
            row_data.insert(name, value);
        }
        self.push_row(row_data, split.total_bytes);
        Ok(())
    }

    /// Capture one COPY data chunk as a row under the same bounded rules.
    fn capture_copy_data(&mut self, payload: &[u8], format: CopyFormat, limits: &CaptureLimits) {
        self.data_bytes += payload.len() as u64;
        if !limits.store_results || self.truncated {
            return;
        }
        if self.rows.len() as u64 + 1 > limits.max_result_rows
            || self.captured_bytes + payload.len() as u64 > limits.max_result_bytes
        {
            self.truncate();
            return;
        }
        let mut row_data = serde_json::Map::with_capacity(1);
        match format {
            CopyFormat::Text | CopyFormat::Csv => {
                let text = String::from_utf8_lossy(payload);
                row_data.insert(
                    "data".to_string(),
                    Value::String(text.trim_end_matches('\n').to_string()),
                );
            }
            CopyFormat::Binary => {
                row_data.insert(
                    "data_base64".to_string(),
                    Value::String(BASE64.encode(payload)),
                );
            }
        }
        self.push_row(row_data, payload.len() as u64);
    }

    fn push_row(&mut self, row_data: serde_json::Map<String, Value>, size: u64) {
        self.rows.push(NewQueryRow {
            row_number: self.rows.len() as u64,
            row_data,
            row_size_bytes: size,
        });
        self.captured_bytes += size;
    }

    fn truncate(&mut self) {
        // Refuse to store a partial, misleading slice of the result
        self.truncated = true;
        self.rows.clear();
        self.captured_bytes = 0;
    }

    /// Settle into the records to persist. Truncated queries keep zero rows.
    pub fn finish(mut self) -> (NewQuery, Vec<NewQueryRow>) {
        if self.truncated {
            warn!(
                sql = %self.sql,
                data_bytes = self.data_bytes,
                "result capture truncated, dropping captured rows"
            );
            self.rows.clear();
        }
        let query = NewQuery {
            sql_text: self.sql,
            parameters: self.parameters,
            executed_at: self.executed_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            rows_affected: self.rows_affected,
            error: self.error,
            copy_format: self.copy_format,
            copy_direction: self.copy_direction,
            truncated: self.truncated,
            data_bytes: self.data_bytes,
        };
        (query, self.rows)
    }
}

/// All interception state both pumps share, guarded by one session lock held
/// only for the brief intercept operation on each message.
///
/// Extended Query allows several Executes before a Sync, so pending queries
/// form a FIFO; Simple Query is the degenerate case of a single `current`
/// slot. Backend result messages target the queue head when the queue is
/// non-empty, the current slot otherwise.
#[derive(Default)]
pub struct Intercept {
    queue: VecDeque<PendingQuery>,
    current: Option<PendingQuery>,
    completed: Vec<PendingQuery>,
    /// RowDescription answered to a Describe that raced ahead of the Execute
    /// the client pump is still processing; claimed by the next Execute
    described: Option<Vec<FieldDescription>>,
    pub prepared: FnvHashMap<String, PreparedStatement>,
    pub portals: FnvHashMap<String, Portal>,
    pub copy: Option<CopyState>,
}

impl Intercept {
    pub fn new() -> Self {
        Self::default()
    }

    /// A Simple Query opened; one audit row per Query message.
    pub fn begin_simple(&mut self, sql: String) {
        self.current = Some(PendingQuery::new(sql, None));
    }

    /// An Execute was forwarded; enqueue its pending query.
    pub fn begin_execute(&mut self, sql: String, parameters: QueryParameters) {
        let mut pending = PendingQuery::new(sql, Some(parameters));
        if let Some(fields) = self.described.take() {
            pending.fields = fields;
        }
        self.queue.push_back(pending);
    }

    fn active_mut(&mut self) -> Option<&mut PendingQuery> {
        if !self.queue.is_empty() {
            self.queue.front_mut()
        } else {
            self.current.as_mut()
        }
    }

    pub fn on_row_description(&mut self, fields: Vec<FieldDescription>) {
        match self.active_mut() {
            Some(pending) => pending.fields = fields,
            None => self.described = Some(fields),
        }
    }

    pub fn on_data_row(&mut self, msg: &Message, limits: &CaptureLimits) -> Result<()> {
        if let Some(pending) = self.active_mut() {
            pending.capture_data_row(msg, limits)?;
        }
        Ok(())
    }

    /// CopyInResponse/CopyOutResponse: open COPY state using the column list
    /// the classifier extracted from the active statement.
    pub fn on_copy_response(&mut self, direction: CopyDirection, wire_binary: bool) {
        let wire_format = if wire_binary {
            CopyFormat::Binary
        } else {
            CopyFormat::Text
        };
        let (columns, format) = match self.active_mut() {
            Some(pending) => {
                // CSV vs TEXT is invisible on the wire; trust the statement
                let (columns, format) = match classify(&pending.sql)
                    .into_iter()
                    .find_map(|s| s.copy)
                {
                    Some(copy) => (copy.columns, copy.format),
                    None => (Vec::new(), wire_format),
                };
                pending.copy_direction = Some(direction);
                pending.copy_format = Some(format);
                (columns, format)
            }
            None => (Vec::new(), wire_format),
        };
        debug!(%direction, %format, ?columns, "COPY started");
        self.copy = Some(CopyState {
            direction,
            format,
            columns,
        });
    }

    /// CopyData from either side; from_client distinguishes COPY IN payload
    /// from COPY OUT payload.
    pub fn on_copy_data(&mut self, payload: &[u8], from_client: bool, limits: &CaptureLimits) {
        let format = match &self.copy {
            Some(copy) => {
                let expect_client = copy.direction == CopyDirection::In;
                if expect_client != from_client {
                    return;
                }
                copy.format
            }
            None => return,
        };
        if let Some(pending) = self.active_mut() {
            pending.capture_copy_data(payload, format, limits);
        }
    }

    pub fn on_copy_done(&mut self) {
        self.copy = None;
    }

    /// CommandComplete: Extended mode drains the queue head into the
    /// completed list; Simple mode keeps accumulating on the current slot
    /// (a multi-statement batch gets one CommandComplete per statement).
    pub fn on_command_complete(&mut self, tag: &str) {
        let affected = rows_affected(tag);
        if let Some(mut head) = self.queue.pop_front() {
            head.rows_affected = affected;
            self.completed.push(head);
        } else if let Some(current) = self.current.as_mut() {
            current.rows_affected = affected;
        }
        self.copy = None;
    }

    pub fn on_error(&mut self, err: &PostgresError) {
        if let Some(mut head) = self.queue.pop_front() {
            head.error = Some(err.message.clone());
            self.completed.push(head);
        } else if let Some(current) = self.current.as_mut() {
            current.error = Some(err.message.clone());
        }
        self.copy = None;
    }

    /// ReadyForQuery: everything settled since the last one is ready to
    /// persist. Pending queries still queued never executed (the server
    /// skipped them after an error) and are discarded.
    pub fn take_finished(&mut self) -> Vec<PendingQuery> {
        let mut finished = std::mem::take(&mut self.completed);
        if let Some(current) = self.current.take() {
            finished.push(current);
        }
        self.queue.clear();
        self.described = None;
        self.copy = None;
        finished
    }

    pub fn close_statement(&mut self, name: &str) {
        self.prepared.remove(name);
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
    }
}
