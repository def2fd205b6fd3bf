//! Tool runtime: the three functions exposed to the model.
//!
//! Results are a tagged variant — `{"ok": …}` on success, `{"error": …}`
//! on failure — so the model always sees a discriminating key and an
//! empty result set is never conflated with an error.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::llm::ToolDefinition;
use crate::metrics;
use crate::tabular::{QueryResult, SchemaMap, TabularStore};

/// Rows serialized back to the model per query.
const MAX_RESULT_ROWS: usize = 200;

pub const TOOL_QUERY_DATA: &str = "queryData";
pub const TOOL_GET_MESSAGE_TYPES: &str = "getMessageTypes";
pub const TOOL_GET_DATA_SCHEMA: &str = "getDataSchema";

pub struct ToolRuntime<'a> {
    store: &'a TabularStore,
    schema: &'a SchemaMap,
}

impl<'a> ToolRuntime<'a> {
    pub fn new(store: &'a TabularStore, schema: &'a SchemaMap) -> Self {
        Self { store, schema }
    }

    /// Definitions advertised to the model.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                TOOL_QUERY_DATA,
                "Execute a read-only SQL SELECT against the flight log tables and return the rows.",
                json!({
                    "type": "object",
                    "properties": {
                        "sql": {
                            "type": "string",
                            "description": "A single SELECT statement. Quote column names with double quotes."
                        }
                    },
                    "required": ["sql"]
                }),
            ),
            ToolDefinition::function(
                TOOL_GET_MESSAGE_TYPES,
                "List the telemetry message types that were ingested from this flight log.",
                json!({ "type": "object", "properties": {} }),
            ),
            ToolDefinition::function(
                TOOL_GET_DATA_SCHEMA,
                "Return every table with its column names and types. Call this before querying an unfamiliar field.",
                json!({ "type": "object", "properties": {} }),
            ),
        ]
    }

    /// Dispatch one tool call. Malformed arguments and execution failures
    /// come back as `{"error": …}` for the model to recover from; this
    /// never fails the turn.
    pub fn dispatch(&self, name: &str, raw_arguments: &str) -> Value {
        metrics::inc_tool_call(name);
        debug!("Tool call {} with arguments {}", name, raw_arguments);
        match name {
            TOOL_QUERY_DATA => self.query_data(raw_arguments),
            TOOL_GET_MESSAGE_TYPES => self.message_types(),
            TOOL_GET_DATA_SCHEMA => self.data_schema(),
            other => json!({ "error": format!("Unknown tool: {}", other) }),
        }
    }

    fn query_data(&self, raw_arguments: &str) -> Value {
        #[derive(Deserialize)]
        struct QueryArgs {
            sql: String,
        }

        let args: QueryArgs = match serde_json::from_str(raw_arguments) {
            Ok(args) => args,
            Err(e) => {
                return json!({ "error": format!("Invalid tool arguments: {}", e) });
            }
        };

        match self.store.query(&args.sql) {
            Ok(result) => serialize_result(&result),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    fn message_types(&self) -> Value {
        let types: Vec<&str> = self.schema.keys().map(|k| k.as_str()).collect();
        json!({ "ok": true, "messageTypes": types })
    }

    fn data_schema(&self) -> Value {
        json!({ "ok": true, "schema": schema_json(self.schema) })
    }
}

/// `{msgtype → {table, columns: [{name, type}]}}` — exactly the columns
/// present in the store, no phantom fields.
pub fn schema_json(schema: &SchemaMap) -> Value {
    let mut out = serde_json::Map::new();
    for (msgtype, table) in schema {
        out.insert(
            msgtype.clone(),
            json!({
                "table": table.table,
                "columns": table.columns,
            }),
        );
    }
    Value::Object(out)
}

/// Serialize a query result for the model. Cells cross the JSON boundary
/// through `Cell::to_json`, which narrows wide integers to finite reals.
pub fn serialize_result(result: &QueryResult) -> Value {
    let truncated = result.rows.len() > MAX_RESULT_ROWS;
    let rows: Vec<Value> = result
        .rows
        .iter()
        .take(MAX_RESULT_ROWS)
        .map(|row| Value::Array(row.iter().map(|cell| cell.to_json()).collect()))
        .collect();
    let mut out = json!({
        "ok": true,
        "columns": result.columns,
        "rows": rows,
        "rowCount": result.rows.len(),
    });
    if truncated {
        out["truncated"] = json!(true);
    }
    out
}
