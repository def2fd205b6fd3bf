//! Parsed-log ingestion: schema inference, normalization, table load.
//!
//! A parsed log is a JSON object mapping message types to field maps.
//! A message type with a `time_boot_ms` field keyed by stringified
//! ordinals is a time series; without it, a static single-row record.
//! Anything else is rejected for that type only.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::store::{Cell, ColumnDef, ColumnType, TabularStore};

/// Auxiliary collections excluded from ingestion. Their shape is not the
/// per-message-type field map and they are not useful for analytical
/// querying: raw file content, geofence definitions, parameter dumps with
/// inconsistent row shape, and positional/event collections whose schema
/// cannot be reconciled. This list is part of the contract.
pub const SKIPPED_MESSAGE_TYPES: &[&str] = &[
    "file",
    "logType",
    "fences",
    "params",
    "trajectories",
    "mission",
    "events",
    "flightModeChanges",
];

#[derive(Debug, Clone, serde::Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub message_type: String,
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub time_series: bool,
    pub row_count: usize,
}

/// message type → derived table schema
pub type SchemaMap = BTreeMap<String, TableSchema>;

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub tables_created: usize,
    pub skipped: Vec<SkippedType>,
    pub failures: Vec<FailedType>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedType {
    pub message_type: String,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedType {
    pub message_type: String,
    pub error: String,
}

/// Derive the table name for a message type: lowercase, non-alphanumeric
/// folded to `_`, bracket indices flattened, `_data` suffix.
/// `GPS[0]` → `gps_0_data`.
pub fn table_name_for(msgtype: &str) -> String {
    let mut folded = String::with_capacity(msgtype.len() + 5);
    for ch in msgtype.chars() {
        if ch.is_ascii_alphanumeric() {
            for lower in ch.to_lowercase() {
                folded.push(lower);
            }
        } else if !folded.ends_with('_') {
            folded.push('_');
        }
    }
    let trimmed = folded.trim_matches('_');
    format!("{}_data", trimmed)
}

/// Ingest a parsed log into the store. Per-message-type failures are
/// captured in the summary; the remaining types still load. The store is
/// sealed read-only before returning.
pub fn ingest_log(store: &TabularStore, log: &Value) -> Result<(SchemaMap, IngestSummary)> {
    let obj = log
        .as_object()
        .ok_or_else(|| anyhow!("Parsed log must be a JSON object keyed by message type"))?;

    let mut schema_map = SchemaMap::new();
    let mut summary = IngestSummary::default();

    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();

    for key in keys {
        if SKIPPED_MESSAGE_TYPES.contains(&key.as_str()) {
            summary.skipped.push(SkippedType {
                message_type: key.clone(),
                reason: "excluded from ingestion".into(),
            });
            continue;
        }

        let fields = match obj[key].as_object() {
            Some(fields) if !fields.is_empty() => fields,
            Some(_) => {
                summary.skipped.push(SkippedType {
                    message_type: key.clone(),
                    reason: "no fields".into(),
                });
                continue;
            }
            None => {
                summary.skipped.push(SkippedType {
                    message_type: key.clone(),
                    reason: "unsupported shape".into(),
                });
                continue;
            }
        };

        match ingest_message_type(store, key, fields) {
            Ok(schema) => {
                debug!(
                    "Ingested {} into {} ({} rows, {} columns)",
                    key,
                    schema.table,
                    schema.row_count,
                    schema.columns.len()
                );
                schema_map.insert(key.clone(), schema);
                summary.tables_created += 1;
            }
            Err(e) => {
                warn!("Failed to ingest message type {}: {}", key, e);
                summary.failures.push(FailedType {
                    message_type: key.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    store.seal()?;
    Ok((schema_map, summary))
}

fn ingest_message_type(
    store: &TabularStore,
    msgtype: &str,
    fields: &Map<String, Value>,
) -> Result<TableSchema> {
    match fields.get("time_boot_ms") {
        Some(Value::Object(time_map)) => ingest_time_series(store, msgtype, fields, time_map),
        Some(_) => Err(anyhow!(
            "time_boot_ms is present but not a key-indexed mapping"
        )),
        None => ingest_static(store, msgtype, fields),
    }
}

const TIME_COLUMN: &str = "time_boot_ms";

fn ingest_time_series(
    store: &TabularStore,
    msgtype: &str,
    fields: &Map<String, Value>,
    time_map: &Map<String, Value>,
) -> Result<TableSchema> {
    if time_map.is_empty() {
        return Err(anyhow!("time_boot_ms has no entries"));
    }

    // The set of distinct time keys is the canonical row index.
    let mut keys: Vec<&String> = time_map.keys().collect();
    keys.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });

    let mut columns: Vec<(ColumnSpec, Vec<Cell>)> = Vec::with_capacity(fields.len());

    let time_cells: Vec<Cell> = keys
        .iter()
        .map(|k| match time_map[k.as_str()].as_f64() {
            Some(v) => Cell::Real(v),
            None => Cell::Null,
        })
        .collect();
    columns.push((
        ColumnSpec {
            name: TIME_COLUMN.into(),
            column_type: ColumnType::Real,
        },
        time_cells,
    ));

    let mut inferred_fields = 0usize;
    for (name, value) in fields {
        if name == TIME_COLUMN {
            continue;
        }
        inferred_fields += 1;

        let field_map = match value.as_object() {
            Some(map) => map,
            // Field does not carry per-time entries; dropped here, the
            // divergence check below re-derives the schema without it.
            None => continue,
        };

        let column_type = keys
            .iter()
            .filter_map(|k| field_map.get(k.as_str()))
            .find_map(infer_scalar_type)
            .unwrap_or(ColumnType::Real);

        // Sparse projection onto the canonical index: missing entries
        // become SQL nulls, not zeros.
        let cells: Vec<Cell> = keys
            .iter()
            .map(|k| match field_map.get(k.as_str()) {
                Some(v) => value_cell(v, column_type),
                None => Cell::Null,
            })
            .collect();

        columns.push((
            ColumnSpec {
                name: name.clone(),
                column_type,
            },
            cells,
        ));
    }

    let materialized_fields = columns.len() - 1;
    if materialized_fields != inferred_fields {
        warn!(
            "Schema mismatch for {}: {} fields inferred, {} materialized; re-deriving schema from materialized data",
            msgtype, inferred_fields, materialized_fields
        );
    }
    if materialized_fields == 0 {
        return Err(anyhow!("no projectable fields besides time_boot_ms"));
    }

    let row_count = reconcile_lengths(&mut columns);

    let table = table_name_for(msgtype);
    create_and_load(store, &table, &columns, row_count)?;
    store.create_index(&table, TIME_COLUMN)?;

    Ok(TableSchema {
        message_type: msgtype.to_string(),
        table,
        columns: columns.into_iter().map(|(spec, _)| spec).collect(),
        time_series: true,
        row_count,
    })
}

fn ingest_static(
    store: &TabularStore,
    msgtype: &str,
    fields: &Map<String, Value>,
) -> Result<TableSchema> {
    let mut columns: Vec<(ColumnSpec, Vec<Cell>)> = Vec::with_capacity(fields.len());

    for (name, value) in fields {
        let cell;
        let column_type;
        match infer_scalar_type(value) {
            Some(ct) => {
                column_type = ct;
                cell = value_cell(value, ct);
            }
            None if value.is_null() => {
                column_type = ColumnType::Real;
                cell = Cell::Null;
            }
            // Nested structures have no place in a single-row table.
            None => continue,
        }
        columns.push((
            ColumnSpec {
                name: name.clone(),
                column_type,
            },
            vec![cell],
        ));
    }

    if columns.is_empty() {
        return Err(anyhow!("no scalar fields"));
    }

    let table = table_name_for(msgtype);
    create_and_load(store, &table, &columns, 1)?;

    Ok(TableSchema {
        message_type: msgtype.to_string(),
        table,
        columns: columns.into_iter().map(|(spec, _)| spec).collect(),
        time_series: false,
        row_count: 1,
    })
}

fn create_and_load(
    store: &TabularStore,
    table: &str,
    columns: &[(ColumnSpec, Vec<Cell>)],
    row_count: usize,
) -> Result<()> {
    let defs: Vec<ColumnDef> = columns
        .iter()
        .map(|(spec, _)| ColumnDef {
            name: spec.name.clone(),
            column_type: spec.column_type,
        })
        .collect();
    store.create_table(table, &defs)?;

    let names: Vec<String> = columns.iter().map(|(spec, _)| spec.name.clone()).collect();
    let rows: Vec<Vec<Cell>> = (0..row_count)
        .map(|i| columns.iter().map(|(_, cells)| cells[i].clone()).collect())
        .collect();
    store.bulk_insert(table, &names, &rows)
}

/// Align materialized column arrays on the modal length: longer arrays are
/// truncated to it, shorter ones padded with nulls. Returns the canonical
/// row count.
fn reconcile_lengths(columns: &mut [(ColumnSpec, Vec<Cell>)]) -> usize {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for (_, cells) in columns.iter() {
        *counts.entry(cells.len()).or_insert(0) += 1;
    }
    let modal = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(len, _)| *len)
        .unwrap_or(0);

    for (spec, cells) in columns.iter_mut() {
        if cells.len() != modal {
            warn!(
                "Column {} has {} rows, reconciling to {}",
                spec.name,
                cells.len(),
                modal
            );
        }
        cells.truncate(modal);
        while cells.len() < modal {
            cells.push(Cell::Null);
        }
    }
    modal
}

fn infer_scalar_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Number(_) | Value::Bool(_) => Some(ColumnType::Real),
        Value::String(_) => Some(ColumnType::Text),
        _ => None,
    }
}

fn value_cell(value: &Value, column_type: ColumnType) -> Cell {
    match column_type {
        ColumnType::Real => match value {
            Value::Number(n) => n.as_f64().map(Cell::Real).unwrap_or(Cell::Null),
            Value::Bool(b) => Cell::Real(if *b { 1.0 } else { 0.0 }),
            _ => Cell::Null,
        },
        ColumnType::Text => match value {
            Value::String(s) => Cell::Text(s.clone()),
            Value::Number(n) => Cell::Text(n.to_string()),
            Value::Bool(b) => Cell::Text(b.to_string()),
            _ => Cell::Null,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_log() -> Value {
        json!({
            "ATT": {
                "time_boot_ms": {"0": 100.0, "1": 200.0, "2": 300.0},
                "Roll": {"0": 1.5, "1": -2.5, "2": 4.0},
                "Pitch": {"0": 0.2, "2": 0.4}
            },
            "GPS[0]": {
                "time_boot_ms": {"0": 100.0, "1": 200.0},
                "Alt": {"0": 10.0, "1": 1448.0}
            },
            "VER": {
                "FWString": "ArduCopter V4.3.0",
                "BoardId": 1062
            },
            "file": "raw-bytes-here",
            "params": {"values": [["RTL_ALT", 1500.0]]}
        })
    }

    // ===== Naming Tests =====

    #[test]
    fn test_table_name_folding() {
        assert_eq!(table_name_for("ATT"), "att_data");
        assert_eq!(table_name_for("GPS[0]"), "gps_0_data");
        assert_eq!(table_name_for("XKF1[1]"), "xkf1_1_data");
        assert_eq!(table_name_for("MODE"), "mode_data");
    }

    // ===== Time-Series Tests =====

    #[test]
    fn test_time_series_ingest_row_counts() {
        let store = TabularStore::new().unwrap();
        let (schemas, summary) = ingest_log(&store, &sample_log()).unwrap();

        assert_eq!(summary.tables_created, 3);
        let att = &schemas["ATT"];
        assert!(att.time_series);
        assert_eq!(att.row_count, 3);
        let names: Vec<&str> = att.columns.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"time_boot_ms"));
        assert!(names.contains(&"Roll"));
        assert!(names.contains(&"Pitch"));

        // Every column has exactly as many rows as there are time keys.
        let result = store
            .query("SELECT COUNT(time_boot_ms), COUNT(*) FROM att_data")
            .unwrap();
        assert_eq!(result.rows[0][1], Cell::Integer(3));
    }

    #[test]
    fn test_sparse_field_becomes_null_not_zero() {
        let store = TabularStore::new().unwrap();
        ingest_log(&store, &sample_log()).unwrap();

        let result = store
            .query("SELECT \"Pitch\" FROM att_data ORDER BY time_boot_ms")
            .unwrap();
        assert_eq!(result.rows[0][0], Cell::Real(0.2));
        assert_eq!(result.rows[1][0], Cell::Null);
        assert_eq!(result.rows[2][0], Cell::Real(0.4));
    }

    #[test]
    fn test_time_keys_sort_numerically() {
        let store = TabularStore::new().unwrap();
        let log = json!({
            "BAT": {
                "time_boot_ms": {"0": 0.0, "2": 20.0, "10": 100.0, "1": 10.0},
                "Volt": {"0": 12.6, "1": 12.5, "2": 12.4, "10": 11.9}
            }
        });
        ingest_log(&store, &log).unwrap();
        let result = store.query("SELECT \"Volt\" FROM bat_data").unwrap();
        let volts: Vec<Cell> = result.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(
            volts,
            vec![
                Cell::Real(12.6),
                Cell::Real(12.5),
                Cell::Real(12.4),
                Cell::Real(11.9)
            ]
        );
    }

    #[test]
    fn test_reserved_keyword_field_is_queryable() {
        let store = TabularStore::new().unwrap();
        let log = json!({
            "RCIN": {
                "time_boot_ms": {"0": 1.0},
                "offset": {"0": 42.0}
            }
        });
        ingest_log(&store, &log).unwrap();
        let result = store.query("SELECT \"offset\" FROM rcin_data").unwrap();
        assert_eq!(result.rows[0][0], Cell::Real(42.0));
    }

    // ===== Static Tests =====

    #[test]
    fn test_static_table_has_one_row() {
        let store = TabularStore::new().unwrap();
        let (schemas, _) = ingest_log(&store, &sample_log()).unwrap();

        let ver = &schemas["VER"];
        assert!(!ver.time_series);
        assert_eq!(ver.row_count, 1);

        let result = store.query("SELECT COUNT(*) FROM ver_data").unwrap();
        assert_eq!(result.rows[0][0], Cell::Integer(1));

        let fw = store.query("SELECT \"FWString\" FROM ver_data").unwrap();
        assert_eq!(fw.rows[0][0], Cell::Text("ArduCopter V4.3.0".into()));
    }

    // ===== Skip List Tests =====

    #[test]
    fn test_skip_list_is_honored() {
        let store = TabularStore::new().unwrap();
        let (schemas, summary) = ingest_log(&store, &sample_log()).unwrap();

        assert!(!schemas.contains_key("file"));
        assert!(!schemas.contains_key("params"));
        let skipped: Vec<&str> = summary
            .skipped
            .iter()
            .map(|s| s.message_type.as_str())
            .collect();
        assert!(skipped.contains(&"file"));
        assert!(skipped.contains(&"params"));
        assert!(!store.list_tables().unwrap().contains(&"file_data".into()));
    }

    // ===== Failure Semantics Tests =====

    #[test]
    fn test_per_type_failure_does_not_block_others() {
        let store = TabularStore::new().unwrap();
        let log = json!({
            "BAD": {"time_boot_ms": 12345},
            "ATT": {
                "time_boot_ms": {"0": 100.0},
                "Roll": {"0": 1.0}
            }
        });
        let (schemas, summary) = ingest_log(&store, &log).unwrap();

        assert_eq!(summary.tables_created, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].message_type, "BAD");
        assert!(schemas.contains_key("ATT"));
    }

    #[test]
    fn test_non_object_type_is_skipped_not_failed() {
        let store = TabularStore::new().unwrap();
        let log = json!({
            "logType": "bin",
            "ATT": {"time_boot_ms": {"0": 1.0}, "Roll": {"0": 0.5}}
        });
        let (_, summary) = ingest_log(&store, &log).unwrap();
        assert!(summary.failures.is_empty());
        assert_eq!(summary.tables_created, 1);
    }

    #[test]
    fn test_rejects_non_object_log() {
        let store = TabularStore::new().unwrap();
        assert!(ingest_log(&store, &json!([1, 2, 3])).is_err());
    }

    // ===== Reconciliation Tests =====

    #[test]
    fn test_reconcile_truncates_to_modal_length() {
        let spec = |name: &str| ColumnSpec {
            name: name.into(),
            column_type: ColumnType::Real,
        };
        let mut columns = vec![
            (spec("a"), vec![Cell::Real(1.0); 5]),
            (spec("b"), vec![Cell::Real(2.0); 5]),
            (spec("c"), vec![Cell::Real(3.0); 7]),
        ];
        let canonical = reconcile_lengths(&mut columns);
        assert_eq!(canonical, 5);
        assert!(columns.iter().all(|(_, cells)| cells.len() == 5));
    }

    #[test]
    fn test_reconcile_pads_short_arrays_with_null() {
        let spec = |name: &str| ColumnSpec {
            name: name.into(),
            column_type: ColumnType::Real,
        };
        let mut columns = vec![
            (spec("a"), vec![Cell::Real(1.0); 4]),
            (spec("b"), vec![Cell::Real(2.0); 4]),
            (spec("c"), vec![Cell::Real(3.0); 2]),
        ];
        let canonical = reconcile_lengths(&mut columns);
        assert_eq!(canonical, 4);
        assert_eq!(columns[2].1[3], Cell::Null);
    }

    // ===== Idempotence Tests =====

    #[test]
    fn test_same_log_twice_produces_identical_schemas() {
        let store_a = TabularStore::new().unwrap();
        let store_b = TabularStore::new().unwrap();
        let (schemas_a, _) = ingest_log(&store_a, &sample_log()).unwrap();
        let (schemas_b, _) = ingest_log(&store_b, &sample_log()).unwrap();

        assert_eq!(schemas_a.len(), schemas_b.len());
        for (key, a) in &schemas_a {
            let b = &schemas_b[key];
            assert_eq!(a.table, b.table);
            assert_eq!(a.row_count, b.row_count);
            let names_a: Vec<&str> = a.columns.iter().map(|c| c.name.as_str()).collect();
            let names_b: Vec<&str> = b.columns.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names_a, names_b);
        }
    }

    #[test]
    fn test_store_is_sealed_after_ingest() {
        let store = TabularStore::new().unwrap();
        ingest_log(&store, &sample_log()).unwrap();
        assert!(store
            .create_table(
                "late",
                &[ColumnDef {
                    name: "x".into(),
                    column_type: ColumnType::Real
                }]
            )
            .is_err());
    }
}
