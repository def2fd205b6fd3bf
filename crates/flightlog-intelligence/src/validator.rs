//! Numeric self-validation of assistant answers.
//!
//! Scans the final assistant text for SQL-shaped substrings, re-executes
//! each against the session's tables through an injected query capability,
//! and compares the numbers the text claims against the first result row.
//! A claim is discrepant only when it matches no numeric cell within both
//! the absolute (10) and relative (5%) thresholds.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::tabular::QueryResult;

const ABS_THRESHOLD: f64 = 10.0;
const REL_THRESHOLD: f64 = 0.05;
/// Characters scanned after a SQL match for claimed numbers.
const CLAIM_WINDOW_AFTER: usize = 300;
/// Characters scanned before a SQL match for claimed numbers.
const CLAIM_WINDOW_BEFORE: usize = 150;

lazy_static! {
    static ref SQL_RE: Regex = Regex::new(r"(?i)\bSELECT\b[^;`\n]+").unwrap();
    static ref FROM_RE: Regex =
        Regex::new(r#"(?i)\bFROM\s+"?[A-Za-z_][A-Za-z0-9_]*"?"#).unwrap();
    static ref TAIL_PROSE_RE: Regex = Regex::new(
        r"(?i)\b(?:returns?|returned|shows?|showed|gives?|gave|yields?|yielded|equals?|which|that)\b"
    )
    .unwrap();
    static ref CLAIM_RE: Regex = Regex::new(
        r"(?i)\b(?:returns?|returned|shows?|showed|was|is|gives?|gave|yields?|equals?)\s*:?\s*(-?\d+(?:\.\d+)?)"
    )
    .unwrap();
    static ref AGG_CLAIM_RE: Regex = Regex::new(
        r"(?i)\b(?:maximum|minimum|average|max|min|avg|mean)\b[^.\n]{0,40}?\b(?:was|is|of|=|:)\s*(-?\d+(?:\.\d+)?)"
    )
    .unwrap();
    static ref LEADING_NUM_RE: Regex =
        Regex::new(r"^[\s:\-–>=]*(-?\d+(?:\.\d+)?)").unwrap();
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    pub claimed: f64,
    pub closest_actual: f64,
    pub absolute_error: f64,
    pub relative_error: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub sql: String,
    pub claimed_numbers: Vec<f64>,
    pub actual_first_row: Vec<f64>,
    pub discrepancies: Vec<Discrepancy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub total_queries: usize,
    pub valid_queries: usize,
    pub queries_with_discrepancies: usize,
    pub validations: Vec<Validation>,
}

impl ValidationReport {
    pub fn has_discrepancies(&self) -> bool {
        self.queries_with_discrepancies > 0
    }
}

/// Extract each SQL-shaped substring with its end offset in the text.
fn extract_sql(text: &str) -> Vec<(String, usize, usize)> {
    let mut found = Vec::new();
    for m in SQL_RE.find_iter(text) {
        let candidate = trim_sql_tail(m.as_str());
        if !FROM_RE.is_match(candidate) {
            continue;
        }
        let sql = candidate.trim().trim_end_matches(['.', ',']).to_string();
        let end = m.start() + candidate.len();
        found.push((sql, m.start(), end));
    }
    found
}

/// Cut prose that continues on the same line as the statement
/// ("SELECT … FROM t returned 3147" → "SELECT … FROM t").
fn trim_sql_tail(candidate: &str) -> &str {
    let from_end = match FROM_RE.find(candidate) {
        Some(m) => m.end(),
        None => return candidate,
    };
    match TAIL_PROSE_RE.find(&candidate[from_end..]) {
        Some(m) => &candidate[..from_end + m.start()],
        None => candidate,
    }
}

/// Claimed numbers adjacent to a SQL match: the fixed claim patterns in
/// the windows around it, plus a number immediately following it.
fn extract_claims(text: &str, sql_start: usize, sql_end: usize) -> Vec<f64> {
    let mut claims = Vec::new();

    let after_end = (sql_end + CLAIM_WINDOW_AFTER).min(text.len());
    let after_end = ceil_char_boundary(text, after_end);
    let after = &text[sql_end..after_end];

    let before_start = sql_start.saturating_sub(CLAIM_WINDOW_BEFORE);
    let before_start = ceil_char_boundary(text, before_start);
    let before = &text[before_start..sql_start];

    if let Some(cap) = LEADING_NUM_RE.captures(after) {
        push_claim(&mut claims, &cap[1]);
    }
    for window in [after, before] {
        for cap in CLAIM_RE.captures_iter(window) {
            push_claim(&mut claims, &cap[1]);
        }
        for cap in AGG_CLAIM_RE.captures_iter(window) {
            push_claim(&mut claims, &cap[1]);
        }
    }

    claims
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn push_claim(claims: &mut Vec<f64>, raw: &str) {
    if let Ok(value) = raw.parse::<f64>() {
        if !claims.iter().any(|c| (c - value).abs() < f64::EPSILON) {
            claims.push(value);
        }
    }
}

fn check_claims(claimed: &[f64], actual: &[f64]) -> Vec<Discrepancy> {
    if actual.is_empty() {
        return Vec::new();
    }
    let mut discrepancies = Vec::new();
    for &claim in claimed {
        let mut closest = actual[0];
        let mut closest_abs = f64::INFINITY;
        let mut matched = false;
        for &cell in actual {
            let abs = (claim - cell).abs();
            let rel = abs / cell.abs().max(f64::MIN_POSITIVE);
            if abs <= ABS_THRESHOLD || rel <= REL_THRESHOLD {
                matched = true;
                break;
            }
            if abs < closest_abs {
                closest_abs = abs;
                closest = cell;
            }
        }
        if !matched {
            let abs = (claim - closest).abs();
            discrepancies.push(Discrepancy {
                claimed: claim,
                closest_actual: closest,
                absolute_error: abs,
                relative_error: abs / closest.abs().max(f64::MIN_POSITIVE),
            });
        }
    }
    discrepancies
}

/// Validate every SQL citation in an assistant response by re-executing
/// it through `run_query`.
pub fn validate_response<F>(text: &str, run_query: F) -> ValidationReport
where
    F: Fn(&str) -> anyhow::Result<QueryResult>,
{
    let mut report = ValidationReport::default();

    for (sql, start, end) in extract_sql(text) {
        report.total_queries += 1;
        let claimed_numbers = extract_claims(text, start, end);

        match run_query(&sql) {
            Ok(result) => {
                report.valid_queries += 1;
                let actual_first_row: Vec<f64> = result
                    .rows
                    .first()
                    .map(|row| row.iter().filter_map(|cell| cell.as_f64()).collect())
                    .unwrap_or_default();
                let discrepancies = check_claims(&claimed_numbers, &actual_first_row);
                if !discrepancies.is_empty() {
                    report.queries_with_discrepancies += 1;
                }
                report.validations.push(Validation {
                    sql,
                    claimed_numbers,
                    actual_first_row,
                    discrepancies,
                    error: None,
                });
            }
            Err(e) => {
                report.validations.push(Validation {
                    sql,
                    claimed_numbers,
                    actual_first_row: Vec::new(),
                    discrepancies: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    report
}
