//! Executes a [`Plan`] against a storage backend.
//!
//! The executor has no idea how rows are stored; it only talks to the
//! [`Engine`] trait, which [`crate::db::Database`] implements. This
//! keeps the query layer testable with a fake in-memory engine and
//! keeps `db.rs` (which embeds a query engine) from having to depend
//! back on concrete executor internals.

use std::collections::BTreeMap;

use regex::Regex;
use uuid::Uuid;

use crate::error::{Result, SerengetiError};
use crate::query::ast::{CompareOp, DdlStatement, OrderByItem, SortDirection, Statement, WherePredicate};
use crate::query::parser::parse;
use crate::query::planner::{self, AccessMethod, Catalog, Plan, PlanKind, PostOp};
use crate::value::Value;

/// Levenshtein distance tolerated by a `FUZZY` predicate (spec §4.7).
pub const FUZZY_DISTANCE_THRESHOLD: usize = 2;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Row {
    pub id: Uuid,
    pub columns: BTreeMap<String, Value>,
}

/// Storage backend the executor drives. Implemented by [`crate::db::Database`].
pub trait Engine: Catalog {
    fn scan_table(&self, database: &str, table: &str) -> Result<Vec<Row>>;
    fn fetch_by_index(&self, database: &str, table: &str, column: &str, value: &Value) -> Result<Vec<Row>>;
    fn fetch_by_range(
        &self,
        database: &str,
        table: &str,
        column: &str,
        lower: Option<(CompareOp, &Value)>,
        upper: Option<(CompareOp, &Value)>,
    ) -> Result<Vec<Row>>;
    fn fulltext_search(&self, database: &str, table: &str, column: &str, query: &str) -> Result<Vec<(Uuid, f64)>>;
    fn fetch_rows(&self, database: &str, table: &str, ids: &[Uuid]) -> Result<Vec<Row>>;
    fn insert_row(&self, database: &str, table: &str, row: Row) -> Result<()>;
    fn update_rows(
        &self,
        database: &str,
        table: &str,
        rows: &[Row],
        assignments: &[(String, Value)],
    ) -> Result<usize>;
    fn delete_rows(&self, database: &str, table: &str, ids: &[Uuid]) -> Result<usize>;
    fn execute_ddl(&self, stmt: &DdlStatement) -> Result<Vec<Value>>;
}

/// Response shape returned to the REPL/client (spec §6): `executed` and
/// `error` are mutually informative, `explain` carries a plan summary
/// when requested, `list` carries row/metadata output.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub executed: bool,
    pub error: Option<String>,
    pub explain: Option<String>,
    pub list: Option<Vec<Value>>,
}

impl QueryResponse {
    fn ok(list: Option<Vec<Value>>) -> Self {
        Self { executed: true, error: None, explain: None, list }
    }

    fn err(e: impl Into<String>) -> Self {
        Self { executed: false, error: Some(e.into()), explain: None, list: None }
    }
}

/// Parses and runs one statement, building the plan through `engine`
/// (which also serves as the [`Catalog`]).
pub fn execute(sql: &str, engine: &dyn Engine) -> QueryResponse {
    let statement = match parse(sql) {
        Ok(s) => s,
        Err(e) => return QueryResponse::err(e.client_message()),
    };
    let p = planner::plan(statement, engine);
    match run(&p, engine) {
        Ok(resp) => resp,
        Err(e) => QueryResponse::err(e.client_message()),
    }
}

/// Parses and plans without executing, for diagnostics / `EXPLAIN`-style use.
pub fn explain(sql: &str, engine: &dyn Engine) -> QueryResponse {
    let statement = match parse(sql) {
        Ok(s) => s,
        Err(e) => return QueryResponse::err(e.client_message()),
    };
    let p = planner::plan(statement, engine);
    QueryResponse {
        executed: true,
        error: None,
        explain: Some(format!("{p:?}")),
        list: None,
    }
}

fn run(plan: &Plan, engine: &dyn Engine) -> Result<QueryResponse> {
    match plan.kind {
        PlanKind::Select => run_select(plan, engine),
        PlanKind::Insert => run_insert(plan, engine),
        PlanKind::Update => run_update(plan, engine),
        PlanKind::Delete => run_delete(plan, engine),
        PlanKind::Ddl => run_ddl(plan, engine),
    }
}

fn run_select(plan: &Plan, engine: &dyn Engine) -> Result<QueryResponse> {
    let table = &plan.tables[0];
    let mut rows = match plan.access.as_ref().unwrap() {
        AccessMethod::FullScan => engine.scan_table(&plan.database, table)?,
        AccessMethod::IndexLookup { column, value } => {
            engine.fetch_by_index(&plan.database, table, column, value)?
        }
        AccessMethod::RangeScan { column, lower, upper } => {
            let lower = lower.as_ref().map(|(op, v)| (*op, v));
            let upper = upper.as_ref().map(|(op, v)| (*op, v));
            engine.fetch_by_range(&plan.database, table, column, lower, upper)?
        }
        AccessMethod::FulltextSearch { column, query } => {
            let hits = engine.fulltext_search(&plan.database, table, column, query)?;
            let ids: Vec<Uuid> = hits.iter().map(|(id, _)| *id).collect();
            let mut fetched = engine.fetch_rows(&plan.database, table, &ids)?;
            let relevance: BTreeMap<Uuid, f64> = hits.into_iter().collect();
            let order: BTreeMap<Uuid, usize> =
                ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            // preserve relevance order from the fulltext search itself.
            fetched.sort_by_key(|r| order.get(&r.id).copied().unwrap_or(usize::MAX));
            for row in fetched.iter_mut() {
                if let Some(score) = relevance.get(&row.id) {
                    row.columns.insert("__relevance".to_string(), Value::Float(*score));
                }
            }
            fetched
        }
    };

    for op in &plan.post_ops {
        apply_post_op(&mut rows, op)?;
    }

    let list = rows
        .into_iter()
        .map(|mut r| {
            r.columns.insert("__id".to_string(), Value::Str(r.id.to_string()));
            Value::Object(r.columns)
        })
        .collect();
    Ok(QueryResponse::ok(Some(list)))
}

fn apply_post_op(rows: &mut Vec<Row>, op: &PostOp) -> Result<()> {
    match op {
        PostOp::Filter(pred) => {
            rows.retain(|r| eval_predicate(r, pred).unwrap_or(false));
        }
        PostOp::Project(columns) => {
            for row in rows.iter_mut() {
                row.columns.retain(|k, _| columns.contains(k));
            }
        }
        PostOp::Sort(items) => {
            rows.sort_by(|a, b| compare_rows(a, b, items));
        }
        PostOp::Distinct => {
            let mut seen = std::collections::HashSet::new();
            rows.retain(|r| {
                let key = r
                    .columns
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.to_display_string()))
                    .collect::<Vec<_>>()
                    .join("\u{1}");
                seen.insert(key)
            });
        }
        PostOp::Limit { limit, offset } => {
            let offset = offset.unwrap_or(0);
            if offset >= rows.len() {
                rows.clear();
            } else {
                rows.drain(0..offset);
            }
            if let Some(l) = limit {
                rows.truncate(*l);
            }
        }
    }
    Ok(())
}

fn compare_rows(a: &Row, b: &Row, items: &[OrderByItem]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for item in items {
        let av = a.columns.get(&item.column);
        let bv = b.columns.get(&item.column);
        let ord = match (av, bv) {
            (Some(x), Some(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        };
        let ord = match item.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

fn eval_predicate(row: &Row, pred: &WherePredicate) -> Result<bool> {
    let Some(actual) = row.columns.get(&pred.column) else {
        return Ok(false);
    };
    Ok(match pred.op {
        CompareOp::Eq => actual == &pred.value,
        CompareOp::Ne => actual != &pred.value,
        CompareOp::Gt => actual.partial_cmp(&pred.value) == Some(std::cmp::Ordering::Greater),
        CompareOp::Lt => actual.partial_cmp(&pred.value) == Some(std::cmp::Ordering::Less),
        CompareOp::Ge => matches!(
            actual.partial_cmp(&pred.value),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        CompareOp::Le => matches!(
            actual.partial_cmp(&pred.value),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        CompareOp::Like => like_match(&actual.to_display_string(), &pred.value.to_display_string()),
        CompareOp::Contains => actual
            .to_display_string()
            .to_lowercase()
            .contains(&pred.value.to_display_string().to_lowercase()),
        CompareOp::In => match &pred.value {
            Value::Array(items) => items.contains(actual),
            other => actual == other,
        },
        CompareOp::Regex => {
            let re = Regex::new(&pred.value.to_display_string())
                .map_err(|e| SerengetiError::Plan { message: format!("bad regex: {e}") })?;
            re.is_match(&actual.to_display_string())
        }
        CompareOp::Fuzzy => {
            let distance = strsim::levenshtein(&actual.to_display_string(), &pred.value.to_display_string());
            distance <= FUZZY_DISTANCE_THRESHOLD
        }
    })
}

/// Translates a SQL `LIKE` pattern (`%` any run, `_` any char) to an
/// anchored regex and matches it.
fn like_match(haystack: &str, pattern: &str) -> bool {
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            _ => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map(|re| re.is_match(haystack)).unwrap_or(false)
}

fn run_insert(plan: &Plan, engine: &dyn Engine) -> Result<QueryResponse> {
    let Statement::Insert(s) = &plan.statement else { unreachable!() };
    let mut columns = BTreeMap::new();
    for (col, val) in s.columns.iter().zip(s.values.iter()) {
        columns.insert(col.clone(), val.clone());
    }
    let row = Row { id: Uuid::new_v4(), columns };
    engine.insert_row(&plan.database, &plan.tables[0], row)?;
    Ok(QueryResponse::ok(None))
}

fn run_update(plan: &Plan, engine: &dyn Engine) -> Result<QueryResponse> {
    let Statement::Update(s) = &plan.statement else { unreachable!() };
    let table = &plan.tables[0];
    let mut candidates = match plan.access.as_ref().unwrap() {
        AccessMethod::IndexLookup { column, value } => engine.fetch_by_index(&plan.database, table, column, value)?,
        AccessMethod::RangeScan { column, lower, upper } => {
            let lower = lower.as_ref().map(|(op, v)| (*op, v));
            let upper = upper.as_ref().map(|(op, v)| (*op, v));
            engine.fetch_by_range(&plan.database, table, column, lower, upper)?
        }
        _ => engine.scan_table(&plan.database, table)?,
    };
    for pred in &s.predicates {
        candidates.retain(|r| eval_predicate(r, pred).unwrap_or(false));
    }
    let updated = engine.update_rows(&plan.database, table, &candidates, &s.assignments)?;
    Ok(QueryResponse::ok(Some(vec![Value::Int(updated as i64)])))
}

fn run_delete(plan: &Plan, engine: &dyn Engine) -> Result<QueryResponse> {
    let Statement::Delete(s) = &plan.statement else { unreachable!() };
    let table = &plan.tables[0];
    let candidates = match plan.access.as_ref().unwrap() {
        AccessMethod::IndexLookup { column, value } => engine.fetch_by_index(&plan.database, table, column, value)?,
        _ => {
            let mut rows = engine.scan_table(&plan.database, table)?;
            rows.retain(|r| eval_predicate(r, &s.predicate).unwrap_or(false));
            rows
        }
    };
    let ids: Vec<Uuid> = candidates.iter().map(|r| r.id).collect();
    let deleted = engine.delete_rows(&plan.database, table, &ids)?;
    Ok(QueryResponse::ok(Some(vec![Value::Int(deleted as i64)])))
}

fn run_ddl(plan: &Plan, engine: &dyn Engine) -> Result<QueryResponse> {
    let Statement::Ddl(d) = &plan.statement else { unreachable!() };
    let list = engine.execute_ddl(d)?;
    Ok(QueryResponse::ok(Some(list)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::IndexKind;
    use std::sync::Mutex;

    struct FakeEngine {
        rows: Mutex<Vec<Row>>,
    }

    impl Catalog for FakeEngine {
        fn index_kind(&self, _d: &str, _t: &str, _c: &str) -> Option<IndexKind> {
            None
        }
    }

    impl Engine for FakeEngine {
        fn scan_table(&self, _d: &str, _t: &str) -> Result<Vec<Row>> {
            Ok(self.rows.lock().unwrap().clone())
        }
        fn fetch_by_index(&self, _d: &str, _t: &str, _c: &str, _v: &Value) -> Result<Vec<Row>> {
            Ok(vec![])
        }
        fn fetch_by_range(
            &self,
            _d: &str,
            _t: &str,
            _c: &str,
            _lower: Option<(CompareOp, &Value)>,
            _upper: Option<(CompareOp, &Value)>,
        ) -> Result<Vec<Row>> {
            Ok(vec![])
        }
        fn fulltext_search(&self, _d: &str, _t: &str, _c: &str, _q: &str) -> Result<Vec<(Uuid, f64)>> {
            Ok(vec![])
        }
        fn fetch_rows(&self, _d: &str, _t: &str, _ids: &[Uuid]) -> Result<Vec<Row>> {
            Ok(vec![])
        }
        fn insert_row(&self, _d: &str, _t: &str, row: Row) -> Result<()> {
            self.rows.lock().unwrap().push(row);
            Ok(())
        }
        fn update_rows(&self, _d: &str, _t: &str, _rows: &[Row], _a: &[(String, Value)]) -> Result<usize> {
            Ok(0)
        }
        fn delete_rows(&self, _d: &str, _t: &str, ids: &[Uuid]) -> Result<usize> {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| !ids.contains(&r.id));
            Ok(before - rows.len())
        }
        fn execute_ddl(&self, _stmt: &DdlStatement) -> Result<Vec<Value>> {
            Ok(vec![])
        }
    }

    fn row(age: i64) -> Row {
        let mut columns = BTreeMap::new();
        columns.insert("age".to_string(), Value::Int(age));
        Row { id: Uuid::new_v4(), columns }
    }

    #[test]
    fn select_filters_and_sorts() {
        let engine = FakeEngine { rows: Mutex::new(vec![row(30), row(10), row(20)]) };
        let resp = execute("SELECT age FROM db.t WHERE age >= 15 ORDER BY age DESC", &engine);
        assert!(resp.executed);
        let list = resp.list.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_object().unwrap()["age"].as_int(), Some(30));
    }

    #[test]
    fn insert_then_scan_roundtrip() {
        let engine = FakeEngine { rows: Mutex::new(vec![]) };
        let resp = execute("INSERT INTO db.t (age) VALUES (42)", &engine);
        assert!(resp.executed);
        assert_eq!(engine.rows.lock().unwrap().len(), 1);
    }

    #[test]
    fn parse_error_is_reported_not_executed() {
        let engine = FakeEngine { rows: Mutex::new(vec![]) };
        let resp = execute("NOT A STATEMENT", &engine);
        assert!(!resp.executed);
        assert!(resp.error.is_some());
    }

    #[test]
    fn like_pattern_matches_wildcard() {
        assert!(like_match("hello world", "hello%"));
        assert!(!like_match("hello world", "world%"));
    }
}
