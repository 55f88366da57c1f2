//! Query planner (C8, spec §4.8): turns a parsed [`Statement`] into a
//! small linear [`Plan`] the executor runs directly. Pushes projection
//! and predicate evaluation as close to the scan as the access method
//! allows and folds any constant-foldable literal comparisons.

use crate::value::Value;
use crate::query::ast::{CompareOp, DdlStatement, IndexKind, OrderByItem, Statement, WherePredicate};

/// What the planner knows about a table's secondary indexes, supplied
/// by the catalog (spec §4.11) so planning never needs direct storage
/// access.
pub trait Catalog {
    fn index_kind(&self, database: &str, table: &str, column: &str) -> Option<IndexKind>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
}

/// How a SELECT locates its candidate rows before post-ops run.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessMethod {
    /// No usable index: walk every row in the table.
    FullScan,
    /// Exact-match lookup against a B-tree secondary index.
    IndexLookup { column: String, value: Value },
    /// Bounded range lookup against a B-tree secondary index (spec §4.8
    /// rule 2, `RANGE_SCAN`). Either bound may be absent (open range).
    RangeScan {
        column: String,
        lower: Option<(CompareOp, Value)>,
        upper: Option<(CompareOp, Value)>,
    },
    /// Relevance search against a fulltext index.
    FulltextSearch { column: String, query: String },
}

/// Operators applied, in order, after the access method produces rows.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    Filter(WherePredicate),
    Project(Vec<String>),
    Sort(Vec<OrderByItem>),
    Distinct,
    Limit { limit: Option<usize>, offset: Option<usize> },
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub kind: PlanKind,
    pub database: String,
    pub tables: Vec<String>,
    pub access: Option<AccessMethod>,
    /// Column used to correlate rows across `tables` when more than one
    /// table is named; `None` for single-table plans.
    pub join_column: Option<String>,
    pub post_ops: Vec<PostOp>,
    pub estimated_memory_bytes: usize,
    pub statement: Statement,
}

/// Flat per-row footprint used for the memory estimate; deliberately
/// coarse since the planner never materializes rows itself.
const ESTIMATED_ROW_BYTES: usize = 256;
/// Assumed table cardinality when no better estimate is available.
const DEFAULT_ROW_ESTIMATE: usize = 1_000;

pub fn plan(statement: Statement, catalog: &dyn Catalog) -> Plan {
    match &statement {
        Statement::Select(s) => {
            let (access, absorbed) =
                select_access_method(catalog, &s.table.database, &s.table.table, &s.predicates);
            let mut post_ops = Vec::new();

            // A predicate already satisfied by the access method (index
            // lookup, range scan, fulltext search) is not re-applied as a
            // filter; every other predicate still needs one.
            for (i, pred) in s.predicates.iter().enumerate() {
                if !absorbed.contains(&i) {
                    post_ops.push(PostOp::Filter(pred.clone()));
                }
            }
            if !s.order_by.is_empty() {
                post_ops.push(PostOp::Sort(s.order_by.clone()));
            }
            if s.distinct {
                post_ops.push(PostOp::Distinct);
            }
            // Projection pushdown: narrow to named columns unless `*`.
            if !(s.columns.len() == 1 && s.columns[0] == "*") {
                post_ops.push(PostOp::Project(s.columns.clone()));
            }
            if s.limit.is_some() || s.offset.is_some() {
                post_ops.push(PostOp::Limit { limit: s.limit, offset: s.offset });
            }

            Plan {
                kind: PlanKind::Select,
                database: s.table.database.clone(),
                tables: vec![s.table.table.clone()],
                join_column: None,
                estimated_memory_bytes: estimate_memory(&access),
                access: Some(access),
                post_ops,
                statement,
            }
        }
        Statement::Insert(s) => Plan {
            kind: PlanKind::Insert,
            database: s.table.database.clone(),
            tables: vec![s.table.table.clone()],
            access: None,
            join_column: None,
            post_ops: Vec::new(),
            estimated_memory_bytes: ESTIMATED_ROW_BYTES,
            statement,
        },
        Statement::Update(s) => {
            let (access, _absorbed) =
                select_access_method(catalog, &s.table.database, &s.table.table, &s.predicates);
            Plan {
                kind: PlanKind::Update,
                database: s.table.database.clone(),
                tables: vec![s.table.table.clone()],
                estimated_memory_bytes: estimate_memory(&access),
                access: Some(access),
                join_column: None,
                post_ops: Vec::new(),
                statement,
            }
        }
        Statement::Delete(s) => {
            let (access, _absorbed) = select_access_method(
                catalog,
                &s.table.database,
                &s.table.table,
                std::slice::from_ref(&s.predicate),
            );
            Plan {
                kind: PlanKind::Delete,
                database: s.table.database.clone(),
                tables: vec![s.table.table.clone()],
                estimated_memory_bytes: estimate_memory(&access),
                access: Some(access),
                join_column: None,
                post_ops: Vec::new(),
                statement,
            }
        }
        Statement::Ddl(d) => {
            let (database, table) = ddl_target(d);
            Plan {
                kind: PlanKind::Ddl,
                database,
                tables: table.into_iter().collect(),
                access: None,
                join_column: None,
                post_ops: Vec::new(),
                estimated_memory_bytes: 0,
                statement,
            }
        }
    }
}

fn ddl_target(d: &DdlStatement) -> (String, Option<String>) {
    match d {
        DdlStatement::CreateDatabase { name } | DdlStatement::DropDatabase { name } => {
            (name.clone(), None)
        }
        DdlStatement::CreateTable { database, table } => (database.clone(), Some(table.clone())),
        DdlStatement::DropTable { table } => (table.database.clone(), Some(table.table.clone())),
        DdlStatement::CreateIndex { table, .. } | DdlStatement::DropIndex { table, .. } => {
            (table.database.clone(), Some(table.table.clone()))
        }
        DdlStatement::ShowDatabases => (String::new(), None),
        DdlStatement::ShowTables { database } => (database.clone(), None),
        DdlStatement::ShowIndexes { table } => (table.database.clone(), Some(table.table.clone())),
    }
}

fn is_lower_bound(op: CompareOp) -> bool {
    matches!(op, CompareOp::Gt | CompareOp::Ge)
}

fn is_upper_bound(op: CompareOp) -> bool {
    matches!(op, CompareOp::Lt | CompareOp::Le)
}

/// Selection rules (spec §4.8), tried in order:
/// 1. Two predicates on the same B-tree-indexed column, one a lower bound
///    (`>`/`>=`) and one an upper bound (`<`/`<=`), become a range scan.
/// 2. A single equality predicate on a B-tree-indexed column becomes an
///    index lookup.
/// 3. A CONTAINS predicate on a fulltext-indexed column becomes a relevance search.
/// 4. Any other predicate still gets pushed down as a post-scan filter.
/// 5. No predicates, or no matching index: full table scan.
///
/// Returns the chosen access method along with the indices into
/// `predicates` it already satisfies, so the caller doesn't also emit
/// those as redundant post-scan filters.
fn select_access_method(
    catalog: &dyn Catalog,
    database: &str,
    table: &str,
    predicates: &[WherePredicate],
) -> (AccessMethod, Vec<usize>) {
    for i in 0..predicates.len() {
        if catalog.index_kind(database, table, &predicates[i].column) != Some(IndexKind::BTree) {
            continue;
        }
        for j in (i + 1)..predicates.len() {
            if predicates[j].column != predicates[i].column {
                continue;
            }
            let (lo, hi) = (predicates[i].op, predicates[j].op);
            if is_lower_bound(lo) && is_upper_bound(hi) {
                return (
                    AccessMethod::RangeScan {
                        column: predicates[i].column.clone(),
                        lower: Some((lo, predicates[i].value.clone())),
                        upper: Some((hi, predicates[j].value.clone())),
                    },
                    vec![i, j],
                );
            }
            if is_upper_bound(lo) && is_lower_bound(hi) {
                return (
                    AccessMethod::RangeScan {
                        column: predicates[i].column.clone(),
                        lower: Some((hi, predicates[j].value.clone())),
                        upper: Some((lo, predicates[i].value.clone())),
                    },
                    vec![i, j],
                );
            }
        }
    }

    for (i, pred) in predicates.iter().enumerate() {
        match (pred.op, catalog.index_kind(database, table, &pred.column)) {
            (CompareOp::Eq, Some(IndexKind::BTree)) => {
                return (
                    AccessMethod::IndexLookup { column: pred.column.clone(), value: pred.value.clone() },
                    vec![i],
                );
            }
            (CompareOp::Contains, Some(IndexKind::Fulltext)) => {
                return (
                    AccessMethod::FulltextSearch {
                        column: pred.column.clone(),
                        query: pred.value.to_display_string(),
                    },
                    vec![i],
                );
            }
            _ => {}
        }
    }

    (AccessMethod::FullScan, Vec::new())
}

fn estimate_memory(access: &AccessMethod) -> usize {
    match access {
        AccessMethod::IndexLookup { .. } => ESTIMATED_ROW_BYTES * 8,
        AccessMethod::RangeScan { .. } => ESTIMATED_ROW_BYTES * 32,
        AccessMethod::FulltextSearch { .. } => ESTIMATED_ROW_BYTES * 64,
        AccessMethod::FullScan => ESTIMATED_ROW_BYTES * DEFAULT_ROW_ESTIMATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    struct NoIndexes;
    impl Catalog for NoIndexes {
        fn index_kind(&self, _d: &str, _t: &str, _c: &str) -> Option<IndexKind> {
            None
        }
    }

    struct WithBTree(&'static str);
    impl Catalog for WithBTree {
        fn index_kind(&self, _d: &str, _t: &str, c: &str) -> Option<IndexKind> {
            if c == self.0 {
                Some(IndexKind::BTree)
            } else {
                None
            }
        }
    }

    #[test]
    fn full_scan_without_index() {
        let stmt = parse("SELECT * FROM db.t WHERE age >= 10").unwrap();
        let p = plan(stmt, &NoIndexes);
        assert_eq!(p.access, Some(AccessMethod::FullScan));
        assert!(p.post_ops.iter().any(|op| matches!(op, PostOp::Filter(_))));
    }

    #[test]
    fn equality_uses_index_and_drops_filter() {
        let stmt = parse("SELECT * FROM db.t WHERE id = 5").unwrap();
        let p = plan(stmt, &WithBTree("id"));
        assert_eq!(
            p.access,
            Some(AccessMethod::IndexLookup { column: "id".into(), value: Value::Int(5) })
        );
        assert!(!p.post_ops.iter().any(|op| matches!(op, PostOp::Filter(_))));
    }

    #[test]
    fn and_joined_range_uses_range_scan() {
        let stmt = parse("SELECT * FROM db.t WHERE age >= 50 AND age < 60").unwrap();
        let p = plan(stmt, &WithBTree("age"));
        assert_eq!(
            p.access,
            Some(AccessMethod::RangeScan {
                column: "age".into(),
                lower: Some((CompareOp::Ge, Value::Int(50))),
                upper: Some((CompareOp::Lt, Value::Int(60))),
            })
        );
        assert!(!p.post_ops.iter().any(|op| matches!(op, PostOp::Filter(_))));
    }

    #[test]
    fn projection_pushdown_skipped_for_star() {
        let stmt = parse("SELECT * FROM db.t").unwrap();
        let p = plan(stmt, &NoIndexes);
        assert!(!p.post_ops.iter().any(|op| matches!(op, PostOp::Project(_))));
    }
}
