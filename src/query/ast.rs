//! The parsed syntax tree produced by the tokenizer/parser (C7, spec
//! §4.7). One root per statement; a thin [`Visitor`] trait lets later
//! passes rewrite the tree without matching on every variant by hand.

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    Ne,
    Like,
    In,
    Contains,
    Regex,
    Fuzzy,
}

impl CompareOp {
    /// Longest-match-first table the parser scans to find the leftmost
    /// operator in a WHERE clause (spec §4.7 parse policy).
    pub const TOKENS: &'static [(&'static str, CompareOp)] = &[
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        ("<>", CompareOp::Ne),
        ("!=", CompareOp::Ne),
        ("=", CompareOp::Eq),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub column: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WherePredicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub distinct: bool,
    /// WHERE predicates, ANDed together; empty means no WHERE clause.
    pub predicates: Vec<WherePredicate>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct InsertStatement {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub table: TableRef,
    pub assignments: Vec<(String, Value)>,
    /// WHERE predicates, ANDed together; empty means every row.
    pub predicates: Vec<WherePredicate>,
}

#[derive(Debug, Clone)]
pub struct DeleteStatement {
    pub table: TableRef,
    /// Exactly one equality predicate; a general WHERE is a `ParseError`
    /// (spec §4.7 "DELETE predicate shape").
    pub predicate: WherePredicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Fulltext,
}

#[derive(Debug, Clone)]
pub enum DdlStatement {
    CreateDatabase { name: String },
    DropDatabase { name: String },
    CreateTable { database: String, table: String },
    DropTable { table: TableRef },
    CreateIndex { table: TableRef, column: String, kind: IndexKind },
    DropIndex { table: TableRef, column: String },
    ShowDatabases,
    ShowTables { database: String },
    ShowIndexes { table: TableRef },
}

#[derive(Debug, Clone)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Ddl(DdlStatement),
}

/// Visitor interface for later rewrite passes (spec §4.7 "permits later
/// rewriting"). Default methods are no-ops so a rewrite only needs to
/// override the variants it cares about.
pub trait Visitor {
    fn visit_select(&mut self, _stmt: &mut SelectStatement) {}
    fn visit_insert(&mut self, _stmt: &mut InsertStatement) {}
    fn visit_update(&mut self, _stmt: &mut UpdateStatement) {}
    fn visit_delete(&mut self, _stmt: &mut DeleteStatement) {}
    fn visit_ddl(&mut self, _stmt: &mut DdlStatement) {}
}

pub fn walk(statement: &mut Statement, visitor: &mut impl Visitor) {
    match statement {
        Statement::Select(s) => visitor.visit_select(s),
        Statement::Insert(s) => visitor.visit_insert(s),
        Statement::Update(s) => visitor.visit_update(s),
        Statement::Delete(s) => visitor.visit_delete(s),
        Statement::Ddl(s) => visitor.visit_ddl(s),
    }
}
