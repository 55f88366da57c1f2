//! Tokenizer and parser for the SQL subset of spec §4.7.
//!
//! Parse policy: the statement type is determined by its leading
//! keyword; the rest is split on keywords case-insensitively. WHERE
//! clauses are scanned for the leftmost operator, trying multi-char
//! operators before single-char ones. Quoted strings are stripped of
//! their quotes; everything else is handed to [`Value::from_literal`]'s
//! decimal-point probe.

use crate::error::SerengetiError;
use crate::value::Value;

use super::ast::*;

type PResult<T> = Result<T, SerengetiError>;

fn parse_error(message: impl Into<String>, position: usize) -> SerengetiError {
    SerengetiError::Parse {
        message: message.into(),
        position,
    }
}

/// A single lexical token plus the byte offset it started at, so errors
/// can report a position.
#[derive(Debug, Clone)]
struct Token {
    text: String,
    pos: usize,
}

fn tokenize_sql(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == ',' {
            tokens.push(Token { text: ",".into(), pos: i });
            i += 1;
            continue;
        }
        if c == '(' || c == ')' {
            tokens.push(Token { text: c.to_string(), pos: i });
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let start = i;
            i += 1;
            let mut s = String::new();
            while i < bytes.len() && bytes[i] != quote {
                s.push(bytes[i]);
                i += 1;
            }
            i += 1; // closing quote
            tokens.push(Token {
                text: format!("\u{0}{s}"), // sentinel marks "was quoted"
                pos: start,
            });
            continue;
        }
        if ">=<!".contains(c) {
            let start = i;
            let mut s = String::new();
            s.push(c);
            i += 1;
            if i < bytes.len() && (bytes[i] == '=' || (c == '<' && bytes[i] == '>')) {
                s.push(bytes[i]);
                i += 1;
            }
            tokens.push(Token { text: s, pos: start });
            continue;
        }
        if c == '=' {
            tokens.push(Token { text: "=".into(), pos: i });
            i += 1;
            continue;
        }
        let start = i;
        let mut s = String::new();
        while i < bytes.len() && !bytes[i].is_whitespace() && bytes[i] != ',' && bytes[i] != '(' && bytes[i] != ')' {
            if ">=<!".contains(bytes[i]) {
                break;
            }
            s.push(bytes[i]);
            i += 1;
        }
        tokens.push(Token { text: s, pos: start });
    }
    tokens
}

fn kw(tok: &Token, word: &str) -> bool {
    tok.text.eq_ignore_ascii_case(word)
}

fn literal_value(tok: &Token) -> Value {
    if let Some(rest) = tok.text.strip_prefix('\u{0}') {
        Value::from_literal(rest, true)
    } else {
        Value::from_literal(&tok.text, false)
    }
}

fn parse_table_ref(tok: &Token) -> PResult<TableRef> {
    let raw = tok.text.trim_start_matches('\u{0}');
    let mut parts = raw.splitn(2, '.');
    let database = parts
        .next()
        .ok_or_else(|| parse_error("expected db.table", tok.pos))?
        .to_string();
    let table = parts
        .next()
        .ok_or_else(|| parse_error("expected db.table", tok.pos))?
        .to_string();
    Ok(TableRef { database, table })
}

/// Finds the leftmost comparison operator token in `tokens[from..]`,
/// trying the longest operators first per spec §4.7.
fn find_operator(tokens: &[Token], from: usize) -> Option<(usize, CompareOp)> {
    for (i, tok) in tokens.iter().enumerate().skip(from) {
        for (text, op) in CompareOp::TOKENS {
            if tok.text.eq_ignore_ascii_case(text) {
                return Some((i, *op));
            }
        }
        if kw(tok, "LIKE") {
            return Some((i, CompareOp::Like));
        }
        if kw(tok, "IN") {
            return Some((i, CompareOp::In));
        }
        if kw(tok, "CONTAINS") {
            return Some((i, CompareOp::Contains));
        }
        if kw(tok, "REGEX") {
            return Some((i, CompareOp::Regex));
        }
        if kw(tok, "FUZZY") {
            return Some((i, CompareOp::Fuzzy));
        }
    }
    None
}

fn parse_where(tokens: &[Token], from: usize, end: usize) -> PResult<WherePredicate> {
    if from >= end {
        return Err(parse_error("expected predicate after WHERE", tokens.last().map(|t| t.pos).unwrap_or(0)));
    }
    let column = tokens[from].text.clone();
    let Some((op_idx, op)) = find_operator(tokens, from + 1) else {
        return Err(parse_error("expected a comparison operator", tokens[from].pos));
    };
    if op_idx >= end || op_idx + 1 >= end {
        return Err(parse_error("expected a value after operator", tokens[op_idx].pos));
    }
    let value = literal_value(&tokens[op_idx + 1]);
    Ok(WherePredicate { column, op, value })
}

/// Splits `tokens[from..end]` on top-level `AND` keywords and parses each
/// segment as one predicate, ANDing the results together.
fn parse_where_list(tokens: &[Token], from: usize, end: usize) -> PResult<Vec<WherePredicate>> {
    let mut predicates = Vec::new();
    let mut start = from;
    loop {
        let and_idx = tokens[start..end].iter().position(|t| kw(t, "AND")).map(|p| p + start);
        let segment_end = and_idx.unwrap_or(end);
        predicates.push(parse_where(tokens, start, segment_end)?);
        match and_idx {
            Some(a) => start = a + 1,
            None => break,
        }
    }
    Ok(predicates)
}

fn find_keyword(tokens: &[Token], word: &str, from: usize) -> Option<usize> {
    tokens.iter().skip(from).position(|t| kw(t, word)).map(|p| p + from)
}

pub fn parse(sql: &str) -> PResult<Statement> {
    let tokens = tokenize_sql(sql);
    let Some(first) = tokens.first() else {
        return Err(parse_error("empty statement", 0));
    };
    if kw(first, "SELECT") {
        parse_select(&tokens)
    } else if kw(first, "INSERT") {
        parse_insert(&tokens)
    } else if kw(first, "UPDATE") {
        parse_update(&tokens)
    } else if kw(first, "DELETE") {
        parse_delete(&tokens)
    } else if kw(first, "CREATE") {
        parse_create(&tokens)
    } else if kw(first, "DROP") {
        parse_drop(&tokens)
    } else if kw(first, "SHOW") {
        parse_show(&tokens)
    } else {
        Err(parse_error(
            format!("unrecognized statement keyword '{}'", first.text),
            first.pos,
        ))
    }
}

fn split_on_commas(tokens: &[Token]) -> Vec<&Token> {
    tokens.iter().filter(|t| t.text != ",").collect()
}

fn parse_select(tokens: &[Token]) -> PResult<Statement> {
    let from_idx = find_keyword(tokens, "FROM", 1)
        .ok_or_else(|| parse_error("expected FROM", tokens[0].pos))?;
    let mut column_tokens = split_on_commas(&tokens[1..from_idx]);
    let distinct = column_tokens.first().map(|t| kw(t, "DISTINCT")).unwrap_or(false);
    if distinct {
        column_tokens.remove(0);
    }
    let columns: Vec<String> = column_tokens.into_iter().map(|t| t.text.clone()).collect();

    let where_idx = find_keyword(tokens, "WHERE", from_idx + 1);
    let order_idx = find_keyword(tokens, "ORDER", from_idx + 1);
    let limit_idx = find_keyword(tokens, "LIMIT", from_idx + 1);

    let table_end = where_idx.or(order_idx).or(limit_idx).unwrap_or(tokens.len());
    let table = parse_table_ref(
        tokens
            .get(from_idx + 1)
            .ok_or_else(|| parse_error("expected table name after FROM", tokens[from_idx].pos))?,
    )?;
    let _ = table_end;

    let predicates = if let Some(w) = where_idx {
        let end = order_idx.or(limit_idx).unwrap_or(tokens.len());
        parse_where_list(tokens, w + 1, end)?
    } else {
        Vec::new()
    };

    let mut order_by = Vec::new();
    if let Some(o) = order_idx {
        // tokens[o] == "ORDER", tokens[o+1] should be "BY"
        let start = o + 2;
        let end = limit_idx.unwrap_or(tokens.len());
        let mut i = start;
        while i < end {
            if tokens[i].text == "," {
                i += 1;
                continue;
            }
            let column = tokens[i].text.clone();
            let mut direction = SortDirection::Asc;
            if i + 1 < end && (kw(&tokens[i + 1], "ASC") || kw(&tokens[i + 1], "DESC")) {
                if kw(&tokens[i + 1], "DESC") {
                    direction = SortDirection::Desc;
                }
                i += 1;
            }
            order_by.push(OrderByItem { column, direction });
            i += 1;
        }
    }

    let mut limit = None;
    let mut offset = None;
    if let Some(l) = limit_idx {
        let rest: Vec<&Token> = split_on_commas(&tokens[l + 1..]);
        match rest.len() {
            1 => limit = rest[0].text.parse().ok(),
            2 => {
                offset = rest[0].text.parse().ok();
                limit = rest[1].text.parse().ok();
            }
            _ => return Err(parse_error("malformed LIMIT clause", tokens[l].pos)),
        }
    }

    Ok(Statement::Select(SelectStatement {
        table,
        columns,
        distinct,
        predicates,
        order_by,
        limit,
        offset,
    }))
}

fn parse_insert(tokens: &[Token]) -> PResult<Statement> {
    let into_idx = if kw(&tokens[1], "INTO") { 1 } else { 0 };
    let table_tok = tokens
        .get(into_idx + 1)
        .ok_or_else(|| parse_error("expected table after INSERT INTO", tokens[0].pos))?;
    let table = parse_table_ref(table_tok)?;

    let open = tokens
        .iter()
        .position(|t| t.text == "(")
        .ok_or_else(|| parse_error("expected column list", table_tok.pos))?;
    let close = tokens
        .iter()
        .position(|t| t.text == ")")
        .ok_or_else(|| parse_error("unterminated column list", tokens[open].pos))?;
    let columns: Vec<String> = split_on_commas(&tokens[open + 1..close])
        .into_iter()
        .map(|t| t.text.clone())
        .collect();

    let values_idx = find_keyword(tokens, "VALUES", close)
        .ok_or_else(|| parse_error("expected VALUES", tokens[close].pos))?;
    let vopen = tokens[values_idx..]
        .iter()
        .position(|t| t.text == "(")
        .map(|p| p + values_idx)
        .ok_or_else(|| parse_error("expected value list", tokens[values_idx].pos))?;
    let vclose = tokens[vopen..]
        .iter()
        .position(|t| t.text == ")")
        .map(|p| p + vopen)
        .ok_or_else(|| parse_error("unterminated value list", tokens[vopen].pos))?;
    let values: Vec<Value> = split_on_commas(&tokens[vopen + 1..vclose])
        .into_iter()
        .map(literal_value)
        .collect();

    if values.len() != columns.len() {
        return Err(parse_error(
            "column count does not match value count",
            tokens[vopen].pos,
        ));
    }

    Ok(Statement::Insert(InsertStatement { table, columns, values }))
}

fn parse_update(tokens: &[Token]) -> PResult<Statement> {
    let table = parse_table_ref(
        tokens.get(1).ok_or_else(|| parse_error("expected table after UPDATE", tokens[0].pos))?,
    )?;
    let set_idx = find_keyword(tokens, "SET", 1)
        .ok_or_else(|| parse_error("expected SET", tokens[0].pos))?;
    let where_idx = find_keyword(tokens, "WHERE", set_idx + 1);
    let assign_end = where_idx.unwrap_or(tokens.len());

    let mut assignments = Vec::new();
    for part in split_on_commas(&tokens[set_idx + 1..assign_end]) {
        let mut pieces = part.text.splitn(2, '=');
        let col = pieces
            .next()
            .ok_or_else(|| parse_error("malformed assignment", part.pos))?;
        if !col.is_empty() && pieces.clone().next().is_some() {
            let val = pieces.next().unwrap();
            assignments.push((col.to_string(), Value::from_literal(val, false)));
        }
    }
    if assignments.is_empty() {
        // operator token was split separately ("col" "=" "val")
        let mut i = set_idx + 1;
        while i < assign_end {
            if tokens[i].text == "," {
                i += 1;
                continue;
            }
            let col = tokens[i].text.clone();
            if i + 2 >= assign_end || tokens[i + 1].text != "=" {
                return Err(parse_error("malformed SET clause", tokens[i].pos));
            }
            assignments.push((col, literal_value(&tokens[i + 2])));
            i += 3;
        }
    }

    let predicates = match where_idx {
        Some(w) => parse_where_list(tokens, w + 1, tokens.len())?,
        None => Vec::new(),
    };

    Ok(Statement::Update(UpdateStatement {
        table,
        assignments,
        predicates,
    }))
}

fn parse_delete(tokens: &[Token]) -> PResult<Statement> {
    let from_idx = if kw(&tokens[1], "FROM") { 1 } else { 0 };
    let table = parse_table_ref(
        tokens
            .get(from_idx + 1)
            .ok_or_else(|| parse_error("expected table after DELETE FROM", tokens[0].pos))?,
    )?;
    let where_idx = find_keyword(tokens, "WHERE", from_idx + 1)
        .ok_or_else(|| parse_error("DELETE requires a WHERE clause", tokens[0].pos))?;
    let predicate = parse_where(tokens, where_idx + 1, tokens.len())?;
    // spec §4.7: DELETE accepts exactly one equality predicate.
    if predicate.op != CompareOp::Eq {
        return Err(parse_error(
            "DELETE only supports a single equality predicate",
            tokens[where_idx].pos,
        ));
    }
    let rest_has_more = tokens.len() > where_idx + 3;
    if rest_has_more {
        return Err(parse_error(
            "DELETE only supports a single equality predicate",
            tokens[where_idx].pos,
        ));
    }
    Ok(Statement::Delete(DeleteStatement { table, predicate }))
}

fn parse_create(tokens: &[Token]) -> PResult<Statement> {
    let second = tokens
        .get(1)
        .ok_or_else(|| parse_error("expected object after CREATE", tokens[0].pos))?;
    if kw(second, "DATABASE") {
        let name = tokens
            .get(2)
            .ok_or_else(|| parse_error("expected database name", second.pos))?
            .text
            .clone();
        return Ok(Statement::Ddl(DdlStatement::CreateDatabase { name }));
    }
    if kw(second, "TABLE") {
        let table_tok = tokens
            .get(2)
            .ok_or_else(|| parse_error("expected table name", second.pos))?;
        let r = parse_table_ref(table_tok)?;
        return Ok(Statement::Ddl(DdlStatement::CreateTable {
            database: r.database,
            table: r.table,
        }));
    }
    if kw(second, "FULLTEXT") || kw(second, "INDEX") {
        let mut i = 2;
        let kind = if kw(second, "FULLTEXT") {
            if tokens.get(i).map(|t| kw(t, "INDEX")).unwrap_or(false) {
                i += 1;
            }
            IndexKind::Fulltext
        } else {
            IndexKind::BTree
        };
        let on_idx = find_keyword(tokens, "ON", i)
            .ok_or_else(|| parse_error("expected ON in CREATE INDEX", tokens[i].pos))?;
        let table_tok = tokens
            .get(on_idx + 1)
            .ok_or_else(|| parse_error("expected table after ON", tokens[on_idx].pos))?;
        let table = parse_table_ref(table_tok)?;
        let open = tokens
            .get(on_idx + 2)
            .filter(|t| t.text == "(")
            .ok_or_else(|| parse_error("expected table(column)", table_tok.pos))?;
        let column = tokens
            .get(on_idx + 3)
            .ok_or_else(|| parse_error("expected column name", open.pos))?
            .text
            .clone();
        tokens
            .get(on_idx + 4)
            .filter(|t| t.text == ")")
            .ok_or_else(|| parse_error("unterminated table(column)", open.pos))?;
        let kind = if find_keyword(tokens, "FULLTEXT", on_idx + 1).is_some() {
            IndexKind::Fulltext
        } else {
            kind
        };
        return Ok(Statement::Ddl(DdlStatement::CreateIndex {
            table,
            column,
            kind,
        }));
    }
    Err(parse_error("unrecognized CREATE statement", second.pos))
}

fn parse_drop(tokens: &[Token]) -> PResult<Statement> {
    let second = tokens
        .get(1)
        .ok_or_else(|| parse_error("expected object after DROP", tokens[0].pos))?;
    if kw(second, "DATABASE") {
        let name = tokens
            .get(2)
            .ok_or_else(|| parse_error("expected database name", second.pos))?
            .text
            .clone();
        return Ok(Statement::Ddl(DdlStatement::DropDatabase { name }));
    }
    if kw(second, "TABLE") {
        let table = parse_table_ref(
            tokens.get(2).ok_or_else(|| parse_error("expected table name", second.pos))?,
        )?;
        return Ok(Statement::Ddl(DdlStatement::DropTable { table }));
    }
    if kw(second, "INDEX") {
        let on_idx = find_keyword(tokens, "ON", 2)
            .ok_or_else(|| parse_error("expected ON in DROP INDEX", second.pos))?;
        let column = tokens[2].text.clone();
        let table = parse_table_ref(
            tokens
                .get(on_idx + 1)
                .ok_or_else(|| parse_error("expected table after ON", tokens[on_idx].pos))?,
        )?;
        return Ok(Statement::Ddl(DdlStatement::DropIndex { table, column }));
    }
    Err(parse_error("unrecognized DROP statement", second.pos))
}

fn parse_show(tokens: &[Token]) -> PResult<Statement> {
    let second = tokens
        .get(1)
        .ok_or_else(|| parse_error("expected object after SHOW", tokens[0].pos))?;
    if kw(second, "DATABASES") {
        return Ok(Statement::Ddl(DdlStatement::ShowDatabases));
    }
    if kw(second, "TABLES") {
        let database = tokens
            .get(2)
            .map(|t| t.text.clone())
            .ok_or_else(|| parse_error("expected database name", second.pos))?;
        return Ok(Statement::Ddl(DdlStatement::ShowTables { database }));
    }
    if kw(second, "INDEXES") {
        let table = parse_table_ref(
            tokens.get(2).ok_or_else(|| parse_error("expected table name", second.pos))?,
        )?;
        return Ok(Statement::Ddl(DdlStatement::ShowIndexes { table }));
    }
    Err(parse_error("unrecognized SHOW statement", second.pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_select() {
        let stmt = parse("SELECT * FROM mydb.users WHERE age >= 50").unwrap();
        match stmt {
            Statement::Select(s) => {
                assert_eq!(s.table.database, "mydb");
                assert_eq!(s.table.table, "users");
                assert_eq!(s.predicates.len(), 1);
                let pred = &s.predicates[0];
                assert_eq!(pred.column, "age");
                assert_eq!(pred.op, CompareOp::Ge);
                assert_eq!(pred.value.as_int(), Some(50));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn parses_insert() {
        let stmt = parse("INSERT INTO db.t (name, age) VALUES ('bob', 30)").unwrap();
        match stmt {
            Statement::Insert(s) => {
                assert_eq!(s.columns, vec!["name", "age"]);
                assert_eq!(s.values[0].as_str(), Some("bob"));
                assert_eq!(s.values[1].as_int(), Some(30));
            }
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn parses_and_joined_range_predicates() {
        let stmt = parse("SELECT * FROM db.t WHERE age >= 50 AND age < 60").unwrap();
        match stmt {
            Statement::Select(s) => {
                assert_eq!(s.predicates.len(), 2);
                assert_eq!(s.predicates[0].op, CompareOp::Ge);
                assert_eq!(s.predicates[1].op, CompareOp::Lt);
                assert_eq!(s.predicates[1].value.as_int(), Some(60));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn delete_rejects_multi_predicate() {
        let err = parse("DELETE FROM db.t WHERE a = 1 AND b = 2").unwrap_err();
        assert!(matches!(err, SerengetiError::Parse { .. }));
    }

    #[test]
    fn parses_order_by_multi_column() {
        let stmt = parse("SELECT * FROM db.t ORDER BY a DESC, b ASC LIMIT 10").unwrap();
        match stmt {
            Statement::Select(s) => {
                assert_eq!(s.order_by.len(), 2);
                assert_eq!(s.order_by[0].direction, SortDirection::Desc);
                assert_eq!(s.order_by[1].direction, SortDirection::Asc);
                assert_eq!(s.limit, Some(10));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn parses_distinct() {
        let stmt = parse("SELECT DISTINCT city FROM db.users").unwrap();
        match stmt {
            Statement::Select(s) => {
                assert!(s.distinct);
                assert_eq!(s.columns, vec!["city"]);
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn parses_create_index_on_column() {
        let stmt = parse("CREATE INDEX ON db.users(age)").unwrap();
        match stmt {
            Statement::Ddl(DdlStatement::CreateIndex { table, column, kind }) => {
                assert_eq!(table.table, "users");
                assert_eq!(column, "age");
                assert_eq!(kind, IndexKind::BTree);
            }
            _ => panic!("expected create index"),
        }
    }
}
