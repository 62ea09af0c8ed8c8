//! Text-level handling of caller-supplied SQL: comment stripping,
//! statement classification and LIMIT/OFFSET rewriting.
//!
//! This is not a parser. Paging clauses are only recognised at the very end
//! of the statement, so a subquery's own `LIMIT` or a literal containing the
//! word is left alone.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{AppError, AppResult};

/// Page size applied when neither the caller nor the SQL supplies one.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Largest LIMIT or OFFSET handed to SQLite, which takes them as i64.
pub const MAX_ROW_BOUND: usize = i64::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKind {
    Select,
    Insert,
    Update,
    Delete,
    Exec,
}

impl SqlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SqlKind::Select => "SELECT",
            SqlKind::Insert => "INSERT",
            SqlKind::Update => "UPDATE",
            SqlKind::Delete => "DELETE",
            SqlKind::Exec => "EXEC",
        }
    }
}

/// Remove `--` and `/* */` comments, collapse whitespace runs to one space
/// and trim. Quoted strings and identifiers are copied untouched.
pub fn clean_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                pending_space = true;
            }
            c if c.is_whitespace() => pending_space = true,
            '\'' | '"' | '`' | '[' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                for n in chars.by_ref() {
                    out.push(n);
                    if n == close {
                        break;
                    }
                }
            }
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }
    out
}

/// Leading-keyword classification of a cleaned statement.
pub fn classify(sql: &str) -> SqlKind {
    let cleaned = clean_sql(sql);
    let keyword: String = cleaned
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    let rest_ok = cleaned[keyword.len()..]
        .chars()
        .next()
        .map_or(false, |c| !c.is_ascii_alphanumeric() && c != '_');
    if !rest_ok {
        return SqlKind::Exec;
    }
    match keyword.as_str() {
        "SELECT" => SqlKind::Select,
        "INSERT" => SqlKind::Insert,
        "UPDATE" => SqlKind::Update,
        "DELETE" => SqlKind::Delete,
        _ => SqlKind::Exec,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
}

impl Pagination {
    /// Rows skipped before this page. Fails when the window lies beyond
    /// what SQLite can address.
    pub fn offset(&self) -> AppResult<usize> {
        self.page
            .checked_sub(1)
            .and_then(|p| p.checked_mul(self.size))
            .filter(|&o| o <= MAX_ROW_BOUND && self.size <= MAX_ROW_BOUND)
            .ok_or_else(|| self.out_of_range())
    }

    /// Same page index, size held to at most `max_size` rows.
    pub fn capped(self, max_size: usize) -> Self {
        Self {
            page: self.page,
            size: self.size.min(max_size.max(1)),
        }
    }

    fn out_of_range(&self) -> AppError {
        AppError::Validation(format!(
            "page {} of size {} is out of range",
            self.page, self.size
        ))
    }
}

/// A statement split into its body and the trailing paging clause, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedSql {
    /// Statement without trailing `LIMIT`/`OFFSET` or semicolons.
    pub body: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn limit_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+LIMIT\s+(\d+)(?:\s*,\s*(\d+)|\s+OFFSET\s+(\d+))?\s*$")
            .expect("valid regex")
    })
}

fn offset_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s+OFFSET\s+(\d+)\s*$").expect("valid regex"))
}

// Digits only, so a failed parse means overflow; saturate and let the
// window check reject it.
fn parse_num(m: Option<regex::Match<'_>>) -> Option<usize> {
    m.map(|m| m.as_str().parse().unwrap_or(usize::MAX))
}

fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

impl PagedSql {
    pub fn parse(sql: &str) -> Self {
        let sql = trim_statement(sql);
        if let Some(caps) = limit_tail_re().captures(sql) {
            let start = caps.get(0).map_or(sql.len(), |m| m.start());
            let (limit, offset) = if caps.get(2).is_some() {
                // LIMIT <offset>, <count>
                (parse_num(caps.get(2)), parse_num(caps.get(1)))
            } else {
                (parse_num(caps.get(1)), parse_num(caps.get(3)))
            };
            return Self {
                body: trim_statement(&sql[..start]).to_string(),
                limit,
                offset,
            };
        }
        if let Some(caps) = offset_tail_re().captures(sql) {
            let start = caps.get(0).map_or(sql.len(), |m| m.start());
            return Self {
                body: trim_statement(&sql[..start]).to_string(),
                limit: None,
                offset: parse_num(caps.get(1)),
            };
        }
        Self {
            body: sql.to_string(),
            limit: None,
            offset: None,
        }
    }

    /// Paging embedded in the SQL text. Needs a non-zero LIMIT; an OFFSET on
    /// its own says nothing about the page size.
    pub fn embedded(&self) -> Option<Pagination> {
        let size = self.limit.filter(|&l| l > 0)?;
        let page = self.offset.map_or(1, |o| (o / size).saturating_add(1));
        Some(Pagination { page, size })
    }

    /// Body with `LIMIT size+1 OFFSET (page-1)*size`; the extra row signals
    /// that another page exists.
    pub fn lookahead_page(&self, p: Pagination) -> AppResult<String> {
        let offset = p.offset()?;
        let limit = p
            .size
            .checked_add(1)
            .filter(|&l| l <= MAX_ROW_BOUND)
            .ok_or_else(|| p.out_of_range())?;
        Ok(format!("{} LIMIT {} OFFSET {}", self.body, limit, offset))
    }

    /// Body with exactly one page worth of rows.
    pub fn page(&self, p: Pagination) -> AppResult<String> {
        Ok(format!("{} LIMIT {} OFFSET {}", self.body, p.size, p.offset()?))
    }

    pub fn count(&self) -> String {
        count_sql(&self.body)
    }
}

/// Caller parameters win; SQL paging is used only when the caller gave
/// neither page nor size; otherwise page 1 of `default_size`.
pub fn resolve_pagination(
    page: Option<usize>,
    size: Option<usize>,
    embedded: Option<Pagination>,
    default_size: usize,
) -> Pagination {
    let page = page.filter(|&p| p >= 1);
    let size = size.filter(|&s| s >= 1);
    match (page, size) {
        (None, None) => embedded.unwrap_or(Pagination {
            page: 1,
            size: default_size,
        }),
        (page, size) => Pagination {
            page: page.unwrap_or(1),
            size: size.unwrap_or(default_size),
        },
    }
}

pub fn count_sql(body: &str) -> String {
    format!("SELECT COUNT(*) FROM ({}) AS _count", trim_statement(body))
}

/// Zero-row query that still reports the statement's output columns.
pub fn dry_run_sql(body: &str) -> String {
    format!("SELECT * FROM ({}) AS t LIMIT 0", trim_statement(body))
}
