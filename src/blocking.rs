//! Blocking rules and the SQL that applies them.
//!
//! A blocking rule is a predicate over a left (`l.`) and right (`r.`) record.
//! When several rules are applied together, each pair is attributed to the
//! first rule it satisfies (its `match_key`), so no pair is generated twice.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::LinkType;

static COLUMN_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b[lr]\."?([A-Za-z_][A-Za-z0-9_]*)"?"#).expect("Invalid column reference regex")
});
static LEFT_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bl\.").expect("Invalid left ref regex"));
static RIGHT_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\br\.").expect("Invalid right ref regex"));
static BARE_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^"?([A-Za-z_][A-Za-z0-9_]*)"?$"#).expect("Invalid bare column regex")
});

/// Predicate restricting which record pairs are compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BlockingRule {
    blocking_rule_sql: String,
    equi_join_conditions: Vec<(String, String)>,
}

impl BlockingRule {
    pub fn new(sql: impl Into<String>) -> Self {
        let blocking_rule_sql = sql.into().trim().to_string();
        let equi_join_conditions = parse_equi_join_conditions(&blocking_rule_sql);
        Self {
            blocking_rule_sql,
            equi_join_conditions,
        }
    }

    pub fn blocking_rule_sql(&self) -> &str {
        &self.blocking_rule_sql
    }

    /// `(left key, right key)` expressions of the rule's top-level equality
    /// conjuncts, rewritten to run against the unaliased input table.
    pub fn equi_join_conditions(&self) -> &[(String, String)] {
        &self.equi_join_conditions
    }

    /// Input columns referenced as `l.col` / `r.col`.
    pub fn columns_used(&self) -> BTreeSet<String> {
        COLUMN_REF_RE
            .captures_iter(&self.blocking_rule_sql)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Columns the rule guarantees to be exactly equal (`l.col = r.col`).
    pub fn exact_match_columns(&self) -> BTreeSet<String> {
        self.equi_join_conditions
            .iter()
            .filter_map(|(l_key, r_key)| {
                let l = BARE_COLUMN_RE.captures(l_key)?;
                let r = BARE_COLUMN_RE.captures(r_key)?;
                (l[1] == r[1]).then(|| l[1].to_string())
            })
            .collect()
    }
}

impl From<String> for BlockingRule {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

impl From<&str> for BlockingRule {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<BlockingRule> for String {
    fn from(rule: BlockingRule) -> Self {
        rule.blocking_rule_sql
    }
}

impl fmt::Display for BlockingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.blocking_rule_sql)
    }
}

fn parse_equi_join_conditions(sql: &str) -> Vec<(String, String)> {
    if split_top_level(sql, "or").len() > 1 {
        return Vec::new();
    }
    split_top_level(sql, "and")
        .into_iter()
        .filter_map(|conjunct| {
            let conjunct = strip_outer_parens(conjunct);
            let (lhs, rhs) = split_equality(conjunct)?;
            let (lhs, rhs) = (lhs.trim(), rhs.trim());
            let refs = |s: &str| (LEFT_REF_RE.is_match(s), RIGHT_REF_RE.is_match(s));
            match (refs(lhs), refs(rhs)) {
                ((true, false), (false, true)) => Some((strip_alias(lhs, &LEFT_REF_RE), strip_alias(rhs, &RIGHT_REF_RE))),
                ((false, true), (true, false)) => Some((strip_alias(rhs, &LEFT_REF_RE), strip_alias(lhs, &RIGHT_REF_RE))),
                _ => None,
            }
        })
        .collect()
}

fn strip_alias(expr: &str, alias: &Regex) -> String {
    alias.replace_all(expr, "").trim().to_string()
}

/// Split on a top-level binary `=` (not `<=`, `>=`, `!=`, `==`).
fn split_equality(expr: &str) -> Option<(&str, &str)> {
    let bytes = expr.as_bytes();
    let mut found = None;
    for (idx, depth) in top_level_positions(expr) {
        if depth != 0 || bytes[idx] != b'=' {
            continue;
        }
        let prev = idx.checked_sub(1).map(|i| bytes[i]);
        let next = bytes.get(idx + 1).copied();
        if matches!(prev, Some(b'<' | b'>' | b'!' | b'=')) || next == Some(b'=') {
            continue;
        }
        if found.is_some() {
            return None;
        }
        found = Some(idx);
    }
    found.map(|idx| (&expr[..idx], &expr[idx + 1..]))
}

/// Byte offsets outside string literals, with their parenthesis depth.
fn top_level_positions(sql: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(sql.len());
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (idx, &b) in sql.as_bytes().iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ => out.push((idx, depth)),
        }
    }
    out
}

/// Split `sql` on a keyword (`and` / `or`) appearing at parenthesis depth 0.
pub fn split_top_level<'a>(sql: &'a str, keyword: &str) -> Vec<&'a str> {
    let bytes = sql.as_bytes();
    let kw = keyword.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut parts = Vec::new();
    let mut start = 0;
    let mut skip_until = 0;
    for (idx, depth) in top_level_positions(sql) {
        if idx < skip_until || depth != 0 || idx + kw.len() > bytes.len() {
            continue;
        }
        if !bytes[idx..idx + kw.len()].eq_ignore_ascii_case(kw) {
            continue;
        }
        let before_ok = idx == 0 || !is_word(bytes[idx - 1]);
        let after_ok = bytes.get(idx + kw.len()).map_or(true, |&b| !is_word(b));
        if before_ok && after_ok {
            parts.push(sql[start..idx].trim());
            start = idx + kw.len();
            skip_until = start;
        }
    }
    parts.push(sql[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Remove parentheses that wrap the whole expression.
pub fn strip_outer_parens(expr: &str) -> &str {
    let mut s = expr.trim();
    while s.starts_with('(') && s.ends_with(')') && closing_paren(s) == Some(s.len() - 1) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

fn closing_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (idx, &b) in s.as_bytes().iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Table and column naming needed to generate blocking SQL.
#[derive(Debug, Clone)]
pub struct BlockingContext<'a> {
    pub link_type: LinkType,
    /// Link-only with exactly two inputs: left and right are separate tables.
    pub two_dataset_link_only: bool,
    pub unique_id_column_name: &'a str,
    pub source_dataset_column_name: &'a str,
    pub input_tablename_l: &'a str,
    pub input_tablename_r: &'a str,
}

impl BlockingContext<'_> {
    fn composite_unique_id(&self, alias: &str) -> String {
        let uid = quote_identifier(self.unique_id_column_name);
        match self.link_type {
            LinkType::DedupeOnly => format!("{alias}.{uid}"),
            _ => {
                let sd = quote_identifier(self.source_dataset_column_name);
                format!("{alias}.{sd} || '-__-' || {alias}.{uid}")
            }
        }
    }

    /// Restricts the join to each unordered pair once, across datasets where required.
    pub fn where_condition(&self) -> String {
        if self.two_dataset_link_only {
            return "where 1=1".to_string();
        }
        let id_l = self.composite_unique_id("l");
        let id_r = self.composite_unique_id("r");
        match self.link_type {
            LinkType::DedupeOnly | LinkType::LinkAndDedupe => format!("where {id_l} < {id_r}"),
            LinkType::LinkOnly => {
                let sd = quote_identifier(self.source_dataset_column_name);
                format!("where {id_l} < {id_r} and l.{sd} != r.{sd}")
            }
        }
    }

    /// Select list carrying ids and the given input columns with `_l`/`_r` suffixes.
    pub fn columns_to_select(&self, input_columns: &BTreeSet<String>) -> Vec<String> {
        let mut cols: Vec<&str> = vec![self.unique_id_column_name, self.source_dataset_column_name];
        cols.extend(
            input_columns
                .iter()
                .map(String::as_str)
                .filter(|c| *c != self.unique_id_column_name && *c != self.source_dataset_column_name),
        );
        cols.into_iter()
            .flat_map(|c| {
                let q = quote_identifier(c);
                [
                    format!("l.{q} AS {}", quote_identifier(&format!("{c}_l"))),
                    format!("r.{q} AS {}", quote_identifier(&format!("{c}_r"))),
                ]
            })
            .collect()
    }

    /// One `union all` branch per rule; later rules exclude pairs already
    /// claimed by earlier ones. No rules means the full cartesian join.
    pub fn block_using_rules_sql(&self, rules: &[BlockingRule], select_columns: &[String]) -> String {
        let where_condition = self.where_condition();
        let mut select_list = select_columns.join(", ");
        if !select_list.is_empty() {
            select_list.push_str(", ");
        }
        let cartesian = [BlockingRule::new("1=1")];
        let rules = if rules.is_empty() { &cartesian[..] } else { rules };

        rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let exclusions: String = rules[..i]
                    .iter()
                    .map(|prev| format!(" AND NOT COALESCE(({}), FALSE)", prev.blocking_rule_sql()))
                    .collect();
                format!(
                    "select {select_list}'{i}' as match_key \
                     from {l} as l inner join {r} as r \
                     on ({rule}) {where_condition}{exclusions}",
                    l = self.input_tablename_l,
                    r = self.input_tablename_r,
                    rule = rule.blocking_rule_sql(),
                )
            })
            .collect::<Vec<_>>()
            .join("\nUNION ALL\n")
    }
}
