//! Parameterized SQL assembly for advanced and paged queries.
//!
//! A [`QuerySpec`] collects condition categories and renders them into a
//! WHERE clause with `$n` placeholders plus the ordered parameter list:
//! equality conditions AND-combine, ranges become BETWEEN, fuzzies become
//! `LIKE '%v%'`, IN lists expand one placeholder per element, and a raw
//! clause is appended parenthesized. Empty categories are omitted.
//!
//! Everything here is pure string/parameter assembly so the shapes are
//! unit-tested without a database.

use chrono::{DateTime, Utc};

use crate::StoreError;

/// A bind parameter. Typed so integers compare as integers server-side.
/// NULL tests never bind a parameter — they go through
/// [`QuerySpec::raw`] as `col IS NULL`.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    I64(i64),
    I32(i32),
    F64(f64),
    Str(String),
    Ts(DateTime<Utc>),
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}
impl From<i32> for SqlParam {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}
impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}
impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}
impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}
impl From<DateTime<Utc>> for SqlParam {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Ts(v)
    }
}

/// One page of a paged query.
#[derive(Clone, Debug)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total_items: i64,
    pub total_pages: i64,
    pub current_page: i64,
    pub page_size: i64,
}

/// Composable query description. All categories AND-combine.
#[derive(Clone, Debug, Default)]
pub struct QuerySpec {
    conditions: Vec<(String, SqlParam)>,
    ranges: Vec<(String, SqlParam, SqlParam)>,
    fuzzies: Vec<(String, String)>,
    ins: Vec<(String, Vec<SqlParam>)>,
    raw: Option<String>,
    group_by: Option<String>,
    order_by: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, col: &str, value: impl Into<SqlParam>) -> Self {
        self.conditions.push((col.to_string(), value.into()));
        self
    }

    pub fn between(
        mut self,
        col: &str,
        lo: impl Into<SqlParam>,
        hi: impl Into<SqlParam>,
    ) -> Self {
        self.ranges.push((col.to_string(), lo.into(), hi.into()));
        self
    }

    pub fn like(mut self, col: &str, needle: &str) -> Self {
        self.fuzzies.push((col.to_string(), needle.to_string()));
        self
    }

    pub fn is_in<P: Into<SqlParam>>(mut self, col: &str, values: Vec<P>) -> Self {
        self.ins
            .push((col.to_string(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Appended as a parenthesized AND clause, verbatim. The caller owns
    /// its safety; only constant fragments belong here.
    pub fn raw(mut self, clause: &str) -> Self {
        self.raw = Some(clause.to_string());
        self
    }

    pub fn group_by(mut self, cols: &str) -> Self {
        self.group_by = Some(cols.to_string());
        self
    }

    pub fn order_by(mut self, clause: &str) -> Self {
        self.order_by = Some(clause.to_string());
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: i64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Render the WHERE clause (empty string when no conditions) and the
    /// ordered parameters, numbering placeholders from `$1`.
    pub fn build_where(&self) -> (String, Vec<SqlParam>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut n = 0usize;
        let mut next = |params: &mut Vec<SqlParam>, p: SqlParam| {
            n += 1;
            params.push(p);
            format!("${n}")
        };

        for (col, val) in &self.conditions {
            let ph = next(&mut params, val.clone());
            clauses.push(format!("{col} = {ph}"));
        }
        for (col, lo, hi) in &self.ranges {
            let ph_lo = next(&mut params, lo.clone());
            let ph_hi = next(&mut params, hi.clone());
            clauses.push(format!("{col} BETWEEN {ph_lo} AND {ph_hi}"));
        }
        for (col, needle) in &self.fuzzies {
            let ph = next(&mut params, SqlParam::Str(format!("%{needle}%")));
            clauses.push(format!("{col} LIKE {ph}"));
        }
        for (col, values) in &self.ins {
            if values.is_empty() {
                continue;
            }
            let phs: Vec<String> = values
                .iter()
                .map(|v| next(&mut params, v.clone()))
                .collect();
            clauses.push(format!("{col} IN ({})", phs.join(", ")));
        }
        if let Some(raw) = &self.raw {
            clauses.push(format!("({raw})"));
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), params)
        }
    }

    /// Full SELECT for [`query_advanced`][crate::PgStore::query_advanced].
    pub fn build_select(&self, base: &str) -> (String, Vec<SqlParam>) {
        let (where_clause, params) = self.build_where();
        let mut sql = format!("{base}{where_clause}");
        if let Some(g) = &self.group_by {
            sql.push_str(&format!(" GROUP BY {g}"));
        }
        if let Some(o) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {o}"));
        }
        if let Some(l) = self.limit {
            sql.push_str(&format!(" LIMIT {l}"));
        }
        if let Some(o) = self.offset {
            sql.push_str(&format!(" OFFSET {o}"));
        }
        (sql, params)
    }

    /// Count + data statement pair for a paged query. Paging without an
    /// explicit order-by would return nondeterministic pages, so it is
    /// rejected outright.
    pub fn build_page(
        &self,
        base: &str,
        page: i64,
        page_size: i64,
    ) -> Result<PagedSql, StoreError> {
        let order_by = self
            .order_by
            .as_deref()
            .ok_or_else(|| StoreError::BadQuery("paged query requires an order-by".into()))?;

        let page = page.max(1);
        let page_size = page_size.max(1);
        let (where_clause, params) = self.build_where();

        let mut inner = format!("{base}{where_clause}");
        if let Some(g) = &self.group_by {
            inner.push_str(&format!(" GROUP BY {g}"));
        }
        let count_sql = format!("SELECT COUNT(*) FROM ({inner}) AS tmp");

        let data_sql = format!(
            "{inner} ORDER BY {order_by} LIMIT {page_size} OFFSET {}",
            (page - 1) * page_size
        );

        Ok(PagedSql {
            count_sql,
            data_sql,
            params,
            page,
            page_size,
        })
    }
}

/// Rendered SQL pair for one page.
#[derive(Clone, Debug)]
pub struct PagedSql {
    pub count_sql: String,
    pub data_sql: String,
    pub params: Vec<SqlParam>,
    pub page: i64,
    pub page_size: i64,
}

impl PagedSql {
    pub fn total_pages(&self, total_items: i64) -> i64 {
        (total_items + self.page_size - 1) / self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_renders_no_where() {
        let (sql, params) = QuerySpec::new().build_select("SELECT * FROM uv_order");
        assert_eq!(sql, "SELECT * FROM uv_order");
        assert!(params.is_empty());
    }

    #[test]
    fn all_categories_compose_in_order() {
        let spec = QuerySpec::new()
            .eq("status", 0i32)
            .between("reward", 10.0, 500.0)
            .like("order_no", "ORD")
            .is_in("order_type_code", vec![101i64, 701i64])
            .raw("uv_id IS NULL");
        let (sql, params) = spec.build_select("SELECT * FROM uv_order");

        assert_eq!(
            sql,
            "SELECT * FROM uv_order WHERE status = $1 \
             AND reward BETWEEN $2 AND $3 \
             AND order_no LIKE $4 \
             AND order_type_code IN ($5, $6) \
             AND (uv_id IS NULL)"
        );
        assert_eq!(params.len(), 6);
        assert_eq!(params[3], SqlParam::Str("%ORD%".into()));
        assert_eq!(params[4], SqlParam::I64(101));
    }

    #[test]
    fn empty_in_list_is_omitted() {
        let spec = QuerySpec::new()
            .eq("status", 0i32)
            .is_in::<i64>("order_type_code", vec![]);
        let (sql, params) = spec.build_select("SELECT * FROM uv_order");
        assert_eq!(sql, "SELECT * FROM uv_order WHERE status = $1");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn select_tail_clauses() {
        let spec = QuerySpec::new()
            .eq("is_delete", 0i32)
            .group_by("order_type_code")
            .order_by("created_at DESC")
            .limit(10)
            .offset(20);
        let (sql, _) = spec.build_select("SELECT * FROM uv_order");
        assert!(sql.ends_with(
            "GROUP BY order_type_code ORDER BY created_at DESC LIMIT 10 OFFSET 20"
        ));
    }

    #[test]
    fn paging_without_order_by_is_rejected() {
        let err = QuerySpec::new()
            .eq("status", 0i32)
            .build_page("SELECT * FROM uv_order", 1, 100)
            .unwrap_err();
        assert!(matches!(err, StoreError::BadQuery(_)));
    }

    #[test]
    fn paged_sql_shapes_and_clamping() {
        let paged = QuerySpec::new()
            .eq("status", 0i32)
            .order_by("created_at DESC")
            .build_page("SELECT * FROM uv_order", 0, 0)
            .unwrap();

        // Page and size are clamped to 1.
        assert_eq!(paged.page, 1);
        assert_eq!(paged.page_size, 1);
        assert_eq!(
            paged.count_sql,
            "SELECT COUNT(*) FROM (SELECT * FROM uv_order WHERE status = $1) AS tmp"
        );
        assert_eq!(
            paged.data_sql,
            "SELECT * FROM uv_order WHERE status = $1 ORDER BY created_at DESC LIMIT 1 OFFSET 0"
        );
    }

    #[test]
    fn total_pages_rounds_up() {
        let paged = QuerySpec::new()
            .order_by("id")
            .build_page("SELECT * FROM uv_order", 2, 100)
            .unwrap();
        assert_eq!(paged.total_pages(0), 0);
        assert_eq!(paged.total_pages(100), 1);
        assert_eq!(paged.total_pages(101), 2);
    }
}
