//! Query Classifier
//!
//! Turns raw SQL or structured cube parameters into an [`AggregationRequest`],
//! refusing anything that is not a single read-only aggregation it can fully
//! account for.

use crate::ast::{
    quote_ident, quote_table_name, AggregateArg, AggregateFunction, Expr, SelectItem,
    SelectStatement,
};
use crate::lexer::{Lexer, Token};
use crate::parser::{parse_expression, Parser};
use crate::predicate::Predicate;
use cube_core::{CubeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Settings of the classifier (the `hypercube` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Fact table used by structured cube requests; always permitted
    pub source_table: String,
    /// Further tables raw SQL may read from
    pub allowed_tables: Vec<String>,
    /// When false any table may be queried
    pub restrict_tables: bool,
    /// Columns usable as dimensions; empty allows any column
    pub allowed_dimensions: Vec<String>,
    pub max_dimensionality: usize,
    /// Measure used by cube requests that do not name one
    pub default_metric: String,
    pub select_only: bool,
    pub forbid_multi_statement: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            source_table: "public.facts_agg".to_string(),
            allowed_tables: Vec::new(),
            restrict_tables: true,
            allowed_dimensions: Vec::new(),
            max_dimensionality: 8,
            default_metric: "SUM(count)".to_string(),
            select_only: true,
            forbid_multi_statement: true,
        }
    }
}

impl ClassifierConfig {
    /// Accept any table and any number of dimensions
    pub fn permissive() -> Self {
        Self {
            restrict_tables: false,
            max_dimensionality: usize::MAX,
            ..Self::default()
        }
    }

    pub fn with_source_table(mut self, table: impl Into<String>) -> Self {
        self.source_table = table.into();
        self
    }

    pub fn with_allowed_tables(mut self, tables: Vec<String>) -> Self {
        self.allowed_tables = tables;
        self
    }

    pub fn with_allowed_dimensions(mut self, dims: Vec<String>) -> Self {
        self.allowed_dimensions = dims;
        self
    }

    pub fn with_max_dimensionality(mut self, max: usize) -> Self {
        self.max_dimensionality = max;
        self
    }

    pub fn with_default_metric(mut self, metric: impl Into<String>) -> Self {
        self.default_metric = metric.into();
        self
    }
}

/// An aggregate over one column, or `COUNT(*)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measure {
    pub func: AggregateFunction,
    pub column: Option<String>,
}

impl Measure {
    pub fn new(func: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            func,
            column: Some(column.into()),
        }
    }

    pub fn count_star() -> Self {
        Self {
            func: AggregateFunction::Count,
            column: None,
        }
    }

    pub fn parse(text: &str) -> Result<Measure> {
        Self::from_expr(&parse_expression(text)?)
    }

    pub fn from_expr(expr: &Expr) -> Result<Measure> {
        match expr {
            Expr::AggregateFunction {
                distinct: true, ..
            } => Err(CubeError::rejected("DISTINCT aggregates are not supported")),
            Expr::AggregateFunction {
                func,
                arg: AggregateArg::Star,
                ..
            } => Ok(Measure {
                func: *func,
                column: None,
            }),
            Expr::AggregateFunction {
                func,
                arg: AggregateArg::Expr(inner),
                ..
            } => match inner.as_ref() {
                Expr::Column(column) => Ok(Measure::new(*func, column.clone())),
                _ => Err(CubeError::rejected(
                    "Aggregate arguments must be plain columns",
                )),
            },
            _ => Err(CubeError::rejected(
                "Measure must be one of COUNT, SUM, AVG, MIN, MAX",
            )),
        }
    }

    /// Aggregate that combines partial results of this measure.
    ///
    /// `AVG` has none: averages of averages are wrong.
    pub fn rollup_function(&self) -> Option<AggregateFunction> {
        match self.func {
            AggregateFunction::Count | AggregateFunction::Sum => Some(AggregateFunction::Sum),
            AggregateFunction::Min => Some(AggregateFunction::Min),
            AggregateFunction::Max => Some(AggregateFunction::Max),
            AggregateFunction::Avg => None,
        }
    }
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{}({})", self.func, quote_ident(column)),
            None => write!(f, "{}(*)", self.func),
        }
    }
}

/// A classified read: one measure grouped by a dimension list, optionally filtered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub source_table: String,
    /// Requested order, which is also the output column order
    pub dimensions: Vec<String>,
    pub measure: Measure,
    pub filters: Option<Predicate>,
}

impl AggregationRequest {
    pub fn new(
        source_table: impl Into<String>,
        dimensions: Vec<String>,
        measure: Measure,
        filters: Option<Predicate>,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            dimensions,
            measure,
            filters,
        }
    }

    pub fn dimensionality(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimension_set(&self) -> BTreeSet<String> {
        self.dimensions.iter().cloned().collect()
    }

    /// Name of the measure column in result tables
    pub fn measure_name(&self) -> String {
        self.measure.to_string()
    }

    /// SQL sent to the source system for this request
    pub fn to_sql(&self) -> String {
        let dims: Vec<String> = self.dimensions.iter().map(|d| quote_ident(d)).collect();

        let mut sql = String::from("SELECT ");
        for dim in &dims {
            sql.push_str(dim);
            sql.push_str(", ");
        }
        sql.push_str(&format!(
            "{} AS {} FROM {}",
            self.measure,
            quote_ident(&self.measure_name()),
            quote_table_name(&self.source_table)
        ));
        if let Some(filter) = &self.filters {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        if !dims.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", dims.join(", ")));
        }
        sql
    }
}

/// Parameters of a structured cube request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeParams {
    pub dims: Vec<String>,
    pub metric: Option<String>,
    pub filters: Option<String>,
    pub table: Option<String>,
}

impl CubeParams {
    pub fn new<I, S>(dims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dims: dims.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Dimensions given as `p1,p2`
    pub fn from_dims_str(dims: &str) -> Self {
        Self::new(
            dims.split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty()),
        )
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn with_filters(mut self, filters: impl Into<String>) -> Self {
        self.filters = Some(filters.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

pub struct QueryClassifier {
    config: ClassifierConfig,
}

impl QueryClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify raw SQL text
    pub fn classify_sql(&self, sql: &str) -> Result<AggregationRequest> {
        let tokens = Lexer::new(sql).tokenize()?;
        self.check_tokens(&tokens)?;

        let statement = Parser::from_tokens(tokens).parse()?;
        let request = self.classify_statement(&statement)?;
        self.validate(&request)?;

        debug!(
            table = %request.source_table,
            dims = ?request.dimensions,
            measure = %request.measure,
            "Classified SQL request"
        );
        Ok(request)
    }

    /// Classify a structured cube request
    pub fn classify_cube(&self, params: &CubeParams) -> Result<AggregationRequest> {
        let table = canonical_table_name(
            params
                .table
                .as_deref()
                .unwrap_or(self.config.source_table.as_str()),
        )?;

        let mut dimensions = Vec::with_capacity(params.dims.len());
        for dim in &params.dims {
            let name = match parse_expression(dim)? {
                Expr::Column(name) => name,
                _ => {
                    return Err(CubeError::rejected(format!(
                        "Invalid dimension: {}",
                        dim
                    )))
                }
            };
            if dimensions.contains(&name) {
                return Err(CubeError::rejected(format!("Duplicate dimension: {}", name)));
            }
            dimensions.push(name);
        }

        let measure = Measure::parse(
            params
                .metric
                .as_deref()
                .unwrap_or(self.config.default_metric.as_str()),
        )?;
        let filters = match &params.filters {
            Some(text) => Predicate::parse(text)?,
            None => None,
        };

        let request = AggregationRequest::new(table, dimensions, measure, filters);
        self.validate(&request)?;
        Ok(request)
    }

    fn check_tokens(&self, tokens: &[Token]) -> Result<()> {
        if self.config.forbid_multi_statement {
            if let Some(pos) = tokens.iter().position(|t| *t == Token::Semicolon) {
                let trailing = tokens[pos..]
                    .iter()
                    .any(|t| !matches!(t, Token::Semicolon | Token::Eof));
                if trailing {
                    return Err(CubeError::rejected("Multiple statements are not allowed"));
                }
            }
        }

        if self.config.select_only {
            if tokens.first() != Some(&Token::Select) {
                return Err(CubeError::rejected("Only SELECT statements are allowed"));
            }
            if let Some(verb) = tokens.iter().find(|t| t.is_write_verb()) {
                return Err(CubeError::rejected(format!(
                    "Statement contains a write keyword: {:?}",
                    verb
                )));
            }
        }

        Ok(())
    }

    fn classify_statement(&self, stmt: &SelectStatement) -> Result<AggregationRequest> {
        if stmt.distinct {
            return Err(CubeError::rejected("SELECT DISTINCT is not supported"));
        }
        if stmt.having.is_some() {
            return Err(CubeError::rejected("HAVING is not supported"));
        }
        if !stmt.order_by.is_empty() {
            return Err(CubeError::rejected("ORDER BY is not supported"));
        }
        if stmt.limit.is_some() || stmt.offset.is_some() {
            return Err(CubeError::rejected("LIMIT and OFFSET are not supported"));
        }

        let table = stmt
            .from
            .as_ref()
            .ok_or_else(|| CubeError::rejected("Query has no FROM clause"))?;

        let mut dimensions: Vec<String> = Vec::new();
        let mut measure = None;

        for item in &stmt.projection {
            let (expr, alias) = match item {
                SelectItem::Wildcard => {
                    return Err(CubeError::rejected("SELECT * is not supported"))
                }
                SelectItem::UnnamedExpr(expr) => (expr, None),
                SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias)),
            };

            match expr {
                Expr::AggregateFunction { .. } => {
                    if measure.is_some() {
                        return Err(CubeError::rejected("Only one aggregate is supported"));
                    }
                    // Aliases on the measure are dropped; result columns use the canonical name
                    measure = Some(Measure::from_expr(expr)?);
                }
                Expr::Column(name) => {
                    if measure.is_some() {
                        return Err(CubeError::rejected(
                            "The aggregate must be the last selected column",
                        ));
                    }
                    if alias.is_some_and(|a| a != name) {
                        return Err(CubeError::rejected("Aliases on dimensions are not supported"));
                    }
                    if dimensions.contains(name) {
                        return Err(CubeError::rejected(format!(
                            "Duplicate dimension: {}",
                            name
                        )));
                    }
                    dimensions.push(name.clone());
                }
                Expr::QualifiedColumn { .. } => {
                    return Err(CubeError::rejected(
                        "Qualified column references are not supported",
                    ))
                }
                _ => {
                    return Err(CubeError::rejected(
                        "Only plain columns and one aggregate may be selected",
                    ))
                }
            }
        }

        let measure = measure.ok_or_else(|| CubeError::rejected("Query has no aggregate"))?;

        let mut group_by: Vec<String> = Vec::new();
        for expr in &stmt.group_by {
            match expr {
                Expr::Column(name) => {
                    if !group_by.contains(name) {
                        group_by.push(name.clone());
                    }
                }
                _ => {
                    return Err(CubeError::rejected(
                        "GROUP BY supports plain columns only",
                    ))
                }
            }
        }

        let grouped: BTreeSet<&String> = group_by.iter().collect();
        let selected: BTreeSet<&String> = dimensions.iter().collect();
        if grouped != selected {
            return Err(CubeError::rejected(
                "GROUP BY must list exactly the selected dimensions",
            ));
        }

        let filters = match &stmt.selection {
            Some(expr) => Predicate::from_where(expr)?,
            None => None,
        };

        Ok(AggregationRequest::new(
            table.name.clone(),
            dimensions,
            measure,
            filters,
        ))
    }

    fn validate(&self, request: &AggregationRequest) -> Result<()> {
        if self.config.restrict_tables && !self.table_allowed(&request.source_table) {
            return Err(CubeError::rejected(format!(
                "Table not permitted: {}",
                request.source_table
            )));
        }

        if request.dimensionality() > self.config.max_dimensionality {
            return Err(CubeError::rejected(format!(
                "Too many dimensions: {} > {}",
                request.dimensionality(),
                self.config.max_dimensionality
            )));
        }

        if !self.config.allowed_dimensions.is_empty() {
            if let Some(dim) = request
                .dimensions
                .iter()
                .find(|d| !self.config.allowed_dimensions.contains(d))
            {
                return Err(CubeError::rejected(format!("Dimension not permitted: {}", dim)));
            }
        }

        Ok(())
    }

    fn table_allowed(&self, table: &str) -> bool {
        std::iter::once(&self.config.source_table)
            .chain(self.config.allowed_tables.iter())
            .any(|allowed| allowed.eq_ignore_ascii_case(table))
    }
}

/// Normalize a `[schema.]table` name the way the lexer would
pub fn canonical_table_name(text: &str) -> Result<String> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parts = Vec::new();
    let mut expect_ident = true;

    for token in &tokens {
        match (token, expect_ident) {
            (Token::Identifier(name), true) => parts.push(name.clone()),
            (Token::Dot, false) => {}
            (Token::Eof, false) => return Ok(parts.join(".")),
            _ => break,
        }
        expect_ident = !expect_ident;
    }

    Err(CubeError::rejected(format!("Invalid table name: {}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> QueryClassifier {
        QueryClassifier::new(ClassifierConfig::default())
    }

    fn rejected(result: Result<AggregationRequest>) -> bool {
        matches!(result, Err(CubeError::RejectedQuery(_)))
    }

    #[test]
    fn test_classify_sql() {
        let req = classifier()
            .classify_sql(
                "select P2, p1, sum(count) as total from public.facts_agg where p3 > 5 group by p1, p2",
            )
            .unwrap();

        assert_eq!(req.source_table, "public.facts_agg");
        assert_eq!(req.dimensions, vec!["p2", "p1"]);
        assert_eq!(req.measure, Measure::new(AggregateFunction::Sum, "count"));
        assert_eq!(req.measure_name(), "SUM(count)");
        assert_eq!(req.filters.unwrap().to_string(), "p3 > 5");
    }

    #[test]
    fn test_sql_and_cube_forms_agree() {
        let c = classifier();
        let from_sql = c
            .classify_sql("SELECT p1, SUM(count) FROM public.facts_agg WHERE p3 > 5 GROUP BY p1")
            .unwrap();
        let from_cube = c
            .classify_cube(&CubeParams::from_dims_str("p1").with_filters("5 < p3"))
            .unwrap();
        assert_eq!(from_sql, from_cube);
    }

    #[test]
    fn test_where_true_and_duplicate_group_by() {
        let req = classifier()
            .classify_sql("SELECT p1, COUNT(*) FROM public.facts_agg WHERE TRUE GROUP BY p1, p1")
            .unwrap();
        assert!(req.filters.is_none());
        assert_eq!(req.measure, Measure::count_star());
    }

    #[test]
    fn test_security_rejections() {
        let c = classifier();
        assert!(rejected(c.classify_sql(
            "SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p1; DROP TABLE public.facts_agg"
        )));
        assert!(rejected(c.classify_sql("DELETE FROM public.facts_agg")));
        assert!(rejected(c.classify_sql("WITH x AS (SELECT 1) SELECT * FROM x")));
        assert!(rejected(c.classify_sql("SELECT p1, SUM(count) FROM secrets GROUP BY p1")));
        assert!(rejected(c.classify_sql(
            "SELECT p1, SUM(count) FROM public.facts_agg -- GROUP BY p1"
        )));
    }

    #[test]
    fn test_shape_rejections() {
        let c = classifier();
        for sql in [
            "SELECT * FROM public.facts_agg",
            "SELECT DISTINCT p1, SUM(count) FROM public.facts_agg GROUP BY p1",
            "SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p1 ORDER BY p1",
            "SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p1 LIMIT 10",
            "SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p1 HAVING SUM(count) > 1",
            "SELECT p1, SUM(count), MAX(count) FROM public.facts_agg GROUP BY p1",
            "SELECT SUM(count), p1 FROM public.facts_agg GROUP BY p1",
            "SELECT p1 AS x, SUM(count) FROM public.facts_agg GROUP BY p1",
            "SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p2",
            "SELECT p1, SUM(count) FROM public.facts_agg",
            "SELECT p1, p1, SUM(count) FROM public.facts_agg GROUP BY p1",
            "SELECT p1, COUNT(DISTINCT p2) FROM public.facts_agg GROUP BY p1",
            "SELECT p1 FROM public.facts_agg GROUP BY p1",
        ] {
            assert!(rejected(c.classify_sql(sql)), "accepted: {}", sql);
        }
    }

    #[test]
    fn test_dimension_limits() {
        let c = QueryClassifier::new(
            ClassifierConfig::default()
                .with_max_dimensionality(2)
                .with_allowed_dimensions(vec!["p1".into(), "p2".into(), "p3".into()]),
        );
        assert!(c.classify_cube(&CubeParams::new(["p1", "p2"])).is_ok());
        assert!(rejected(c.classify_cube(&CubeParams::new(["p1", "p2", "p3"]))));
        assert!(rejected(c.classify_cube(&CubeParams::new(["p9"]))));
        assert!(rejected(c.classify_cube(&CubeParams::new(["p1; drop table x"]))));
    }

    #[test]
    fn test_permissive_config() {
        let c = QueryClassifier::new(ClassifierConfig::permissive());
        let req = c
            .classify_sql("SELECT region, AVG(amount) FROM sales GROUP BY region")
            .unwrap();
        assert_eq!(req.source_table, "sales");
        assert!(req.measure.rollup_function().is_none());
    }

    #[test]
    fn test_to_sql_reclassifies_to_same_request() {
        let c = classifier();
        let req = c
            .classify_cube(
                &CubeParams::new(["p2", "p1"])
                    .with_metric("max(count)")
                    .with_filters("p3 IN (1, 2) AND p4 = 'x'"),
            )
            .unwrap();
        let sql = req.to_sql();
        assert_eq!(
            sql,
            "SELECT p2, p1, MAX(count) AS \"MAX(count)\" FROM public.facts_agg \
             WHERE (p3 = 1 OR p3 = 2) AND p4 = 'x' GROUP BY p2, p1"
        );
        assert_eq!(c.classify_sql(&sql).unwrap(), req);
    }

    #[test]
    fn test_to_sql_keeps_dotted_column_whole() {
        let c = QueryClassifier::new(ClassifierConfig::permissive());
        let req = c
            .classify_sql(r#"SELECT "a.b", SUM(count) FROM sales WHERE "a.b" = 'x' GROUP BY "a.b""#)
            .unwrap();
        assert_eq!(req.dimensions, vec!["a.b"]);

        let sql = req.to_sql();
        assert!(sql.starts_with(r#"SELECT "a.b", SUM(count)"#));
        assert_eq!(c.classify_sql(&sql).unwrap(), req);
    }

    #[test]
    fn test_canonical_table_name() {
        assert_eq!(canonical_table_name("Public.Facts_Agg").unwrap(), "public.facts_agg");
        assert!(canonical_table_name("facts; drop").is_err());
        assert!(canonical_table_name("a..b").is_err());
    }
}
