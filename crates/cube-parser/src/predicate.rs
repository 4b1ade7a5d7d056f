//! Filter predicates in a closed normal form
//!
//! Free-form WHERE expressions are lowered to comparisons of a column against
//! a literal, combined with AND and OR. NOT is pushed into the comparisons,
//! IN lists and BETWEEN ranges are expanded, and numeric literals are
//! rewritten to one spelling so that equivalent filters print identically.

use crate::ast::{quote_ident, BinaryOperator, Expr, Literal, UnaryOperator};
use crate::parser::parse_expression;
use cube_core::{CubeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    /// Operator for `NOT (a op b)`
    pub fn negate(&self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::NotEq,
            CompareOp::NotEq => CompareOp::Eq,
            CompareOp::Lt => CompareOp::GtEq,
            CompareOp::LtEq => CompareOp::Gt,
            CompareOp::Gt => CompareOp::LtEq,
            CompareOp::GtEq => CompareOp::Lt,
        }
    }

    /// Operator for `b op a` given `a op b`
    pub fn flip(&self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::NotEq => CompareOp::NotEq,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
        }
    }

    fn from_binary(op: BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Equal => Some(CompareOp::Eq),
            BinaryOperator::NotEqual => Some(CompareOp::NotEq),
            BinaryOperator::Less => Some(CompareOp::Lt),
            BinaryOperator::LessEqual => Some(CompareOp::LtEq),
            BinaryOperator::Greater => Some(CompareOp::Gt),
            BinaryOperator::GreaterEqual => Some(CompareOp::GtEq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Comparison {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: Literal) -> Self {
        Predicate::Comparison {
            column: column.into(),
            op,
            value,
        }
    }

    /// Parse filter text. `TRUE` (or an empty string) means no filter.
    pub fn parse(text: &str) -> Result<Option<Predicate>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let expr = parse_expression(text)?;
        Self::from_where(&expr)
    }

    /// Lower a WHERE clause, treating a bare `TRUE` as no filter
    pub fn from_where(expr: &Expr) -> Result<Option<Predicate>> {
        if *expr == Expr::Literal(Literal::Boolean(true)) {
            return Ok(None);
        }
        Ok(Some(Self::from_expr(expr)?.normalize()))
    }

    /// Lower a parsed expression into the closed predicate form
    pub fn from_expr(expr: &Expr) -> Result<Predicate> {
        lower(expr, false)
    }

    /// Flatten nested conjunctions and disjunctions, then sort and dedup
    /// their children by printed form.
    pub fn normalize(self) -> Predicate {
        match self {
            Predicate::Comparison { .. } => self,
            Predicate::And(children) => Self::collapse(children, true),
            Predicate::Or(children) => Self::collapse(children, false),
        }
    }

    fn collapse(children: Vec<Predicate>, conjunction: bool) -> Predicate {
        let mut flat = Vec::with_capacity(children.len());
        for child in children.into_iter().map(Predicate::normalize) {
            match child {
                Predicate::And(inner) if conjunction => flat.extend(inner),
                Predicate::Or(inner) if !conjunction => flat.extend(inner),
                other => flat.push(other),
            }
        }

        flat.sort_by_cached_key(|p| p.to_string());
        flat.dedup();

        if flat.len() == 1 {
            return flat.remove(0);
        }
        if conjunction {
            Predicate::And(flat)
        } else {
            Predicate::Or(flat)
        }
    }

    /// Combine predicates with AND; `None` when the list is empty
    pub fn all(predicates: Vec<Predicate>) -> Option<Predicate> {
        match predicates.len() {
            0 => None,
            _ => Some(Predicate::And(predicates).normalize()),
        }
    }

    /// Top-level conjuncts of a normalized predicate
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(children) => children.iter().collect(),
            other => vec![other],
        }
    }

    /// Every column the predicate references
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::Comparison { column, .. } => {
                out.insert(column.clone());
            }
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_columns(out);
                }
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Comparison { column, op, value } => {
                write!(f, "{} {} {}", quote_ident(column), op.symbol(), value)
            }
            Predicate::And(children) => write_joined(f, children, " AND "),
            Predicate::Or(children) => write_joined(f, children, " OR "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[Predicate], sep: &str) -> fmt::Result {
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        match child {
            Predicate::Comparison { .. } => write!(f, "{}", child)?,
            _ => write!(f, "({})", child)?,
        }
    }
    Ok(())
}

fn lower(expr: &Expr, negated: bool) -> Result<Predicate> {
    match expr {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => lower(expr, !negated),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And | BinaryOperator::Or => {
                let children = vec![lower(left, negated)?, lower(right, negated)?];
                // De Morgan: a negated AND becomes an OR and vice versa
                let conjunction = (*op == BinaryOperator::And) != negated;
                Ok(if conjunction {
                    Predicate::And(children)
                } else {
                    Predicate::Or(children)
                })
            }
            _ => {
                let op = CompareOp::from_binary(*op)
                    .ok_or_else(|| unsupported("arithmetic in filters"))?;
                let (column, op, value) = match (left.as_ref(), right.as_ref()) {
                    (Expr::Column(c), Expr::Literal(v)) => (c, op, v),
                    (Expr::Literal(v), Expr::Column(c)) => (c, op.flip(), v),
                    _ => return Err(unsupported("comparisons other than column against literal")),
                };
                let op = if negated { op.negate() } else { op };
                Ok(Predicate::compare(column.clone(), op, canonical_literal(value)?))
            }
        },
        Expr::InList {
            expr,
            list,
            negated: not_in,
        } => {
            let column = column_name(expr)?;
            let negated = negated != *not_in;
            let op = if negated { CompareOp::NotEq } else { CompareOp::Eq };
            let items = list
                .iter()
                .map(|item| match item {
                    Expr::Literal(v) => Ok(Predicate::compare(column.clone(), op, canonical_literal(v)?)),
                    _ => Err(unsupported("non-literal IN list items")),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(if negated {
                Predicate::And(items)
            } else {
                Predicate::Or(items)
            })
        }
        Expr::Between {
            expr,
            low,
            high,
            negated: not_between,
        } => {
            let column = column_name(expr)?;
            let (Expr::Literal(low), Expr::Literal(high)) = (low.as_ref(), high.as_ref()) else {
                return Err(unsupported("non-literal BETWEEN bounds"));
            };
            let low = canonical_literal(low)?;
            let high = canonical_literal(high)?;
            if negated != *not_between {
                Ok(Predicate::Or(vec![
                    Predicate::compare(column.clone(), CompareOp::Lt, low),
                    Predicate::compare(column, CompareOp::Gt, high),
                ]))
            } else {
                Ok(Predicate::And(vec![
                    Predicate::compare(column.clone(), CompareOp::GtEq, low),
                    Predicate::compare(column, CompareOp::LtEq, high),
                ]))
            }
        }
        Expr::IsNull { .. } => Err(unsupported("IS NULL filters")),
        Expr::QualifiedColumn { .. } => Err(unsupported("qualified column references")),
        Expr::AggregateFunction { .. } => Err(unsupported("aggregates in filters")),
        Expr::Column(_) | Expr::Literal(_) => Err(unsupported("bare values as filters")),
        Expr::UnaryOp { .. } => Err(unsupported("arithmetic in filters")),
    }
}

fn column_name(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Column(name) => Ok(name.clone()),
        _ => Err(unsupported("filters on expressions other than plain columns")),
    }
}

/// Rewrite numbers to a single spelling (`01.50` -> `1.5`, `2.0` -> `2`)
fn canonical_literal(value: &Literal) -> Result<Literal> {
    match value {
        Literal::Number(text) => {
            if let Ok(int) = text.parse::<i64>() {
                return Ok(Literal::Number(int.to_string()));
            }
            match text.parse::<f64>() {
                Ok(float) if float.is_finite() => Ok(Literal::Number(float.to_string())),
                _ => Err(CubeError::rejected(format!("Invalid number literal: {}", text))),
            }
        }
        Literal::Null => Err(unsupported("comparisons with NULL")),
        other => Ok(other.clone()),
    }
}

fn unsupported(what: &str) -> CubeError {
    CubeError::rejected(format!("Unsupported filter: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(text: &str) -> String {
        Predicate::parse(text).unwrap().unwrap().to_string()
    }

    #[test]
    fn test_conjunct_order_is_irrelevant() {
        assert_eq!(
            normalized("p2 = 'x' AND p1 > 3"),
            normalized("p1 > 3 AND p2 = 'x'")
        );
        assert_eq!(
            normalized("(a = 1 AND b = 2) AND c = 3"),
            normalized("c = 3 AND (b = 2 AND a = 1)")
        );
    }

    #[test]
    fn test_operator_spelling() {
        assert_eq!(normalized("p1 != 1"), "p1 <> 1");
        assert_eq!(normalized("3 < p1"), "p1 > 3");
        assert_eq!(normalized("p1 = 2.0"), "p1 = 2");
        assert_eq!(normalized("p1 = 007"), "p1 = 7");
    }

    #[test]
    fn test_not_push_down() {
        assert_eq!(normalized("NOT (p1 = 1 AND p2 < 2)"), "p1 <> 1 OR p2 >= 2");
        assert_eq!(normalized("NOT p1 IN (1, 2)"), "p1 <> 1 AND p1 <> 2");
    }

    #[test]
    fn test_in_and_between() {
        assert_eq!(normalized("p1 IN ('b', 'a', 'b')"), "p1 = 'a' OR p1 = 'b'");
        assert_eq!(normalized("p1 BETWEEN 1 AND 5"), "p1 <= 5 AND p1 >= 1");
        assert_eq!(normalized("p1 NOT BETWEEN 1 AND 5"), "p1 < 1 OR p1 > 5");
    }

    #[test]
    fn test_nested_groups_parenthesized() {
        let text = normalized("p1 = 1 AND (p2 = 2 OR p3 = 3)");
        assert_eq!(text, "p1 = 1 AND (p2 = 2 OR p3 = 3)");
        // printed form parses back to the same predicate
        assert_eq!(normalized(&text), text);
    }

    #[test]
    fn test_true_means_no_filter() {
        assert_eq!(Predicate::parse("TRUE").unwrap(), None);
        assert_eq!(Predicate::parse("  ").unwrap(), None);
    }

    #[test]
    fn test_rejects_unsupported_shapes() {
        for text in ["p1 = p2", "p1 IS NULL", "p1 + 1 > 2", "p1 = NULL", "p1", "t.p1 = 1"] {
            let err = Predicate::parse(text).unwrap_err();
            assert!(matches!(err, CubeError::RejectedQuery(_)), "{}", text);
        }
    }

    #[test]
    fn test_conjuncts_and_columns() {
        let p = Predicate::parse("p1 = 1 AND (p2 = 2 OR p3 = 3)").unwrap().unwrap();
        assert_eq!(p.conjuncts().len(), 2);
        let cols: Vec<_> = p.columns().into_iter().collect();
        assert_eq!(cols, vec!["p1", "p2", "p3"]);
    }
}
