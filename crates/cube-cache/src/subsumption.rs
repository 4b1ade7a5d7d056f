//! When a cached aggregate can answer another request
//!
//! The rule is deliberately narrow. A cached entry covers a request when:
//!
//! - both read the same table with the same measure
//! - the cached dimensions include every requested dimension
//! - every conjunct of the cached filter also appears in the requested filter
//! - the remaining requested conjuncts only reference cached dimensions
//!
//! The remaining conjuncts (the residual) are applied to the cached rows before
//! re-aggregation. A finer grain additionally needs a measure whose partial
//! results can be combined; `AVG` is only served at equal grain.

use cube_parser::{AggregationRequest, Predicate};

#[derive(Debug, Clone, PartialEq)]
pub struct Cover {
    /// Filter still to apply to the cached rows
    pub residual: Option<Predicate>,
    /// Cached dimensions the request does not ask for
    pub extra_dimensions: usize,
}

impl Cover {
    /// Whether the cached rows can be returned as they are (modulo column order)
    pub fn is_exact(&self) -> bool {
        self.residual.is_none() && self.extra_dimensions == 0
    }
}

pub fn covers(cached: &AggregationRequest, requested: &AggregationRequest) -> Option<Cover> {
    if cached.source_table != requested.source_table || cached.measure != requested.measure {
        return None;
    }

    let cached_dims = cached.dimension_set();
    let requested_dims = requested.dimension_set();
    if !requested_dims.is_subset(&cached_dims) {
        return None;
    }

    let extra_dimensions = cached_dims.len() - requested_dims.len();
    if extra_dimensions > 0 && cached.measure.rollup_function().is_none() {
        return None;
    }

    let cached_conjuncts = cached
        .filters
        .as_ref()
        .map(|p| p.conjuncts())
        .unwrap_or_default();
    let requested_conjuncts = requested
        .filters
        .as_ref()
        .map(|p| p.conjuncts())
        .unwrap_or_default();

    if !cached_conjuncts
        .iter()
        .all(|c| requested_conjuncts.contains(c))
    {
        return None;
    }

    let residual = Predicate::all(
        requested_conjuncts
            .into_iter()
            .filter(|c| !cached_conjuncts.contains(c))
            .cloned()
            .collect(),
    );

    if let Some(residual) = &residual {
        if !residual.columns().is_subset(&cached_dims) {
            return None;
        }
    }

    Some(Cover {
        residual,
        extra_dimensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_parser::{ClassifierConfig, QueryClassifier};

    fn req(sql: &str) -> AggregationRequest {
        QueryClassifier::new(ClassifierConfig::permissive())
            .classify_sql(sql)
            .unwrap()
    }

    #[test]
    fn test_finer_grain_covers_coarser() {
        let cached = req("SELECT p1, p2, SUM(count) FROM t GROUP BY p1, p2");
        let wanted = req("SELECT p1, SUM(count) FROM t GROUP BY p1");

        let cover = covers(&cached, &wanted).unwrap();
        assert_eq!(cover.extra_dimensions, 1);
        assert!(cover.residual.is_none());
        assert!(covers(&wanted, &cached).is_none());
    }

    #[test]
    fn test_same_request_is_exact() {
        let a = req("SELECT p1, p2, SUM(count) FROM t GROUP BY p1, p2");
        let b = req("SELECT p2, p1, SUM(count) FROM t GROUP BY p2, p1");
        assert!(covers(&a, &b).unwrap().is_exact());
    }

    #[test]
    fn test_residual_on_cached_dimension() {
        let cached = req("SELECT p1, p2, SUM(count) FROM t WHERE p3 = 1 GROUP BY p1, p2");
        let wanted = req("SELECT p1, SUM(count) FROM t WHERE p3 = 1 AND p2 > 4 GROUP BY p1");

        let cover = covers(&cached, &wanted).unwrap();
        assert_eq!(cover.residual.unwrap().to_string(), "p2 > 4");
    }

    #[test]
    fn test_residual_outside_cached_dimensions() {
        let cached = req("SELECT p1, SUM(count) FROM t GROUP BY p1");
        let wanted = req("SELECT p1, SUM(count) FROM t WHERE p2 = 1 GROUP BY p1");
        assert!(covers(&cached, &wanted).is_none());
    }

    #[test]
    fn test_cached_filter_must_be_implied() {
        let cached = req("SELECT p1, p2, SUM(count) FROM t WHERE p2 = 1 GROUP BY p1, p2");
        let unfiltered = req("SELECT p1, SUM(count) FROM t GROUP BY p1");
        let narrower_range = req("SELECT p1, SUM(count) FROM t WHERE p2 = 2 GROUP BY p1");
        assert!(covers(&cached, &unfiltered).is_none());
        assert!(covers(&cached, &narrower_range).is_none());
    }

    #[test]
    fn test_measure_and_table_must_match() {
        let cached = req("SELECT p1, p2, SUM(count) FROM t GROUP BY p1, p2");
        assert!(covers(&cached, &req("SELECT p1, MAX(count) FROM t GROUP BY p1")).is_none());
        assert!(covers(&cached, &req("SELECT p1, SUM(count) FROM u GROUP BY p1")).is_none());
    }

    #[test]
    fn test_avg_only_at_equal_grain() {
        let cached = req("SELECT p1, p2, AVG(v) FROM t GROUP BY p1, p2");
        assert!(covers(&cached, &req("SELECT p1, AVG(v) FROM t GROUP BY p1")).is_none());

        let filtered = req("SELECT p1, p2, AVG(v) FROM t WHERE p1 = 'a' GROUP BY p1, p2");
        let cover = covers(&cached, &filtered).unwrap();
        assert_eq!(cover.extra_dimensions, 0);
        assert!(cover.residual.is_some());
    }
}
