//! Cache Key Builder

use ahash::AHasher;
use cube_parser::ast::{quote_ident, quote_table_name};
use cube_parser::AggregationRequest;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Order-independent identity of an aggregation request.
///
/// Built from the source table, the sorted dimension set, the printed measure
/// and the normalized filter text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey {
    text: String,
}

impl CanonicalKey {
    pub fn build(request: &AggregationRequest) -> Self {
        let mut dims: Vec<String> = request.dimensions.iter().map(|d| quote_ident(d)).collect();
        dims.sort();
        dims.dedup();

        let filter = request
            .filters
            .as_ref()
            .map(|p| p.clone().normalize().to_string())
            .unwrap_or_default();

        Self {
            text: format!(
                "table={}|dims={}|measure={}|filter={}",
                quote_table_name(&request.source_table),
                dims.join(","),
                request.measure,
                filter
            ),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// 64-bit hash of the key text
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = AHasher::default();
        self.text.hash(&mut hasher);
        hasher.finish()
    }

    /// Short label for log lines
    pub fn short_id(&self) -> String {
        format!("cube_{:016x}", self.fingerprint())
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_parser::{ClassifierConfig, CubeParams, QueryClassifier};

    fn classify(sql: &str) -> AggregationRequest {
        QueryClassifier::new(ClassifierConfig::default())
            .classify_sql(sql)
            .unwrap()
    }

    #[test]
    fn test_permuted_dimensions_share_a_key() {
        let a = classify("SELECT p1, p2, SUM(count) FROM public.facts_agg GROUP BY p1, p2");
        let b = classify("select p2 , P1,sum( count ) from PUBLIC.FACTS_AGG group by p2, p1");
        assert_ne!(a.dimensions, b.dimensions);
        assert_eq!(CanonicalKey::build(&a), CanonicalKey::build(&b));
    }

    #[test]
    fn test_reordered_filters_share_a_key() {
        let a = classify(
            "SELECT p1, SUM(count) FROM public.facts_agg WHERE p2 = 'x' AND p3 > 1 GROUP BY p1",
        );
        let b = classify(
            "SELECT p1, SUM(count) FROM public.facts_agg WHERE 1 < p3 AND (p2 = 'x') GROUP BY p1",
        );
        assert_eq!(CanonicalKey::build(&a), CanonicalKey::build(&b));
    }

    #[test]
    fn test_sql_and_cube_share_a_key() {
        let classifier = QueryClassifier::new(ClassifierConfig::default());
        let a = classify("SELECT p2, p1, SUM(count) FROM public.facts_agg GROUP BY p1, p2");
        let b = classifier
            .classify_cube(&CubeParams::from_dims_str("p1, p2"))
            .unwrap();
        assert_eq!(CanonicalKey::build(&a), CanonicalKey::build(&b));
    }

    #[test]
    fn test_distinct_requests_differ() {
        let base = classify("SELECT p1, SUM(count) FROM public.facts_agg GROUP BY p1");
        let other_measure = classify("SELECT p1, MAX(count) FROM public.facts_agg GROUP BY p1");
        let filtered =
            classify("SELECT p1, SUM(count) FROM public.facts_agg WHERE p2 = 1 GROUP BY p1");
        let other_dims = classify("SELECT p2, SUM(count) FROM public.facts_agg GROUP BY p2");

        let key = CanonicalKey::build(&base);
        for other in [other_measure, filtered, other_dims] {
            assert_ne!(key, CanonicalKey::build(&other));
        }
    }

    #[test]
    fn test_key_text_and_short_id() {
        let req = classify("SELECT p2, p1, SUM(count) FROM public.facts_agg WHERE p3 = 1 GROUP BY p2, p1");
        let key = CanonicalKey::build(&req);
        assert_eq!(
            key.as_str(),
            "table=public.facts_agg|dims=p1,p2|measure=SUM(count)|filter=p3 = 1"
        );
        assert!(key.short_id().starts_with("cube_"));
        assert_eq!(key.short_id(), CanonicalKey::build(&req).short_id());
    }
}
