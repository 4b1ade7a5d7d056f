pub mod ast;
pub mod classifier;
pub mod lexer;
pub mod parser;
pub mod predicate;

pub use ast::{AggregateFunction, Literal};
pub use classifier::{
    canonical_table_name, AggregationRequest, ClassifierConfig, CubeParams, Measure,
    QueryClassifier,
};
pub use parser::Parser;
pub use predicate::{CompareOp, Predicate};
