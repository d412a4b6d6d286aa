pub mod condition;
pub mod optimizer;
pub mod evaluator;
pub mod results;
