use crate::query::condition::Condition;

/// Trait for condition rewrite rules
pub trait OptimizationRule: Send + Sync {
    fn name(&self) -> &str;
    /// Rewrites one node; `None` leaves it as is.
    fn optimize(&self, condition: &Condition) -> Option<Condition>;
}

/// Rule: NOT(NOT(x)) => x
pub struct DoubleNegationRule;

impl OptimizationRule for DoubleNegationRule {
    fn name(&self) -> &str {
        "double_negation"
    }

    fn optimize(&self, condition: &Condition) -> Option<Condition> {
        match condition {
            Condition::Not(inner) => match inner.as_ref() {
                Condition::Not(x) => Some(x.as_ref().clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Rule: AND(a, AND(b, c)) => AND(a, b, c), same for OR
pub struct FlattenRule;

impl OptimizationRule for FlattenRule {
    fn name(&self) -> &str {
        "flatten"
    }

    fn optimize(&self, condition: &Condition) -> Option<Condition> {
        match condition {
            Condition::And(children) if children.iter().any(|c| matches!(c, Condition::And(_))) => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child {
                        Condition::And(nested) => flat.extend(nested.iter().cloned()),
                        other => flat.push(other.clone()),
                    }
                }
                Some(Condition::And(flat))
            }
            Condition::Or(children) if children.iter().any(|c| matches!(c, Condition::Or(_))) => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child {
                        Condition::Or(nested) => flat.extend(nested.iter().cloned()),
                        other => flat.push(other.clone()),
                    }
                }
                Some(Condition::Or(flat))
            }
            _ => None,
        }
    }
}

/// Rule: single-child AND/OR collapse to the child
pub struct SingleChildRule;

impl OptimizationRule for SingleChildRule {
    fn name(&self) -> &str {
        "single_child"
    }

    fn optimize(&self, condition: &Condition) -> Option<Condition> {
        match condition {
            Condition::And(children) | Condition::Or(children) if children.len() == 1 => {
                Some(children[0].clone())
            }
            _ => None,
        }
    }
}

/// Condition optimizer
pub struct QueryOptimizer {
    pub rules: Vec<Box<dyn OptimizationRule>>,
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryOptimizer {
    pub fn new() -> Self {
        QueryOptimizer {
            rules: vec![
                Box::new(DoubleNegationRule),
                Box::new(FlattenRule),
                Box::new(SingleChildRule),
            ],
        }
    }

    /// Rewrites bottom-up until no rule applies at a node.
    pub fn optimize(&self, condition: Condition) -> Condition {
        let rebuilt = match condition {
            Condition::And(children) => Condition::And(children.into_iter().map(|c| self.optimize(c)).collect()),
            Condition::Or(children) => Condition::Or(children.into_iter().map(|c| self.optimize(c)).collect()),
            Condition::Not(inner) => Condition::Not(Box::new(self.optimize(*inner))),
            leaf => leaf,
        };
        self.rewrite_node(rebuilt)
    }

    fn rewrite_node(&self, mut condition: Condition) -> Condition {
        loop {
            let rewritten = self.rules.iter().find_map(|rule| rule.optimize(&condition));
            match rewritten {
                Some(next) => condition = next,
                None => return condition,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::{and, eq, not, or};

    #[test]
    fn removes_double_negation() {
        let optimizer = QueryOptimizer::new();
        assert_eq!(optimizer.optimize(not(not(eq("a", 1i64)))), eq("a", 1i64));
        assert_eq!(optimizer.optimize(not(not(not(eq("a", 1i64))))), not(eq("a", 1i64)));
    }

    #[test]
    fn flattens_nested_junctions() {
        let optimizer = QueryOptimizer::new();
        let nested = and([eq("a", 1i64), and([eq("b", 2i64), and([eq("c", 3i64)])])]);
        assert_eq!(
            optimizer.optimize(nested),
            and([eq("a", 1i64), eq("b", 2i64), eq("c", 3i64)])
        );

        let mixed = or([eq("a", 1i64), not(not(or([eq("b", 2i64), eq("c", 3i64)])))]);
        assert_eq!(
            optimizer.optimize(mixed),
            or([eq("a", 1i64), eq("b", 2i64), eq("c", 3i64)])
        );
    }
}
