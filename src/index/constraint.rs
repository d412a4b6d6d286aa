use std::marker::PhantomData;
use crate::core::error::{Error, Result};

/// Custom validation run before an entity is added or replaced.
///
/// `current` is the entity being replaced, `None` for additions. Any error
/// aborts the whole mutation and leaves the map untouched.
pub trait Constraint<E>: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, position: u64, current: Option<&E>, candidate: &E) -> Result<()>;
}

type CheckFn<E> = Box<dyn Fn(Option<&E>, &E) -> bool + Send + Sync>;

/// Closure-backed constraint; the closure returns whether `candidate` is valid
pub struct ConstraintFn<E> {
    name: String,
    valid: CheckFn<E>,
    _entity: PhantomData<fn(&E)>,
}

impl<E: 'static> ConstraintFn<E> {
    pub fn new(
        name: impl Into<String>,
        valid: impl Fn(Option<&E>, &E) -> bool + Send + Sync + 'static,
    ) -> Self {
        ConstraintFn { name: name.into(), valid: Box::new(valid), _entity: PhantomData }
    }
}

impl<E> Constraint<E> for ConstraintFn<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, position: u64, current: Option<&E>, candidate: &E) -> Result<()> {
        if (self.valid)(current, candidate) {
            Ok(())
        } else {
            Err(Error::constraint(format!("constraint {} rejected position {}", self.name, position)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn closure_constraint() {
        let positive = ConstraintFn::new("positive", |_: Option<&i64>, v: &i64| *v > 0);
        assert!(positive.check(0, None, &3).is_ok());
        assert_eq!(positive.check(0, Some(&3), &-1).unwrap_err().kind, ErrorKind::ConstraintViolation);
    }
}
