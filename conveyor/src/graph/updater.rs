//! State reducers: how a node's partial update merges into the graph state.
//!
//! The engine never replaces state wholesale; every node output goes through
//! the graph's reducer. Reducers must be pure and total.

use std::sync::Arc;

/// Merges a node's partial update `U` into the current state `S`.
pub trait StateReducer<S, U>: Send + Sync {
    fn apply(&self, state: &mut S, update: U);
}

/// Boxed reducer stored by the compiled graph.
pub type BoxedReducer<S, U> = Arc<dyn StateReducer<S, U>>;

struct FnReducer<F>(F);

impl<S, U, F> StateReducer<S, U> for FnReducer<F>
where
    F: Fn(&mut S, U) + Send + Sync,
{
    fn apply(&self, state: &mut S, update: U) {
        (self.0)(state, update)
    }
}

/// Wraps a plain function as a reducer.
pub fn reducer_fn<S, U, F>(f: F) -> BoxedReducer<S, U>
where
    S: 'static,
    U: 'static,
    F: Fn(&mut S, U) + Send + Sync + 'static,
{
    Arc::new(FnReducer(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: A function reducer applies updates in order.
    #[test]
    fn fn_reducer_applies_in_order() {
        let reducer: BoxedReducer<Vec<i32>, i32> = reducer_fn(|s: &mut Vec<i32>, u| s.push(u));
        let mut state = vec![];
        reducer.apply(&mut state, 1);
        reducer.apply(&mut state, 2);
        assert_eq!(state, vec![1, 2]);
    }
}
