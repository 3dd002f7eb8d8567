//! Ergonomic testing utilities for reducers
//!
//! This module provides a fluent API for testing reducers with readable
//! Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use command_flow_core::reducer::Reducer;

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// Each `when` step folds one `(command, output)` pair into the state, in
/// order, exactly as the runtime does for successive emissions.
///
/// # Example
///
/// ```
/// use command_flow_core::reducer::FnReducer;
/// use command_flow_testing::ReducerTest;
///
/// ReducerTest::new(FnReducer::new(|total: &u32, _: &(), n: &u32| total + n))
///     .given_state(1)
///     .when((), 2)
///     .when((), 3)
///     .then_state(|state| assert_eq!(*state, 6))
///     .run();
/// ```
pub struct ReducerTest<R>
where
    R: Reducer,
{
    reducer: R,
    initial_state: Option<R::State>,
    steps: Vec<(R::Command, R::Output)>,
    state_assertions: Vec<StateAssertion<R::State>>,
}

impl<R> ReducerTest<R>
where
    R: Reducer,
    R::State: Clone + PartialEq + std::fmt::Debug,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            initial_state: None,
            steps: Vec::new(),
            state_assertions: Vec::new(),
        }
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: R::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Add a command and the output its effect produced (When)
    #[must_use]
    pub fn when(mut self, command: R::Command, output: R::Output) -> Self {
        self.steps.push((command, output));
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&R::State) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Assert the resulting state equals `expected` (Then)
    #[must_use]
    pub fn then_state_eq(self, expected: R::State) -> Self
    where
        R::State: 'static,
    {
        self.then_state(move |state| assert_eq!(state, &expected))
    }

    /// Run the test and execute all assertions
    ///
    /// Also checks that the reducer is deterministic: folding the same
    /// steps from the same initial state twice must give equal states.
    ///
    /// # Panics
    ///
    /// Panics if initial state or any step is missing, if the reducer is
    /// not deterministic, or if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let initial = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        assert!(!self.steps.is_empty(), "At least one step must be set with when()");

        let fold = |start: &R::State| {
            self.steps
                .iter()
                .fold(start.clone(), |state, (command, output)| {
                    self.reducer.reduce(&state, command, output)
                })
        };

        let state = fold(&initial);
        let replayed = fold(&initial);
        assert_eq!(state, replayed, "Reducer must be deterministic");

        for assertion in self.state_assertions {
            assertion(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Cart {
        items: Vec<String>,
        loads: u32,
    }

    #[derive(Clone, Debug)]
    enum CartCommand {
        Load,
        Clear,
    }

    struct CartReducer;

    impl Reducer for CartReducer {
        type State = Cart;
        type Command = CartCommand;
        type Output = Vec<String>;

        fn reduce(&self, state: &Cart, command: &CartCommand, output: &Vec<String>) -> Cart {
            match command {
                CartCommand::Load => Cart {
                    items: output.clone(),
                    loads: state.loads + 1,
                },
                CartCommand::Clear => Cart {
                    items: Vec::new(),
                    loads: state.loads,
                },
            }
        }
    }

    fn empty() -> Cart {
        Cart {
            items: Vec::new(),
            loads: 0,
        }
    }

    #[test]
    fn test_reducer_test_load() {
        ReducerTest::new(CartReducer)
            .given_state(empty())
            .when(CartCommand::Load, vec!["apple".to_string()])
            .then_state(|state| {
                assert_eq!(state.items, vec!["apple".to_string()]);
                assert_eq!(state.loads, 1);
            })
            .run();
    }

    #[test]
    fn test_reducer_test_steps_fold_in_order() {
        ReducerTest::new(CartReducer)
            .given_state(empty())
            .when(CartCommand::Load, vec!["pear".to_string()])
            .when(CartCommand::Clear, Vec::new())
            .then_state_eq(Cart {
                items: Vec::new(),
                loads: 1,
            })
            .run();
    }
}
