//! Ordered fallback chains.
//!
//! A chain is a list of named strategies tried in priority order. The first
//! success wins; a failure falls through to the next strategy; running out
//! of strategies is a reported outcome, not a fault. A strategy that panics
//! counts as a failure.

use std::panic::{self, AssertUnwindSafe};
use tracing::debug;

pub type StrategyFn<C, I, O> = Box<dyn Fn(&C, &I) -> Result<O, String> + Send + Sync>;

pub struct Strategy<C, I, O> {
    name: &'static str,
    run: StrategyFn<C, I, O>,
}

impl<C, I, O> Strategy<C, I, O> {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Why one strategy did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome<O> {
    Succeeded { strategy: &'static str, value: O },
    Exhausted { attempts: Vec<Attempt> },
}

/// Run one fallible host call, counting a panic as a failure.
pub fn guarded<T>(call: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|_| Err("host call panicked".to_string()))
}

/// Human-readable summary of every failed attempt.
pub fn describe_failures(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no strategies configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct StrategyChain<C, I, O> {
    strategies: Vec<Strategy<C, I, O>>,
}

impl<C, I, O> Default for StrategyChain<C, I, O> {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }
}

impl<C, I, O> StrategyChain<C, I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a strategy at the lowest priority so far.
    pub fn then<F>(mut self, name: &'static str, run: F) -> Self
    where
        F: Fn(&C, &I) -> Result<O, String> + Send + Sync + 'static,
    {
        self.push(name, run);
        self
    }

    pub fn push<F>(&mut self, name: &'static str, run: F)
    where
        F: Fn(&C, &I) -> Result<O, String> + Send + Sync + 'static,
    {
        self.strategies.push(Strategy {
            name,
            run: Box::new(run),
        });
    }

    /// Insert a strategy at `index` (0 = highest priority).
    pub fn insert<F>(&mut self, index: usize, name: &'static str, run: F)
    where
        F: Fn(&C, &I) -> Result<O, String> + Send + Sync + 'static,
    {
        let index = index.min(self.strategies.len());
        self.strategies.insert(
            index,
            Strategy {
                name,
                run: Box::new(run),
            },
        );
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(Strategy::name).collect()
    }

    pub fn run(&self, ctx: &C, input: &I) -> ChainOutcome<O> {
        let mut attempts = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match guarded(|| (strategy.run)(ctx, input)) {
                Ok(value) => {
                    debug!(strategy = strategy.name, "strategy succeeded");
                    return ChainOutcome::Succeeded {
                        strategy: strategy.name,
                        value,
                    };
                }
                Err(reason) => {
                    debug!(strategy = strategy.name, %reason, "strategy failed");
                    attempts.push(Attempt {
                        strategy: strategy.name,
                        reason,
                    });
                }
            }
        }
        ChainOutcome::Exhausted { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_first_success_wins_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let chain: StrategyChain<(), u32, u32> = StrategyChain::new()
            .then("fails", |_, _| Err("nope".into()))
            .then("doubles", |_, n| Ok(n * 2))
            .then("never", move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            });

        assert_eq!(
            chain.run(&(), &21),
            ChainOutcome::Succeeded {
                strategy: "doubles",
                value: 42
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exhaustion_reports_every_attempt() {
        let chain: StrategyChain<(), (), ()> = StrategyChain::new()
            .then("a", |_, _| Err("no a".into()))
            .then("b", |_, _| Err("no b".into()));
        let ChainOutcome::Exhausted { attempts } = chain.run(&(), &()) else {
            panic!("expected exhaustion");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(describe_failures(&attempts), "a: no a; b: no b");
    }

    #[test]
    fn test_panicking_strategy_falls_through() {
        let chain: StrategyChain<(), (), &str> = StrategyChain::new()
            .then("explodes", |_, _| panic!("host threw"))
            .then("fallback", |_, _| Ok("ok"));
        assert_eq!(
            chain.run(&(), &()),
            ChainOutcome::Succeeded {
                strategy: "fallback",
                value: "ok"
            }
        );
    }

    #[test]
    fn test_guarded_turns_panic_into_failure() {
        assert_eq!(guarded(|| Ok::<_, String>(3)), Ok(3));
        assert_eq!(
            guarded(|| -> Result<(), String> { panic!("toastr undefined") }),
            Err("host call panicked".to_string())
        );
    }

    #[test]
    fn test_insert_sets_priority() {
        let mut chain: StrategyChain<(), (), u8> = StrategyChain::new().then("late", |_, _| Ok(2));
        chain.insert(0, "early", |_, _| Ok(1));
        assert_eq!(chain.names(), vec!["early", "late"]);
        assert!(matches!(
            chain.run(&(), &()),
            ChainOutcome::Succeeded { value: 1, .. }
        ));
    }

    #[test]
    fn test_empty_chain_is_exhausted() {
        let chain: StrategyChain<(), (), ()> = StrategyChain::new();
        assert_eq!(
            chain.run(&(), &()),
            ChainOutcome::Exhausted { attempts: vec![] }
        );
    }
}
