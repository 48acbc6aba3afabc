//! Runtime Configuration
//!
//! Knobs that decide how a [`Runtime`](crate::reactive::Runtime) behaves when
//! a flush goes wrong. Everything has a sensible default, so most callers
//! never build one of these by hand.

/// What a flush does when an effect panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EffectPanicPolicy {
    /// Keep visiting the remaining nodes of the flush, then resume the first
    /// panic from the call that triggered the flush.
    #[default]
    ContinueFlush,

    /// Stop the flush at the failing effect and resume its panic right away.
    /// Nodes that were not yet visited stay unvisited.
    AbortFlush,
}

/// Configuration for a reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Upper bound on flush rounds. Every round processes the writes made by
    /// the previous one; an effect writing to its own input never settles.
    pub max_flush_rounds: usize,

    /// Behavior when an effect panics during a flush.
    pub effect_panic: EffectPanicPolicy,
}

impl RuntimeConfig {
    /// Default number of rounds before a flush is declared runaway.
    pub const DEFAULT_MAX_FLUSH_ROUNDS: usize = 100;

    /// Create the default configuration.
    pub fn new() -> Self {
        Self {
            max_flush_rounds: Self::DEFAULT_MAX_FLUSH_ROUNDS,
            effect_panic: EffectPanicPolicy::default(),
        }
    }

    /// Set the maximum number of flush rounds. Zero is treated as one.
    #[must_use]
    pub fn with_max_flush_rounds(mut self, rounds: usize) -> Self {
        self.max_flush_rounds = rounds.max(1);
        self
    }

    /// Set the effect panic policy.
    #[must_use]
    pub fn with_effect_panic(mut self, policy: EffectPanicPolicy) -> Self {
        self.effect_panic = policy;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_flush_rounds, 100);
        assert_eq!(config.effect_panic, EffectPanicPolicy::ContinueFlush);
    }

    #[test]
    fn builder_clamps_rounds() {
        let config = RuntimeConfig::new()
            .with_max_flush_rounds(0)
            .with_effect_panic(EffectPanicPolicy::AbortFlush);
        assert_eq!(config.max_flush_rounds, 1);
        assert_eq!(config.effect_panic, EffectPanicPolicy::AbortFlush);
    }
}
