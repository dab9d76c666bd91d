use std::fmt;

/// Monotonic marker identifying one connection generation.
///
/// Anything that outlives a single await (runtime callbacks, timer ticks,
/// negotiation continuations) captures the token when it starts and compares
/// it against [`GenerationCounter::current`] before touching state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationToken(u64);

impl GenerationToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Owner of the current generation. Only teardown or replacement advances it.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    current: u64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> GenerationToken {
        GenerationToken(self.current)
    }

    pub fn bump(&mut self) -> GenerationToken {
        self.current = self.current.saturating_add(1);
        GenerationToken(self.current)
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        token.0 == self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_invalidates_captured_tokens() {
        let mut counter = GenerationCounter::new();
        let captured = counter.current();
        assert!(counter.is_current(captured));
        let next = counter.bump();
        assert!(!counter.is_current(captured));
        assert!(counter.is_current(next));
        assert!(next > captured);
        assert_eq!(next.to_string(), "gen-1");
    }
}
