//! Transcoding strategies: one named argument set per attempt.

use serde::Serialize;
use std::fmt;

use crate::config::{default_strategies, StrategyConfig};

/// An immutable description of one transcoding attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeStrategy {
    name: String,
    args: Vec<String>,
}

impl TranscodeStrategy {
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Name used in diagnostics and reported as `strategy_used`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine arguments placed between the input and the output.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for TranscodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&StrategyConfig> for TranscodeStrategy {
    fn from(cfg: &StrategyConfig) -> Self {
        Self::new(cfg.name.clone(), cfg.args.iter().cloned())
    }
}

/// Stream copy, fast re-encode, compatibility re-encode.
pub fn canonical_chain() -> Vec<TranscodeStrategy> {
    chain_from_config(&default_strategies())
}

pub fn chain_from_config(strategies: &[StrategyConfig]) -> Vec<TranscodeStrategy> {
    strategies.iter().map(TranscodeStrategy::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_cheapest_first() {
        let chain = canonical_chain();
        let names: Vec<_> = chain.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["stream copy", "fast re-encode", "compatibility re-encode"]);
        assert_eq!(chain[0].args(), ["-c", "copy"]);
        assert!(chain[2].args().windows(2).any(|w| w == ["-movflags", "+faststart"]));
    }

    #[test]
    fn single_strategy_chain() {
        let chain = chain_from_config(&[StrategyConfig {
            name: "copy".into(),
            args: vec!["-c".into(), "copy".into()],
        }]);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].to_string(), "copy");
    }
}
