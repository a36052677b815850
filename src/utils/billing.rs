use cyder_tools::log::debug;
use serde::{Deserialize, Serialize};

/// Micro-units per currency unit. All amounts are stored as `i64` micro-units.
pub const MICROS_PER_UNIT: i64 = 1_000_000;

/// Rough characters-per-token ratio used whenever a provider does not report usage.
const CHARS_PER_TOKEN: usize = 4;
/// Per-message framing overhead (role markers etc.) added to input estimates.
const TOKENS_PER_MESSAGE: i32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
}

impl UsageInfo {
    pub fn new(input_tokens: i32, output_tokens: i32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Folds a later usage report into this one. Providers report cumulative
    /// counters, sometimes split across events (input first, output last), so
    /// each side keeps the largest value seen.
    pub fn merge(&mut self, other: UsageInfo) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.total_tokens = (self.input_tokens + self.output_tokens).max(other.total_tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Per-model price list, in micro-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_price_per_1k: i64,
    #[serde(default)]
    pub output_price_per_1k: i64,
    #[serde(default)]
    pub request_price: i64,
}

fn tokens_cost(tokens: i32, price_per_1k: i64) -> i64 {
    if tokens <= 0 || price_per_1k <= 0 {
        return 0;
    }
    // Round up so partial thousands never go uncharged.
    (tokens as i64 * price_per_1k + 999) / 1000
}

/// Cost of a completed (or partially completed) call.
pub fn calculate_cost(usage: &UsageInfo, pricing: &Pricing) -> i64 {
    let cost = tokens_cost(usage.input_tokens, pricing.input_price_per_1k)
        + tokens_cost(usage.output_tokens, pricing.output_price_per_1k)
        + pricing.request_price;
    debug!("[calculate_cost] usage: {:?}, pricing: {:?}, cost: {}", usage, pricing, cost);
    cost
}

pub fn estimate_tokens(chars: usize) -> i32 {
    chars.div_ceil(CHARS_PER_TOKEN) as i32
}

/// Input token estimate for a prompt made of `message_lengths`. A heuristic,
/// not a bound: dense scripts and code tokenize to more than chars / 4.
pub fn estimate_input_tokens<I>(message_lengths: I) -> i32
where
    I: IntoIterator<Item = usize>,
{
    message_lengths
        .into_iter()
        .map(|len| estimate_tokens(len) + TOKENS_PER_MESSAGE)
        .sum()
}

/// Estimated cost reserved before a call: the prompt estimate plus the full
/// output allowance.
pub fn estimate_cost(input_tokens: i32, max_output_tokens: i32, pricing: &Pricing) -> i64 {
    calculate_cost(&UsageInfo::new(input_tokens, max_output_tokens), pricing)
}

pub fn micros_to_amount(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICING: Pricing = Pricing {
        input_price_per_1k: 1_000,
        output_price_per_1k: 2_000,
        request_price: 50,
    };

    #[test]
    fn cost_rounds_partial_thousands_up() {
        let usage = UsageInfo::new(1, 1);
        // 1 * 1000 / 1000 = 1, 1 * 2000 / 1000 = 2, plus flat fee.
        assert_eq!(calculate_cost(&usage, &PRICING), 53);

        let usage = UsageInfo::new(1500, 0);
        assert_eq!(calculate_cost(&usage, &PRICING), 1_550);
    }

    #[test]
    fn free_models_cost_nothing() {
        let usage = UsageInfo::new(10_000, 10_000);
        assert_eq!(calculate_cost(&usage, &Pricing::default()), 0);
    }

    #[test]
    fn estimate_includes_full_output_allowance() {
        let input = estimate_input_tokens([40usize, 8]);
        assert_eq!(input, 10 + 4 + 2 + 4);
        assert_eq!(
            estimate_cost(input, 1000, &PRICING),
            calculate_cost(&UsageInfo::new(input, 1000), &PRICING)
        );
    }

    #[test]
    fn merge_keeps_cumulative_maximums() {
        let mut usage = UsageInfo::new(120, 0);
        usage.merge(UsageInfo {
            input_tokens: 0,
            output_tokens: 35,
            total_tokens: 35,
        });
        assert_eq!(usage, UsageInfo::new(120, 35));
    }

    #[test]
    fn micros_render_as_amount() {
        assert_eq!(micros_to_amount(9_850_000), 9.85);
    }
}
