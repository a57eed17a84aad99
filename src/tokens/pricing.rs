//! Model pricing and cost computation.

use serde::{Deserialize, Serialize};

/// Price per 1K tokens for one model, in the table's currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    /// Discounted rate for prompt tokens served from a provider-side cache,
    /// when the provider distinguishes them.
    #[serde(default)]
    pub cached_input_per_1k: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl PriceTable {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
            cached_input_per_1k: None,
            currency: default_currency(),
        }
    }

    pub fn with_cached_input(mut self, per_1k: f64) -> Self {
        self.cached_input_per_1k = Some(per_1k);
        self
    }

    /// Cost of one call. `cached_prompt_tokens` is the portion of
    /// `prompt_tokens` billed at the cached rate (0 when unknown).
    pub fn cost(
        &self,
        prompt_tokens: u32,
        completion_tokens: u32,
        cached_prompt_tokens: u32,
    ) -> CostBreakdown {
        let cached = cached_prompt_tokens.min(prompt_tokens);
        let fresh = prompt_tokens - cached;
        let cached_rate = self.cached_input_per_1k.unwrap_or(self.input_per_1k);
        let input_cost =
            (fresh as f64 / 1000.0) * self.input_per_1k + (cached as f64 / 1000.0) * cached_rate;
        let output_cost = (completion_tokens as f64 / 1000.0) * self.output_per_1k;
        CostBreakdown {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            currency: self.currency.clone(),
        }
    }

    /// Built-in presets for common model ids; used when a client config
    /// carries no price table of its own.
    pub fn for_model(model: &str) -> Option<Self> {
        let m = model.to_lowercase();
        if m.contains("gpt-4o-mini") {
            Some(Self::new(0.00015, 0.0006))
        } else if m.contains("gpt-4o") {
            Some(Self::new(0.005, 0.015))
        } else if m.contains("claude-3-5-sonnet") {
            Some(Self::new(0.003, 0.015).with_cached_input(0.0003))
        } else if m.contains("claude-3-haiku") {
            Some(Self::new(0.00025, 0.00125))
        } else if m.contains("deepseek") {
            Some(Self::new(0.00027, 0.0011).with_cached_input(0.00007))
        } else {
            None
        }
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Itemized cost of one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
}

impl CostBreakdown {
    pub fn format(&self) -> String {
        format!("{} {:.6}", self.currency, self.total_cost)
    }
}
