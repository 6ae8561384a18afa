//! Quota arithmetic shared by reservations, commits and probe logs

use std::fmt;

use relaymeter_core::Quota;

/// Rates applied to one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateCard {
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
}

impl RateCard {
    /// Combined multiplier, `model_ratio * group_ratio`
    pub fn ratio(&self) -> f64 {
        self.model_ratio * self.group_ratio
    }

    /// Final charge for the reported usage
    pub fn charge(&self, prompt_tokens: u32, completion_tokens: u32, tools_cost: Quota) -> Quota {
        compute_charge(
            prompt_tokens,
            completion_tokens,
            self.completion_ratio,
            self.ratio(),
            tools_cost,
        )
    }
}

impl fmt::Display for RateCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model rate {:.2}, group rate {:.2}, completion rate {:.2}",
            self.model_ratio, self.group_ratio, self.completion_ratio
        )
    }
}

/// `ceil((prompt + completion * completion_ratio) * ratio) + tools_cost`
///
/// A non-zero ratio always charges at least 1.
#[allow(clippy::cast_possible_truncation)]
pub fn compute_charge(
    prompt_tokens: u32,
    completion_tokens: u32,
    completion_ratio: f64,
    ratio: f64,
    tools_cost: Quota,
) -> Quota {
    let weighted = f64::from(prompt_tokens) + f64::from(completion_tokens) * completion_ratio;
    let quota = (weighted * ratio).ceil() as Quota + tools_cost;

    if ratio != 0.0 && quota <= 0 { 1 } else { quota }
}

/// Reservation amount for a request before the backend has answered
#[allow(clippy::cast_possible_truncation)]
pub fn estimate_reservation(prompt_tokens: u32, max_tokens: u32, base_tokens: u32, ratio: f64) -> Quota {
    let tokens = u64::from(prompt_tokens) + u64::from(max_tokens) + u64::from(base_tokens);
    #[allow(clippy::cast_precision_loss)]
    let estimate = (tokens as f64 * ratio).ceil();
    estimate.max(0.0) as Quota
}
