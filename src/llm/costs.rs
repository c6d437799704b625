//! Per-token pricing used for cost logging.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token for a model name. Unknown models cost zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let m = model.to_ascii_lowercase();
    if m.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else if m.contains("sonnet") {
        (dec!(0.000003), dec!(0.000015))
    } else if m.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if m.starts_with("gpt-4o-mini") {
        (dec!(0.00000015), dec!(0.0000006))
    } else if m.starts_with("gpt-4o") {
        (dec!(0.0000025), dec!(0.00001))
    } else {
        (Decimal::ZERO, Decimal::ZERO)
    }
}

/// Cost of one call given token counts.
pub fn call_cost(rates: (Decimal, Decimal), input_tokens: u32, output_tokens: u32) -> Decimal {
    rates.0 * Decimal::from(input_tokens) + rates.1 * Decimal::from(output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_have_prices() {
        assert!(model_cost("claude-sonnet-4-20250514").0 > Decimal::ZERO);
        assert!(model_cost("claude-3-5-haiku-latest").1 > Decimal::ZERO);
        assert_eq!(model_cost("local-llama"), (Decimal::ZERO, Decimal::ZERO));
    }

    #[test]
    fn call_cost_multiplies() {
        let cost = call_cost((dec!(0.001), dec!(0.002)), 10, 5);
        assert_eq!(cost, dec!(0.020));
    }
}
