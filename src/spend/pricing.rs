//! Model price table and token estimation.

/// Per-million-token pricing, USD.
struct ModelPrice {
    model: &'static str,
    input: f64,
    output: f64,
}

/// Known model prices. Unknown models fall back to the first entry.
const PRICES: &[ModelPrice] = &[
    ModelPrice {
        model: "gemini-2.0-flash-lite",
        input: 0.075,
        output: 0.30,
    },
    ModelPrice {
        model: "gemini-pro",
        input: 0.50,
        output: 1.50,
    },
    ModelPrice {
        model: "gemini-1.5-pro",
        input: 1.25,
        output: 5.00,
    },
];

/// Estimate the USD cost of a call from token counts.
pub fn estimate_cost(input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
    let price = PRICES
        .iter()
        .find(|p| p.model == model)
        .unwrap_or(&PRICES[0]);
    (input_tokens as f64 / 1_000_000.0) * price.input
        + (output_tokens as f64 / 1_000_000.0) * price.output
}

/// Word-count token estimator (x1.3), used when the provider response
/// carries no usage metadata. Matches the estimator used at reservation
/// time so reserve/adjust arithmetic stays consistent.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3) as u64
}
