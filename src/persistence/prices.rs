use std::{collections::HashMap, sync::LazyLock};

use crate::persistence::billing::PriceMicroPer1M;

/// Built-in fallback price table used when no saved override exists.
/// Keys are canonical model keys; rates are micro-USD per 1M tokens.
pub static DEFAULT_PRICES: LazyLock<HashMap<&'static str, PriceMicroPer1M>> =
    LazyLock::new(|| {
        HashMap::from([
            (
                "claude-opus-4-5-20251101",
                PriceMicroPer1M {
                    prompt: 5_000_000,      // $5.00 / 1M
                    completion: 25_000_000, // $25.00 / 1M
                    cached: 500_000,        // $0.50 / 1M
                },
            ),
            (
                "claude-opus-4-6",
                PriceMicroPer1M {
                    prompt: 5_000_000,
                    completion: 25_000_000,
                    cached: 500_000,
                },
            ),
            (
                "claude-sonnet-4-5",
                PriceMicroPer1M {
                    prompt: 3_000_000,
                    completion: 15_000_000,
                    cached: 300_000,
                },
            ),
            (
                "claude-haiku-4-5-20251001",
                PriceMicroPer1M {
                    prompt: 1_000_000,
                    completion: 5_000_000,
                    cached: 100_000,
                },
            ),
            (
                "gpt-5.2",
                PriceMicroPer1M {
                    prompt: 1_750_000,
                    completion: 14_000_000,
                    cached: 175_000,
                },
            ),
            (
                "gemini-2.5-pro",
                PriceMicroPer1M {
                    prompt: 1_250_000,
                    completion: 10_000_000,
                    cached: 125_000,
                },
            ),
        ])
    });
