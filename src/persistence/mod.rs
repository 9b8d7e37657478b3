pub mod billing;
pub mod conn;
pub mod entities;
pub mod limiter;
pub mod prices;

pub use billing::{
    BillingStore, DailyUsageDelta, DailyUsageReport, DailyUsageRow, ModelPrice, PriceMicroPer1M,
    PriceSource, cost_micro_usd, micro_usd_to_usd, usd_per_1m_to_micro,
};
pub use limiter::DailyLimiter;
