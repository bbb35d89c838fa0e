pub mod copy_engine;
pub mod fees;
pub mod ledger;
pub mod position_sizer;
pub mod risk_guard;
pub mod stress;

pub use copy_engine::{run_copy_engine, CopyEngine, CycleReport};
pub use ledger::{EntryFill, ExitQuote, Ledger, LedgerConfig, LegFill, PortfolioSummary, SettleReport};
pub use risk_guard::{RiskGuard, RiskViolation};
pub use stress::{StressRejection, StressSimulator, StressStats};
