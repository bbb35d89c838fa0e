pub mod health_monitor;
pub mod parity_checker;
pub mod watchdog;

pub use health_monitor::{run_health_monitor, HealthMonitor, Liveness, StateFlusher};
pub use parity_checker::{run_parity_reporter, ParityChecker};
pub use watchdog::run_watchdog;
