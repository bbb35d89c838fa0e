pub mod clob_client;
pub mod data_client;
pub mod gamma_client;
pub mod service;
pub mod types;

pub use clob_client::ClobClient;
pub use data_client::DataClient;
pub use gamma_client::GammaClient;
pub use service::{MarketDataService, PolymarketService, ResolutionLookup};
pub use types::{ApiActivity, ApiMarket, GammaMarket, WsSubscribe, WsTrade};
