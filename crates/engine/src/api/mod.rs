//! External market-data providers

pub mod binance;

pub use binance::BinanceClient;
