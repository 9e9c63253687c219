//! Exchange Adapters
//!
//! Concrete [`StreamConnector`](crate::application::ports::StreamConnector)
//! and [`ExchangeRest`](crate::application::ports::ExchangeRest)
//! implementations, one submodule per venue.

pub mod bybit;
