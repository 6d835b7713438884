//! Page source implementations.

pub mod http;

pub use http::HttpPageSource;
