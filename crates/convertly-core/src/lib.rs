pub mod aggregate;
pub mod attribution;
pub mod config;
pub mod error;
pub mod event;
pub mod funnel;
pub mod goals;
pub mod identity;
pub mod path;
pub mod session;
pub mod store;

pub use error::ConversionError;
