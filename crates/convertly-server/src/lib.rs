pub mod app;
pub mod device;
pub mod engine;
pub mod error;
pub mod routes;
pub mod state;
