pub mod analytics;
pub mod funnels;
pub mod health;
pub mod sessions;
pub mod track;
