pub mod config;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod scraper;
pub mod store;
