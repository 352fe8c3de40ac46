pub mod apns;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use state::AppState;
