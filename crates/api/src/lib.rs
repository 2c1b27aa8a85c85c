//! HuertoRentable API Library
//!
//! Identity resolution, session reconciliation and route gating for the
//! HuertoRentable web application.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
