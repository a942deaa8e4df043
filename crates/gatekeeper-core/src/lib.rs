pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod relay;
pub mod state;

pub use error::PipelineError;
pub use handler::router;
pub use state::{AppState, SharedState};
