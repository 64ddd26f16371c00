//! HTTP API for text extraction.
//!
//! Routes are nested under `/api/`:
//! - `POST /api/extract` runs the extraction ladder on an uploaded document
//! - `POST /api/materials/:id/extract` extracts and persists a stored material
//! - `GET /api/health` reports which backends are configured
//!
//! `build_router()` returns a composable `Router`; `start_server()` binds it
//! and hands back a handle with a shutdown channel.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::build_router;
pub use server::{start_server, ApiServer, ServerError, ServerSession};
pub use types::ApiContext;
