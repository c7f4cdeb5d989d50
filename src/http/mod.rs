pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::{build_router, build_ws_router};
pub use state::AppState;
