pub mod app_state;
pub mod assets;
pub mod cors;
pub mod errors;
pub mod proxying;
pub mod routes;
pub mod server;

pub use app_state::AppState;
pub use server::build_router;
