pub mod api;
pub mod server;
pub mod state;

pub use server::serve;
pub use state::AppState;
