mod extract;
mod handlers;
mod routes;
mod state;

pub use extract::{CurrentUser, USER_ID_HEADER};
pub use routes::create_router;
pub use state::AppState;
