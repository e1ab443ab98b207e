pub mod extract;
pub mod routes;
pub mod state;
