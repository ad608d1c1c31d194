pub mod handlers;
pub mod serve;
pub mod sse;
pub mod state;
