pub mod alerts;
pub mod retry;
pub mod store;
