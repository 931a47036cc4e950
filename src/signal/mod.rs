pub mod session;
pub mod tracker;
