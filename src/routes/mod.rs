pub mod admin;
pub mod cache;
