pub mod auth;
pub mod drive;
