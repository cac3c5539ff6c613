// Middleware module - Request metadata and admin authentication

pub mod auth;
pub mod context;
