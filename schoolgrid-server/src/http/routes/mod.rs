//! Route handlers organized by resource

pub mod auth;
pub mod classes;
pub mod health;
pub mod platform;
