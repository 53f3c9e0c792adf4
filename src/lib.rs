use std::error::Error;

pub mod assistant;
pub mod auth;
pub mod billing;
pub mod community;
pub mod compress;
pub mod config;
pub mod error;
pub mod gate;
pub mod handler;
pub mod login;
pub mod model;
pub mod permits;
pub mod prefs;
pub mod reports;
pub mod residents;
pub mod routes;
pub mod store;
pub mod subscription;
pub mod weather;

/// Flattens an error and its source chain into one log-friendly line.
pub fn unpack_error(err: &(dyn Error)) -> String {
    let mut parts = Vec::new();
    parts.push(err.to_string());
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}
