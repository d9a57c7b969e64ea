//! # ukey-common
//!
//! Shared foundation for the EasyUKey server: configuration, error types,
//! entity models, the device wire protocol, and the crypto/TOTP primitives
//! both ends of the transport rely on.

pub mod any_row;
pub mod callback;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hub;
pub mod ids;
pub mod messages;
pub mod models;
pub mod totp;
pub mod validation;
