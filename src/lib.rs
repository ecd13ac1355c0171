//! Identity federation core: one canonical user, linked to accounts on external
//! game platforms, exposed to third-party apps through a small oauth server.

pub mod clock;
pub mod config;
pub mod error;
pub mod external;
pub mod http;
pub mod id;
pub mod identity;
pub mod link;
pub mod oauth;
pub mod password;
pub mod resolver;
pub mod services;
pub mod session;
pub mod types;
pub mod user;

pub use error::{AuthError, Result};
pub use services::{Dependencies, Services};
