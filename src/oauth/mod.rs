//! OAuth in both directions: this service as an authorization server for
//! third-party clients, and as a client of provider C's authorization server.

pub mod authorization_code;
pub mod client;
pub mod consumer;
pub mod provider;
pub mod token;
pub mod upstream;

pub use client::{ClientRegistry, NewClient, RegisteredClient};
pub use consumer::{OauthConsumer, OauthConsumerParts, OauthStateStore, UpstreamOutcome, UpstreamRedirect};
pub use provider::{
    AccessTokenResponse, AuthorizationRequest, AuthorizeOutcome, ConsentPrompt, OauthProvider,
    ResponseType, TokenRequest,
};
pub use token::AccessTokenStore;
pub use upstream::{
    HttpUpstreamConfig, HttpUpstreamOauthClient, MemUpstreamOauthClient, UpstreamOauthClient,
};
