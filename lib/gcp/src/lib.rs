mod auth;
mod client;
pub mod compute;
pub mod resourcemanager;

pub use auth::{
    AuthorizedUser, CLOUD_PLATFORM_SCOPE, Credentials, Error as AuthError, ServiceAccountKey,
    TokenSource,
};
pub use client::{
    COMPUTE_ENDPOINT, Client, Config, Error, ErrorResponse, ListParams, Page,
    RESOURCE_MANAGER_ENDPOINT,
};
