//! HTTP surface: rate limit middleware, admin routes and the server.

mod admin;
mod middleware;
mod server;

pub use admin::{admin_routes, AdminError, ClassQuery};
pub use middleware::{
    AuthenticatedUser, ExtensionIdentity, IdentityResolver, RateLimitLayer, RateLimitService,
    RateLimitState, POLICY_NOT_FOUND, RATE_LIMIT_EXCEEDED,
};
pub use server::{build_router, HttpServer};
