mod guards;
mod server;
mod verifier;
mod websocket;

pub use guards::{requires_auth, requires_permission, requires_role};
pub use server::{GatewayServer, HealthResponse};
pub use verifier::{JwtVerifier, StaticTokenVerifier};
pub use websocket::{ws_handler, GatewayContext};
