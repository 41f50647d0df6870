//! Gateway facade and its HTTP surface.

pub mod facade;
pub mod server;

pub use facade::{ChatStream, GatewayFacade};
pub use server::{create_admin_app, create_gateway_app, GatewayServer, WriteEventRequest};
