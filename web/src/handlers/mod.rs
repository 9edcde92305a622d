//! HTTP request handlers, grouped by the router group they share a
//! middleware chain and `ServiceToggle` key with (spec.md §6, §9
//! "treat each router group as a set of handlers sharing a middleware
//! chain and a ServiceToggle key").

pub mod auth;
pub mod devices;
pub mod files;
pub mod pairing;
pub mod server;
pub mod status;
pub mod transfers;
pub mod ws;
