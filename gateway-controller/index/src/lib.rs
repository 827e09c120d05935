//! Route synthesis and publication.
//!
//! The [`RouteSynthesizer`] turns a [`DiscoverySet`](gateway_controller_core::DiscoverySet) into
//! an unversioned [`RouteSnapshot`](gateway_controller_core::RouteSnapshot). The
//! [`ConfigProvider`] stamps each snapshot with the next version and makes it current:
//!
//! ```text
//! [ DiscoverySet ] -> synthesize -> publish -> [ current snapshot ] <- get_config
//!                                      |
//!                                      +-> fire previous change token
//! ```
//!
//! A published snapshot is never mutated; readers may hold onto one for as long as they like,
//! and superseded snapshots are freed once the last reader drops them.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod provider;
mod synthesize;

#[cfg(test)]
mod tests;

pub use self::{
    provider::{ConfigProvider, SharedProvider},
    synthesize::{PathMappings, RouteSynthesizer},
};
