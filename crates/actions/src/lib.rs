//! Action dispatch for the companion device.
//!
//! The [`ActionDispatcher`] fires a user's action over the companion
//! [`CompanionLink`] when it is immediately reachable and falls back to a
//! direct authenticated call against the action's server otherwise. The
//! result is published as a self-clearing [`ActionRunState`].

pub mod action;
pub mod api;
pub mod catalog;
pub mod companion;
pub mod dispatcher;
pub mod error;
pub mod reachability;

pub use {
    action::{Action, ActionRunState, RunSnapshot},
    api::{ActionApi, HttpActionApi, ServerDirectory, ServerEndpoint},
    catalog::{ActionCatalog, MemoryCatalog},
    companion::{ACTION_ROW_PRESSED, CompanionLink, LinkFrame, PeerLink},
    dispatcher::{ActionDispatcher, ActionRunner, DispatcherOptions},
    error::{DispatchError, LinkError},
    reachability::{LinkReachability, ReachabilityGateway},
};
