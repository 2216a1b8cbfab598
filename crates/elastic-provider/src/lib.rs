//! elastic-provider — elastic capacity providers.
//!
//! - **`catalog`**: instance types and boot images a provider offers
//! - **`connector`**: the `ProviderConnector` driver seam and a loopback
//!   driver that starts nothing
//! - **`provider`**: `CloudProvider`: offers, creation requests and the
//!   machines it hosts
//! - **`manager`**: `ElasticProviderManager`: cheapest offer across
//!   providers, confirmation callbacks, destruction choice
//!
//! A creation is pending from the moment its connector accepts it until
//! `confirmed_request` or `refused_request`. While pending, its VMs count
//! against the provider limit and its per-task-type slots are reported by
//! `pending_core_count`.

pub mod catalog;
pub mod connector;
pub mod error;
pub mod manager;
pub mod provider;

pub use catalog::{core_slots, Image, InstanceType};
pub use connector::{ConnectorCall, ConnectorError, LoopbackConnector, ProviderConnector};
pub use error::{ProviderError, ProviderResult};
pub use manager::{Destruction, ElasticProviderManager, ManagerState};
pub use provider::{CloudProvider, CreationRequest, Offer, ProviderState};
