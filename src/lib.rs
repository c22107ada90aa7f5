//! The Rust SDK core for Flagship, a feature flagging and experimentation platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`Flagship`] instance that creates [`Visitor`]s. Each visitor has an
//! id, a [`Context`] of key-value attributes and a tracking consent. Fetching a visitor's flags
//! assigns it to campaign variations, either by asking the decision API
//! ([`DecisionMode::DecisionApi`]) or by evaluating a periodically polled bucketing file locally
//! ([`DecisionMode::Bucketing`]). Flag values are then read through typed [`Flag`] views.
//!
//! Reading a flag with `expose` set sends an activation, so the platform knows which variation
//! the visitor saw. Analytics [hits](HitKind) and activations are queued and sent in batches by
//! the [`TrackingManager`] according to its [`CacheStrategy`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag reads never fail: a missing flag, a value of another type or a fetch that has not
//! happened yet all resolve to the default value. Errors are returned by fetches and lifecycle
//! operations and are usually worth logging, not crashing on.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, all
//! under the `flagship` target with structured key-values. Consider integrating a
//! `log`-compatible logger implementation for better visibility into SDK operations.
//!
//! # Persistence
//!
//! Visitors, unsent hits and the bucketing file can be persisted between runs by providing
//! [`VisitorCache`], [`HitCache`] and [`BucketingCache`] implementations in [`FlagshipConfig`].
//! Nothing is persisted by default.

#![warn(rustdoc::missing_crate_level_docs)]

mod account_settings;
pub mod bucketing;
mod cache;
mod campaign;
mod client;
mod config;
pub mod context;
pub mod decision;
mod error;
mod flag;
mod hit;
mod http;
mod sharder;
mod status;
pub mod targeting;
mod tracking;
mod visitor;

#[cfg(test)]
mod test_utils;

pub use account_settings::{AccountSettings, TroubleshootingSettings};
pub use cache::{BucketingCache, FileBucketingCache, HitCache, NoopCache, VisitorCache};
pub use campaign::CampaignAssignment;
pub use client::Flagship;
pub use config::{CacheStrategy, DecisionMode, FlagshipConfig, TrackingConfig};
pub use context::{Context, ContextProvider, ContextValue};
pub use error::{Error, Result};
pub use flag::{Flag, FlagMetadata, FlagValue};
pub use hit::{Activation, Diagnostic, Event, EventCategory, Hit, HitKind, Item, Transaction};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use sharder::allocate;
pub use status::SdkStatus;
pub use tracking::{troubleshooting::TroubleshootingLabel, TrackingManager};
pub use visitor::{FetchFlagsRequiredStatusReason, FlagStatus, Visitor, VisitorBuilder, VisitorEvent};
