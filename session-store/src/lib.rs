//! Tiered, Redis-backed session storage engine for multi-turn
//! conversational-agent runtimes.
//!
//! Two on-disk layouts coexist behind one [`service::SessionService`]
//! facade: a legacy per-app hash-of-blobs layout (`backend::v1`) and a
//! newer per-user layout with server-side atomic scripts
//! (`backend::v2`). [`config::CompatMode`] controls how a process reads
//! and writes across the two during a migration.

pub mod backend;
pub mod config;
pub mod contract;
pub mod domain;
pub mod error;
pub mod keys;
pub mod persist;
pub mod scripts;
pub mod service;
pub mod summary;

pub use config::{CompatMode, SessionServiceConfig};
pub use contract::{AppendEventHook, GetSessionHook, SessionServiceContract, Summarizer, TrackService};
pub use domain::{
    Choice, Event, EventFilter, Message, Response, Role, Session, StateMap, StorageVersion, Summary,
    TrackEvent, Usage,
};
pub use error::{Result, SessionError};
pub use service::{SessionService, SessionServiceBuilder};
