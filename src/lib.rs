//! `flowguard-engine`: an embeddable production rule engine. A host
//! application constructs an [`Engine`], registers `Rule`s, and drives it
//! by emitting events, setting facts, and scheduling timers; the engine
//! dispatches matching rules, runs their actions, and records everything
//! to an in-memory audit trail.
//!
//! The engine is storage-agnostic: it runs entirely in memory by default
//! and only touches a [`storage::StorageAdapter`] when one is supplied, to
//! survive a restart with in-flight timers and persisted rule state.

pub mod action;
pub mod audit;
pub mod condition;
pub mod engine;
pub mod error;
pub mod model;
pub mod pattern;
pub mod rules;
pub mod services;
pub mod storage;
pub mod store;
pub mod temporal;
pub mod timer;

pub use engine::{Config, Engine, EngineStats, EventSubscription, QueryResult};
pub use error::{EngineError, EngineResult};
pub use model::{
    AuditCategory, AuditEntry, AuditType, Event, EventDraft, Fact, FactChangeKind, LogLevel, Rule,
    RuleAction, RuleBuilder, RuleCondition, RuleGroup, Timer, TimerDraft, Trigger,
};
pub use services::{AnomalyVerdict, BaselineStore, Service, ServiceRegistry};
pub use storage::{InMemoryStorageAdapter, StorageAdapter, StoredState};
