//! `safefs-kernel` – Safety Enforcement
//!
//! Exposes a robot's devices, configuration, memory and logs as one
//! path-addressed tree and places a policy layer in front of it. Nothing
//! reaches the hardware paths without passing the checks.
//!
//! # Modules
//!
//! - [`namespace`] – [`Namespace`]: the in-memory resource tree of
//!   directories and JSON leaves.
//! - [`permissions`] – [`PermissionTable`]: per-path access lists plus
//!   per-principal [`Capability`][safefs_types::Capability] grants.
//! - [`safety`] – [`SafetyLayer`]: the single enforcement point. Lockouts,
//!   the emergency stop, motor rate limiting and clamping, bounds checks,
//!   work orders and the three audit logs.
//! - [`bounds`] – [`BoundsChecker`]: workspace geometry, joint and force
//!   limits with warning bands, and robot archetype presets.
//! - [`authority`] – [`WorkAuthority`]: work orders approved by an
//!   authorized human before destructive actions may run.
//! - [`config`] – [`KernelConfig`]: TOML configuration with `SAFEFS_*`
//!   environment overrides.
//! - [`clock`] – [`Clock`]: the time source every time-dependent check reads.
//! - [`telemetry`] – `tracing` subscriber and OTLP export setup.
//! - [`path`] – path normalization helpers.

pub mod authority;
pub mod bounds;
pub mod clock;
pub mod config;
pub mod namespace;
pub mod path;
pub mod permissions;
pub mod safety;
pub mod telemetry;

pub use authority::{DestructiveClassifier, WorkAuthority, WorkOrder};
pub use bounds::{Archetype, BoundsChecker, BoundsResult, BoundsStatus, Constraint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KernelConfig;
pub use namespace::{Content, Metadata, Namespace, NodeKind};
pub use permissions::PermissionTable;
pub use safety::{AuditEntry, AuditKind, Policy, SafetyConfig, SafetyLayer};
