//! [`SafetyLayer`] – the single enforcement point between callers and the
//! [`Namespace`].
//!
//! Agents, the gateway and drivers never touch the tree directly. Every
//! boundary operation is attributed to a principal and goes through the same
//! ordered pipeline:
//!
//! 1. **Lockout**: a principal whose lockout has not expired is refused
//!    outright. An expired lockout is cleared together with its violation
//!    counter.
//! 2. **Estop**: while the global emergency stop is latched, nothing under
//!    `/devices/motor` may change.
//! 3. **Permission**: delegated to [`PermissionTable`]. A deny counts as a
//!    violation; reaching `max_violations_before_lockout` locks the principal
//!    out for `lockout_duration_s`.
//! 4. **Read-only nodes**: `/logs/**` and `/config/safety/**` are rendered
//!    from layer state and cannot be modified by anyone.
//! 5. **Motor rate window**: at most `motor_rate_hz` writes to
//!    `/devices/motor/**` per trailing second. Exceeding it is refused but is
//!    not a violation. A write refused by a later step gives its slot back.
//! 6. **Clamping**: `linear` and `angular` fields of motor commands are
//!    clamped into their configured ranges.
//! 7. **Bounds**: every motor and arm payload except `/devices/motor/status`
//!    is checked by the attached [`BoundsChecker`]. Payloads that are not an
//!    action record are violations. A violation blocks the write; a warning
//!    is recorded.
//! 8. **Work order**: with a [`WorkAuthority`] attached, destructive targets
//!    need a valid order. The order is claimed here and handed back if the
//!    commit fails.
//! 9. **Commit** to the namespace, then audit.
//!
//! Reads run steps 1, 3 and 9. Every refusal is an `Err` value and, with the
//! `audit_denials` policy on, an entry in `/logs/access`.
//!
//! # Example
//!
//! ```
//! use safefs_kernel::safety::{SafetyConfig, SafetyLayer};
//! use safefs_kernel::namespace::Content;
//! use safefs_types::KernelError;
//! use serde_json::json;
//!
//! let layer = SafetyLayer::new(SafetyConfig::default()).unwrap();
//!
//! layer.write("/devices/motor/cmd", json!({"linear": 3.0, "angular": 0.0}), "agent").unwrap();
//! assert_eq!(
//!     layer.read("/devices/motor/cmd", "agent").unwrap(),
//!     Some(Content::Value(json!({"linear": 1.0, "angular": 0.0})))
//! );
//!
//! layer.estop("agent").unwrap();
//! assert!(matches!(
//!     layer.write("/devices/motor/cmd", json!({"linear": 0.1}), "agent"),
//!     Err(KernelError::EstopActive { .. })
//! ));
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use safefs_types::{Access, Capability, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::authority::WorkAuthority;
use crate::bounds::{BoundsChecker, BoundsStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::KernelConfig;
use crate::namespace::{Content, Metadata, Namespace};
use crate::path;
use crate::permissions::PermissionTable;

pub const MOTOR_SUBTREE: &str = "/devices/motor";
pub const ARM_SUBTREE: &str = "/devices/arm";
pub const MOTOR_CMD: &str = "/devices/motor/cmd";
pub const MOTOR_STATUS: &str = "/devices/motor/status";
pub const LOGS: &str = "/logs";
pub const SAFETY_CONFIG: &str = "/config/safety";

const LIMITS_NODE: &str = "/config/safety/limits";
const POLICIES_NODE: &str = "/config/safety/policies";
const CAPABILITIES_NODE: &str = "/config/safety/capabilities";

/// Subtrees rendered from layer state; read-only for every principal.
const VIRTUAL_ROOTS: [&str; 2] = [LOGS, SAFETY_CONFIG];

/// Upper bound applied to `lockout_duration_s`.
const MAX_LOCKOUT: Duration = Duration::from_secs(365 * 24 * 3600);

const RATE_WINDOW: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Policies
// ────────────────────────────────────────────────────────────────────────────

/// Independently toggleable enforcement steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Clamp,
    RateLimit,
    AuditWrites,
    AuditDenials,
    Lockout,
    BoundsCheck,
}

impl Policy {
    pub const ALL: [Policy; 6] = [
        Policy::Clamp,
        Policy::RateLimit,
        Policy::AuditWrites,
        Policy::AuditDenials,
        Policy::Lockout,
        Policy::BoundsCheck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Policy::Clamp => "clamp",
            Policy::RateLimit => "rate_limit",
            Policy::AuditWrites => "audit_writes",
            Policy::AuditDenials => "audit_denials",
            Policy::Lockout => "lockout",
            Policy::BoundsCheck => "bounds_check",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name.trim())
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn enabled() -> bool {
    true
}

/// On/off state of every [`Policy`]. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policies {
    #[serde(default = "enabled")]
    pub clamp: bool,
    #[serde(default = "enabled")]
    pub rate_limit: bool,
    #[serde(default = "enabled")]
    pub audit_writes: bool,
    #[serde(default = "enabled")]
    pub audit_denials: bool,
    #[serde(default = "enabled")]
    pub lockout: bool,
    #[serde(default = "enabled")]
    pub bounds_check: bool,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            clamp: true,
            rate_limit: true,
            audit_writes: true,
            audit_denials: true,
            lockout: true,
            bounds_check: true,
        }
    }
}

impl Policies {
    fn slot(&mut self, policy: Policy) -> &mut bool {
        match policy {
            Policy::Clamp => &mut self.clamp,
            Policy::RateLimit => &mut self.rate_limit,
            Policy::AuditWrites => &mut self.audit_writes,
            Policy::AuditDenials => &mut self.audit_denials,
            Policy::Lockout => &mut self.lockout,
            Policy::BoundsCheck => &mut self.bounds_check,
        }
    }

    pub fn enabled(&self, policy: Policy) -> bool {
        match policy {
            Policy::Clamp => self.clamp,
            Policy::RateLimit => self.rate_limit,
            Policy::AuditWrites => self.audit_writes,
            Policy::AuditDenials => self.audit_denials,
            Policy::Lockout => self.lockout,
            Policy::BoundsCheck => self.bounds_check,
        }
    }

    pub fn set(&mut self, policy: Policy, on: bool) {
        *self.slot(policy) = on;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

fn default_unit_range() -> (f64, f64) {
    (-1.0, 1.0)
}

fn default_motor_rate_hz() -> f64 {
    20.0
}

fn default_max_violations() -> u32 {
    5
}

fn default_lockout_duration_s() -> f64 {
    30.0
}

fn default_audit_ring_size() -> usize {
    1000
}

/// `[safety]` section of the kernel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_unit_range")]
    pub motor_linear_range: (f64, f64),
    #[serde(default = "default_unit_range")]
    pub motor_angular_range: (f64, f64),
    /// Motor writes admitted per trailing second.
    #[serde(default = "default_motor_rate_hz")]
    pub motor_rate_hz: f64,
    #[serde(default = "default_max_violations")]
    pub max_violations_before_lockout: u32,
    #[serde(default = "default_lockout_duration_s")]
    pub lockout_duration_s: f64,
    /// Capacity of each audit log; oldest entries are dropped first.
    #[serde(default = "default_audit_ring_size")]
    pub audit_ring_size: usize,
    #[serde(default)]
    pub policies: Policies,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            motor_linear_range: default_unit_range(),
            motor_angular_range: default_unit_range(),
            motor_rate_hz: default_motor_rate_hz(),
            max_violations_before_lockout: default_max_violations(),
            lockout_duration_s: default_lockout_duration_s(),
            audit_ring_size: default_audit_ring_size(),
            policies: Policies::default(),
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        let bad = |msg: String| Err(KernelError::Config(msg));
        for (name, (lo, hi)) in [
            ("motor_linear_range", self.motor_linear_range),
            ("motor_angular_range", self.motor_angular_range),
        ] {
            if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                return bad(format!("{name} [{lo}, {hi}] is not a valid range"));
            }
        }
        if !(self.motor_rate_hz.is_finite() && self.motor_rate_hz > 0.0) {
            return bad(format!("motor_rate_hz {} must be > 0", self.motor_rate_hz));
        }
        if self.max_violations_before_lockout == 0 {
            return bad("max_violations_before_lockout must be >= 1".into());
        }
        if !(self.lockout_duration_s.is_finite() && self.lockout_duration_s >= 0.0) {
            return bad(format!(
                "lockout_duration_s {} must be >= 0",
                self.lockout_duration_s
            ));
        }
        if self.audit_ring_size == 0 {
            return bad("audit_ring_size must be > 0".into());
        }
        Ok(())
    }

    /// Writes admitted per window: `max(1, floor(motor_rate_hz))`.
    pub fn motor_window_capacity(&self) -> usize {
        if self.motor_rate_hz.is_finite() && self.motor_rate_hz >= 1.0 {
            self.motor_rate_hz.floor() as usize
        } else {
            1
        }
    }

    fn lockout_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.lockout_duration_s)
            .unwrap_or(Duration::ZERO)
            .min(MAX_LOCKOUT)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Audit
// ────────────────────────────────────────────────────────────────────────────

/// The three audit logs, served under `/logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    /// Committed mutations.
    Actions,
    /// Lockouts, estops, bounds results, policy and grant changes.
    Safety,
    /// Every admitted or refused boundary operation.
    Access,
}

impl AuditKind {
    pub fn path(self) -> &'static str {
        match self {
            AuditKind::Actions => "/logs/actions",
            AuditKind::Safety => "/logs/safety",
            AuditKind::Access => "/logs/access",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub principal: String,
    pub op: String,
    pub path: String,
    /// `ok`, `warning`, or the [`KernelError::kind`] of a refusal.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Operations
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Ls,
    Stat,
    Walk,
    Write,
    Append,
    Mkdir,
    Unlink,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Read => "read",
            Op::Ls => "ls",
            Op::Stat => "stat",
            Op::Walk => "walk",
            Op::Write => "write",
            Op::Append => "append",
            Op::Mkdir => "mkdir",
            Op::Unlink => "unlink",
        }
    }

    fn mutates(self) -> bool {
        matches!(self, Op::Write | Op::Append | Op::Mkdir | Op::Unlink)
    }

    fn access(self) -> Access {
        if self.mutates() {
            Access::WRITE
        } else {
            Access::READ
        }
    }

    /// Action type looked up in the work-order table.
    fn authority_action(self) -> Option<&'static str> {
        match self {
            Op::Write | Op::Append => Some("write"),
            Op::Unlink => Some("unlink"),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Runtime state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SafetyState {
    motor_window: VecDeque<Instant>,
    violations: HashMap<String, u32>,
    /// Principal → lockout expiry.
    lockouts: HashMap<String, Instant>,
    estop: bool,
    policies: Policies,
    actions: VecDeque<AuditEntry>,
    safety: VecDeque<AuditEntry>,
    access: VecDeque<AuditEntry>,
}

impl SafetyState {
    fn ring(&mut self, kind: AuditKind) -> &mut VecDeque<AuditEntry> {
        match kind {
            AuditKind::Actions => &mut self.actions,
            AuditKind::Safety => &mut self.safety,
            AuditKind::Access => &mut self.access,
        }
    }

    fn record(&mut self, kind: AuditKind, entry: AuditEntry, cap: usize) {
        let ring = self.ring(kind);
        ring.push_back(entry);
        while ring.len() > cap {
            ring.pop_front();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyLayer
// ────────────────────────────────────────────────────────────────────────────

/// Policy-enforcing front of the resource tree.
///
/// Lock order is state before permissions. The namespace is only called
/// with neither held.
pub struct SafetyLayer {
    ns: Namespace,
    permissions: RwLock<PermissionTable>,
    config: SafetyConfig,
    state: Mutex<SafetyState>,
    bounds: RwLock<Option<BoundsChecker>>,
    authority: Option<Arc<WorkAuthority>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SafetyLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyLayer")
            .field("config", &self.config)
            .field("estopped", &self.is_estopped())
            .field("bounds", &self.bounds.read().is_some())
            .field("authority", &self.authority.is_some())
            .finish_non_exhaustive()
    }
}

impl SafetyLayer {
    /// Layer with the default permission table and the system clock.
    pub fn new(config: SafetyConfig) -> Result<Self, KernelError> {
        Self::with_parts(config, PermissionTable::with_defaults(), Arc::new(SystemClock))
    }

    /// Layer over an explicit permission table and clock. Validates `config`
    /// and creates the conventional tree.
    pub fn with_parts(
        config: SafetyConfig,
        permissions: PermissionTable,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        let ns = Namespace::new();
        if let Err(e) = bootstrap(&ns) {
            error!(error = %e, "namespace bootstrap failed");
        }
        let state = SafetyState {
            policies: config.policies,
            ..SafetyState::default()
        };
        Ok(Self {
            ns,
            permissions: RwLock::new(permissions),
            config,
            state: Mutex::new(state),
            bounds: RwLock::new(None),
            authority: None,
            clock,
        })
    }

    /// Validate `config` and build a layer with bounds checker and work
    /// authority attached when their sections are present.
    pub fn from_config(config: &KernelConfig, clock: Arc<dyn Clock>) -> Result<Self, KernelError> {
        config.validate()?;
        let mut layer = Self::with_parts(
            config.safety.clone(),
            PermissionTable::with_defaults(),
            clock.clone(),
        )?;
        if let Some(bounds) = &config.bounds {
            layer = layer.with_bounds(BoundsChecker::new(bounds.clone()));
        }
        if let Some(authority) = &config.authority {
            let authority = WorkAuthority::with_clock(authority.clone(), clock)?;
            layer = layer.with_authority(Arc::new(authority));
        }
        Ok(layer)
    }

    /// Attach a bounds checker for motor and arm payloads.
    #[must_use]
    pub fn with_bounds(self, checker: BoundsChecker) -> Self {
        *self.bounds.write() = Some(checker);
        self
    }

    /// Require work orders for destructive targets.
    #[must_use]
    pub fn with_authority(mut self, authority: Arc<WorkAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn authority(&self) -> Option<&Arc<WorkAuthority>> {
        self.authority.as_ref()
    }

    // ── boundary: reads ─────────────────────────────────────────────────────

    /// Leaf payload, directory listing, or `None` when absent.
    pub fn read(&self, path: &str, principal: &str) -> Result<Option<Content>, KernelError> {
        let path = self.admit(Op::Read, path, principal)?;
        let content = match self.render_virtual(&path) {
            Some(value) => Some(Content::Value(value)),
            None => self.ns.read(&path)?,
        };
        self.record_access(Op::Read, &path, principal, None);
        Ok(content)
    }

    /// Child names, or `None` for leaves and absent paths.
    pub fn ls(&self, path: &str, principal: &str) -> Result<Option<Vec<String>>, KernelError> {
        let path = self.admit(Op::Ls, path, principal)?;
        let names = self.ns.ls(&path)?;
        self.record_access(Op::Ls, &path, principal, None);
        Ok(names)
    }

    pub fn stat(&self, path: &str, principal: &str) -> Result<Option<Metadata>, KernelError> {
        let path = self.admit(Op::Stat, path, principal)?;
        let meta = self.ns.stat(&path)?;
        self.record_access(Op::Stat, &path, principal, None);
        Ok(meta)
    }

    /// Descendants of `path` the principal may read, depth-first.
    pub fn walk(&self, path: &str, principal: &str) -> Result<Vec<String>, KernelError> {
        let path = self.admit(Op::Walk, path, principal)?;
        let all = self.ns.walk(&path)?;
        let visible = {
            let table = self.permissions.read();
            all.into_iter()
                .filter(|p| table.check_access(principal, p, Access::READ))
                .collect()
        };
        self.record_access(Op::Walk, &path, principal, None);
        Ok(visible)
    }

    /// Unauthenticated existence probe. Malformed paths do not exist.
    pub fn exists(&self, path: &str) -> bool {
        self.ns.exists(path)
    }

    // ── boundary: mutations ─────────────────────────────────────────────────

    /// Replace (or create) the leaf at `path`.
    pub fn write(&self, path: &str, value: Value, principal: &str) -> Result<(), KernelError> {
        self.mutate(Op::Write, path, value, principal)
    }

    /// Append `value` to the leaf at `path`, coercing it to a list.
    pub fn append(&self, path: &str, value: Value, principal: &str) -> Result<(), KernelError> {
        self.mutate(Op::Append, path, value, principal)
    }

    pub fn mkdir(&self, path: &str, principal: &str) -> Result<(), KernelError> {
        let path = self.admit(Op::Mkdir, path, principal)?;
        self.ns.mkdir(&path)?;
        self.record_commit(Op::Mkdir, &path, principal, None);
        Ok(())
    }

    /// Remove a leaf or empty directory. `Ok(false)` when absent.
    pub fn unlink(&self, path: &str, principal: &str) -> Result<bool, KernelError> {
        let path = self.admit(Op::Unlink, path, principal)?;
        let order = self.claim_order(Op::Unlink, &path, principal)?;
        let removed = match self.ns.unlink(&path) {
            Ok(removed) => removed,
            Err(e) => {
                self.release_order(order);
                return Err(e);
            }
        };
        if removed {
            self.record_commit(Op::Unlink, &path, principal, None);
        } else {
            self.release_order(order);
            self.record_access(Op::Unlink, &path, principal, Some("absent".into()));
        }
        Ok(removed)
    }

    fn mutate(&self, op: Op, path: &str, value: Value, principal: &str) -> Result<(), KernelError> {
        let path = self.admit(op, path, principal)?;
        let slot = if path::is_within(&path, MOTOR_SUBTREE) {
            self.admit_motor_rate(op, &path, principal)?
        } else {
            None
        };
        let result = self.commit(op, &path, value, principal);
        if result.is_err()
            && let Some(at) = slot
        {
            self.release_motor_slot(at);
        }
        result
    }

    /// Steps 6–9 on an admitted path.
    fn commit(
        &self,
        op: Op,
        path: &str,
        value: Value,
        principal: &str,
    ) -> Result<(), KernelError> {
        let motor = path::is_within(path, MOTOR_SUBTREE);
        let value = if motor && self.policy(Policy::Clamp) {
            self.clamp_motor(path, value)
        } else {
            value
        };
        let detail = if is_action_target(path) && self.policy(Policy::BoundsCheck) {
            self.check_bounds(op, path, &value, principal)?
        } else {
            None
        };
        let order = self.claim_order(op, path, principal)?;

        let written = match op {
            Op::Append => self.ns.append(path, value),
            _ => self.ns.write(path, value),
        };
        if let Err(e) = written {
            self.release_order(order);
            return Err(e);
        }
        self.record_commit(op, path, principal, detail);
        Ok(())
    }

    // ── emergency stop ──────────────────────────────────────────────────────

    /// Latch the emergency stop and command the motors to zero.
    ///
    /// Needs [`Capability::ESTOP`]. Refused while the caller is locked out.
    pub fn estop(&self, principal: &str) -> Result<(), KernelError> {
        self.check_lockout(principal, MOTOR_SUBTREE, "estop")?;
        self.require_capability(principal, Capability::ESTOP, "estop")?;
        {
            let mut st = self.state.lock();
            st.estop = true;
            let entry = self.entry(principal, "estop", MOTOR_SUBTREE, "ok", None);
            st.record(AuditKind::Safety, entry, self.config.audit_ring_size);
        }
        error!(principal, "EMERGENCY STOP latched");
        if let Err(e) = self.ns.write(MOTOR_CMD, json!({"linear": 0.0, "angular": 0.0})) {
            error!(error = %e, "failed to zero motor command");
        }
        if let Err(e) = self.ns.write(MOTOR_STATUS, json!("estopped")) {
            error!(error = %e, "failed to set motor status");
        }
        Ok(())
    }

    /// Release the emergency stop. Needs root or [`Capability::SAFETY_OVERRIDE`].
    pub fn clear_estop(&self, principal: &str) -> Result<(), KernelError> {
        self.check_lockout(principal, MOTOR_SUBTREE, "clear_estop")?;
        self.require_capability(principal, Capability::SAFETY_OVERRIDE, "clear_estop")?;
        {
            let mut st = self.state.lock();
            st.estop = false;
            let entry = self.entry(principal, "clear_estop", MOTOR_SUBTREE, "ok", None);
            st.record(AuditKind::Safety, entry, self.config.audit_ring_size);
        }
        info!(principal, "emergency stop cleared");
        if let Err(e) = self.ns.write(MOTOR_STATUS, json!("idle")) {
            error!(error = %e, "failed to set motor status");
        }
        Ok(())
    }

    pub fn is_estopped(&self) -> bool {
        self.state.lock().estop
    }

    // ── administration ──────────────────────────────────────────────────────

    /// Toggle a policy. Root only.
    pub fn set_policy(&self, principal: &str, policy: Policy, on: bool) -> Result<(), KernelError> {
        self.require_root(principal, POLICIES_NODE)?;
        let mut st = self.state.lock();
        st.policies.set(policy, on);
        let entry = self.entry(
            principal,
            "set_policy",
            POLICIES_NODE,
            "ok",
            Some(format!("{policy}={on}")),
        );
        st.record(AuditKind::Safety, entry, self.config.audit_ring_size);
        info!(principal, %policy, enabled = on, "policy changed");
        Ok(())
    }

    /// Add capabilities to `target`. Root only.
    pub fn grant_capability(
        &self,
        principal: &str,
        target: &str,
        caps: Capability,
    ) -> Result<(), KernelError> {
        self.require_root(principal, CAPABILITIES_NODE)?;
        self.permissions.write().grant(target, caps);
        self.record_admin(principal, "grant", CAPABILITIES_NODE, format!("{target} +{:?}", caps.names()));
        Ok(())
    }

    /// Remove capabilities from `target`. Root only.
    pub fn revoke_capability(
        &self,
        principal: &str,
        target: &str,
        caps: Capability,
    ) -> Result<(), KernelError> {
        self.require_root(principal, CAPABILITIES_NODE)?;
        self.permissions.write().revoke(target, caps);
        self.record_admin(principal, "revoke", CAPABILITIES_NODE, format!("{target} -{:?}", caps.names()));
        Ok(())
    }

    /// Set `target`'s access bits at `path`. Root only.
    pub fn set_acl(
        &self,
        principal: &str,
        path: &str,
        target: &str,
        access: Access,
    ) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        self.require_root(principal, &path)?;
        self.permissions.write().set_acl(&path, target, access)?;
        self.record_admin(principal, "set_acl", &path, format!("{target}={access}"));
        Ok(())
    }

    /// Switch the force ceiling for human proximity. No-op without a
    /// bounds checker.
    pub fn set_human_nearby(&self, nearby: bool) {
        let changed = {
            let mut bounds = self.bounds.write();
            match bounds.as_mut() {
                Some(checker) if checker.human_nearby() != nearby => {
                    checker.set_human_nearby(nearby);
                    true
                }
                _ => false,
            }
        };
        if changed {
            let entry = self.entry(
                "",
                "human_nearby",
                ARM_SUBTREE,
                "ok",
                Some(nearby.to_string()),
            );
            self.state
                .lock()
                .record(AuditKind::Safety, entry, self.config.audit_ring_size);
        }
    }

    // ── introspection ───────────────────────────────────────────────────────

    pub fn violations(&self, principal: &str) -> u32 {
        self.state.lock().violations.get(principal).copied().unwrap_or(0)
    }

    /// `true` while an unexpired lockout exists. Does not clear expired ones.
    pub fn is_locked_out(&self, principal: &str) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .lockouts
            .get(principal)
            .is_some_and(|until| now < *until)
    }

    pub fn policies(&self) -> Policies {
        self.state.lock().policies
    }

    pub fn audit(&self, kind: AuditKind) -> Vec<AuditEntry> {
        self.state.lock().ring(kind).iter().cloned().collect()
    }

    /// Silent permission probe against the live table.
    pub fn check_access(&self, principal: &str, path: &str, access: Access) -> bool {
        self.permissions.read().check_access(principal, path, access)
    }

    // ── pipeline steps ──────────────────────────────────────────────────────

    fn policy(&self, policy: Policy) -> bool {
        self.state.lock().policies.enabled(policy)
    }

    /// Steps 1–4. Returns the normalized path.
    fn admit(&self, op: Op, raw: &str, principal: &str) -> Result<String, KernelError> {
        let path = path::normalize(raw)?;
        self.check_lockout(principal, &path, op.name())?;

        let now = self.clock.now();
        let mut st = self.state.lock();

        if op.mutates() && st.estop && path::is_within(&path, MOTOR_SUBTREE) {
            let err = KernelError::EstopActive { path: path.clone() };
            self.deny(&mut st, op.name(), &path, principal, &err);
            return Err(err);
        }

        let allowed = self
            .permissions
            .read()
            .check_access(principal, &path, op.access());
        if !allowed {
            let err = KernelError::PermissionDenied {
                principal: principal.to_string(),
                path: path.clone(),
                access: op.access(),
            };
            self.deny(&mut st, op.name(), &path, principal, &err);
            self.count_violation(&mut st, principal, &path, now);
            return Err(err);
        }

        if op.mutates() && is_virtual(&path) {
            let err = KernelError::ReadOnly(path.clone());
            self.deny(&mut st, op.name(), &path, principal, &err);
            return Err(err);
        }
        Ok(path)
    }

    /// Step 1 alone: refuse during a lockout, clear an expired one.
    fn check_lockout(&self, principal: &str, path: &str, op: &str) -> Result<(), KernelError> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let Some(&until) = st.lockouts.get(principal) else {
            return Ok(());
        };
        if now < until {
            let remaining_ms = u64::try_from((until - now).as_millis()).unwrap_or(u64::MAX);
            let err = KernelError::Lockout {
                principal: principal.to_string(),
                remaining_ms,
            };
            self.deny(&mut st, op, path, principal, &err);
            return Err(err);
        }
        st.lockouts.remove(principal);
        st.violations.remove(principal);
        let entry = self.entry(principal, "lockout_cleared", path, "ok", None);
        st.record(AuditKind::Safety, entry, self.config.audit_ring_size);
        info!(principal, "lockout expired");
        Ok(())
    }

    /// Count a permission violation and lock out at the threshold.
    fn count_violation(&self, st: &mut SafetyState, principal: &str, path: &str, now: Instant) {
        let count = st.violations.entry(principal.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        if st.policies.lockout && count >= self.config.max_violations_before_lockout {
            let duration = self.config.lockout_duration();
            st.lockouts.insert(principal.to_string(), now + duration);
            let entry = self.entry(
                principal,
                "lockout",
                path,
                "lockout",
                Some(format!("{count} violations, {} s", duration.as_secs_f64())),
            );
            st.record(AuditKind::Safety, entry, self.config.audit_ring_size);
            error!(principal, violations = count, "principal locked out");
        }
    }

    /// Step 5: sliding one-second window over motor writes. Returns the
    /// reserved slot, or `None` with rate limiting off.
    fn admit_motor_rate(&self, op: Op, path: &str, principal: &str) -> Result<Option<Instant>, KernelError> {
        let now = self.clock.now();
        let capacity = self.config.motor_window_capacity();
        let mut st = self.state.lock();
        if !st.policies.rate_limit {
            return Ok(None);
        }
        while st
            .motor_window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW)
        {
            st.motor_window.pop_front();
        }
        if st.motor_window.len() >= capacity {
            let err = KernelError::RateLimited {
                path: path.to_string(),
                rate_hz: self.config.motor_rate_hz,
            };
            self.deny(&mut st, op.name(), path, principal, &err);
            return Err(err);
        }
        st.motor_window.push_back(now);
        Ok(Some(now))
    }

    /// Give back a slot reserved by a write that was then refused.
    fn release_motor_slot(&self, at: Instant) {
        let mut st = self.state.lock();
        if let Some(i) = st.motor_window.iter().rposition(|t| *t == at) {
            st.motor_window.remove(i);
        }
    }

    /// Step 6: clamp `linear`/`angular`, numbers or objects of numbers.
    fn clamp_motor(&self, path: &str, mut value: Value) -> Value {
        let Some(fields) = value.as_object_mut() else {
            return value;
        };
        for (key, (lo, hi)) in [
            ("linear", self.config.motor_linear_range),
            ("angular", self.config.motor_angular_range),
        ] {
            match fields.get_mut(key) {
                Some(Value::Object(axes)) => {
                    for (axis, v) in axes.iter_mut() {
                        clamp_number(v, lo, hi, path, &format!("{key}.{axis}"));
                    }
                }
                Some(v) => clamp_number(v, lo, hi, path, key),
                None => {}
            }
        }
        value
    }

    /// Step 7. `Ok(Some(detail))` for a warning that lets the write through.
    fn check_bounds(
        &self,
        op: Op,
        path: &str,
        value: &Value,
        principal: &str,
    ) -> Result<Option<String>, KernelError> {
        let result = match self.bounds.read().as_ref() {
            Some(checker) => checker.check_action_value(value),
            None => return Ok(None),
        };
        match result.status {
            BoundsStatus::Ok => Ok(None),
            BoundsStatus::Warning => {
                warn!(principal, path, margin = result.margin, detail = %result.detail, "bounds warning");
                let entry = self.entry(principal, "bounds", path, "warning", Some(result.detail.clone()));
                self.state
                    .lock()
                    .record(AuditKind::Safety, entry, self.config.audit_ring_size);
                Ok(Some(result.detail))
            }
            BoundsStatus::Violation => {
                error!(principal, path, margin = result.margin, detail = %result.detail, "bounds violation");
                let err = KernelError::BoundsViolation {
                    path: path.to_string(),
                    detail: result.detail.clone(),
                };
                let mut st = self.state.lock();
                let entry = self.entry(principal, "bounds", path, err.kind(), Some(result.detail));
                st.record(AuditKind::Safety, entry, self.config.audit_ring_size);
                self.deny(&mut st, op.name(), path, principal, &err);
                Err(err)
            }
        }
    }

    /// Step 8. `Ok(Some(id))` names the order claimed for this commit.
    fn claim_order(&self, op: Op, path: &str, principal: &str) -> Result<Option<Uuid>, KernelError> {
        let (Some(authority), Some(action)) = (&self.authority, op.authority_action()) else {
            return Ok(None);
        };
        match authority.claim(action, path) {
            Ok(order) => Ok(order),
            Err(err) => {
                warn!(principal, path, action, "work order required");
                self.deny(&mut self.state.lock(), op.name(), path, principal, &err);
                Err(err)
            }
        }
    }

    fn release_order(&self, order: Option<Uuid>) {
        if let (Some(authority), Some(id)) = (&self.authority, order)
            && let Err(e) = authority.release(id)
        {
            warn!(order_id = %id, error = %e, "work order could not be released");
        }
    }

    fn require_root(&self, principal: &str, path: &str) -> Result<(), KernelError> {
        self.check_lockout(principal, path, "admin")?;
        if self.permissions.read().is_root(principal) {
            return Ok(());
        }
        let err = KernelError::PermissionDenied {
            principal: principal.to_string(),
            path: path.to_string(),
            access: Access::WRITE,
        };
        let now = self.clock.now();
        let mut st = self.state.lock();
        self.deny(&mut st, "admin", path, principal, &err);
        self.count_violation(&mut st, principal, path, now);
        Err(err)
    }

    /// Capability gate for the estop operations, charged against the motor
    /// subtree.
    fn require_capability(&self, principal: &str, caps: Capability, op: &str) -> Result<(), KernelError> {
        if self.permissions.read().holds(principal, caps) {
            return Ok(());
        }
        let err = KernelError::PermissionDenied {
            principal: principal.to_string(),
            path: MOTOR_SUBTREE.to_string(),
            access: Access::EXECUTE,
        };
        let now = self.clock.now();
        let mut st = self.state.lock();
        self.deny(&mut st, op, MOTOR_SUBTREE, principal, &err);
        self.count_violation(&mut st, principal, MOTOR_SUBTREE, now);
        Err(err)
    }

    // ── audit helpers ───────────────────────────────────────────────────────

    fn entry(
        &self,
        principal: &str,
        op: &str,
        path: &str,
        outcome: &str,
        detail: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            at: self.clock.utc(),
            principal: principal.to_string(),
            op: op.to_string(),
            path: path.to_string(),
            outcome: outcome.to_string(),
            detail,
        }
    }

    fn deny(&self, st: &mut SafetyState, op: &str, path: &str, principal: &str, err: &KernelError) {
        warn!(principal, op, path, reason = err.kind(), "denied");
        if st.policies.audit_denials {
            let entry = self.entry(principal, op, path, err.kind(), Some(err.to_string()));
            st.record(AuditKind::Access, entry, self.config.audit_ring_size);
        }
    }

    fn record_access(&self, op: Op, path: &str, principal: &str, detail: Option<String>) {
        let entry = self.entry(principal, op.name(), path, "ok", detail);
        self.state
            .lock()
            .record(AuditKind::Access, entry, self.config.audit_ring_size);
    }

    fn record_commit(&self, op: Op, path: &str, principal: &str, detail: Option<String>) {
        let cap = self.config.audit_ring_size;
        let mut st = self.state.lock();
        if st.policies.audit_writes {
            let entry = self.entry(principal, op.name(), path, "ok", detail.clone());
            st.record(AuditKind::Actions, entry, cap);
        }
        let entry = self.entry(principal, op.name(), path, "ok", detail);
        st.record(AuditKind::Access, entry, cap);
    }

    fn record_admin(&self, principal: &str, op: &str, path: &str, detail: String) {
        info!(principal, op, path, %detail, "permission table changed");
        let entry = self.entry(principal, op, path, "ok", Some(detail));
        self.state
            .lock()
            .record(AuditKind::Safety, entry, self.config.audit_ring_size);
    }

    // ── virtual nodes ───────────────────────────────────────────────────────

    fn render_virtual(&self, path: &str) -> Option<Value> {
        match path {
            "/logs/actions" => Some(json!(self.audit(AuditKind::Actions))),
            "/logs/safety" => Some(json!(self.audit(AuditKind::Safety))),
            "/logs/access" => Some(json!(self.audit(AuditKind::Access))),
            LIMITS_NODE => Some(self.limits_json()),
            POLICIES_NODE => Some(json!(self.policies())),
            CAPABILITIES_NODE => Some(self.permissions.read().capability_dump()),
            _ => None,
        }
    }

    fn limits_json(&self) -> Value {
        let c = &self.config;
        let bounds = match self.bounds.read().as_ref() {
            Some(checker) => json!({
                "attached": true,
                "human_nearby": checker.human_nearby(),
                "effective_max_force": checker.effective_max_force(),
            }),
            None => json!({ "attached": false }),
        };
        json!({
            "motor_linear_range": [c.motor_linear_range.0, c.motor_linear_range.1],
            "motor_angular_range": [c.motor_angular_range.0, c.motor_angular_range.1],
            "motor_rate_hz": c.motor_rate_hz,
            "max_violations_before_lockout": c.max_violations_before_lockout,
            "lockout_duration_s": c.lockout_duration_s,
            "audit_ring_size": c.audit_ring_size,
            "bounds": bounds,
        })
    }
}

fn is_virtual(path: &str) -> bool {
    VIRTUAL_ROOTS.iter().any(|root| path::is_within(path, root))
}

/// Paths whose payloads are physical commands for the bounds checker.
fn is_action_target(path: &str) -> bool {
    path::is_within(path, ARM_SUBTREE)
        || (path::is_within(path, MOTOR_SUBTREE) && path != MOTOR_STATUS)
}

fn clamp_number(v: &mut Value, lo: f64, hi: f64, path: &str, field: &str) {
    let Some(x) = v.as_f64() else {
        return;
    };
    let clamped = x.max(lo).min(hi);
    if clamped != x {
        warn!(path, field, requested = x, clamped, "motor command clamped");
        *v = json!(clamped);
    }
}

/// Create the conventional tree on a fresh namespace.
fn bootstrap(ns: &Namespace) -> Result<(), KernelError> {
    for dir in [
        "/devices/camera",
        "/devices/speaker",
        "/memory",
        "/context",
        "/channels",
        "/proc",
    ] {
        ns.mkdir(dir)?;
    }
    ns.write(MOTOR_CMD, json!({"linear": 0.0, "angular": 0.0}))?;
    ns.write(MOTOR_STATUS, json!("idle"))?;
    ns.write("/devices/arm/cmd", Value::Object(Map::new()))?;
    for node in [LIMITS_NODE, POLICIES_NODE, CAPABILITIES_NODE] {
        ns.write(node, Value::Null)?;
    }
    for kind in [AuditKind::Actions, AuditKind::Safety, AuditKind::Access] {
        ns.write(kind.path(), json!([]))?;
    }
    Ok(())
}
