//! [`WorkAuthority`] – time-bounded, role-gated approval of destructive actions.
//!
//! A [`DestructiveClassifier`] decides which targets are dangerous enough to
//! need a [`WorkOrder`]. An order is requested by one principal and approved
//! by another whose [`Role`] is both in the authorized tier set and at least
//! the order's `required_role`. An approved order is valid until it expires,
//! is executed once, or is revoked.
//!
//! ```text
//!   request_authorization ──▶ pending ──approve──▶ approved ──mark_executed──▶ executed
//!                                │                    │
//!                                └──────revoke────────┴──(ttl passes)──▶ revoked
//! ```
//!
//! Expiry is lazy: every public operation first sweeps approved orders whose
//! TTL has passed and marks them revoked. Every state transition is appended
//! to a size-capped audit trail.
//!
//! # Example
//!
//! ```
//! use safefs_kernel::authority::{AuthorityConfig, WorkAuthority};
//! use safefs_types::Role;
//!
//! let authority = WorkAuthority::new(AuthorityConfig::default()).unwrap();
//! authority.assign_role("operator_carol", Role::Operator);
//! authority.assign_role("creator_alice", Role::Creator);
//!
//! let id = authority.request_authorization("write", "/devices/arm/firmware", "operator_carol", Role::Creator);
//! assert!(authority.check_authorization("write", "/devices/arm/firmware").is_none());
//!
//! authority.approve(id, "creator_alice").unwrap();
//! assert!(authority.check_authorization("write", "/devices/arm/firmware").is_some());
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use safefs_types::{KernelError, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

// ────────────────────────────────────────────────────────────────────────────
// DestructiveClassifier
// ────────────────────────────────────────────────────────────────────────────

/// Targets matching any of these need a work order.
pub const BUILTIN_PATTERNS: &[&str] = &[
    r"(?i)factory[_\-\s]?reset",
    r"(?i)firmware",
    r"(?i)\b(wipe|format)\b",
    r"(?i)\brm\s+-[a-z]*(rf|fr)",
    r"(?i)\bdelete\s+(-r|--recursive|all)\b",
    r"^/config/safety(/|$)",
    r"(?i)calibrat",
];

/// Regex classifier over paths and command strings.
#[derive(Debug, Clone)]
pub struct DestructiveClassifier {
    patterns: Vec<Regex>,
}

impl Default for DestructiveClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DestructiveClassifier {
    /// Classifier loaded with [`BUILTIN_PATTERNS`].
    pub fn new() -> Self {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns }
    }

    /// Classifier that flags nothing until patterns are loaded.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Compile and add `patterns`. Nothing is added unless every one
    /// compiles. Returns how many were added.
    pub fn load_patterns<I, S>(&mut self, patterns: I) -> Result<usize, KernelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(p).map_err(|e| KernelError::InvalidPattern(format!("{p}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let added = compiled.len();
        self.patterns.extend(compiled);
        Ok(added)
    }

    /// Load one regex per line from `path`. Blank lines and lines starting
    /// with `#` are skipped.
    pub fn load_patterns_from_file(&mut self, path: &Path) -> Result<usize, KernelError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            KernelError::Config(format!("cannot read pattern file {}: {e}", path.display()))
        })?;
        self.load_patterns(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        )
    }

    /// The first pattern `target` matches, if any.
    pub fn matching(&self, target: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(target))
            .map(Regex::as_str)
    }

    pub fn is_destructive(&self, target: &str) -> bool {
        self.matching(target).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WorkOrder
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle stage of a [`WorkOrder`] at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Approved,
    Executed,
    Revoked,
    Expired,
}

/// One approval record for one destructive action on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Uuid,
    pub action_type: String,
    pub target: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub authorized_by: Option<String>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Lowest tier allowed to approve.
    pub required_role: Role,
    pub executed: bool,
    pub revoked: bool,
    /// When the order became terminal (executed, revoked or expired).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl WorkOrder {
    pub fn is_approved(&self) -> bool {
        self.authorized_at.is_some()
    }

    /// Approved, not expired, not executed, not revoked.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_approved()
            && self.expires_at.is_some_and(|exp| now < exp)
            && !self.executed
            && !self.revoked
    }

    pub fn status(&self, now: DateTime<Utc>) -> OrderStatus {
        if self.executed {
            OrderStatus::Executed
        } else if self.revoked {
            OrderStatus::Revoked
        } else if !self.is_approved() {
            OrderStatus::Pending
        } else if self.is_valid(now) {
            OrderStatus::Approved
        } else {
            OrderStatus::Expired
        }
    }

    fn matches(&self, action_type: &str, target: &str) -> bool {
        self.action_type == action_type && self.target == target
    }
}

/// One line of the authority audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityEvent {
    pub at: DateTime<Utc>,
    pub order_id: Uuid,
    /// `requested`, `approved`, `approve_denied`, `executed`, `revoked`,
    /// `revoke_denied` or `expired`.
    pub event: String,
    pub principal: String,
    pub detail: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

fn default_order_ttl_s() -> u64 {
    3600
}

fn default_authorized_roles() -> Vec<Role> {
    vec![Role::Owner, Role::Creator]
}

fn default_audit_size() -> usize {
    1000
}

fn default_retention_s() -> u64 {
    600
}

/// `[authority]` section of the kernel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Lifetime of an approval, in seconds.
    #[serde(default = "default_order_ttl_s")]
    pub order_ttl_s: u64,
    /// Tiers allowed to approve and revoke.
    #[serde(default = "default_authorized_roles")]
    pub authorized_roles: Vec<Role>,
    /// Extra classifier regexes on top of the built-ins.
    #[serde(default)]
    pub destructive_patterns: Vec<String>,
    #[serde(default = "default_audit_size")]
    pub audit_size: usize,
    /// How long terminal orders stay listed before the sweep drops them.
    #[serde(default = "default_retention_s")]
    pub retention_s: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            order_ttl_s: default_order_ttl_s(),
            authorized_roles: default_authorized_roles(),
            destructive_patterns: Vec::new(),
            audit_size: default_audit_size(),
            retention_s: default_retention_s(),
        }
    }
}

impl AuthorityConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.audit_size == 0 {
            return Err(KernelError::Config("authority audit_size must be > 0".into()));
        }
        if self.authorized_roles.is_empty() {
            return Err(KernelError::Config(
                "authority authorized_roles must not be empty".into(),
            ));
        }
        DestructiveClassifier::empty()
            .load_patterns(&self.destructive_patterns)
            .map_err(|e| KernelError::Config(e.to_string()))?;
        Ok(())
    }

    fn ttl(&self) -> TimeDelta {
        seconds(self.order_ttl_s)
    }

    fn retention(&self) -> TimeDelta {
        seconds(self.retention_s)
    }
}

fn seconds(s: u64) -> TimeDelta {
    i64::try_from(s)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

// ────────────────────────────────────────────────────────────────────────────
// WorkAuthority
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct AuthorityState {
    /// Creation order.
    orders: Vec<WorkOrder>,
    roles: HashMap<String, Role>,
    trail: VecDeque<AuthorityEvent>,
}

/// Work-order table, role assignments and classifier.
pub struct WorkAuthority {
    config: AuthorityConfig,
    classifier: RwLock<DestructiveClassifier>,
    state: Mutex<AuthorityState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkAuthority")
            .field("config", &self.config)
            .field("patterns", &self.classifier.read().len())
            .finish_non_exhaustive()
    }
}

impl WorkAuthority {
    pub fn new(config: AuthorityConfig) -> Result<Self, KernelError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Fails with [`KernelError::InvalidPattern`] if a configured pattern
    /// does not compile.
    pub fn with_clock(config: AuthorityConfig, clock: Arc<dyn Clock>) -> Result<Self, KernelError> {
        let mut classifier = DestructiveClassifier::new();
        classifier.load_patterns(&config.destructive_patterns)?;
        Ok(Self {
            config,
            classifier: RwLock::new(classifier),
            state: Mutex::new(AuthorityState::default()),
            clock,
        })
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    // ── classifier ──────────────────────────────────────────────────────────

    pub fn is_destructive(&self, target: &str) -> bool {
        self.classifier.read().is_destructive(target)
    }

    pub fn load_patterns<I, S>(&self, patterns: I) -> Result<usize, KernelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.classifier.write().load_patterns(patterns)
    }

    pub fn load_patterns_from_file(&self, path: &Path) -> Result<usize, KernelError> {
        self.classifier.write().load_patterns_from_file(path)
    }

    // ── roles ───────────────────────────────────────────────────────────────

    pub fn assign_role(&self, principal: &str, role: Role) {
        self.state.lock().roles.insert(principal.to_string(), role);
        info!(principal, %role, "role assigned");
    }

    /// Unassigned principals are guests.
    pub fn role_of(&self, principal: &str) -> Role {
        self.state
            .lock()
            .roles
            .get(principal)
            .copied()
            .unwrap_or_default()
    }

    fn is_authorized_tier(&self, role: Role) -> bool {
        self.config.authorized_roles.contains(&role)
    }

    // ── orders ──────────────────────────────────────────────────────────────

    /// Open a pending order and return its id.
    pub fn request_authorization(
        &self,
        action_type: &str,
        target: &str,
        requested_by: &str,
        required_role: Role,
    ) -> Uuid {
        let now = self.clock.utc();
        let order = WorkOrder {
            id: Uuid::new_v4(),
            action_type: action_type.to_string(),
            target: target.to_string(),
            requested_by: requested_by.to_string(),
            requested_at: now,
            authorized_by: None,
            authorized_at: None,
            expires_at: None,
            required_role,
            executed: false,
            revoked: false,
            closed_at: None,
        };
        let id = order.id;
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        state.orders.push(order);
        self.record(
            &mut state,
            now,
            id,
            "requested",
            requested_by,
            format!("{action_type} {target} (requires {required_role})"),
        );
        info!(%id, action_type, target, requested_by, "work order requested");
        id
    }

    /// Approve a pending order.
    ///
    /// Fails with [`KernelError::WorkOrderInvalid`] when the order is unknown
    /// or no longer pending, when the approver's tier is not authorized or is
    /// below the order's `required_role`, or when the approver requested it.
    pub fn approve(&self, order_id: Uuid, approver: &str) -> Result<(), KernelError> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        let role = state.roles.get(approver).copied().unwrap_or_default();

        let refusal = match state.orders.iter().find(|o| o.id == order_id) {
            None => Some(format!("unknown order {order_id}")),
            Some(o) if o.revoked => Some(format!("order {order_id} is revoked")),
            Some(o) if o.executed => Some(format!("order {order_id} is already executed")),
            Some(o) if o.is_approved() => Some(format!("order {order_id} is already approved")),
            Some(o) if o.requested_by == approver => {
                Some(format!("{approver} cannot approve their own order"))
            }
            Some(_) if !self.is_authorized_tier(role) => {
                Some(format!("{approver} ({role}) is not an authorizing tier"))
            }
            Some(o) if role < o.required_role => Some(format!(
                "{approver} ({role}) is below required role {}",
                o.required_role
            )),
            Some(_) => None,
        };
        if let Some(reason) = refusal {
            self.record(&mut state, now, order_id, "approve_denied", approver, reason.clone());
            warn!(%order_id, approver, %reason, "work order approval denied");
            return Err(KernelError::WorkOrderInvalid(reason));
        }

        let expires_at = now
            .checked_add_signed(self.config.ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(order) = state.orders.iter_mut().find(|o| o.id == order_id) {
            order.authorized_by = Some(approver.to_string());
            order.authorized_at = Some(now);
            order.expires_at = Some(expires_at);
        }
        self.record(
            &mut state,
            now,
            order_id,
            "approved",
            approver,
            format!("expires {}", expires_at.to_rfc3339()),
        );
        info!(%order_id, approver, %role, "work order approved");
        Ok(())
    }

    /// The first currently valid order for `action_type` on `target`.
    pub fn check_authorization(&self, action_type: &str, target: &str) -> Option<WorkOrder> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        state
            .orders
            .iter()
            .find(|o| o.matches(action_type, target) && o.is_valid(now))
            .cloned()
    }

    /// Consume a valid order. Fails if it is unknown, pending, expired,
    /// revoked or already executed.
    pub fn mark_executed(&self, order_id: Uuid) -> Result<(), KernelError> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        let Some(order) = state.orders.iter_mut().find(|o| o.id == order_id) else {
            return Err(KernelError::WorkOrderInvalid(format!("unknown order {order_id}")));
        };
        if !order.is_valid(now) {
            let status = order.status(now);
            return Err(KernelError::WorkOrderInvalid(format!(
                "order {order_id} is not executable ({status:?})"
            )));
        }
        order.executed = true;
        order.closed_at = Some(now);
        let who = order.authorized_by.clone().unwrap_or_default();
        let detail = format!("{} {}", order.action_type, order.target);
        self.record(&mut state, now, order_id, "executed", &who, detail);
        info!(%order_id, "work order executed");
        Ok(())
    }

    /// Find a valid order for `action_type` on `target` and mark it executed
    /// in one step, so no two callers can consume the same order.
    ///
    /// `Ok(None)` when `target` is not destructive. Pair with
    /// [`release`](Self::release) if the guarded action then fails.
    pub fn claim(&self, action_type: &str, target: &str) -> Result<Option<Uuid>, KernelError> {
        if !self.is_destructive(target) {
            return Ok(None);
        }
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        let Some(order) = state
            .orders
            .iter_mut()
            .find(|o| o.matches(action_type, target) && o.is_valid(now))
        else {
            return Err(KernelError::AuthorizationRequired {
                action: action_type.to_string(),
                target: target.to_string(),
            });
        };
        order.executed = true;
        order.closed_at = Some(now);
        let id = order.id;
        let who = order.authorized_by.clone().unwrap_or_default();
        self.record(&mut state, now, id, "executed", &who, format!("{action_type} {target}"));
        info!(order_id = %id, action_type, target, "work order claimed");
        Ok(Some(id))
    }

    /// Undo a [`claim`](Self::claim) whose action did not happen. The order
    /// becomes usable again if it has not expired meanwhile.
    pub fn release(&self, order_id: Uuid) -> Result<(), KernelError> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        let Some(order) = state
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.executed && !o.revoked)
        else {
            return Err(KernelError::WorkOrderInvalid(format!(
                "order {order_id} is not claimed"
            )));
        };
        order.executed = false;
        order.closed_at = None;
        self.record(&mut state, now, order_id, "released", "", String::new());
        info!(%order_id, "work order released");
        self.sweep(&mut state, now);
        Ok(())
    }

    /// Revoke a pending or approved order. Only authorized tiers may revoke.
    pub fn revoke(&self, order_id: Uuid, principal: &str) -> Result<(), KernelError> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        let role = state.roles.get(principal).copied().unwrap_or_default();
        if !self.is_authorized_tier(role) {
            let reason = format!("{principal} ({role}) may not revoke orders");
            self.record(&mut state, now, order_id, "revoke_denied", principal, reason.clone());
            warn!(%order_id, principal, "work order revoke denied");
            return Err(KernelError::WorkOrderInvalid(reason));
        }
        let Some(order) = state.orders.iter_mut().find(|o| o.id == order_id) else {
            return Err(KernelError::WorkOrderInvalid(format!("unknown order {order_id}")));
        };
        if order.executed || order.revoked {
            let status = order.status(now);
            return Err(KernelError::WorkOrderInvalid(format!(
                "order {order_id} is already {status:?}"
            )));
        }
        order.revoked = true;
        order.closed_at = Some(now);
        self.record(&mut state, now, order_id, "revoked", principal, String::new());
        info!(%order_id, principal, "work order revoked");
        Ok(())
    }

    /// `Ok(None)` when `target` is not destructive, `Ok(Some(id))` of a valid
    /// order when one exists, else [`KernelError::AuthorizationRequired`].
    pub fn guard(&self, action_type: &str, target: &str) -> Result<Option<Uuid>, KernelError> {
        if !self.is_destructive(target) {
            return Ok(None);
        }
        match self.check_authorization(action_type, target) {
            Some(order) => Ok(Some(order.id)),
            None => Err(KernelError::AuthorizationRequired {
                action: action_type.to_string(),
                target: target.to_string(),
            }),
        }
    }

    // ── introspection ───────────────────────────────────────────────────────

    pub fn get(&self, order_id: Uuid) -> Option<WorkOrder> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        state.orders.iter().find(|o| o.id == order_id).cloned()
    }

    /// Every order, oldest first.
    pub fn orders(&self) -> Vec<WorkOrder> {
        let now = self.clock.utc();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);
        state.orders.clone()
    }

    /// Orders still awaiting approval.
    pub fn pending(&self) -> Vec<WorkOrder> {
        self.orders()
            .into_iter()
            .filter(|o| !o.is_approved() && !o.revoked)
            .collect()
    }

    pub fn audit_trail(&self) -> Vec<AuthorityEvent> {
        self.state.lock().trail.iter().cloned().collect()
    }

    // ── internals ───────────────────────────────────────────────────────────

    /// Mark approved orders past their expiry as revoked, then drop
    /// terminal orders closed longer than the retention window ago.
    fn sweep(&self, state: &mut AuthorityState, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        for o in state.orders.iter_mut() {
            if let Some(exp) = o.expires_at
                && o.is_approved()
                && !o.executed
                && !o.revoked
                && now >= exp
            {
                o.revoked = true;
                o.closed_at = Some(exp);
                expired.push(o.id);
            }
        }
        for id in expired {
            self.record(state, now, id, "expired", "", String::new());
            info!(order_id = %id, "work order expired");
        }

        let retention = self.config.retention();
        let before = state.orders.len();
        state
            .orders
            .retain(|o| o.closed_at.is_none_or(|at| now.signed_duration_since(at) < retention));
        let dropped = before - state.orders.len();
        if dropped > 0 {
            debug!(dropped, "closed work orders swept");
        }
    }

    fn record(
        &self,
        state: &mut AuthorityState,
        at: DateTime<Utc>,
        order_id: Uuid,
        event: &str,
        principal: &str,
        detail: String,
    ) {
        state.trail.push_back(AuthorityEvent {
            at,
            order_id,
            event: event.to_string(),
            principal: principal.to_string(),
            detail,
        });
        while state.trail.len() > self.config.audit_size {
            state.trail.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::io::Write;
    use std::time::Duration;

    fn authority() -> (WorkAuthority, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let auth = WorkAuthority::with_clock(AuthorityConfig::default(), clock.clone()).unwrap();
        auth.assign_role("operator_carol", Role::Operator);
        auth.assign_role("owner_bob", Role::Owner);
        auth.assign_role("creator_alice", Role::Creator);
        (auth, clock)
    }

    // ── classifier ──────────────────────────────────────────────────────────

    #[test]
    fn builtin_patterns_compile_and_classify() {
        let c = DestructiveClassifier::new();
        assert_eq!(c.len(), BUILTIN_PATTERNS.len());
        assert!(c.is_destructive("/devices/arm/firmware"));
        assert!(c.is_destructive("factory reset"));
        assert!(c.is_destructive("rm -rf /memory"));
        assert!(c.is_destructive("/config/safety/limits"));
        assert!(c.is_destructive("/devices/arm/calibration"));
        assert!(!c.is_destructive("/devices/motor/cmd"));
        assert!(!c.is_destructive("/config/safetynet"));
    }

    #[test]
    fn invalid_pattern_is_rejected_atomically() {
        let mut c = DestructiveClassifier::empty();
        let err = c.load_patterns(["^/ok$", "([unclosed"]).unwrap_err();
        assert!(matches!(err, KernelError::InvalidPattern(_)));
        assert!(c.is_empty());
    }

    #[test]
    fn patterns_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# site-specific").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "^/memory/episodic$").unwrap();
        writeln!(file, "  (?i)purge  ").unwrap();
        let mut c = DestructiveClassifier::empty();
        assert_eq!(c.load_patterns_from_file(file.path()).unwrap(), 2);
        assert!(c.is_destructive("/memory/episodic"));
        assert_eq!(c.matching("PURGE cache"), Some("(?i)purge"));
    }

    #[test]
    fn missing_pattern_file_is_config_error() {
        let mut c = DestructiveClassifier::empty();
        let err = c
            .load_patterns_from_file(Path::new("/nonexistent/patterns.txt"))
            .unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    // ── approval rules ──────────────────────────────────────────────────────

    #[test]
    fn creator_only_order_scenario() {
        let (auth, _) = authority();
        let id = auth.request_authorization("write", "/devices/arm/firmware", "operator_carol", Role::Creator);

        assert!(matches!(
            auth.approve(id, "owner_bob"),
            Err(KernelError::WorkOrderInvalid(_))
        ));
        assert!(auth.check_authorization("write", "/devices/arm/firmware").is_none());

        auth.approve(id, "creator_alice").unwrap();
        let order = auth.get(id).unwrap();
        assert!(order.is_valid(auth.clock.utc()));
        assert_eq!(order.authorized_by.as_deref(), Some("creator_alice"));
    }

    #[test]
    fn self_approval_always_fails() {
        let (auth, _) = authority();
        let id = auth.request_authorization("unlink", "/memory", "creator_alice", Role::Owner);
        let err = auth.approve(id, "creator_alice").unwrap_err();
        assert!(err.to_string().contains("own order"));
    }

    #[test]
    fn unauthorized_tier_cannot_approve() {
        let (auth, _) = authority();
        auth.assign_role("admin_dan", Role::Admin);
        let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Guest);
        assert!(auth.approve(id, "admin_dan").is_err());
        assert!(auth.approve(id, "stranger").is_err());
        assert!(auth.approve(id, "owner_bob").is_ok());
    }

    #[test]
    fn double_approval_and_unknown_order_fail() {
        let (auth, _) = authority();
        let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        auth.approve(id, "owner_bob").unwrap();
        assert!(auth.approve(id, "creator_alice").is_err());
        assert!(auth.approve(Uuid::new_v4(), "creator_alice").is_err());
    }

    #[test]
    fn role_of_unknown_is_guest() {
        let (auth, _) = authority();
        assert_eq!(auth.role_of("nobody"), Role::Guest);
        assert_eq!(auth.role_of("owner_bob"), Role::Owner);
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    #[test]
    fn mark_executed_is_single_use() {
        let (auth, _) = authority();
        let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        assert!(auth.mark_executed(id).is_err(), "pending orders are not executable");
        auth.approve(id, "owner_bob").unwrap();
        auth.mark_executed(id).unwrap();
        assert!(auth.mark_executed(id).is_err());
        assert!(auth.check_authorization("write", "firmware").is_none());
        assert_eq!(auth.get(id).unwrap().status(auth.clock.utc()), OrderStatus::Executed);
    }

    #[test]
    fn approval_expires_lazily() {
        let (auth, clock) = authority();
        let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        auth.approve(id, "owner_bob").unwrap();
        clock.advance(Duration::from_secs(3599));
        assert!(auth.check_authorization("write", "firmware").is_some());
        clock.advance(Duration::from_secs(2));
        assert!(auth.check_authorization("write", "firmware").is_none());
        let order = auth.get(id).unwrap();
        assert!(order.revoked);
        assert!(auth.audit_trail().iter().any(|e| e.event == "expired"));
    }

    #[test]
    fn revoke_requires_authorized_tier() {
        let (auth, _) = authority();
        let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        auth.approve(id, "creator_alice").unwrap();
        assert!(auth.revoke(id, "operator_carol").is_err());
        auth.revoke(id, "owner_bob").unwrap();
        assert!(auth.check_authorization("write", "firmware").is_none());
        assert!(auth.revoke(id, "owner_bob").is_err());
    }

    #[test]
    fn pending_lists_unapproved_only() {
        let (auth, _) = authority();
        let a = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        let b = auth.request_authorization("unlink", "/memory/x", "operator_carol", Role::Owner);
        auth.approve(a, "owner_bob").unwrap();
        let pending: Vec<Uuid> = auth.pending().iter().map(|o| o.id).collect();
        assert_eq!(pending, vec![b]);
        assert_eq!(auth.orders().len(), 2);
    }

    #[test]
    fn guard_passes_harmless_targets() {
        let (auth, _) = authority();
        assert_eq!(auth.guard("write", "/devices/motor/cmd").unwrap(), None);
        assert!(matches!(
            auth.guard("write", "/devices/arm/firmware"),
            Err(KernelError::AuthorizationRequired { .. })
        ));
        let id = auth.request_authorization("write", "/devices/arm/firmware", "operator_carol", Role::Owner);
        auth.approve(id, "owner_bob").unwrap();
        assert_eq!(auth.guard("write", "/devices/arm/firmware").unwrap(), Some(id));
        assert!(auth.guard("unlink", "/devices/arm/firmware").is_err());
    }

    #[test]
    fn claim_consumes_order_exactly_once() {
        let (auth, _) = authority();
        let target = "/devices/arm/calibration";
        assert_eq!(auth.claim("write", "/devices/motor/cmd").unwrap(), None);
        assert!(matches!(
            auth.claim("write", target),
            Err(KernelError::AuthorizationRequired { .. })
        ));

        let id = auth.request_authorization("write", target, "operator_carol", Role::Owner);
        auth.approve(id, "owner_bob").unwrap();
        assert_eq!(auth.claim("write", target).unwrap(), Some(id));
        assert!(auth.claim("write", target).is_err());
        assert!(auth.get(id).unwrap().executed);

        auth.release(id).unwrap();
        assert_eq!(auth.claim("write", target).unwrap(), Some(id));
        assert!(auth.audit_trail().iter().any(|e| e.event == "released"));
    }

    #[test]
    fn release_of_unclaimed_order_fails() {
        let (auth, _) = authority();
        let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        assert!(matches!(auth.release(id), Err(KernelError::WorkOrderInvalid(_))));
        auth.approve(id, "owner_bob").unwrap();
        assert!(auth.release(id).is_err());
    }

    #[test]
    fn concurrent_claims_share_one_order() {
        use std::sync::Barrier;

        for _ in 0..50 {
            let (auth, _) = authority();
            let auth = Arc::new(auth);
            let id = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
            auth.approve(id, "owner_bob").unwrap();

            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let auth = Arc::clone(&auth);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        auth.claim("write", "firmware").is_ok()
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn sweep_drops_closed_orders_after_retention() {
        let (auth, clock) = authority();
        for i in 0..100 {
            let id = auth.request_authorization("write", &format!("firmware/{i}"), "operator_carol", Role::Owner);
            auth.approve(id, "owner_bob").unwrap();
        }
        let executed = auth.request_authorization("write", "firmware", "operator_carol", Role::Owner);
        auth.approve(executed, "owner_bob").unwrap();
        auth.mark_executed(executed).unwrap();
        let waiting = auth.request_authorization("unlink", "/memory", "operator_carol", Role::Owner);
        assert_eq!(auth.orders().len(), 102);

        // Expired at 1 h, still inside the 10 min retention window.
        clock.advance(Duration::from_secs(3601));
        assert_eq!(auth.orders().len(), 102);
        assert!(auth.get(executed).is_none());

        clock.advance(Duration::from_secs(3600));
        let left: Vec<Uuid> = auth.orders().iter().map(|o| o.id).collect();
        assert_eq!(left, vec![waiting]);
        assert!(auth.audit_trail().iter().any(|e| e.event == "expired"));
    }

    #[test]
    fn audit_trail_is_capped() {
        let clock = Arc::new(ManualClock::new());
        let config = AuthorityConfig {
            audit_size: 3,
            ..AuthorityConfig::default()
        };
        let auth = WorkAuthority::with_clock(config, clock).unwrap();
        for i in 0..5 {
            auth.request_authorization("write", &format!("t{i}"), "p", Role::Owner);
        }
        let trail = auth.audit_trail();
        assert_eq!(trail.len(), 3);
        assert!(trail[0].detail.contains("t2"));
    }

    #[test]
    fn configured_patterns_extend_builtins() {
        let config = AuthorityConfig {
            destructive_patterns: vec!["^/memory/".into()],
            ..AuthorityConfig::default()
        };
        let auth = WorkAuthority::new(config).unwrap();
        assert!(auth.is_destructive("/memory/semantic"));
        assert!(auth.is_destructive("firmware"));

        let bad = AuthorityConfig {
            destructive_patterns: vec!["(".into()],
            ..AuthorityConfig::default()
        };
        assert!(WorkAuthority::new(bad.clone()).is_err());
        assert!(matches!(bad.validate(), Err(KernelError::Config(_))));
    }
}
