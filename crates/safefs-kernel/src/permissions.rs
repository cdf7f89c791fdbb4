//! [`PermissionTable`] – path access lists plus principal capabilities.
//!
//! Two independent checks guard every path operation:
//!
//! 1. **Access list**: the [`AccessEntry`] governing the path must give the
//!    principal the requested [`Access`] bit. The governing entry is the one
//!    registered at the exact path, or failing that at the longest registered
//!    ancestor. No entry at all means deny.
//! 2. **Capabilities**: the principal's held [`Capability`] set must contain
//!    every capability the governing entry requires for that kind of access.
//!    Reads check `required_read`; writes and execution check
//!    `required_write`.
//!
//! Root-equivalent principals skip both. A failed check is a silent `false`
//! from [`PermissionTable::check_access`]; callers that want an error use
//! [`PermissionTable::check`].
//!
//! # Example
//!
//! ```
//! use safefs_kernel::permissions::PermissionTable;
//! use safefs_types::{Access, Capability};
//!
//! let mut table = PermissionTable::new();
//! table.set_acl("/devices/motor", "agent", Access::READ | Access::WRITE).unwrap();
//! table.require("/devices/motor", Capability::MOTOR_WRITE).unwrap();
//!
//! // The access bit alone is not enough.
//! assert!(!table.check_access("agent", "/devices/motor/cmd", Access::WRITE));
//!
//! table.grant("agent", Capability::MOTOR_WRITE);
//! assert!(table.check_access("agent", "/devices/motor/cmd", Access::WRITE));
//! assert!(table.check_access("root", "/anything/at/all", Access::EXECUTE));
//!
//! // Write-only requirements leave reads alone.
//! table.set_acl("/config", "agent", Access::READ | Access::WRITE).unwrap();
//! table.require_write("/config", Capability::CONFIG_WRITE).unwrap();
//! assert!(table.check_access("agent", "/config/prompt", Access::READ));
//! assert!(!table.check_access("agent", "/config/prompt", Access::WRITE));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use safefs_types::{Access, Capability, KernelError, principal};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::path;

// ────────────────────────────────────────────────────────────────────────────
// Default grants
// ────────────────────────────────────────────────────────────────────────────

/// Built-in capabilities of the reasoning agent.
pub const AGENT_GRANTS: Capability = Capability::MOTOR_WRITE
    .union(Capability::ESTOP)
    .union(Capability::MEMORY_READ)
    .union(Capability::MEMORY_WRITE)
    .union(Capability::CHANNEL_SEND)
    .union(Capability::CONTEXT_WRITE)
    .union(Capability::DEVICE_ACCESS);

/// Built-in capabilities of hardware drivers.
pub const DRIVER_GRANTS: Capability = Capability::MOTOR_WRITE
    .union(Capability::ESTOP)
    .union(Capability::DEVICE_ACCESS);

/// Built-in capabilities of the REST gateway.
pub const GATEWAY_GRANTS: Capability = Capability::MOTOR_WRITE
    .union(Capability::ESTOP)
    .union(Capability::MEMORY_READ)
    .union(Capability::CHANNEL_SEND)
    .union(Capability::DEVICE_ACCESS)
    .union(Capability::PROVIDER_SWITCH);

/// Built-in capabilities of messaging channels.
pub const CHANNEL_GRANTS: Capability = Capability::CHANNEL_SEND
    .union(Capability::MEMORY_READ)
    .union(Capability::DEVICE_ACCESS);

// ────────────────────────────────────────────────────────────────────────────
// AccessEntry
// ────────────────────────────────────────────────────────────────────────────

/// Access list registered at one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    /// Principal → permitted bits. Unknown principals get nothing.
    pub modes: BTreeMap<String, Access>,
    /// Capabilities a reader must hold on top of the access bit.
    #[serde(default)]
    pub required_read: Capability,
    /// Capabilities a writer or executor must hold on top of the access bit.
    #[serde(default)]
    pub required_write: Capability,
}

impl AccessEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: give `principal` the bits parsed from `mode` (e.g. `"rw"`).
    ///
    /// Unparsable modes grant nothing.
    #[must_use]
    pub fn allow(mut self, principal: &str, mode: &str) -> Self {
        self.modes.insert(
            principal.to_string(),
            Access::from_mode(mode).unwrap_or(Access::empty()),
        );
        self
    }

    /// Builder: require `caps` for every kind of access.
    #[must_use]
    pub fn requiring(self, caps: Capability) -> Self {
        self.requiring_read(caps).requiring_write(caps)
    }

    #[must_use]
    pub fn requiring_read(mut self, caps: Capability) -> Self {
        self.required_read |= caps;
        self
    }

    /// Builder: require `caps` for writes and execution only.
    #[must_use]
    pub fn requiring_write(mut self, caps: Capability) -> Self {
        self.required_write |= caps;
        self
    }

    /// Capabilities needed for `access`. Mixed bits need both sets.
    pub fn required_for(&self, access: Access) -> Capability {
        let mut caps = Capability::empty();
        if access.contains(Access::READ) {
            caps |= self.required_read;
        }
        if access.intersects(Access::WRITE | Access::EXECUTE) {
            caps |= self.required_write;
        }
        caps
    }

    /// Bits held by `principal`; empty when unlisted.
    pub fn mode_for(&self, principal: &str) -> Access {
        self.modes.get(principal).copied().unwrap_or(Access::empty())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PermissionTable
// ────────────────────────────────────────────────────────────────────────────

/// Path → [`AccessEntry`] plus principal → [`Capability`].
#[derive(Debug, Clone)]
pub struct PermissionTable {
    entries: BTreeMap<String, AccessEntry>,
    grants: HashMap<String, Capability>,
    root_principals: BTreeSet<String>,
}

impl Default for PermissionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionTable {
    /// An empty table. Only `root` passes anything.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            grants: HashMap::new(),
            root_principals: BTreeSet::from([principal::ROOT.to_string()]),
        }
    }

    /// The built-in policy for the four standard principals over the
    /// conventional subtrees.
    pub fn with_defaults() -> Self {
        use principal::{AGENT, CHANNEL, DRIVER, GATEWAY};

        let mut table = Self::new();
        let defaults = [
            (
                "/devices",
                AccessEntry::new()
                    .allow(AGENT, "r")
                    .allow(DRIVER, "r")
                    .allow(GATEWAY, "r"),
            ),
            (
                "/devices/motor",
                AccessEntry::new()
                    .allow(AGENT, "rw")
                    .allow(DRIVER, "rwx")
                    .allow(GATEWAY, "rw")
                    .requiring(Capability::MOTOR_WRITE),
            ),
            (
                "/devices/arm",
                AccessEntry::new()
                    .allow(AGENT, "rw")
                    .allow(DRIVER, "rwx")
                    .requiring(Capability::MOTOR_WRITE),
            ),
            (
                "/devices/camera",
                AccessEntry::new()
                    .allow(AGENT, "r")
                    .allow(DRIVER, "rw")
                    .allow(GATEWAY, "r")
                    .requiring(Capability::DEVICE_ACCESS),
            ),
            (
                "/devices/speaker",
                AccessEntry::new()
                    .allow(AGENT, "rw")
                    .allow(DRIVER, "rw")
                    .allow(CHANNEL, "w")
                    .requiring(Capability::DEVICE_ACCESS),
            ),
            (
                "/config",
                AccessEntry::new()
                    .allow(AGENT, "r")
                    .allow(DRIVER, "r")
                    .allow(GATEWAY, "r")
                    .requiring_write(Capability::CONFIG_WRITE),
            ),
            (
                "/config/provider",
                AccessEntry::new()
                    .allow(AGENT, "r")
                    .allow(DRIVER, "r")
                    .allow(GATEWAY, "rw")
                    .requiring_write(Capability::PROVIDER_SWITCH),
            ),
            (
                "/config/safety",
                AccessEntry::new()
                    .allow(AGENT, "r")
                    .allow(GATEWAY, "r")
                    .requiring_write(Capability::CONFIG_WRITE),
            ),
            (
                "/logs",
                AccessEntry::new().allow(AGENT, "r").allow(GATEWAY, "r"),
            ),
            (
                "/memory",
                AccessEntry::new()
                    .allow(AGENT, "rw")
                    .allow(GATEWAY, "r")
                    .allow(CHANNEL, "r")
                    .requiring_read(Capability::MEMORY_READ)
                    .requiring_write(Capability::MEMORY_WRITE),
            ),
            (
                "/context",
                AccessEntry::new()
                    .allow(AGENT, "rw")
                    .requiring_write(Capability::CONTEXT_WRITE),
            ),
            (
                "/channels",
                AccessEntry::new()
                    .allow(AGENT, "rw")
                    .allow(GATEWAY, "rw")
                    .allow(CHANNEL, "rw")
                    .requiring(Capability::CHANNEL_SEND),
            ),
            (
                "/proc",
                AccessEntry::new()
                    .allow(AGENT, "r")
                    .allow(DRIVER, "r")
                    .allow(GATEWAY, "r")
                    .allow(CHANNEL, "r"),
            ),
        ];
        for (p, entry) in defaults {
            table.entries.insert(p.to_string(), entry);
        }

        table.grant(AGENT, AGENT_GRANTS);
        table.grant(DRIVER, DRIVER_GRANTS);
        table.grant(GATEWAY, GATEWAY_GRANTS);
        table.grant(CHANNEL, CHANNEL_GRANTS);
        table
    }

    /// `true` for principals that bypass every check.
    pub fn is_root(&self, principal: &str) -> bool {
        self.root_principals.contains(principal)
    }

    /// Make `principal` root-equivalent.
    pub fn add_root(&mut self, principal: &str) {
        self.root_principals.insert(principal.to_string());
    }

    /// Set `principal`'s bits at `path`, creating the entry if needed.
    pub fn set_acl(&mut self, path: &str, principal: &str, access: Access) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        self.entries
            .entry(path)
            .or_default()
            .modes
            .insert(principal.to_string(), access);
        Ok(())
    }

    /// Add `caps` to the capabilities required for any access at `path`.
    pub fn require(&mut self, path: &str, caps: Capability) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        let entry = self.entries.entry(path).or_default();
        entry.required_read |= caps;
        entry.required_write |= caps;
        Ok(())
    }

    /// Add `caps` to the capabilities required for writes at `path`.
    pub fn require_write(&mut self, path: &str, caps: Capability) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        self.entries.entry(path).or_default().required_write |= caps;
        Ok(())
    }

    /// Replace the whole entry at `path`.
    pub fn set_entry(&mut self, path: &str, entry: AccessEntry) -> Result<(), KernelError> {
        let path = path::normalize(path)?;
        self.entries.insert(path, entry);
        Ok(())
    }

    /// Drop the entry registered exactly at `path`.
    pub fn remove_entry(&mut self, path: &str) -> Result<Option<AccessEntry>, KernelError> {
        let path = path::normalize(path)?;
        Ok(self.entries.remove(&path))
    }

    /// The entry governing `path` and the path it is registered at: exact
    /// match first, then the longest registered ancestor.
    pub fn resolve(&self, path: &str) -> Option<(&str, &AccessEntry)> {
        let normalized = path::normalize(path).ok()?;
        let mut candidate = normalized.as_str();
        loop {
            if let Some((key, entry)) = self.entries.get_key_value(candidate) {
                return Some((key.as_str(), entry));
            }
            candidate = path::parent(candidate)?;
        }
    }

    /// Add `caps` to `principal`'s held set.
    pub fn grant(&mut self, principal: &str, caps: Capability) {
        *self.grants.entry(principal.to_string()).or_default() |= caps;
    }

    /// Remove `caps` from `principal`'s held set. No-ops for unknown principals.
    pub fn revoke(&mut self, principal: &str, caps: Capability) {
        if let Some(held) = self.grants.get_mut(principal) {
            held.remove(caps);
        }
    }

    /// Capabilities held by `principal`; root holds all.
    pub fn capabilities(&self, principal: &str) -> Capability {
        if self.is_root(principal) {
            return Capability::all();
        }
        self.grants.get(principal).copied().unwrap_or(Capability::empty())
    }

    /// `true` when `principal` holds every flag in `caps` (root always does).
    pub fn holds(&self, principal: &str, caps: Capability) -> bool {
        self.capabilities(principal).contains(caps)
    }

    /// `true` when `principal` may perform `access` on `path`.
    pub fn check_access(&self, principal: &str, path: &str, access: Access) -> bool {
        if self.is_root(principal) {
            return true;
        }
        let Some((_, entry)) = self.resolve(path) else {
            return false;
        };
        entry.mode_for(principal).contains(access)
            && self.holds(principal, entry.required_for(access))
    }

    /// Like [`check_access`](Self::check_access) but returns
    /// [`KernelError::PermissionDenied`] on deny.
    pub fn check(&self, principal: &str, path: &str, access: Access) -> Result<(), KernelError> {
        if self.check_access(principal, path, access) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied {
                principal: principal.to_string(),
                path: path.to_string(),
                access,
            })
        }
    }

    /// Principal → capability names, sorted by principal.
    pub fn capability_dump(&self) -> Value {
        let sorted: BTreeMap<&str, Vec<&str>> = self
            .grants
            .iter()
            .map(|(p, caps)| (p.as_str(), caps.names()))
            .collect();
        json!(sorted)
    }

    /// Path → { principal → mode string, required → { read, write } names }.
    pub fn acl_dump(&self) -> Value {
        let entries: BTreeMap<&str, Value> = self
            .entries
            .iter()
            .map(|(p, entry)| {
                let modes: BTreeMap<&str, String> = entry
                    .modes
                    .iter()
                    .map(|(who, access)| (who.as_str(), access.to_string()))
                    .collect();
                let required = json!({
                    "read": entry.required_read.names(),
                    "write": entry.required_write.names(),
                });
                (p.as_str(), json!({ "modes": modes, "required": required }))
            })
            .collect();
        json!(entries)
    }
}
