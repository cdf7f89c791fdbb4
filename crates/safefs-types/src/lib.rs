use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Capability-based security model: path-independent permission bits that
    /// gate whole classes of dangerous operations.
    ///
    /// A principal's held set is independent of any path's access list; an
    /// operation must pass both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capability: u16 {
        /// Command motors under `/devices/motor` and `/devices/arm`.
        const MOTOR_WRITE     = 1 << 0;
        /// Latch the global emergency stop.
        const ESTOP           = 1 << 1;
        /// Change runtime configuration.
        const CONFIG_WRITE    = 1 << 2;
        const MEMORY_READ     = 1 << 3;
        const MEMORY_WRITE    = 1 << 4;
        /// Send on messaging channels.
        const CHANNEL_SEND    = 1 << 5;
        /// Switch the active LLM provider.
        const PROVIDER_SWITCH = 1 << 6;
        /// Clear the emergency stop and bypass safety policy.
        const SAFETY_OVERRIDE = 1 << 7;
        /// Open non-motor devices (camera, speaker).
        const DEVICE_ACCESS   = 1 << 8;
        const CONTEXT_WRITE   = 1 << 9;
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::empty()
    }
}

impl Capability {
    /// Names of every flag set in `self`, in declaration order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }

    /// Parse a capability name, case-insensitively. `"all"` yields every flag.
    ///
    /// ```
    /// use safefs_types::Capability;
    ///
    /// assert_eq!(Capability::parse("motor_write"), Some(Capability::MOTOR_WRITE));
    /// assert_eq!(Capability::parse("ESTOP"), Some(Capability::ESTOP));
    /// assert_eq!(Capability::parse("teleport"), None);
    /// ```
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.trim().to_uppercase();
        if upper == "ALL" {
            return Some(Self::all());
        }
        Self::from_name(&upper)
    }
}

bitflags! {
    /// Read/write/execute bits of a per-principal access-control entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Access: u8 {
        const READ    = 0b100;
        const WRITE   = 0b010;
        const EXECUTE = 0b001;
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::empty()
    }
}

impl Access {
    /// Parse an `ls -l` style mode string such as `"rw-"` or `"rx"`.
    ///
    /// Any character other than `r`, `w`, `x` or `-` is rejected.
    #[must_use]
    pub fn from_mode(mode: &str) -> Option<Self> {
        let mut access = Self::empty();
        for c in mode.chars() {
            match c {
                'r' => access |= Self::READ,
                'w' => access |= Self::WRITE,
                'x' => access |= Self::EXECUTE,
                '-' => {}
                _ => return None,
            }
        }
        Some(access)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag: Access, c: char| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            bit(Access::READ, 'r'),
            bit(Access::WRITE, 'w'),
            bit(Access::EXECUTE, 'x')
        )
    }
}

/// Well-known principal identities understood by the default policy.
///
/// The set is open-ended; these carry built-in access lists and grants.
pub mod principal {
    /// Superuser: bypasses every access-list and capability check.
    pub const ROOT: &str = "root";
    /// The AI reasoning agent.
    pub const AGENT: &str = "agent";
    /// Hardware drivers.
    pub const DRIVER: &str = "driver";
    /// The REST gateway.
    pub const GATEWAY: &str = "gateway";
    /// Messaging channels.
    pub const CHANNEL: &str = "channel";

    /// The four standard, non-root principals.
    pub const STANDARD: [&str; 4] = [AGENT, DRIVER, GATEWAY, CHANNEL];
}

/// Ordered authorization tier of an external user.
///
/// Tiers map onto capability sets by [`Role::capabilities`]; a higher tier
/// always holds everything a lower tier holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    User,
    Operator,
    Admin,
    Owner,
    Creator,
}

impl Role {
    /// Every tier, lowest first.
    pub const ALL: [Role; 6] = [
        Role::Guest,
        Role::User,
        Role::Operator,
        Role::Admin,
        Role::Owner,
        Role::Creator,
    ];

    /// Capability union granted at this tier.
    ///
    /// ```
    /// use safefs_types::{Capability, Role};
    ///
    /// assert!(!Role::User.capabilities().contains(Capability::MOTOR_WRITE));
    /// assert!(Role::Operator.capabilities().contains(Capability::MOTOR_WRITE));
    /// assert_eq!(Role::Creator.capabilities(), Capability::all());
    /// ```
    #[must_use]
    pub fn capabilities(self) -> Capability {
        let guest = Capability::MEMORY_READ;
        let user = guest | Capability::CHANNEL_SEND | Capability::CONTEXT_WRITE;
        let operator = user
            | Capability::MEMORY_WRITE
            | Capability::DEVICE_ACCESS
            | Capability::MOTOR_WRITE
            | Capability::ESTOP;
        let admin = operator | Capability::CONFIG_WRITE | Capability::PROVIDER_SWITCH;
        let owner = admin | Capability::SAFETY_OVERRIDE;
        match self {
            Role::Guest => guest,
            Role::User => user,
            Role::Operator => operator,
            Role::Admin => admin,
            Role::Owner => owner,
            Role::Creator => Capability::all(),
        }
    }

    /// Parse a lowercase or mixed-case tier name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "guest" => Some(Role::Guest),
            "user" => Some(Role::User),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            "owner" => Some(Role::Owner),
            "creator" => Some(Role::Creator),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Guest => "guest",
            Role::User => "user",
            Role::Operator => "operator",
            Role::Admin => "admin",
            Role::Owner => "owner",
            Role::Creator => "creator",
        };
        f.write_str(name)
    }
}

/// Per-joint command inside an [`ActionRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JointCommand {
    /// Target position (rad or m).
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub velocity: Option<f64>,
    #[serde(default)]
    pub torque: Option<f64>,
}

/// Physical action payload validated by the bounds checker before any
/// motor or arm write is committed.
///
/// Every field is optional; only the present ones are checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionRecord {
    /// End-effector target `[x, y, z]`.
    #[serde(default)]
    pub position: Option<[f64; 3]>,
    /// Joint id → command.
    #[serde(default)]
    pub joints: Option<BTreeMap<String, JointCommand>>,
    /// End-effector force (N).
    #[serde(default)]
    pub force: Option<f64>,
    #[serde(default)]
    pub contact_force: Option<f64>,
    #[serde(default)]
    pub gripper_force: Option<f64>,
}

impl ActionRecord {
    /// `true` when the record carries nothing the bounds checker can check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.joints.as_ref().is_none_or(BTreeMap::is_empty)
            && self.force.is_none()
            && self.contact_force.is_none()
            && self.gripper_force.is_none()
    }
}

/// JSON schema of [`ActionRecord`], handed to agents that compose actions.
#[must_use]
pub fn action_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(ActionRecord)
}

/// Error type for every kernel operation.
///
/// Denials are ordinary values of this type: callers match on the variant to
/// learn which check refused the request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Permission denied: {principal} may not {access} {path}")]
    PermissionDenied {
        principal: String,
        path: String,
        access: Access,
    },

    #[error("Principal {principal} is locked out for another {remaining_ms} ms")]
    Lockout { principal: String, remaining_ms: u64 },

    #[error("Emergency stop active: write to {path} refused")]
    EstopActive { path: String },

    #[error("Rate limited: {path} exceeds {rate_hz} Hz")]
    RateLimited { path: String, rate_hz: f64 },

    #[error("Bounds violation on {path}: {detail}")]
    BoundsViolation { path: String, detail: String },

    #[error("Work order invalid: {0}")]
    WorkOrderInvalid(String),

    #[error("Authorization required for {action} on {target}")]
    AuthorizationRequired { action: String, target: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Type conflict at {path}: {detail}")]
    TypeConflict { path: String, detail: String },

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Read-only path: {0}")]
    ReadOnly(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KernelError {
    /// Short machine-readable label, used in audit entries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::PermissionDenied { .. } => "permission_denied",
            KernelError::Lockout { .. } => "lockout",
            KernelError::EstopActive { .. } => "estop_active",
            KernelError::RateLimited { .. } => "rate_limited",
            KernelError::BoundsViolation { .. } => "bounds_violation",
            KernelError::WorkOrderInvalid(_) => "work_order_invalid",
            KernelError::AuthorizationRequired { .. } => "authorization_required",
            KernelError::InvalidPath(_) => "invalid_path",
            KernelError::TypeConflict { .. } => "type_conflict",
            KernelError::NotEmpty(_) => "not_empty",
            KernelError::ReadOnly(_) => "read_only",
            KernelError::InvalidPattern(_) => "invalid_pattern",
            KernelError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_serialization_roundtrip() {
        let caps = Capability::MOTOR_WRITE | Capability::ESTOP;
        let json = serde_json::to_string(&caps).unwrap();
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(caps, back);
    }

    #[test]
    fn capability_names_follow_declaration_order() {
        let caps = Capability::DEVICE_ACCESS | Capability::MOTOR_WRITE;
        assert_eq!(caps.names(), vec!["MOTOR_WRITE", "DEVICE_ACCESS"]);
        assert!(Capability::empty().names().is_empty());
    }

    #[test]
    fn capability_parse_accepts_all() {
        assert_eq!(Capability::parse("all"), Some(Capability::all()));
        assert_eq!(
            Capability::parse(" safety_override "),
            Some(Capability::SAFETY_OVERRIDE)
        );
    }

    #[test]
    fn access_mode_strings() {
        assert_eq!(Access::from_mode("rw-"), Some(Access::READ | Access::WRITE));
        assert_eq!(Access::from_mode("x"), Some(Access::EXECUTE));
        assert_eq!(Access::from_mode("rwz"), None);
        assert_eq!((Access::READ | Access::EXECUTE).to_string(), "r-x");
        assert_eq!(Access::empty().to_string(), "---");
    }

    #[test]
    fn role_capabilities_are_monotonic() {
        for pair in Role::ALL.windows(2) {
            let (lower, higher) = (pair[0], pair[1]);
            assert!(lower < higher);
            assert!(
                higher.capabilities().contains(lower.capabilities()),
                "{higher} must hold everything {lower} holds"
            );
        }
    }

    #[test]
    fn role_parse_and_display_agree() {
        for role in Role::ALL {
            assert_eq!(Role::parse(&role.to_string()), Some(role));
        }
        assert_eq!(Role::parse("CREATOR"), Some(Role::Creator));
        assert_eq!(Role::parse("janitor"), None);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Owner).unwrap();
        assert_eq!(json, "\"owner\"");
    }

    #[test]
    fn action_record_decodes_partial_payload() {
        let action: ActionRecord = serde_json::from_str(
            r#"{"position": [0.1, 0.2, 0.3], "joints": {"j1": {"velocity": 0.5}}, "note": "x"}"#,
        )
        .unwrap();
        assert_eq!(action.position, Some([0.1, 0.2, 0.3]));
        assert_eq!(action.joints.unwrap()["j1"].velocity, Some(0.5));
        assert!(action.force.is_none());
    }

    #[test]
    fn empty_action_record() {
        assert!(ActionRecord::default().is_empty());
        let with_empty_joints = ActionRecord {
            joints: Some(BTreeMap::new()),
            ..ActionRecord::default()
        };
        assert!(with_empty_joints.is_empty());
        let with_force = ActionRecord {
            force: Some(1.0),
            ..ActionRecord::default()
        };
        assert!(!with_force.is_empty());
    }

    #[test]
    fn action_schema_lists_fields() {
        let schema = serde_json::to_string(&action_schema()).unwrap();
        assert!(schema.contains("position"));
        assert!(schema.contains("gripper_force"));
    }

    #[test]
    fn kernel_error_display() {
        let err = KernelError::PermissionDenied {
            principal: "agent".into(),
            path: "/config/safety/limits".into(),
            access: Access::WRITE,
        };
        let msg = err.to_string();
        assert!(msg.contains("agent"));
        assert!(msg.contains("-w-"));
        assert_eq!(err.kind(), "permission_denied");

        let err = KernelError::EstopActive {
            path: "/devices/motor/cmd".into(),
        };
        assert!(err.to_string().contains("Emergency stop"));
    }
}
