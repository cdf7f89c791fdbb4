//! [`BoundsChecker`] – physical limits for motion and force.
//!
//! Before a motor or arm command is committed, its decoded [`ActionRecord`]
//! goes through [`BoundsChecker::check_action`]. Every applicable check
//! yields a [`BoundsResult`]: a tri-state [`BoundsStatus`] plus a signed
//! margin to the nearest limit. Results are combined by keeping the worst
//! status, ties broken by the smallest margin.
//!
//! Three built-in families of limits are provided:
//! - **Workspace**: an allowed envelope (sphere and/or axis-aligned box) the
//!   end effector must stay inside, and forbidden zones it must stay out of.
//! - **Joints**: per-joint position range, velocity ceiling and torque
//!   ceiling.
//! - **Force**: end-effector, contact and gripper force ceilings. While a
//!   human is nearby the end-effector ceiling drops to a tighter value.
//!
//! Custom limits plug in through the [`Constraint`] trait.
//!
//! # Example
//!
//! ```
//! use safefs_kernel::bounds::{BoundsChecker, BoundsConfig, BoundsStatus, Sphere, Vec3, Workspace};
//!
//! let config = BoundsConfig {
//!     workspace: Some(Workspace {
//!         sphere: Some(Sphere { center: Vec3::ZERO, radius: 0.8 }),
//!         ..Workspace::default()
//!     }),
//!     ..BoundsConfig::default()
//! };
//! let checker = BoundsChecker::new(config);
//!
//! assert_eq!(checker.check_position(0.3, 0.3, 0.3).status, BoundsStatus::Ok);
//! assert_eq!(checker.check_position(0.78, 0.0, 0.0).status, BoundsStatus::Warning);
//! assert_eq!(checker.check_position(1.0, 0.0, 0.0).status, BoundsStatus::Violation);
//! ```

use std::collections::BTreeMap;
use std::f64::consts::{PI, TAU};
use std::fmt;

use safefs_types::{ActionRecord, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Default width of the warning band inside a workspace surface.
pub const DEFAULT_MARGIN: f64 = 0.05;
/// Fraction of a joint's position range that counts as "near the limit".
pub const JOINT_POSITION_WARNING: f64 = 0.05;
/// Fraction of a velocity or torque ceiling that counts as "near the limit".
pub const JOINT_RATE_WARNING: f64 = 0.10;

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

/// Outcome severity, ordered `Ok < Warning < Violation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsStatus {
    Ok,
    /// Within limits but close; log, do not block.
    Warning,
    /// Outside limits; the physical action must not happen.
    Violation,
}

impl fmt::Display for BoundsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoundsStatus::Ok => "ok",
            BoundsStatus::Warning => "warning",
            BoundsStatus::Violation => "violation",
        })
    }
}

/// Result of one or more checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsResult {
    pub status: BoundsStatus,
    /// Distance to the nearest limit; negative only when violated.
    pub margin: f64,
    /// Which check produced this result and why.
    pub detail: String,
}

impl BoundsResult {
    /// Nothing applicable: ok with an infinite margin.
    pub fn ok() -> Self {
        Self::with(BoundsStatus::Ok, f64::INFINITY, "no applicable limits")
    }

    fn with(status: BoundsStatus, margin: f64, detail: impl Into<String>) -> Self {
        Self {
            status,
            margin,
            detail: detail.into(),
        }
    }

    pub fn warning(margin: f64, detail: impl Into<String>) -> Self {
        Self::with(BoundsStatus::Warning, margin, detail)
    }

    pub fn violation(margin: f64, detail: impl Into<String>) -> Self {
        Self::with(BoundsStatus::Violation, margin, detail)
    }

    /// `true` when the downstream action must be blocked.
    pub fn is_violation(&self) -> bool {
        self.status == BoundsStatus::Violation
    }

    /// Worst status wins; equal statuses keep the smaller margin.
    /// An empty input is [`BoundsResult::ok`].
    pub fn combine<I>(results: I) -> Self
    where
        I: IntoIterator<Item = BoundsResult>,
    {
        results.into_iter().fold(Self::ok(), |worst, next| {
            if next.status > worst.status
                || (next.status == worst.status && next.margin < worst.margin)
            {
                next
            } else {
                worst
            }
        })
    }
}

/// Classify a margin against a warning band. NaN margins are violations.
fn classify(margin: f64, band: f64, detail: String) -> BoundsResult {
    if margin.is_nan() {
        BoundsResult::violation(f64::NEG_INFINITY, format!("{detail} (not a number)"))
    } else if margin < 0.0 {
        BoundsResult::violation(margin, detail)
    } else if margin < band {
        BoundsResult::warning(margin, detail)
    } else {
        BoundsResult::with(BoundsStatus::Ok, margin, detail)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Geometry primitives
// ────────────────────────────────────────────────────────────────────────────

/// A point or vector in the robot base frame. Serialized as `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    fn abs(self) -> Self {
        Self::new(self.x.abs(), self.y.abs(), self.z.abs())
    }

    fn max_scalar(self, s: f64) -> Self {
        Self::new(self.x.max(s), self.y.max(s), self.z.max(s))
    }

    fn max_component(self) -> f64 {
        self.x.max(self.y).max(self.z)
    }

    pub fn norm(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<Vec3> for [f64; 3] {
    fn from(v: Vec3) -> Self {
        [v.x, v.y, v.z]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f64,
}

impl Sphere {
    /// Negative inside, zero on the surface, positive outside.
    pub fn signed_distance(&self, p: Vec3) -> f64 {
        p.sub(self.center).norm() - self.radius
    }
}

/// Axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl AxisBox {
    /// Negative inside, zero on the surface, positive outside.
    pub fn signed_distance(&self, p: Vec3) -> f64 {
        let center = Vec3::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
            (self.min.z + self.max.z) / 2.0,
        );
        let half = self.max.sub(center);
        let q = p.sub(center).abs().sub(half);
        let outside = q.max_scalar(0.0).norm();
        let inside = q.max_component().min(0.0);
        outside + inside
    }
}

/// A region of space, tagged by shape in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum Zone {
    Sphere(Sphere),
    Box(AxisBox),
}

impl Zone {
    pub fn signed_distance(&self, p: Vec3) -> f64 {
        match self {
            Zone::Sphere(s) => s.signed_distance(p),
            Zone::Box(b) => b.signed_distance(p),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Limit sets
// ────────────────────────────────────────────────────────────────────────────

fn default_margin() -> f64 {
    DEFAULT_MARGIN
}

/// Allowed envelope plus forbidden zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub sphere: Option<Sphere>,
    #[serde(default, rename = "box")]
    pub cuboid: Option<AxisBox>,
    #[serde(default)]
    pub forbidden: Vec<Zone>,
    /// Width of the warning band measured from each surface.
    #[serde(default = "default_margin")]
    pub margin: f64,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            sphere: None,
            cuboid: None,
            forbidden: Vec::new(),
            margin: DEFAULT_MARGIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    /// Inclusive `[min, max]` position.
    pub position_range: (f64, f64),
    pub velocity_max: f64,
    pub torque_max: f64,
}

fn default_warning_fraction() -> f64 {
    0.8
}

/// Force ceilings in newtons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForceBounds {
    pub max_force: f64,
    /// Replaces `max_force` while a human is nearby.
    pub max_force_near_human: f64,
    pub max_contact_force: f64,
    pub max_gripper_force: f64,
    /// Fraction of a ceiling at which a warning is raised.
    #[serde(default = "default_warning_fraction")]
    pub warning_fraction: f64,
    #[serde(skip)]
    pub human_nearby: bool,
}

impl ForceBounds {
    /// The end-effector ceiling currently in force.
    pub fn effective_max_force(&self) -> f64 {
        if self.human_nearby {
            self.max_force_near_human
        } else {
            self.max_force
        }
    }

    fn check(&self, value: f64, limit: f64, label: &str) -> BoundsResult {
        let magnitude = value.abs();
        let detail = format!("{label} {magnitude:.3} N against limit {limit:.3} N");
        let margin = limit - magnitude;
        if margin.is_nan() || margin < 0.0 {
            return classify(margin, 0.0, detail);
        }
        if magnitude >= self.warning_fraction * limit {
            BoundsResult::warning(margin, detail)
        } else {
            BoundsResult::with(BoundsStatus::Ok, margin, detail)
        }
    }
}

/// Named robot archetypes with preset limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    /// Six-axis arm on a table.
    Arm,
    /// Wheeled base carrying a four-axis arm.
    MobileManipulator,
    /// Differential-drive base, no manipulator.
    MobileBase,
}

impl Archetype {
    /// Preset limits for this archetype.
    pub fn preset(self) -> BoundsConfig {
        match self {
            Archetype::Arm => {
                let ranges = [
                    (-PI, PI),
                    (-2.0, 2.0),
                    (-2.5, 2.5),
                    (-PI, PI),
                    (-2.0, 2.0),
                    (-TAU, TAU),
                ];
                let torques = [50.0, 50.0, 30.0, 10.0, 10.0, 5.0];
                let joints = ranges
                    .iter()
                    .zip(torques)
                    .enumerate()
                    .map(|(i, (&position_range, torque_max))| {
                        (
                            format!("j{}", i + 1),
                            JointLimits {
                                position_range,
                                velocity_max: 2.0,
                                torque_max,
                            },
                        )
                    })
                    .collect();
                BoundsConfig {
                    archetype: None,
                    workspace: Some(Workspace {
                        sphere: Some(Sphere {
                            center: Vec3::ZERO,
                            radius: 0.8,
                        }),
                        cuboid: None,
                        forbidden: vec![Zone::Box(AxisBox {
                            min: Vec3::new(-1.0, -1.0, -1.0),
                            max: Vec3::new(1.0, 1.0, -0.05),
                        })],
                        margin: DEFAULT_MARGIN,
                    }),
                    joints,
                    force: Some(ForceBounds {
                        max_force: 50.0,
                        max_force_near_human: 10.0,
                        max_contact_force: 30.0,
                        max_gripper_force: 20.0,
                        warning_fraction: 0.8,
                        human_nearby: false,
                    }),
                }
            }
            Archetype::MobileManipulator => {
                let joints = [(-PI, PI), (-1.8, 1.8), (-2.2, 2.2), (-PI, PI)]
                    .iter()
                    .enumerate()
                    .map(|(i, &position_range)| {
                        (
                            format!("j{}", i + 1),
                            JointLimits {
                                position_range,
                                velocity_max: 1.5,
                                torque_max: 20.0,
                            },
                        )
                    })
                    .collect();
                BoundsConfig {
                    archetype: None,
                    workspace: Some(Workspace {
                        cuboid: Some(AxisBox {
                            min: Vec3::new(-0.6, -0.6, 0.0),
                            max: Vec3::new(0.6, 0.6, 1.2),
                        }),
                        ..Workspace::default()
                    }),
                    joints,
                    force: Some(ForceBounds {
                        max_force: 40.0,
                        max_force_near_human: 10.0,
                        max_contact_force: 25.0,
                        max_gripper_force: 15.0,
                        warning_fraction: 0.8,
                        human_nearby: false,
                    }),
                }
            }
            Archetype::MobileBase => {
                let wheel = JointLimits {
                    position_range: (-1.0e6, 1.0e6),
                    velocity_max: 10.0,
                    torque_max: 5.0,
                };
                BoundsConfig {
                    archetype: None,
                    workspace: Some(Workspace {
                        cuboid: Some(AxisBox {
                            min: Vec3::new(-50.0, -50.0, 0.0),
                            max: Vec3::new(50.0, 50.0, 0.5),
                        }),
                        ..Workspace::default()
                    }),
                    joints: BTreeMap::from([
                        ("left_wheel".to_string(), wheel),
                        ("right_wheel".to_string(), wheel),
                    ]),
                    force: None,
                }
            }
        }
    }
}

/// Bounds section of the kernel configuration.
///
/// When `archetype` is set its preset is the starting point; explicit
/// `workspace` and `force` replace the preset's, explicit `joints` are
/// merged over it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundsConfig {
    #[serde(default)]
    pub archetype: Option<Archetype>,
    #[serde(default)]
    pub workspace: Option<Workspace>,
    #[serde(default)]
    pub joints: BTreeMap<String, JointLimits>,
    #[serde(default)]
    pub force: Option<ForceBounds>,
}

impl BoundsConfig {
    /// Apply the archetype preset, if any.
    pub fn resolve(self) -> BoundsConfig {
        let Some(archetype) = self.archetype else {
            return self;
        };
        let mut base = archetype.preset();
        if self.workspace.is_some() {
            base.workspace = self.workspace;
        }
        base.joints.extend(self.joints);
        if self.force.is_some() {
            base.force = self.force;
        }
        base
    }

    /// Reject geometrically meaningless limits.
    pub fn validate(&self) -> Result<(), KernelError> {
        let bad = |msg: String| Err(KernelError::Config(msg));
        if let Some(ws) = &self.workspace {
            if !(ws.margin >= 0.0) {
                return bad(format!("workspace margin {} must be >= 0", ws.margin));
            }
            if let Some(s) = &ws.sphere
                && !(s.radius > 0.0)
            {
                return bad(format!("workspace sphere radius {} must be > 0", s.radius));
            }
            let boxes = ws.cuboid.iter().chain(ws.forbidden.iter().filter_map(|z| match z {
                Zone::Box(b) => Some(b),
                Zone::Sphere(_) => None,
            }));
            for b in boxes {
                if b.min.x > b.max.x || b.min.y > b.max.y || b.min.z > b.max.z {
                    return bad(format!("box min {:?} exceeds max {:?}", b.min, b.max));
                }
            }
        }
        for (id, j) in &self.joints {
            let (lo, hi) = j.position_range;
            if !(lo < hi) {
                return bad(format!("joint {id}: position range [{lo}, {hi}] is empty"));
            }
            if !(j.velocity_max > 0.0 && j.torque_max > 0.0) {
                return bad(format!("joint {id}: velocity and torque ceilings must be > 0"));
            }
        }
        if let Some(f) = &self.force {
            let limits = [
                f.max_force,
                f.max_force_near_human,
                f.max_contact_force,
                f.max_gripper_force,
            ];
            if limits.iter().any(|l| !(*l > 0.0)) {
                return bad("force limits must be > 0".into());
            }
            if f.max_force_near_human > f.max_force {
                return bad("max_force_near_human must not exceed max_force".into());
            }
            if !(f.warning_fraction > 0.0 && f.warning_fraction <= 1.0) {
                return bad(format!("warning_fraction {} must be in (0, 1]", f.warning_fraction));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Constraint trait
// ────────────────────────────────────────────────────────────────────────────

/// An extra physical invariant evaluated by [`BoundsChecker::check_action`]
/// alongside the built-in limits.
pub trait Constraint: Send + Sync {
    /// Human-readable name used in result details.
    fn name(&self) -> &str;

    fn check(&self, action: &ActionRecord) -> BoundsResult;
}

// ────────────────────────────────────────────────────────────────────────────
// BoundsChecker
// ────────────────────────────────────────────────────────────────────────────

/// Validates positions, joint commands and forces against configured limits.
pub struct BoundsChecker {
    workspace: Option<Workspace>,
    joints: BTreeMap<String, JointLimits>,
    force: Option<ForceBounds>,
    constraints: Vec<Box<dyn Constraint>>,
}

impl fmt::Debug for BoundsChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundsChecker")
            .field("workspace", &self.workspace)
            .field("joints", &self.joints)
            .field("force", &self.force)
            .field(
                "constraints",
                &self.constraints.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BoundsChecker {
    /// Build from configuration, applying any archetype preset.
    pub fn new(config: BoundsConfig) -> Self {
        let config = config.resolve();
        Self {
            workspace: config.workspace,
            joints: config.joints,
            force: config.force,
            constraints: Vec::new(),
        }
    }

    /// Checker with the preset limits of `archetype`.
    pub fn for_archetype(archetype: Archetype) -> Self {
        Self::new(archetype.preset())
    }

    /// Register an extra [`Constraint`]. Constraints run in insertion order.
    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) {
        self.constraints.push(constraint);
    }

    /// Check an end-effector position against the envelope and forbidden zones.
    pub fn check_position(&self, x: f64, y: f64, z: f64) -> BoundsResult {
        let p = Vec3::new(x, y, z);
        if !p.is_finite() {
            return BoundsResult::violation(
                f64::NEG_INFINITY,
                format!("position [{x}, {y}, {z}] is not finite"),
            );
        }
        let Some(ws) = &self.workspace else {
            return BoundsResult::ok();
        };
        let mut results = Vec::new();
        // Allowed envelopes: margin is the depth inside the surface.
        if let Some(sphere) = &ws.sphere {
            let depth = -sphere.signed_distance(p);
            results.push(classify(
                depth,
                ws.margin,
                format!("workspace sphere: depth {depth:.3}"),
            ));
        }
        if let Some(cuboid) = &ws.cuboid {
            let depth = -cuboid.signed_distance(p);
            results.push(classify(
                depth,
                ws.margin,
                format!("workspace box: depth {depth:.3}"),
            ));
        }
        // Forbidden zones: margin is the clearance outside the surface; touching counts.
        for (i, zone) in ws.forbidden.iter().enumerate() {
            let clearance = zone.signed_distance(p);
            let detail = format!("forbidden zone {i}: clearance {clearance:.3}");
            results.push(if clearance <= 0.0 {
                BoundsResult::violation(clearance, detail)
            } else {
                classify(clearance, ws.margin, detail)
            });
        }
        BoundsResult::combine(results)
    }

    /// Check a joint command. Unknown joints yield a non-blocking warning.
    pub fn check_joint(
        &self,
        id: &str,
        position: Option<f64>,
        velocity: Option<f64>,
        torque: Option<f64>,
    ) -> BoundsResult {
        let Some(limits) = self.joints.get(id) else {
            return BoundsResult::warning(
                f64::INFINITY,
                format!("joint {id}: limits undefined"),
            );
        };
        let mut results = Vec::new();
        if let Some(p) = position {
            let (lo, hi) = limits.position_range;
            let margin = (p - lo).min(hi - p);
            results.push(classify(
                margin,
                JOINT_POSITION_WARNING * (hi - lo),
                format!("joint {id} position {p:.3} in [{lo:.3}, {hi:.3}]"),
            ));
        }
        if let Some(v) = velocity {
            results.push(classify(
                limits.velocity_max - v.abs(),
                JOINT_RATE_WARNING * limits.velocity_max,
                format!("joint {id} velocity {v:.3} against {:.3}", limits.velocity_max),
            ));
        }
        if let Some(t) = torque {
            results.push(classify(
                limits.torque_max - t.abs(),
                JOINT_RATE_WARNING * limits.torque_max,
                format!("joint {id} torque {t:.3} against {:.3}", limits.torque_max),
            ));
        }
        BoundsResult::combine(results)
    }

    /// End-effector force against the effective ceiling.
    pub fn check_force(&self, force: f64) -> BoundsResult {
        match &self.force {
            Some(f) => f.check(force, f.effective_max_force(), "force"),
            None => BoundsResult::ok(),
        }
    }

    pub fn check_contact_force(&self, force: f64) -> BoundsResult {
        match &self.force {
            Some(f) => f.check(force, f.max_contact_force, "contact force"),
            None => BoundsResult::ok(),
        }
    }

    pub fn check_gripper_force(&self, force: f64) -> BoundsResult {
        match &self.force {
            Some(f) => f.check(force, f.max_gripper_force, "gripper force"),
            None => BoundsResult::ok(),
        }
    }

    /// Switch the end-effector ceiling to its human-nearby value and back.
    ///
    /// Every actual toggle is logged. No-op without force limits.
    pub fn set_human_nearby(&mut self, nearby: bool) {
        let Some(force) = self.force.as_mut() else {
            return;
        };
        if force.human_nearby != nearby {
            force.human_nearby = nearby;
            warn!(
                human_nearby = nearby,
                max_force = force.effective_max_force(),
                "end-effector force ceiling changed"
            );
        }
    }

    pub fn human_nearby(&self) -> bool {
        self.force.is_some_and(|f| f.human_nearby)
    }

    /// Current end-effector ceiling, if force limits are configured.
    pub fn effective_max_force(&self) -> Option<f64> {
        self.force.map(|f| f.effective_max_force())
    }

    /// Run every check applicable to `action` and combine the results.
    ///
    /// An action with nothing checkable is ok with an infinite margin.
    pub fn check_action(&self, action: &ActionRecord) -> BoundsResult {
        let mut results = Vec::new();
        if let Some([x, y, z]) = action.position {
            results.push(self.check_position(x, y, z));
        }
        if let Some(joints) = &action.joints {
            for (id, cmd) in joints {
                results.push(self.check_joint(id, cmd.position, cmd.velocity, cmd.torque));
            }
        }
        if let Some(f) = action.force {
            results.push(self.check_force(f));
        }
        if let Some(f) = action.contact_force {
            results.push(self.check_contact_force(f));
        }
        if let Some(f) = action.gripper_force {
            results.push(self.check_gripper_force(f));
        }
        for constraint in &self.constraints {
            let mut result = constraint.check(action);
            result.detail = format!("{}: {}", constraint.name(), result.detail);
            results.push(result);
        }
        let combined = BoundsResult::combine(results);
        debug!(status = %combined.status, margin = combined.margin, "bounds check");
        combined
    }

    /// Decode an action payload and check it. Undecodable payloads are
    /// violations.
    pub fn check_action_value(&self, value: &Value) -> BoundsResult {
        match ActionRecord::deserialize(value) {
            Ok(action) => self.check_action(&action),
            Err(e) => BoundsResult::violation(
                f64::NEG_INFINITY,
                format!("malformed action payload: {e}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safefs_types::JointCommand;
    use serde_json::json;

    // ------------------------------------------------------------------ helpers
    fn sphere_checker(radius: f64) -> BoundsChecker {
        BoundsChecker::new(BoundsConfig {
            workspace: Some(Workspace {
                sphere: Some(Sphere {
                    center: Vec3::ZERO,
                    radius,
                }),
                ..Workspace::default()
            }),
            ..BoundsConfig::default()
        })
    }

    fn force_checker() -> BoundsChecker {
        BoundsChecker::new(BoundsConfig {
            force: Some(ForceBounds {
                max_force: 50.0,
                max_force_near_human: 10.0,
                max_contact_force: 30.0,
                max_gripper_force: 20.0,
                warning_fraction: 0.8,
                human_nearby: false,
            }),
            ..BoundsConfig::default()
        })
    }

    fn joint_checker() -> BoundsChecker {
        BoundsChecker::new(BoundsConfig {
            joints: BTreeMap::from([(
                "elbow".to_string(),
                JointLimits {
                    position_range: (-1.0, 1.0),
                    velocity_max: 2.0,
                    torque_max: 10.0,
                },
            )]),
            ..BoundsConfig::default()
        })
    }

    // ------------------------------------------------------------------ geometry

    #[test]
    fn sphere_signed_distance() {
        let s = Sphere {
            center: Vec3::new(1.0, 0.0, 0.0),
            radius: 0.5,
        };
        assert!((s.signed_distance(Vec3::new(1.0, 0.0, 0.0)) + 0.5).abs() < 1e-12);
        assert!((s.signed_distance(Vec3::new(2.0, 0.0, 0.0)) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn box_signed_distance_inside_and_outside() {
        let b = AxisBox {
            min: Vec3::new(-1.0, -1.0, -1.0),
            max: Vec3::new(1.0, 1.0, 1.0),
        };
        assert!((b.signed_distance(Vec3::ZERO) + 1.0).abs() < 1e-12);
        assert!((b.signed_distance(Vec3::new(0.5, 0.0, 0.0)) + 0.5).abs() < 1e-12);
        assert!((b.signed_distance(Vec3::new(3.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
        // Corner region: Euclidean distance to the corner.
        let d = b.signed_distance(Vec3::new(2.0, 2.0, 1.0));
        assert!((d - 2f64.sqrt()).abs() < 1e-12);
        assert!(b.signed_distance(Vec3::new(1.0, 0.0, 0.0)).abs() < 1e-12);
    }

    // ------------------------------------------------------------------ workspace

    #[test]
    fn sphere_scenario_ok_warning_violation() {
        let checker = sphere_checker(0.8);
        let near = checker.check_position(0.78, 0.0, 0.0);
        assert_eq!(near.status, BoundsStatus::Warning);
        assert!((near.margin - 0.02).abs() < 1e-9);

        let out = checker.check_position(1.0, 0.0, 0.0);
        assert_eq!(out.status, BoundsStatus::Violation);
        assert!(out.margin < 0.0);

        assert_eq!(checker.check_position(0.3, 0.3, 0.3).status, BoundsStatus::Ok);
    }

    #[test]
    fn on_envelope_surface_is_warning_with_zero_margin() {
        let checker = sphere_checker(1.0);
        let r = checker.check_position(1.0, 0.0, 0.0);
        assert_eq!(r.status, BoundsStatus::Warning);
        assert_eq!(r.margin, 0.0);
    }

    #[test]
    fn forbidden_zone_inside_is_violation() {
        let checker = BoundsChecker::for_archetype(Archetype::Arm);
        let below_table = checker.check_position(0.2, 0.0, -0.3);
        assert_eq!(below_table.status, BoundsStatus::Violation);
        assert!(below_table.detail.contains("forbidden zone 0"));

        let grazing = checker.check_position(0.2, 0.0, -0.02);
        assert_eq!(grazing.status, BoundsStatus::Warning);

        assert_eq!(checker.check_position(0.2, 0.0, 0.3).status, BoundsStatus::Ok);
    }

    #[test]
    fn box_envelope() {
        let checker = BoundsChecker::for_archetype(Archetype::MobileManipulator);
        assert_eq!(checker.check_position(0.0, 0.0, 0.6).status, BoundsStatus::Ok);
        assert_eq!(checker.check_position(0.58, 0.0, 0.6).status, BoundsStatus::Warning);
        assert_eq!(checker.check_position(0.0, 0.0, 1.5).status, BoundsStatus::Violation);
    }

    #[test]
    fn non_finite_position_is_violation() {
        let checker = sphere_checker(1.0);
        assert!(checker.check_position(f64::NAN, 0.0, 0.0).is_violation());
        assert!(checker.check_position(0.0, f64::INFINITY, 0.0).is_violation());
    }

    #[test]
    fn no_workspace_means_ok() {
        let checker = BoundsChecker::new(BoundsConfig::default());
        let r = checker.check_position(100.0, 100.0, 100.0);
        assert_eq!(r.status, BoundsStatus::Ok);
        assert_eq!(r.margin, f64::INFINITY);
    }

    // ------------------------------------------------------------------ joints

    #[test]
    fn joint_position_bands() {
        let c = joint_checker();
        assert_eq!(c.check_joint("elbow", Some(0.0), None, None).status, BoundsStatus::Ok);
        // 5% of a 2.0 range is 0.1.
        assert_eq!(
            c.check_joint("elbow", Some(0.95), None, None).status,
            BoundsStatus::Warning
        );
        assert_eq!(
            c.check_joint("elbow", Some(-1.2), None, None).status,
            BoundsStatus::Violation
        );
    }

    #[test]
    fn joint_velocity_and_torque_bands() {
        let c = joint_checker();
        assert_eq!(c.check_joint("elbow", None, Some(1.0), None).status, BoundsStatus::Ok);
        assert_eq!(
            c.check_joint("elbow", None, Some(-1.9), None).status,
            BoundsStatus::Warning
        );
        assert_eq!(
            c.check_joint("elbow", None, None, Some(10.5)).status,
            BoundsStatus::Violation
        );
    }

    #[test]
    fn unknown_joint_is_warning_not_violation() {
        let c = joint_checker();
        let r = c.check_joint("wrist", Some(99.0), None, None);
        assert_eq!(r.status, BoundsStatus::Warning);
        assert!(r.detail.contains("limits undefined"));
    }

    #[test]
    fn joint_without_fields_is_ok() {
        let c = joint_checker();
        assert_eq!(c.check_joint("elbow", None, None, None), BoundsResult::ok());
    }

    #[test]
    fn nan_joint_velocity_is_violation() {
        let c = joint_checker();
        assert!(c.check_joint("elbow", None, Some(f64::NAN), None).is_violation());
    }

    // ------------------------------------------------------------------ force

    #[test]
    fn human_nearby_tightens_force_ceiling() {
        let mut c = force_checker();
        assert_eq!(c.check_force(15.0).status, BoundsStatus::Ok);
        c.set_human_nearby(true);
        assert!(c.human_nearby());
        assert_eq!(c.effective_max_force(), Some(10.0));
        assert_eq!(c.check_force(15.0).status, BoundsStatus::Violation);
        c.set_human_nearby(false);
        assert_eq!(c.check_force(15.0).status, BoundsStatus::Ok);
    }

    #[test]
    fn force_warning_fraction() {
        let c = force_checker();
        assert_eq!(c.check_force(40.0).status, BoundsStatus::Warning);
        assert_eq!(c.check_force(-45.0).status, BoundsStatus::Warning);
        assert_eq!(c.check_contact_force(31.0).status, BoundsStatus::Violation);
        assert_eq!(c.check_gripper_force(5.0).status, BoundsStatus::Ok);
    }

    #[test]
    fn force_without_limits_is_ok() {
        let mut c = BoundsChecker::for_archetype(Archetype::MobileBase);
        c.set_human_nearby(true);
        assert!(!c.human_nearby());
        assert_eq!(c.check_force(1e9).status, BoundsStatus::Ok);
    }

    // ------------------------------------------------------------------ combine / actions

    #[test]
    fn combine_empty_is_ok() {
        let r = BoundsResult::combine(Vec::new());
        assert_eq!(r.status, BoundsStatus::Ok);
        assert_eq!(r.margin, f64::INFINITY);
    }

    #[test]
    fn combine_keeps_worst_then_smallest_margin() {
        let r = BoundsResult::combine(vec![
            BoundsResult::warning(0.04, "a"),
            BoundsResult::violation(-0.1, "b"),
            BoundsResult::violation(-0.5, "c"),
            BoundsResult::warning(0.01, "d"),
        ]);
        assert_eq!(r.detail, "c");
        let r = BoundsResult::combine(vec![
            BoundsResult::warning(0.04, "a"),
            BoundsResult::warning(0.01, "d"),
        ]);
        assert_eq!(r.detail, "d");
    }

    #[test]
    fn empty_action_is_ok_with_infinite_margin() {
        let c = BoundsChecker::for_archetype(Archetype::Arm);
        let r = c.check_action(&ActionRecord::default());
        assert_eq!(r.status, BoundsStatus::Ok);
        assert_eq!(r.margin, f64::INFINITY);
        assert_eq!(c.check_action_value(&json!({})), r);
    }

    #[test]
    fn action_combines_all_present_checks() {
        let c = BoundsChecker::for_archetype(Archetype::Arm);
        let action = ActionRecord {
            position: Some([0.2, 0.0, 0.3]),
            joints: Some(BTreeMap::from([(
                "j2".to_string(),
                JointCommand {
                    position: Some(0.1),
                    velocity: Some(0.2),
                    torque: None,
                },
            )])),
            gripper_force: Some(25.0),
            ..ActionRecord::default()
        };
        let r = c.check_action(&action);
        assert_eq!(r.status, BoundsStatus::Violation);
        assert!(r.detail.contains("gripper"));
    }

    #[test]
    fn action_value_decodes_json() {
        let c = BoundsChecker::for_archetype(Archetype::Arm);
        let ok = c.check_action_value(&json!({"position": [0.1, 0.1, 0.2], "force": 5.0}));
        assert_eq!(ok.status, BoundsStatus::Ok);
        let bad = c.check_action_value(&json!({"position": [0.1, 0.1]}));
        assert!(bad.is_violation());
        assert!(bad.detail.contains("malformed"));
    }

    struct NoGripperWhileMoving;

    impl Constraint for NoGripperWhileMoving {
        fn name(&self) -> &str {
            "no_gripper_while_moving"
        }

        fn check(&self, action: &ActionRecord) -> BoundsResult {
            if action.position.is_some() && action.gripper_force.is_some() {
                BoundsResult::violation(0.0, "gripper actuated during motion")
            } else {
                BoundsResult::ok()
            }
        }
    }

    #[test]
    fn custom_constraint_participates() {
        let mut c = BoundsChecker::for_archetype(Archetype::Arm);
        c.add_constraint(Box::new(NoGripperWhileMoving));
        let action = ActionRecord {
            position: Some([0.1, 0.0, 0.2]),
            gripper_force: Some(1.0),
            ..ActionRecord::default()
        };
        let r = c.check_action(&action);
        assert!(r.is_violation());
        assert!(r.detail.starts_with("no_gripper_while_moving"));
        assert!(format!("{c:?}").contains("no_gripper_while_moving"));
    }

    // ------------------------------------------------------------------ config

    #[test]
    fn archetype_presets_validate() {
        for a in [Archetype::Arm, Archetype::MobileManipulator, Archetype::MobileBase] {
            a.preset().validate().unwrap();
        }
    }

    #[test]
    fn revolute_joints_span_full_turns() {
        let arm = Archetype::Arm.preset();
        assert_eq!(arm.joints["j1"].position_range, (-PI, PI));
        assert_eq!(arm.joints["j6"].position_range, (-TAU, TAU));
        let checker = BoundsChecker::new(arm);
        let near_pi = checker.check_joint("j1", Some(3.141), None, None);
        assert_ne!(near_pi.status, BoundsStatus::Violation);

        let mm = Archetype::MobileManipulator.preset();
        assert_eq!(mm.joints["j4"].position_range, (-PI, PI));
    }

    #[test]
    fn explicit_sections_override_preset() {
        let cfg = BoundsConfig {
            archetype: Some(Archetype::Arm),
            joints: BTreeMap::from([(
                "j1".to_string(),
                JointLimits {
                    position_range: (-0.5, 0.5),
                    velocity_max: 1.0,
                    torque_max: 1.0,
                },
            )]),
            ..BoundsConfig::default()
        }
        .resolve();
        assert_eq!(cfg.joints.len(), 6);
        assert_eq!(cfg.joints["j1"].position_range, (-0.5, 0.5));
        assert!(cfg.workspace.is_some());
    }

    #[test]
    fn validate_rejects_bad_limits() {
        let mut cfg = Archetype::Arm.preset();
        cfg.joints.get_mut("j1").unwrap().position_range = (1.0, -1.0);
        assert!(matches!(cfg.validate(), Err(KernelError::Config(_))));

        let mut cfg = Archetype::Arm.preset();
        cfg.force.as_mut().unwrap().max_force_near_human = 80.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn workspace_parses_from_toml() {
        let cfg: BoundsConfig = toml::from_str(
            r#"
            [workspace]
            margin = 0.1
            sphere = { center = [0.0, 0.0, 0.0], radius = 0.8 }

            [[workspace.forbidden]]
            shape = "box"
            min = [-1.0, -1.0, -1.0]
            max = [1.0, 1.0, 0.0]

            [joints.j1]
            position_range = [-1.0, 1.0]
            velocity_max = 2.0
            torque_max = 5.0

            [force]
            max_force = 50.0
            max_force_near_human = 10.0
            max_contact_force = 30.0
            max_gripper_force = 20.0
            "#,
        )
        .unwrap();
        let ws = cfg.workspace.as_ref().unwrap();
        assert_eq!(ws.margin, 0.1);
        assert_eq!(ws.forbidden.len(), 1);
        assert_eq!(cfg.force.unwrap().warning_fraction, 0.8);
        cfg.validate().unwrap();
    }
}
