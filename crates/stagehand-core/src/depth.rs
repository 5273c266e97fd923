//! Recursion and bounce depth guards.
//!
//! A depth counter travels in the event payload. Each time a builder emits a
//! self-invocation (`recursionDepth`) or a cross-function bounce
//! (`bounceDepth`), the outgoing payload carries the counter incremented by
//! one, and emission is refused once the incremented value reaches the
//! ceiling.
//!
//! The guard is advisory: it is checked once per emission against the counter
//! the current invocation received. Concurrent invocations sharing an
//! ancestor are not coordinated, so a fan-out can exceed the ceiling in total
//! while every individual chain stays within it.

use serde_json::Value;
use stagehand_types::task::Overrides;

/// Which counter a guard watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthKind {
    Recursion,
    Bounce,
}

impl DepthKind {
    /// Event field carrying the counter.
    pub fn field(self) -> &'static str {
        match self {
            DepthKind::Recursion => "recursionDepth",
            DepthKind::Bounce => "bounceDepth",
        }
    }
}

/// Emission refused because the ceiling was reached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} {attempted} would reach ceiling {ceiling}")]
pub struct DepthExceeded {
    pub field: &'static str,
    pub attempted: u64,
    pub ceiling: u64,
}

/// Whether emission at `current` depth is permitted under `ceiling`.
pub fn allowed(current: u64, ceiling: u64) -> bool {
    ceiling > current
}

/// The depth an emission from `event` would carry: the event's counter (or 1
/// when absent) plus one.
pub fn next_depth(event: &Value, field: &str) -> u64 {
    let existing = match event.get(field) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    existing.unwrap_or(1).saturating_add(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthGuard {
    kind: DepthKind,
    ceiling: u64,
}

impl DepthGuard {
    pub fn new(kind: DepthKind, ceiling: u64) -> Self {
        Self { kind, ceiling }
    }

    pub fn recursion(overrides: &Overrides) -> Self {
        Self::new(DepthKind::Recursion, overrides.recursion_ceiling())
    }

    pub fn bounce(overrides: &Overrides) -> Self {
        Self::new(DepthKind::Bounce, overrides.bounce_ceiling())
    }

    pub fn kind(&self) -> DepthKind {
        self.kind
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Returns the depth to stamp on the outgoing payload, or the refusal.
    pub fn check(&self, event: &Value) -> Result<u64, DepthExceeded> {
        let field = self.kind.field();
        let attempted = next_depth(event, field);
        if allowed(attempted, self.ceiling) {
            Ok(attempted)
        } else {
            Err(DepthExceeded {
                field,
                attempted,
                ceiling: self.ceiling,
            })
        }
    }

    /// Write `depth` into an outgoing payload object.
    pub fn stamp(&self, payload: &mut Value, depth: u64) {
        if let Value::Object(obj) = payload {
            obj.insert(self.kind.field().to_string(), Value::from(depth));
        }
    }
}

/// The two guards a task runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthGuards {
    pub recursion: DepthGuard,
    pub bounce: DepthGuard,
}

impl DepthGuards {
    pub fn from_overrides(overrides: &Overrides) -> Self {
        Self {
            recursion: DepthGuard::recursion(overrides),
            bounce: DepthGuard::bounce(overrides),
        }
    }
}

impl Default for DepthGuards {
    fn default() -> Self {
        Self::from_overrides(&Overrides::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_allowed() {
        assert!(allowed(2, 3));
        assert!(!allowed(3, 3));
        assert!(!allowed(4, 3));
    }

    #[test]
    fn test_next_depth_defaults_to_two() {
        assert_eq!(next_depth(&json!({}), "recursionDepth"), 2);
        assert_eq!(next_depth(&json!({ "recursionDepth": 1 }), "recursionDepth"), 2);
        assert_eq!(next_depth(&json!({ "recursionDepth": "4" }), "recursionDepth"), 5);
        assert_eq!(next_depth(&json!(null), "bounceDepth"), 2);
    }

    #[test]
    fn test_recursion_guard_at_ceiling_refuses() {
        let guard = DepthGuard::recursion(&Overrides::default());
        assert_eq!(guard.ceiling(), 3);
        let err = guard.check(&json!({ "recursionDepth": 3 })).unwrap_err();
        assert_eq!(err.attempted, 4);
        assert_eq!(err.ceiling, 3);
        assert_eq!(err.field, "recursionDepth");
    }

    #[test]
    fn test_recursion_guard_below_ceiling_emits() {
        let guard = DepthGuard::recursion(&Overrides::default());
        assert_eq!(guard.check(&json!({ "recursionDepth": 1 })).unwrap(), 2);
        assert_eq!(guard.check(&json!({})).unwrap(), 2);
        // 2 + 1 = 3 is not below the ceiling of 3.
        assert!(guard.check(&json!({ "recursionDepth": 2 })).is_err());
    }

    #[test]
    fn test_bounce_guard_uses_override() {
        let overrides = Overrides {
            max_bounce: Some(10),
            ..Overrides::default()
        };
        let guard = DepthGuard::bounce(&overrides);
        assert_eq!(guard.check(&json!({ "bounceDepth": 8 })).unwrap(), 9);
        assert!(guard.check(&json!({ "bounceDepth": 9 })).is_err());
        assert_eq!(DepthGuards::default().bounce.ceiling(), 7);
    }

    #[test]
    fn test_stamp() {
        let guard = DepthGuard::new(DepthKind::Bounce, 7);
        let mut payload = json!({ "a": 1 });
        guard.stamp(&mut payload, 3);
        assert_eq!(payload, json!({ "a": 1, "bounceDepth": 3 }));
    }
}
