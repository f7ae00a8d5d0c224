//! Filter algebra.
//!
//! A [`Filter`] is a pure predicate over a [`Session`]. Filters are immutable
//! values; combinators (`and`, `or`, `and_not`, `negate` and the `&`, `|`, `!`
//! operators) capture their operands and always build a new filter, so
//! deriving a filter never affects the ones it was built from.
//!
//! ```rust,ignore
//! use zinc_core::filter::{Filter, Role};
//!
//! let in_group = Filter::field("group_id", [42]);
//! let staff = Filter::role([Role::Admin, Role::Owner]);
//! let gate = in_group & !staff;
//! assert!(gate.test(&session));
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Session;

type Predicate = dyn Fn(&dyn Session) -> bool + Send + Sync;

/// A composable, side-effect-free predicate over sessions.
#[derive(Clone)]
pub struct Filter(Arc<Predicate>);

impl Filter {
    /// Wraps a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn Session) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A filter accepting every session.
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    /// A filter rejecting every session.
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    /// Evaluates the filter.
    pub fn test(&self, session: &dyn Session) -> bool {
        (self.0)(session)
    }

    /// `self ∧ other`.
    pub fn and(&self, other: &Filter) -> Filter {
        let (a, b) = (self.clone(), other.clone());
        Filter::new(move |s| a.test(s) && b.test(s))
    }

    /// `self ∨ other`.
    pub fn or(&self, other: &Filter) -> Filter {
        let (a, b) = (self.clone(), other.clone());
        Filter::new(move |s| a.test(s) || b.test(s))
    }

    /// `self ∧ ¬other`.
    pub fn and_not(&self, other: &Filter) -> Filter {
        let (a, b) = (self.clone(), other.clone());
        Filter::new(move |s| a.test(s) && !b.test(s))
    }

    /// `¬self`.
    pub fn negate(&self) -> Filter {
        let a = self.clone();
        Filter::new(move |s| !a.test(s))
    }

    /// Accepts sessions whose `key` field equals one of `values`.
    ///
    /// With an empty `values` list the filter accepts any session that
    /// carries the field at all. Numbers and strings compare by their textual
    /// form, so `10001` matches `"10001"`.
    pub fn field<I, V>(key: impl Into<String>, values: I) -> Filter
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let key = key.into();
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Filter::new(move |s| match s.field(&key) {
            Some(actual) => values.is_empty() || values.iter().any(|v| loose_eq(&actual, v)),
            None => false,
        })
    }

    /// Accepts sessions whose sender holds any of `roles`.
    pub fn role(roles: impl IntoIterator<Item = Role>) -> Filter {
        let roles: Vec<Role> = roles.into_iter().collect();
        Filter::new(move |s| roles.iter().any(|role| role.granted(s)))
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").finish_non_exhaustive()
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        self.and(&rhs)
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        self.or(&rhs)
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        self.negate()
    }
}

/// Compares two JSON scalars, treating numbers and strings by textual form.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            *a == b.to_string()
        }
        _ => false,
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Sender roles understood by role predicates.
///
/// The runtime does not decide who holds a role; it only reads the flags the
/// session exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Admin,
    Owner,
    /// Administrator or owner.
    Admins,
}

impl Role {
    /// Whether `session` carries this role.
    pub fn granted(self, session: &dyn Session) -> bool {
        match self {
            Role::Master => session.is_master(),
            Role::Admin => session.is_admin(),
            Role::Owner => session.is_owner(),
            Role::Admins => session.is_admins(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Admin => "admin",
            Role::Owner => "owner",
            Role::Admins => "admins",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            "admins" => Ok(Role::Admins),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RoleFlags, SessionRecord};

    fn sessions() -> Vec<SessionRecord> {
        vec![
            SessionRecord::new("onebot", "message").with_field("user_id", 1),
            SessionRecord::new("onebot", "message").with_field("user_id", 2),
            SessionRecord::new("qq", "message").with_field("group_id", 9),
            SessionRecord::new("qq", "notice"),
        ]
    }

    fn filters() -> Vec<Filter> {
        vec![
            Filter::always(),
            Filter::never(),
            Filter::field("user_id", [1]),
            Filter::field("protocol", ["qq"]),
            Filter::field("group_id", Vec::<Value>::new()),
        ]
    }

    #[test]
    fn test_and_or_not_laws() {
        for f in filters() {
            for g in filters() {
                for s in sessions() {
                    assert_eq!(f.and(&g).test(&s), f.test(&s) && g.test(&s));
                    assert_eq!(f.or(&g).test(&s), f.test(&s) || g.test(&s));
                    assert_eq!(f.and_not(&g).test(&s), f.test(&s) && !g.test(&s));
                    // commutativity of `or`
                    assert_eq!(f.or(&g).test(&s), g.or(&f).test(&s));
                    // De Morgan: ¬(f ∨ g) == ¬f ∧ ¬g
                    assert_eq!(
                        f.or(&g).negate().test(&s),
                        f.negate().and(&g.negate()).test(&s)
                    );
                }
            }
        }
    }

    #[test]
    fn test_operators_match_methods() {
        let s = SessionRecord::new("onebot", "message").with_field("user_id", 1);
        let f = Filter::field("user_id", [1]);
        let g = Filter::field("protocol", ["qq"]);
        assert!((f.clone() | g.clone()).test(&s));
        assert!(!(f.clone() & g.clone()).test(&s));
        assert!((f & !g).test(&s));
    }

    #[test]
    fn test_field_loose_comparison() {
        let s = SessionRecord::new("onebot", "message").with_field("user_id", "10001");
        assert!(Filter::field("user_id", [10001]).test(&s));
        assert!(Filter::field("user_id", ["10001"]).test(&s));
        assert!(!Filter::field("user_id", [10002]).test(&s));
        assert!(!Filter::field("group_id", [10001]).test(&s));
    }

    #[test]
    fn test_role_filter() {
        let admin = SessionRecord::new("onebot", "message").with_roles(RoleFlags {
            admin: true,
            ..Default::default()
        });
        let plain = SessionRecord::new("onebot", "message");

        let f = Filter::role([Role::Admins]);
        assert!(f.test(&admin));
        assert!(!f.test(&plain));
        assert!(!Filter::role([Role::Master, Role::Owner]).test(&admin));
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("admins".parse::<Role>().unwrap(), Role::Admins);
        assert!("guest".parse::<Role>().is_err());
    }
}
