#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "alumnet"
}

/// Separator between the two participant ids inside a conversation key.
/// The ULID alphabet never produces it, so keys stay splittable.
pub const CONVERSATION_KEY_SEPARATOR: char = '_';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("role is invalid")]
    InvalidRole,
    #[error("display name is invalid")]
    InvalidDisplayName,
    #[error("email is invalid")]
    InvalidEmail,
    #[error("conversation key is invalid")]
    InvalidConversationKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Alumni,
    Student,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Alumni => "alumni",
            Self::Student => "student",
        }
    }
}

impl TryFrom<String> for Role {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "admin" => Ok(Self::Admin),
            "alumni" => Ok(Self::Alumni),
            "student" => Ok(Self::Student),
            _ => Err(DomainError::InvalidRole),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(String);

impl DisplayName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DisplayName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let chars = trimmed.chars().count();
        if !(2..=100).contains(&chars) {
            return Err(DomainError::InvalidDisplayName);
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// Lowercased, shape-checked email address. The check is intentionally
/// loose: one `@`, a non-empty local part, and a dotted domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

impl Email {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_lowercase();
        validate_email(&normalized)?;
        Ok(Self(normalized))
    }
}

fn validate_email(value: &str) -> Result<(), DomainError> {
    if value.is_empty() || value.len() > 254 || value.chars().any(char::is_whitespace) {
        return Err(DomainError::InvalidEmail);
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(DomainError::InvalidEmail);
    };
    if local.is_empty() || domain.contains('@') {
        return Err(DomainError::InvalidEmail);
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return Err(DomainError::InvalidEmail);
    };
    if host.is_empty() || tld.is_empty() {
        return Err(DomainError::InvalidEmail);
    }
    Ok(())
}

/// Canonical, order-independent identifier for a participant pair.
///
/// The two ULIDs are sorted lexicographically and joined with
/// [`CONVERSATION_KEY_SEPARATOR`], so `derive(a, b) == derive(b, a)` and
/// distinct pairs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
    encoded: String,
}

impl ConversationKey {
    #[must_use]
    pub fn derive(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low,
            high,
            encoded: format!("{low}{CONVERSATION_KEY_SEPARATOR}{high}"),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// The two participant ids, in canonical (sorted) order. A
    /// self-conversation returns the same id twice.
    #[must_use]
    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    #[must_use]
    pub fn includes(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let Some((low, high)) = value.split_once(CONVERSATION_KEY_SEPARATOR) else {
            return Err(DomainError::InvalidConversationKey);
        };
        if low > high {
            return Err(DomainError::InvalidConversationKey);
        }
        let low = UserId::try_from(low.to_owned())
            .map_err(|_| DomainError::InvalidConversationKey)?;
        let high = UserId::try_from(high.to_owned())
            .map_err(|_| DomainError::InvalidConversationKey)?;
        Ok(Self::derive(low, high))
    }
}

impl From<ConversationKey> for String {
    fn from(value: ConversationKey) -> Self {
        value.encoded
    }
}

impl core::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationKey, DisplayName, DomainError, Email, Role, UserId};

    #[test]
    fn derive_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(ConversationKey::derive(a, b), ConversationKey::derive(b, a));
    }

    #[test]
    fn derive_separates_distinct_partners() {
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        assert_ne!(ConversationKey::derive(a, b), ConversationKey::derive(a, c));
    }

    #[test]
    fn derive_allows_stable_self_pair() {
        let a = UserId::new();
        let key = ConversationKey::derive(a, a);
        assert_eq!(key, ConversationKey::derive(a, a));
        let (low, high) = key.participants();
        assert_eq!(low, a);
        assert_eq!(high, a);
    }

    #[test]
    fn key_round_trips_through_string_form() {
        let a = UserId::new();
        let b = UserId::new();
        let key = ConversationKey::derive(a, b);
        let reparsed = ConversationKey::try_from(key.as_str().to_owned()).unwrap();
        assert_eq!(reparsed, key);
        assert!(reparsed.includes(a));
        assert!(reparsed.includes(b));
        assert!(!reparsed.includes(UserId::new()));
    }

    #[test]
    fn key_rejects_unsorted_and_malformed_input() {
        let a = UserId::new();
        let b = UserId::new();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let backwards = format!("{high}_{low}");
        assert_eq!(
            ConversationKey::try_from(backwards).unwrap_err(),
            DomainError::InvalidConversationKey
        );
        assert_eq!(
            ConversationKey::try_from(String::from("not-a-key")).unwrap_err(),
            DomainError::InvalidConversationKey
        );
    }

    #[test]
    fn role_parses_known_values_only() {
        assert_eq!(Role::try_from(String::from("alumni")).unwrap(), Role::Alumni);
        assert_eq!(
            Role::try_from(String::from("staff")).unwrap_err(),
            DomainError::InvalidRole
        );
    }

    #[test]
    fn display_name_is_trimmed_and_bounded() {
        let name = DisplayName::try_from(String::from("  Ada Lovelace  ")).unwrap();
        assert_eq!(name.as_str(), "Ada Lovelace");
        assert_eq!(
            DisplayName::try_from(String::from("A")).unwrap_err(),
            DomainError::InvalidDisplayName
        );
    }

    #[test]
    fn email_normalizes_case_and_rejects_bad_shapes() {
        let email = Email::try_from(String::from("Grad@Example.EDU")).unwrap();
        assert_eq!(email.as_str(), "grad@example.edu");
        for bad in ["", "no-at.example.com", "a@b", "a b@example.com", "@x.com"] {
            assert_eq!(
                Email::try_from(String::from(bad)).unwrap_err(),
                DomainError::InvalidEmail
            );
        }
    }
}
