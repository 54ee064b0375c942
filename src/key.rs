use rhai::Dynamic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Filter value scoping a handler to a subset of invocations.
///
/// A handler bound to [`HandleKey::Wildcard`] participates in every
/// invocation. One bound to a concrete key runs when the event is invoked
/// with an equal key or with the wildcard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandleKey {
    #[default]
    Wildcard,
    Number(f64),
    String(String),
}

impl HandleKey {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, HandleKey::Wildcard)
    }

    /// True when `self` accepts an invocation made with `other`.
    pub fn matches(&self, other: &HandleKey) -> bool {
        self.is_wildcard() || self == other
    }

    /// Converts a script value into a key. Unit maps to the wildcard; only
    /// numbers and strings are accepted otherwise.
    pub fn from_dynamic(value: &Dynamic) -> Option<Self> {
        if value.is_unit() {
            return Some(HandleKey::Wildcard);
        }
        if let Ok(n) = value.as_int() {
            return Some(HandleKey::Number(n as f64));
        }
        if let Ok(n) = value.as_float() {
            return Some(HandleKey::Number(n));
        }
        if value.is_string() {
            return value.clone().into_string().ok().map(HandleKey::String);
        }
        None
    }

    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            HandleKey::Wildcard => Dynamic::UNIT,
            HandleKey::Number(n) => Dynamic::from_float(*n),
            HandleKey::String(s) => Dynamic::from(s.clone()),
        }
    }

    // -0.0 and 0.0 compare equal, so they must hash alike; all NaNs collapse
    // into one bucket.
    fn number_bits(n: f64) -> u64 {
        if n == 0.0 {
            0
        } else if n.is_nan() {
            f64::NAN.to_bits()
        } else {
            n.to_bits()
        }
    }
}

impl PartialEq for HandleKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HandleKey::Wildcard, HandleKey::Wildcard) => true,
            (HandleKey::Number(a), HandleKey::Number(b)) => Self::number_bits(*a) == Self::number_bits(*b),
            (HandleKey::String(a), HandleKey::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for HandleKey {}

impl Hash for HandleKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            HandleKey::Wildcard => 0u8.hash(state),
            HandleKey::Number(n) => {
                1u8.hash(state);
                Self::number_bits(*n).hash(state);
            }
            HandleKey::String(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKey::Wildcard => write!(f, "*"),
            HandleKey::Number(n) => write!(f, "{n}"),
            HandleKey::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<&str> for HandleKey {
    fn from(value: &str) -> Self {
        HandleKey::String(value.to_string())
    }
}

impl From<String> for HandleKey {
    fn from(value: String) -> Self {
        HandleKey::String(value)
    }
}

impl From<f64> for HandleKey {
    fn from(value: f64) -> Self {
        HandleKey::Number(value)
    }
}

impl From<i64> for HandleKey {
    fn from(value: i64) -> Self {
        HandleKey::Number(value as f64)
    }
}
