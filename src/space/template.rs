use serde::Serialize;

use crate::space::Result;

/// Equality contract used by a [`Template`] to pick one entry out of a key's
/// queue.
pub trait Matcher<V>: Send + Sync {
    fn matches(&self, value: &V) -> bool;
}

/// Matches values equal to the one it holds.
pub struct Equals<V>(pub V);

impl<V: PartialEq + Send + Sync> Matcher<V> for Equals<V> {
    fn matches(&self, value: &V) -> bool {
        self.0 == *value
    }
}

/// Matches values whose BLAKE3 fingerprint equals the stored one.
///
/// The fingerprint is taken over the bincode encoding of the value, so the
/// template never retains the plaintext it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of<V: Serialize>(value: &V) -> Result<Self> {
        let bytes = bincode::serialize(value)?;
        Ok(Self(*blake3::hash(&bytes).as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl<V: Serialize> Matcher<V> for Digest {
    fn matches(&self, value: &V) -> bool {
        // Values that cannot be encoded cannot carry this fingerprint.
        Digest::of(value).is_ok_and(|d| d == *self)
    }
}

impl<V, F> Matcher<V> for F
where
    F: Fn(&V) -> bool + Send + Sync,
{
    fn matches(&self, value: &V) -> bool {
        self(value)
    }
}

/// A `(key, matcher)` selector for take and read operations.
pub struct Template<K, V> {
    key: K,
    matcher: Box<dyn Matcher<V>>,
}

impl<K, V: 'static> Template<K, V> {
    /// Selects the first entry under `key` equal to `value`.
    pub fn equals(key: K, value: V) -> Self
    where
        V: PartialEq + Send + Sync,
    {
        Self::with(key, Equals(value))
    }

    /// Selects the first entry under `key` with the same fingerprint as
    /// `value`.
    pub fn digest(key: K, value: &V) -> Result<Self>
    where
        V: Serialize,
    {
        Ok(Self::with(key, Digest::of(value)?))
    }

    pub fn with(key: K, matcher: impl Matcher<V> + 'static) -> Self {
        Self {
            key,
            matcher: Box::new(matcher),
        }
    }
}

impl<K, V> Template<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn matches(&self, value: &V) -> bool {
        self.matcher.matches(value)
    }

    pub(crate) fn matcher(&self) -> &dyn Matcher<V> {
        self.matcher.as_ref()
    }
}
