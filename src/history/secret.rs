//! Locked, zero-on-drop storage for password values

use std::fmt;

use tracing::debug;
use zeroize::Zeroize;

/// A UTF-8 secret held in a single heap allocation
///
/// The allocation is never resized, is pinned in RAM with `mlock(2)` where
/// the platform allows it, and is overwritten with zeros before release.
/// When locking fails (RLIMIT_MEMLOCK exhausted, non-unix target) the value
/// is still zeroed on drop but may be paged out; [`SecretString::is_locked`]
/// reports which guarantee holds.
pub struct SecretString {
    bytes: Box<[u8]>,
    locked: bool,
}

impl SecretString {
    /// Take ownership of `value`, wiping the caller's buffer
    pub fn new(mut value: String) -> Self {
        let secret = Self::from_bytes(value.as_bytes());
        value.zeroize();
        secret
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let bytes: Box<[u8]> = bytes.into();
        let locked = lock_memory(&bytes);
        if !locked && !bytes.is_empty() {
            debug!("Secret memory could not be locked; it may be swapped out");
        }
        Self { bytes, locked }
    }

    pub fn expose(&self) -> &str {
        // Constructed from a `String`, so always valid UTF-8
        std::str::from_utf8(&self.bytes).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the backing memory is excluded from swap
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.bytes)
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        if self.bytes.len() != other.bytes.len() {
            return false;
        }
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for SecretString {}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretString")
            .field("len", &self.bytes.len())
            .field("locked", &self.locked)
            .finish()
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if self.locked {
            unlock_memory(&self.bytes);
        }
    }
}

#[cfg(unix)]
fn lock_memory(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    // SAFETY: the pointer and length describe a live allocation owned by the caller.
    unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) == 0 }
}

#[cfg(unix)]
fn unlock_memory(bytes: &[u8]) {
    // SAFETY: same allocation that was passed to `mlock`.
    unsafe {
        libc::munlock(bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

#[cfg(not(unix))]
fn lock_memory(_bytes: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_memory(_bytes: &[u8]) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose_roundtrip() {
        let secret = SecretString::new("hunter2".to_string());
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(secret.len(), 7);
    }

    #[test]
    fn test_equality() {
        let a = SecretString::new("same".to_string());
        let b = SecretString::new("same".to_string());
        let c = SecretString::new("other".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::new("do-not-print".to_string());
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("do-not-print"));
    }

    #[test]
    fn test_empty_secret_is_not_locked() {
        let secret = SecretString::new(String::new());
        assert!(secret.is_empty());
        assert!(!secret.is_locked());
    }
}
