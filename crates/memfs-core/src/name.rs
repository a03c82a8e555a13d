//! Name buffers for directory entries and symlink targets

use std::fmt;
use std::sync::Arc;

use crate::dirent::{COOKIE_MASK, COOKIE_MIN};
use crate::error::{FsError, FsResult};

/// Longest allowed entry name.
pub const NAME_MAX: usize = 255;

/// Longest allowed symlink target.
pub const PATH_MAX: usize = 1024;

const FNV1_32_INIT: u32 = 0x811c_9dc5;
const FNV_32_PRIME: u32 = 0x0100_0193;

/// Immutable, shareable byte string. Names are not required to be UTF-8.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Name(Arc<[u8]>);

impl Name {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<[u8]> for Name {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<[u8]> for Name {
    fn eq(&self, other: &[u8]) -> bool {
        *self.0 == *other
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        *self.0 == *other.as_bytes()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// Check that `name` can be bound in a directory.
pub fn validate_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(FsError::InvalidName);
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(FsError::InvalidName);
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

pub fn validate_symlink_target(target: &[u8]) -> FsResult<()> {
    if target.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    if target.len() > PATH_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Hash of an entry name, already folded into the plain cookie range.
pub fn hash_name(name: &[u8]) -> u32 {
    let mut hash = FNV1_32_INIT.wrapping_add(name.len() as u32);
    for &b in name {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= u32::from(b);
    }
    let hash = hash & COOKIE_MASK;
    if hash < COOKIE_MIN {
        hash + COOKIE_MIN
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name(b"file.txt").is_ok());
        assert!(matches!(validate_name(b""), Err(FsError::InvalidName)));
        assert!(matches!(validate_name(b"."), Err(FsError::InvalidName)));
        assert!(matches!(validate_name(b".."), Err(FsError::InvalidName)));
        assert!(matches!(validate_name(b"a/b"), Err(FsError::InvalidName)));
        assert!(matches!(validate_name(b"a\0b"), Err(FsError::InvalidName)));
        assert!(matches!(validate_name(&[b'x'; NAME_MAX + 1]), Err(FsError::NameTooLong)));
        assert!(validate_name(&[b'x'; NAME_MAX]).is_ok());
    }

    #[test]
    fn test_symlink_target_limits() {
        assert!(validate_symlink_target(b"/some/where").is_ok());
        assert!(matches!(validate_symlink_target(b""), Err(FsError::InvalidArgument)));
        assert!(matches!(
            validate_symlink_target(&[b'a'; PATH_MAX + 1]),
            Err(FsError::NameTooLong)
        ));
    }

    #[test]
    fn test_hash_stays_in_plain_cookie_range() {
        for i in 0..10_000 {
            let name = format!("entry-{i}");
            let hash = hash_name(name.as_bytes());
            assert!(hash >= COOKIE_MIN);
            assert!(hash <= COOKIE_MASK);
        }
    }

    #[test]
    fn test_hash_depends_on_length_and_content() {
        assert_ne!(hash_name(b"a"), hash_name(b"b"));
        assert_ne!(hash_name(b"a"), hash_name(b"aa"));
        assert_eq!(hash_name(b"same"), hash_name(b"same"));
    }

    #[test]
    fn test_name_compares_with_bytes() {
        let name = Name::from("hello");
        assert_eq!(name, "hello");
        assert_eq!(&name, &Name::new(b"hello"));
        assert_eq!(name.len(), 5);
        assert_eq!(name.to_string(), "hello");
    }
}
