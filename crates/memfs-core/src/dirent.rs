//! Directory entry tree
//!
//! Entries live in an ordered map keyed by the hash of their name. A hash owned by a
//! single entry is a plain slot whose cookie is the hash itself. When a second name
//! hashes to an occupied slot, the slot becomes a duplicate head holding a chain of
//! entries, each with a cookie drawn from a per-directory counter. A separate index
//! maps those duplicate cookies back to their slot so that resuming enumeration from a
//! cookie costs one map probe plus a chain scan.
//!
//! Duplicate cookies are never handed out twice while the tree exists. A hash whose plain
//! cookie was given up, by removal or by a collision, is retired: names that later land on
//! it get a duplicate cookie even in a plain slot, so no cookie ever names two different
//! entries. Chains are kept in insertion order, which is also ascending cookie order.
//!
//! The retired set costs one `u32` per distinct hash ever given up and only shrinks when the
//! tree is dropped. It is bounded by the cookie space (2^30 hashes), is not charged to any
//! mount budget, and in a directory with heavy churn grows with the number of distinct
//! names removed.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::{FsError, FsResult};
use crate::name::{hash_name, Name};

pub const COOKIE_DOT: u32 = 0;
pub const COOKIE_DOTDOT: u32 = 1;
pub const COOKIE_EOF: u32 = 2;
pub const COOKIE_MASK: u32 = 0x3fff_ffff;
pub const COOKIE_MIN: u32 = 4;
pub const COOKIE_DUP: u32 = 0x4000_0000;
pub const COOKIE_DUPHEAD: u32 = 0x8000_0000;
pub const COOKIE_DUP_MIN: u32 = COOKIE_DUP;
pub const COOKIE_DUP_MAX: u32 = COOKIE_DUP | COOKIE_MASK;

pub fn is_dup_cookie(cookie: u32) -> bool {
    cookie & COOKIE_DUP != 0
}

/// A name binding inside a directory. `node` is `None` for a whiteout.
#[derive(Clone, Debug)]
pub struct Dirent<T> {
    cookie: u32,
    hash: u32,
    name: Name,
    node: Option<T>,
}

impl<T> Dirent<T> {
    fn new(cookie: u32, hash: u32, name: Name, node: Option<T>) -> Self {
        Self {
            cookie,
            hash,
            name,
            node,
        }
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn node(&self) -> Option<&T> {
        self.node.as_ref()
    }

    pub fn into_node(self) -> Option<T> {
        self.node
    }

    pub fn is_whiteout(&self) -> bool {
        self.node.is_none()
    }
}

#[derive(Clone, Debug)]
enum Slot<T> {
    Plain(Dirent<T>),
    DuplicateHead(Vec<Dirent<T>>),
}

impl<T> Slot<T> {
    fn entries(&self) -> &[Dirent<T>] {
        match self {
            Slot::Plain(de) => std::slice::from_ref(de),
            Slot::DuplicateHead(chain) => chain,
        }
    }

    fn contains(&self, name: &[u8]) -> bool {
        self.entries().iter().any(|de| de.name == *name)
    }

    /// Turn a plain slot into a one-element chain.
    fn make_chain(&mut self) -> &mut Vec<Dirent<T>> {
        if let Slot::Plain(_) = self {
            if let Slot::Plain(old) = std::mem::replace(self, Slot::DuplicateHead(Vec::new())) {
                *self = Slot::DuplicateHead(vec![old]);
            }
        }
        match self {
            Slot::DuplicateHead(chain) => chain,
            Slot::Plain(_) => unreachable!("slot was converted to a duplicate head"),
        }
    }
}

/// Enumeration position. A plain value, so it stays valid (if possibly stale) while the
/// tree is mutated between calls; every use re-resolves it against the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirCursor {
    slot: u32,
    chained: Option<u32>,
}

impl DirCursor {
    fn plain(slot: u32) -> Self {
        Self {
            slot,
            chained: None,
        }
    }

    fn chained(slot: u32, cookie: u32) -> Self {
        Self {
            slot,
            chained: Some(cookie),
        }
    }
}

/// Per-directory entry index.
#[derive(Debug)]
pub struct DirTree<T> {
    slots: BTreeMap<u32, Slot<T>>,
    dup_index: BTreeMap<u32, u32>,
    /// Hashes whose plain cookie may not be handed out again.
    retired: BTreeSet<u32>,
    next_dup_cookie: u32,
    len: usize,
    epoch: u64,
}

impl<T> Default for DirTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DirTree<T> {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            dup_index: BTreeMap::new(),
            retired: BTreeSet::new(),
            next_dup_cookie: COOKIE_DUP_MIN,
            len: 0,
            epoch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Changes on every structural mutation.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn lookup(&self, name: &[u8]) -> Option<&Dirent<T>> {
        self.lookup_hashed(name, hash_name(name))
    }

    fn lookup_hashed(&self, name: &[u8], hash: u32) -> Option<&Dirent<T>> {
        self.slots
            .get(&hash)?
            .entries()
            .iter()
            .find(|de| de.name == *name)
    }

    /// Bind `name`, returning the cookie issued for it.
    pub fn insert(&mut self, name: Name, node: Option<T>) -> FsResult<u32> {
        let hash = hash_name(name.as_bytes());
        self.insert_hashed(name, hash, node)
    }

    pub(crate) fn insert_hashed(&mut self, name: Name, hash: u32, node: Option<T>) -> FsResult<u32> {
        debug_assert!((COOKIE_MIN..=COOKIE_MASK).contains(&hash));

        let cookie = match self.slots.get_mut(&hash) {
            None if self.retired.contains(&hash) => {
                Self::check_dup_cookies(self.next_dup_cookie, 1)?;
                let cookie = self.take_dup_cookie(hash);
                self.slots.insert(hash, Slot::Plain(Dirent::new(cookie, hash, name, node)));
                cookie
            }
            None => {
                self.slots.insert(hash, Slot::Plain(Dirent::new(hash, hash, name, node)));
                hash
            }
            Some(slot) => {
                if slot.contains(name.as_bytes()) {
                    return Err(FsError::AlreadyExists);
                }
                // An entry that already carries a duplicate cookie keeps it.
                let rekey = matches!(slot, Slot::Plain(de) if !is_dup_cookie(de.cookie));
                Self::check_dup_cookies(self.next_dup_cookie, if rekey { 2 } else { 1 })?;

                let chain = slot.make_chain();
                if rekey {
                    let cookie = self.next_dup_cookie;
                    self.next_dup_cookie += 1;
                    chain[0].cookie = cookie;
                    self.dup_index.insert(cookie, hash);
                    self.retired.insert(hash);
                }
                let cookie = self.next_dup_cookie;
                self.next_dup_cookie = self.next_dup_cookie.saturating_add(1);
                self.dup_index.insert(cookie, hash);
                chain.push(Dirent::new(cookie, hash, name, node));
                cookie
            }
        };

        self.len += 1;
        self.epoch += 1;
        Ok(cookie)
    }

    /// Unbind `name`, handing back the detached entry.
    pub fn remove(&mut self, name: &[u8]) -> Option<Dirent<T>> {
        self.remove_hashed(name, hash_name(name))
    }

    pub(crate) fn remove_hashed(&mut self, name: &[u8], hash: u32) -> Option<Dirent<T>> {
        let slot = self.slots.get_mut(&hash)?;
        let removed = match slot {
            Slot::Plain(de) => {
                if de.name != *name {
                    return None;
                }
                match self.slots.remove(&hash) {
                    Some(Slot::Plain(de)) => de,
                    _ => unreachable!("plain slot changed under exclusive borrow"),
                }
            }
            Slot::DuplicateHead(chain) => {
                let pos = chain.iter().position(|de| de.name == *name)?;
                let removed = chain.remove(pos);
                if chain.len() == 1 {
                    // The survivor goes back to a plain slot but keeps its cookie, so its
                    // dup-index entry stays.
                    if let Some(survivor) = chain.pop() {
                        *slot = Slot::Plain(survivor);
                    }
                }
                removed
            }
        };

        if is_dup_cookie(removed.cookie) {
            self.dup_index.remove(&removed.cookie);
        } else {
            self.retired.insert(hash);
        }
        self.len -= 1;
        self.epoch += 1;
        Some(removed)
    }

    fn check_dup_cookies(next: u32, needed: u64) -> FsResult<()> {
        if u64::from(next) + needed - 1 > u64::from(COOKIE_DUP_MAX) {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    fn take_dup_cookie(&mut self, hash: u32) -> u32 {
        let cookie = self.next_dup_cookie;
        self.next_dup_cookie = self.next_dup_cookie.saturating_add(1);
        self.dup_index.insert(cookie, hash);
        cookie
    }

    fn cursor_at(hash: u32, slot: &Slot<T>) -> DirCursor {
        match slot {
            Slot::Plain(_) => DirCursor::plain(hash),
            Slot::DuplicateHead(chain) => DirCursor::chained(hash, chain[0].cookie),
        }
    }

    fn first_slot_from(&self, lower: Bound<u32>) -> Option<DirCursor> {
        self.slots
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(hash, slot)| Self::cursor_at(*hash, slot))
    }

    pub fn first(&self) -> Option<DirCursor> {
        self.first_slot_from(Bound::Unbounded)
    }

    /// Entry under `cursor`, if it still exists.
    pub fn get(&self, cursor: &DirCursor) -> Option<&Dirent<T>> {
        match (self.slots.get(&cursor.slot)?, cursor.chained) {
            (Slot::Plain(de), None) => Some(de),
            (Slot::Plain(de), Some(cookie)) => (de.cookie == cookie).then_some(de),
            (Slot::DuplicateHead(chain), Some(cookie)) => chain.iter().find(|de| de.cookie == cookie),
            (Slot::DuplicateHead(_), None) => None,
        }
    }

    /// Position following `cursor`. Works whether or not the entry under `cursor` is
    /// still present: it moves to the next chained entry with a larger cookie, or else to
    /// the next slot in hash order.
    pub fn advance(&self, cursor: &DirCursor) -> Option<DirCursor> {
        if let Some(after) = cursor.chained {
            match self.slots.get(&cursor.slot) {
                Some(Slot::DuplicateHead(chain)) => {
                    if let Some(next) = chain.iter().find(|de| de.cookie > after) {
                        return Some(DirCursor::chained(cursor.slot, next.cookie));
                    }
                }
                Some(Slot::Plain(de)) if de.cookie > after => {
                    return Some(DirCursor::plain(cursor.slot));
                }
                _ => {}
            }
        }
        self.first_slot_from(Bound::Excluded(cursor.slot))
    }

    /// Resolve a resume cookie.
    ///
    /// A plain cookie resolves to the first slot whose hash is not below it, so a vanished
    /// entry skips forward. A duplicate cookie must match a live entry exactly; otherwise
    /// there is no position to resume from and `None` is returned.
    pub fn seek(&self, cookie: u32) -> Option<DirCursor> {
        if cookie & COOKIE_DUPHEAD != 0 {
            return None;
        }
        if is_dup_cookie(cookie) {
            let hash = *self.dup_index.get(&cookie)?;
            return match self.slots.get(&hash)? {
                Slot::Plain(de) if de.cookie == cookie => Some(DirCursor::plain(hash)),
                Slot::DuplicateHead(chain) if chain.iter().any(|de| de.cookie == cookie) => {
                    Some(DirCursor::chained(hash, cookie))
                }
                _ => None,
            };
        }
        self.first_slot_from(Bound::Included(cookie))
    }

    /// Entries in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = &Dirent<T>> {
        self.slots.values().flat_map(|slot| slot.entries().iter())
    }

    /// Detach every entry. The cookie counter is kept.
    pub fn drain(&mut self) -> Vec<Dirent<T>> {
        let slots = std::mem::take(&mut self.slots);
        self.dup_index.clear();
        self.len = 0;
        self.epoch += 1;
        slots
            .into_values()
            .flat_map(|slot| match slot {
                Slot::Plain(de) => vec![de],
                Slot::DuplicateHead(chain) => chain,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    const H: u32 = 0x1234;

    fn names(tree: &DirTree<u32>) -> Vec<String> {
        tree.iter().map(|de| de.name().to_string()).collect()
    }

    fn walk(tree: &DirTree<u32>) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = tree.first();
        while let Some(c) = cursor {
            out.push(tree.get(&c).unwrap().name().to_string());
            cursor = tree.advance(&c);
        }
        out
    }

    #[test]
    fn test_plain_insert_lookup_remove() {
        let mut tree = DirTree::new();
        let cookie = tree.insert(Name::from("a"), Some(1)).unwrap();
        assert_eq!(cookie, hash_name(b"a"));
        assert!(!is_dup_cookie(cookie));

        let de = tree.lookup(b"a").unwrap();
        assert_eq!(de.cookie(), cookie);
        assert_eq!(de.node(), Some(&1));
        assert_eq!(tree.len(), 1);

        let removed = tree.remove(b"a").unwrap();
        assert_eq!(removed.into_node(), Some(1));
        assert!(tree.lookup(b"a").is_none());
        assert!(tree.remove(b"a").is_none());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(1)).unwrap();
        assert!(matches!(
            tree.insert_hashed(Name::from("a"), H, Some(2)),
            Err(FsError::AlreadyExists)
        ));
        tree.insert_hashed(Name::from("b"), H, Some(2)).unwrap();
        assert!(matches!(
            tree.insert_hashed(Name::from("b"), H, Some(3)),
            Err(FsError::AlreadyExists)
        ));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_collision_moves_both_into_chain() {
        let mut tree = DirTree::new();
        let first = tree.insert_hashed(Name::from("a"), H, Some(1)).unwrap();
        assert_eq!(first, H);
        let second = tree.insert_hashed(Name::from("b"), H, Some(2)).unwrap();

        let a = tree.lookup_hashed(b"a", H).unwrap();
        let b = tree.lookup_hashed(b"b", H).unwrap();
        assert!(is_dup_cookie(a.cookie()));
        assert!(is_dup_cookie(b.cookie()));
        assert_ne!(a.cookie(), b.cookie());
        assert_eq!(b.cookie(), second);
        assert!(a.cookie() < b.cookie());
        assert_eq!(a.node(), Some(&1));
        assert_eq!(b.node(), Some(&2));
    }

    #[test]
    fn test_removing_one_collider_keeps_other_by_name_and_cookie() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(1)).unwrap();
        tree.insert_hashed(Name::from("b"), H, Some(2)).unwrap();
        let b_cookie = tree.lookup_hashed(b"b", H).unwrap().cookie();

        tree.remove_hashed(b"a", H).unwrap();
        let b = tree.lookup_hashed(b"b", H).unwrap();
        assert_eq!(b.cookie(), b_cookie);

        let cursor = tree.seek(b_cookie).unwrap();
        assert_eq!(tree.get(&cursor).unwrap().name(), &"b");

        tree.remove_hashed(b"b", H).unwrap();
        assert!(tree.is_empty());
        assert!(tree.seek(b_cookie).is_none());
    }

    #[test]
    fn test_chain_enumerates_in_insertion_order() {
        let mut tree = DirTree::new();
        for (i, name) in ["m", "c", "x", "a"].iter().enumerate() {
            tree.insert_hashed(Name::from(*name), H, Some(i as u32)).unwrap();
        }
        assert_eq!(names(&tree), vec!["m", "c", "x", "a"]);
        assert_eq!(walk(&tree), vec!["m", "c", "x", "a"]);
    }

    #[test]
    fn test_cookies_not_reused_after_removal() {
        let mut tree = DirTree::new();
        let mut seen = HashSet::new();
        tree.insert_hashed(Name::from("keep"), H, Some(0)).unwrap();
        for round in 0..20u32 {
            let name = Name::from("churn");
            let cookie = tree.insert_hashed(name, H, Some(round)).unwrap();
            assert!(seen.insert(cookie), "cookie {cookie:#x} issued twice");
            tree.remove_hashed(b"churn", H).unwrap();
        }
    }

    #[test]
    fn test_plain_cookie_not_handed_to_another_name() {
        let mut tree = DirTree::new();
        let a = tree.insert_hashed(Name::from("a"), H, Some(0)).unwrap();
        assert_eq!(a, H);
        tree.remove_hashed(b"a", H).unwrap();

        let b = tree.insert_hashed(Name::from("b"), H, Some(1)).unwrap();
        assert!(is_dup_cookie(b));
        let at = tree.seek(b).unwrap();
        assert_eq!(tree.get(&at).unwrap().name(), &"b");
        assert_eq!(walk(&tree), vec!["b"]);

        // A hash that lost its plain cookie to a collision is retired too.
        tree.insert_hashed(Name::from("x"), H + 1, Some(2)).unwrap();
        tree.insert_hashed(Name::from("y"), H + 1, Some(3)).unwrap();
        tree.remove_hashed(b"x", H + 1).unwrap();
        tree.remove_hashed(b"y", H + 1).unwrap();
        let z = tree.insert_hashed(Name::from("z"), H + 1, Some(4)).unwrap();
        assert!(is_dup_cookie(z));
    }

    #[test]
    fn test_retired_set_grows_once_per_hash() {
        let mut tree = DirTree::new();
        for round in 0..10u32 {
            tree.insert_hashed(Name::from("churn"), H, Some(round)).unwrap();
            tree.remove_hashed(b"churn", H).unwrap();
        }
        // Only the first removal gave up a plain cookie.
        assert_eq!(tree.retired.len(), 1);

        tree.insert_hashed(Name::from("a"), H + 1, Some(0)).unwrap();
        tree.insert_hashed(Name::from("b"), H + 1, Some(1)).unwrap();
        tree.remove_hashed(b"b", H + 1).unwrap();
        tree.remove_hashed(b"a", H + 1).unwrap();
        assert_eq!(tree.retired.len(), 2);
    }

    #[test]
    fn test_enumeration_visits_every_entry_once() {
        let mut tree = DirTree::new();
        for i in 0..200u32 {
            tree.insert(Name::new(format!("file{i}")), Some(i)).unwrap();
        }
        // Force a few collisions on top of whatever the hash produced.
        for i in 0..5u32 {
            tree.insert_hashed(Name::new(format!("dup{i}")), H, Some(1000 + i)).unwrap();
        }

        let visited = walk(&tree);
        assert_eq!(visited.len(), tree.len());
        let unique: HashSet<_> = visited.iter().collect();
        assert_eq!(unique.len(), visited.len());
        assert_eq!(visited, names(&tree));
    }

    #[test]
    fn test_advance_after_current_chained_entry_removed() {
        let mut tree = DirTree::new();
        for name in ["a", "b", "c"] {
            tree.insert_hashed(Name::from(name), H, Some(0)).unwrap();
        }
        tree.insert_hashed(Name::from("later"), H + 1, Some(0)).unwrap();

        let cursor = tree.first().unwrap();
        assert_eq!(tree.get(&cursor).unwrap().name(), &"a");
        tree.remove_hashed(b"a", H).unwrap();
        assert!(tree.get(&cursor).is_none());

        let next = tree.advance(&cursor).unwrap();
        assert_eq!(tree.get(&next).unwrap().name(), &"b");
        let next = tree.advance(&next).unwrap();
        assert_eq!(tree.get(&next).unwrap().name(), &"c");
        let next = tree.advance(&next).unwrap();
        assert_eq!(tree.get(&next).unwrap().name(), &"later");
        assert!(tree.advance(&next).is_none());
    }

    #[test]
    fn test_advance_reaches_survivor_after_collapse() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(0)).unwrap();
        tree.insert_hashed(Name::from("b"), H, Some(0)).unwrap();

        let cursor = tree.first().unwrap();
        tree.remove_hashed(b"a", H).unwrap();

        let next = tree.advance(&cursor).unwrap();
        assert_eq!(tree.get(&next).unwrap().name(), &"b");
        assert!(tree.advance(&next).is_none());
    }

    #[test]
    fn test_survivor_rejoining_chain_keeps_cookie() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(0)).unwrap();
        tree.insert_hashed(Name::from("b"), H, Some(0)).unwrap();
        tree.remove_hashed(b"a", H).unwrap();
        let b_cookie = tree.lookup_hashed(b"b", H).unwrap().cookie();

        let c_cookie = tree.insert_hashed(Name::from("c"), H, Some(0)).unwrap();
        assert_eq!(tree.lookup_hashed(b"b", H).unwrap().cookie(), b_cookie);
        assert!(c_cookie > b_cookie);
        assert_eq!(walk(&tree), vec!["b", "c"]);
    }

    #[test]
    fn test_seek_plain_cookie_skips_forward() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("low"), 100, Some(0)).unwrap();
        tree.insert_hashed(Name::from("mid"), 200, Some(0)).unwrap();
        tree.insert_hashed(Name::from("high"), 300, Some(0)).unwrap();

        let at = tree.seek(200).unwrap();
        assert_eq!(tree.get(&at).unwrap().name(), &"mid");

        tree.remove_hashed(b"mid", 200).unwrap();
        let at = tree.seek(200).unwrap();
        assert_eq!(tree.get(&at).unwrap().name(), &"high");

        assert!(tree.seek(301).is_none());
    }

    #[test]
    fn test_seek_vanished_dup_cookie_is_end() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(0)).unwrap();
        tree.insert_hashed(Name::from("b"), H, Some(0)).unwrap();
        tree.insert_hashed(Name::from("c"), H, Some(0)).unwrap();
        let b_cookie = tree.lookup_hashed(b"b", H).unwrap().cookie();

        tree.remove_hashed(b"b", H).unwrap();
        assert!(tree.seek(b_cookie).is_none());
        assert!(tree.seek(COOKIE_DUPHEAD | H).is_none());
    }

    #[test]
    fn test_seek_old_plain_cookie_lands_on_chain_start() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(0)).unwrap();
        tree.insert_hashed(Name::from("b"), H, Some(0)).unwrap();

        let at = tree.seek(H).unwrap();
        assert_eq!(tree.get(&at).unwrap().name(), &"a");
    }

    #[test]
    fn test_dup_cookie_exhaustion_fails_without_change() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(0)).unwrap();
        tree.next_dup_cookie = COOKIE_DUP_MAX;

        let epoch = tree.epoch();
        assert!(matches!(
            tree.insert_hashed(Name::from("b"), H, Some(1)),
            Err(FsError::NoSpace)
        ));
        assert_eq!(tree.epoch(), epoch);
        assert_eq!(tree.lookup_hashed(b"a", H).unwrap().cookie(), H);
        assert!(tree.lookup_hashed(b"b", H).is_none());
    }

    #[test]
    fn test_whiteout_entry() {
        let mut tree: DirTree<u32> = DirTree::new();
        tree.insert(Name::from("gone"), None).unwrap();
        assert!(tree.lookup(b"gone").unwrap().is_whiteout());
    }

    #[test]
    fn test_drain_empties_and_bumps_epoch() {
        let mut tree = DirTree::new();
        tree.insert_hashed(Name::from("a"), H, Some(1)).unwrap();
        tree.insert_hashed(Name::from("b"), H, Some(2)).unwrap();
        tree.insert(Name::from("c"), Some(3)).unwrap();
        let epoch = tree.epoch();

        let drained = tree.drain();
        assert_eq!(drained.len(), 3);
        assert!(tree.is_empty());
        assert!(tree.first().is_none());
        assert!(tree.epoch() > epoch);
    }

    proptest! {
        // Hashes folded into four slots so chains form constantly.
        #[test]
        fn proptest_cookies_unique_and_entries_reachable(
            ops in proptest::collection::vec((0u8..24, any::<bool>()), 1..200)
        ) {
            let mut tree = DirTree::new();
            let mut live: HashSet<String> = HashSet::new();
            let mut issued: HashSet<u32> = HashSet::new();
            let mut assigned: HashMap<u32, String> = HashMap::new();

            for (n, insert) in ops {
                let name = format!("n{n}");
                let hash = COOKIE_MIN + u32::from(n % 4);
                if insert {
                    match tree.insert_hashed(Name::new(&name), hash, Some(u32::from(n))) {
                        Ok(cookie) => {
                            prop_assert!(live.insert(name.clone()));
                            if is_dup_cookie(cookie) {
                                prop_assert!(issued.insert(cookie), "dup cookie reissued");
                            }
                        }
                        Err(FsError::AlreadyExists) => prop_assert!(live.contains(&name)),
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                } else {
                    let removed = tree.remove_hashed(name.as_bytes(), hash);
                    prop_assert_eq!(removed.is_some(), live.remove(&name));
                }

                // No cookie ever names two different entries.
                for de in tree.iter() {
                    let owner = assigned
                        .entry(de.cookie())
                        .or_insert_with(|| de.name().to_string());
                    let name = de.name().to_string();
                    prop_assert_eq!(owner.as_str(), name.as_str());
                }
            }

            prop_assert_eq!(tree.len(), live.len());
            let cookies: Vec<u32> = tree.iter().map(|de| de.cookie()).collect();
            let unique: HashSet<u32> = cookies.iter().copied().collect();
            prop_assert_eq!(unique.len(), cookies.len());

            for name in &live {
                let n: u32 = name[1..].parse().unwrap();
                let hash = COOKIE_MIN + n % 4;
                let de = tree.lookup_hashed(name.as_bytes(), hash);
                prop_assert!(de.is_some());
                let cursor = tree.seek(de.unwrap().cookie());
                prop_assert!(cursor.is_some());
                prop_assert_eq!(tree.get(&cursor.unwrap()).unwrap().name().to_string(), name.clone());
            }
            prop_assert_eq!(walk(&tree).len(), live.len());
        }
    }
}
