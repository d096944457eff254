use std::sync::Arc;

use log::debug;

use crate::error::{ErrorKind, SmallError};
use crate::index::node::{self, LeafEntry, MAX_INTERNAL_KEYS, MAX_LEAF_ENTRIES};
use crate::storage::buffer_pool::PageGuard;
use crate::storage::engine::StorageEngine;
use crate::types::{PageId, Rid, SmallResult, INVALID_PAGE_ID};

const MAX_DEPTH: usize = 64;

/// A key type that can serve as a B+ tree key.
///
/// The tree stores 32-bit keys. Integers map by checked cast; strings (and
/// doubles) map through a stable 32-bit FNV-1a hash. Hashed keys collide,
/// so the tree admits duplicate keys pointing at different rows and the
/// caller re-checks equality on the original value; see
/// [`BPlusTree::insert_generic`].
pub trait IndexKey {
    fn to_index_key(&self) -> Result<i32, SmallError>;

    /// Whether the mapping loses information (hash), in which case inserts
    /// keep duplicates instead of updating in place.
    fn is_hashed() -> bool;
}

impl IndexKey for i32 {
    fn to_index_key(&self) -> Result<i32, SmallError> {
        Ok(*self)
    }

    fn is_hashed() -> bool {
        false
    }
}

impl IndexKey for i64 {
    fn to_index_key(&self) -> Result<i32, SmallError> {
        if *self < i32::MIN as i64 || *self > i32::MAX as i64 {
            return Err(SmallError::new(
                ErrorKind::InvalidParam,
                &format!("key {} does not fit the 32-bit index key space", self),
            ));
        }
        Ok(*self as i32)
    }

    fn is_hashed() -> bool {
        false
    }
}

impl IndexKey for &str {
    fn to_index_key(&self) -> Result<i32, SmallError> {
        Ok(fnv1a_32(self.as_bytes()) as i32)
    }

    fn is_hashed() -> bool {
        true
    }
}

impl IndexKey for String {
    fn to_index_key(&self) -> Result<i32, SmallError> {
        Ok(fnv1a_32(self.as_bytes()) as i32)
    }

    fn is_hashed() -> bool {
        true
    }
}

impl IndexKey for f64 {
    fn to_index_key(&self) -> Result<i32, SmallError> {
        Ok(fnv1a_32(&self.to_bits().to_le_bytes()) as i32)
    }

    fn is_hashed() -> bool {
        true
    }
}

fn integrity_error(page_id: PageId, what: &str) -> SmallError {
    SmallError::new(
        ErrorKind::InvalidParam,
        &format!("b+ tree page {}: {}", page_id, what),
    )
}

/// Stable 32-bit FNV-1a. The hash must not change between runs, since
/// hashed keys are persisted in index pages.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A B+ tree whose nodes each occupy one index page.
///
/// Leaves hold `(key, rid)` entries sorted by key and are doubly linked
/// for range scans; internal nodes hold separator keys where the key at
/// position `i` equals the smallest key of the subtree under child `i+1`.
/// The root page id changes when the root splits or collapses; callers
/// persist it (the catalog stores it in the index schema) by reading
/// [`BPlusTree::root`] after mutations.
pub struct BPlusTree {
    engine: Arc<StorageEngine>,
    root: PageId,
    leaf_capacity: usize,
    internal_capacity: usize,
}

impl BPlusTree {
    /// Create an empty tree: a single leaf root.
    pub fn create(engine: &Arc<StorageEngine>) -> Result<Self, SmallError> {
        let (root, guard) = engine.create_index_page()?;
        {
            let mut data = guard.write();
            node::init_leaf(&mut data);
        }
        debug!("created b+ tree with root {}", root);
        Ok(Self {
            engine: Arc::clone(engine),
            root,
            leaf_capacity: MAX_LEAF_ENTRIES,
            internal_capacity: MAX_INTERNAL_KEYS,
        })
    }

    /// Attach to an existing tree rooted at `root`.
    pub fn attach(engine: &Arc<StorageEngine>, root: PageId) -> Self {
        Self {
            engine: Arc::clone(engine),
            root,
            leaf_capacity: MAX_LEAF_ENTRIES,
            internal_capacity: MAX_INTERNAL_KEYS,
        }
    }

    /// Lower the node capacities below the physical maximum. Small
    /// capacities force deep trees out of few keys, which is how the split
    /// and merge paths get exercised without hundreds of thousands of
    /// inserts.
    pub fn with_capacities(mut self, leaf: usize, internal: usize) -> Self {
        assert!(leaf >= 2 && leaf <= MAX_LEAF_ENTRIES);
        assert!(internal >= 2 && internal <= MAX_INTERNAL_KEYS);
        self.leaf_capacity = leaf;
        self.internal_capacity = internal;
        self
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    fn min_leaf_entries(&self) -> usize {
        self.leaf_capacity / 2
    }

    fn min_internal_keys(&self) -> usize {
        self.internal_capacity / 2
    }

    // ------------------------------------------------------------------
    // descent
    // ------------------------------------------------------------------

    /// Walk from the root to the leaf that covers `key`.
    fn find_leaf(&self, key: i32) -> Result<PageId, SmallError> {
        let mut current = self.root;
        for _ in 0..MAX_DEPTH {
            let guard = self.engine.get_index_page(current)?;
            let data = guard.read();
            if node::is_leaf(&data) {
                return Ok(current);
            }
            let count = node::key_count(&data) as usize;
            // smallest i with key < keys[i]; the last child otherwise
            let mut i = 0;
            while i < count && key >= node::internal_key(&data, i) {
                i += 1;
            }
            current = node::internal_child(&data, i);
        }
        Err(SmallError::new(
            ErrorKind::InvalidParam,
            "b+ tree deeper than the depth bound, likely corrupted",
        ))
    }

    /// Like [`find_leaf`], but for duplicate keys lands on the leftmost
    /// leaf that may contain `key`. Duplicates can straddle a split, so
    /// the plain descent may land mid-run.
    fn find_first_leaf(&self, key: i32) -> Result<PageId, SmallError> {
        let mut leaf_id = self.find_leaf(key)?;
        loop {
            let prev = {
                let guard = self.engine.get_index_page(leaf_id)?;
                let data = guard.read();
                let prev = node::leaf_prev(&data);
                if prev == INVALID_PAGE_ID {
                    return Ok(leaf_id);
                }
                prev
            };
            let guard = self.engine.get_index_page(prev)?;
            let data = guard.read();
            let count = node::key_count(&data) as usize;
            if count == 0 || node::leaf_entry(&data, count - 1).key < key {
                return Ok(leaf_id);
            }
            leaf_id = prev;
        }
    }

    // ------------------------------------------------------------------
    // search / range
    // ------------------------------------------------------------------

    /// Point lookup. Returns the first entry with the key.
    pub fn search(&self, key: i32) -> Result<Option<Rid>, SmallError> {
        let leaf_id = self.find_first_leaf(key)?;
        let guard = self.engine.get_index_page(leaf_id)?;
        let data = guard.read();
        match node::leaf_search(&data, key) {
            Ok(index) => Ok(Some(node::leaf_entry(&data, index).rid)),
            Err(_) => Ok(None),
        }
    }

    pub fn has_key(&self, key: i32) -> Result<bool, SmallError> {
        Ok(self.search(key)?.is_some())
    }

    /// All rows with `low <= key <= high`, in ascending key order, walking
    /// the leaf sibling chain.
    pub fn range(&self, low: i32, high: i32) -> Result<Vec<Rid>, SmallError> {
        Ok(self
            .range_entries(low, high)?
            .into_iter()
            .map(|e| e.rid)
            .collect())
    }

    pub(crate) fn range_entries(&self, low: i32, high: i32) -> Result<Vec<LeafEntry>, SmallError> {
        let mut out = Vec::new();
        if low > high {
            return Ok(out);
        }

        let mut leaf_id = self.find_first_leaf(low)?;
        while leaf_id != INVALID_PAGE_ID {
            let guard = self.engine.get_index_page(leaf_id)?;
            let data = guard.read();
            let count = node::key_count(&data) as usize;
            for i in 0..count {
                let entry = node::leaf_entry(&data, i);
                if entry.key < low {
                    continue;
                }
                if entry.key > high {
                    return Ok(out);
                }
                out.push(entry);
            }
            leaf_id = node::leaf_next(&data);
        }
        Ok(out)
    }

    /// Total number of entries, summed over the leaf chain.
    pub fn key_count(&self) -> Result<usize, SmallError> {
        let mut leaf_id = self.leftmost_leaf()?;
        let mut total = 0;
        while leaf_id != INVALID_PAGE_ID {
            let guard = self.engine.get_index_page(leaf_id)?;
            let data = guard.read();
            total += node::key_count(&data) as usize;
            leaf_id = node::leaf_next(&data);
        }
        Ok(total)
    }

    fn leftmost_leaf(&self) -> Result<PageId, SmallError> {
        let mut current = self.root;
        for _ in 0..MAX_DEPTH {
            let guard = self.engine.get_index_page(current)?;
            let data = guard.read();
            if node::is_leaf(&data) {
                return Ok(current);
            }
            current = node::internal_child(&data, 0);
        }
        Err(SmallError::new(
            ErrorKind::InvalidParam,
            "b+ tree deeper than the depth bound, likely corrupted",
        ))
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    /// Insert `key -> rid`. An existing entry with the same key has its
    /// rid overwritten in place.
    pub fn insert(&mut self, key: i32, rid: Rid) -> SmallResult {
        self.insert_entry(key, rid, false)
    }

    /// Insert keeping duplicates: an existing equal key does not absorb
    /// the new entry. Used for hashed key types, where equal 32-bit keys
    /// may stand for different original values.
    pub fn insert_duplicate(&mut self, key: i32, rid: Rid) -> SmallResult {
        self.insert_entry(key, rid, true)
    }

    fn insert_entry(&mut self, key: i32, rid: Rid, allow_duplicate: bool) -> SmallResult {
        let leaf_id = self.find_leaf(key)?;
        let guard = self.engine.get_index_page(leaf_id)?;

        let (position, count) = {
            let data = guard.read();
            let count = node::key_count(&data) as usize;
            match node::leaf_search(&data, key) {
                Ok(index) if !allow_duplicate => {
                    drop(data);
                    let mut data = guard.write();
                    node::set_leaf_entry(&mut data, index, &LeafEntry { key, rid });
                    return Ok(());
                }
                Ok(index) => (index, count),
                Err(index) => (index, count),
            }
        };

        if count < self.leaf_capacity {
            let mut data = guard.write();
            node::leaf_insert_at(&mut data, position, &LeafEntry { key, rid });
            return Ok(());
        }

        drop(guard);
        self.split_leaf(leaf_id, position, LeafEntry { key, rid })
    }

    /// Split a full leaf around a pending insert.
    ///
    /// The logical `n + 1` entries are divided so the right sibling takes
    /// the larger half, and the right sibling's first key becomes the
    /// separator pushed into the parent. Pages are written right sibling
    /// first, then the left, then the parent.
    fn split_leaf(&mut self, leaf_id: PageId, position: usize, entry: LeafEntry) -> SmallResult {
        let guard = self.engine.get_index_page(leaf_id)?;

        let mut entries = node::leaf_entries(&guard.read());
        entries.insert(position, entry);
        let left_count = entries.len() / 2;
        let right_entries = entries.split_off(left_count);

        let (parent_id, old_next) = {
            let data = guard.read();
            (node::parent(&data), node::leaf_next(&data))
        };

        // right sibling first
        let (new_id, new_guard) = self.engine.create_index_page()?;
        {
            let mut data = new_guard.write();
            node::init_leaf(&mut data);
            node::set_leaf_entries(&mut data, &right_entries);
            node::set_leaf_prev(&mut data, leaf_id);
            node::set_leaf_next(&mut data, old_next);
            node::set_parent(&mut data, parent_id);
        }

        // then the left half
        {
            let mut data = guard.write();
            node::set_leaf_entries(&mut data, &entries);
            node::set_leaf_next(&mut data, new_id);
        }

        // the old right neighbor gains a new predecessor
        if old_next != INVALID_PAGE_ID {
            let next_guard = self.engine.get_index_page(old_next)?;
            let mut data = next_guard.write();
            node::set_leaf_prev(&mut data, new_id);
        }

        let separator = right_entries[0].key;
        debug!(
            "split leaf {} -> {} + {}, separator {}",
            leaf_id, leaf_id, new_id, separator
        );

        drop(new_guard);
        drop(guard);
        self.insert_into_parent(leaf_id, new_id, separator)
    }

    /// Install `separator` (and the new right child) in the parent of
    /// `left_id`, splitting internal nodes upward as needed.
    fn insert_into_parent(
        &mut self,
        left_id: PageId,
        right_id: PageId,
        separator: i32,
    ) -> SmallResult {
        let parent_id = {
            let guard = self.engine.get_index_page(left_id)?;
            let data = guard.read();
            node::parent(&data)
        };

        if parent_id == INVALID_PAGE_ID {
            // splitting the root: grow the tree by one level
            let (new_root, root_guard) = self.engine.create_index_page()?;
            {
                let mut data = root_guard.write();
                node::init_internal(&mut data);
                node::set_internal_body(&mut data, &[separator], &[left_id, right_id]);
            }
            drop(root_guard);
            self.set_parent_of(left_id, new_root)?;
            self.set_parent_of(right_id, new_root)?;
            self.root = new_root;
            debug!("new root {} over {} and {}", new_root, left_id, right_id);
            return Ok(());
        }

        let guard = self.engine.get_index_page(parent_id)?;
        let count = node::key_count(&guard.read()) as usize;
        let index = node::find_child_index(&guard.read(), left_id).ok_or_else(|| {
            SmallError::new(
                ErrorKind::InvalidParam,
                &format!("page {} missing from its parent {}", left_id, parent_id),
            )
        })?;

        if count < self.internal_capacity {
            {
                let mut data = guard.write();
                node::internal_insert_at(&mut data, index, separator, right_id);
            }
            drop(guard);
            self.set_parent_of(right_id, parent_id)?;
            return Ok(());
        }

        // split the internal node; the middle key moves up instead of
        // being duplicated
        let mut keys = node::internal_keys(&guard.read());
        let mut children = node::internal_children(&guard.read());
        keys.insert(index, separator);
        children.insert(index + 1, right_id);

        let mid = keys.len() / 2;
        let push_up = keys[mid];
        let right_keys = keys.split_off(mid + 1);
        keys.truncate(mid);
        let right_children = children.split_off(mid + 1);

        let grandparent = node::parent(&guard.read());

        let (new_id, new_guard) = self.engine.create_index_page()?;
        {
            let mut data = new_guard.write();
            node::init_internal(&mut data);
            node::set_internal_body(&mut data, &right_keys, &right_children);
            node::set_parent(&mut data, grandparent);
        }
        {
            let mut data = guard.write();
            node::set_internal_body(&mut data, &keys, &children);
        }
        drop(new_guard);
        drop(guard);

        // children that moved now answer to the new node; the freshly
        // inserted right child may be on either side
        for child in &right_children {
            self.set_parent_of(*child, new_id)?;
        }
        if children.contains(&right_id) {
            self.set_parent_of(right_id, parent_id)?;
        }

        debug!(
            "split internal {} -> {} + {}, push up {}",
            parent_id, parent_id, new_id, push_up
        );
        self.insert_into_parent(parent_id, new_id, push_up)
    }

    fn set_parent_of(&self, page_id: PageId, parent: PageId) -> SmallResult {
        let guard = self.engine.get_index_page(page_id)?;
        let mut data = guard.write();
        node::set_parent(&mut data, parent);
        Ok(())
    }

    // ------------------------------------------------------------------
    // update / delete
    // ------------------------------------------------------------------

    /// Overwrite the rid stored under `key`. Fails when the key is absent.
    pub fn update(&mut self, key: i32, new_rid: Rid) -> SmallResult {
        let leaf_id = self.find_first_leaf(key)?;
        let guard = self.engine.get_index_page(leaf_id)?;
        let index = {
            let data = guard.read();
            node::leaf_search(&data, key)
        };
        match index {
            Ok(index) => {
                let mut data = guard.write();
                node::set_leaf_entry(&mut data, index, &LeafEntry { key, rid: new_rid });
                Ok(())
            }
            Err(_) => Err(SmallError::new(
                ErrorKind::NotFound,
                &format!("key {} is not in the index", key),
            )),
        }
    }

    /// Remove the first entry with `key`. Fails when the key is absent.
    pub fn delete(&mut self, key: i32) -> SmallResult {
        let leaf_id = self.find_first_leaf(key)?;
        let guard = self.engine.get_index_page(leaf_id)?;
        let index = node::leaf_search(&guard.read(), key);
        match index {
            Ok(index) => {
                {
                    let mut data = guard.write();
                    node::leaf_remove_at(&mut data, index);
                }
                drop(guard);
                self.rebalance_leaf(leaf_id)
            }
            Err(_) => Err(SmallError::new(
                ErrorKind::NotFound,
                &format!("key {} is not in the index", key),
            )),
        }
    }

    /// Remove the entry matching both `key` and `rid`. With hashed keys
    /// several entries can share a key; this picks the right one. The
    /// matching run may span sibling leaves.
    pub fn delete_exact(&mut self, key: i32, rid: Rid) -> SmallResult {
        let mut leaf_id = self.find_first_leaf(key)?;
        while leaf_id != INVALID_PAGE_ID {
            let guard = self.engine.get_index_page(leaf_id)?;
            let found = {
                let data = guard.read();
                let count = node::key_count(&data) as usize;
                let mut found = None;
                let mut past_run = false;
                for i in 0..count {
                    let entry = node::leaf_entry(&data, i);
                    if entry.key > key {
                        past_run = true;
                        break;
                    }
                    if entry.key == key && entry.rid == rid {
                        found = Some(i);
                        break;
                    }
                }
                match found {
                    Some(i) => Ok(i),
                    None if past_run || count == 0 => Err(INVALID_PAGE_ID),
                    None => Err(node::leaf_next(&data)),
                }
            };
            match found {
                Ok(index) => {
                    {
                        let mut data = guard.write();
                        node::leaf_remove_at(&mut data, index);
                    }
                    drop(guard);
                    return self.rebalance_leaf(leaf_id);
                }
                Err(next) => {
                    if next == INVALID_PAGE_ID {
                        break;
                    }
                    leaf_id = next;
                }
            }
        }
        Err(SmallError::new(
            ErrorKind::NotFound,
            &format!("entry {} -> {} is not in the index", key, rid),
        ))
    }

    /// Restore minimum occupancy of a leaf after a removal: borrow from a
    /// sibling under the same parent when possible, merge otherwise.
    fn rebalance_leaf(&mut self, leaf_id: PageId) -> SmallResult {
        if leaf_id == self.root {
            return Ok(());
        }

        let guard = self.engine.get_index_page(leaf_id)?;
        let count = node::key_count(&guard.read()) as usize;
        if count >= self.min_leaf_entries() {
            return Ok(());
        }
        let parent_id = node::parent(&guard.read());

        let parent_guard = self.engine.get_index_page(parent_id)?;
        let index = node::find_child_index(&parent_guard.read(), leaf_id).ok_or_else(|| {
            SmallError::new(
                ErrorKind::InvalidParam,
                &format!("leaf {} missing from its parent {}", leaf_id, parent_id),
            )
        })?;
        let parent_count = node::key_count(&parent_guard.read()) as usize;

        // borrow from the left sibling
        if index > 0 {
            let left_id = node::internal_child(&parent_guard.read(), index - 1);
            let left_guard = self.engine.get_index_page(left_id)?;
            let left_count = node::key_count(&left_guard.read()) as usize;
            if left_count > self.min_leaf_entries() {
                let moved = node::leaf_entry(&left_guard.read(), left_count - 1);
                {
                    let mut data = left_guard.write();
                    node::leaf_remove_at(&mut data, left_count - 1);
                }
                {
                    let mut data = guard.write();
                    node::leaf_insert_at(&mut data, 0, &moved);
                }
                let mut data = parent_guard.write();
                node::set_internal_key(&mut data, index - 1, moved.key);
                return Ok(());
            }
        }

        // borrow from the right sibling
        if index < parent_count {
            let right_id = node::internal_child(&parent_guard.read(), index + 1);
            let right_guard = self.engine.get_index_page(right_id)?;
            let right_count = node::key_count(&right_guard.read()) as usize;
            if right_count > self.min_leaf_entries() {
                let moved = node::leaf_entry(&right_guard.read(), 0);
                {
                    let mut data = right_guard.write();
                    node::leaf_remove_at(&mut data, 0);
                }
                {
                    let mut data = guard.write();
                    let count = node::key_count(&data) as usize;
                    node::leaf_insert_at(&mut data, count, &moved);
                }
                let new_first = node::leaf_entry(&right_guard.read(), 0).key;
                let mut data = parent_guard.write();
                node::set_internal_key(&mut data, index, new_first);
                return Ok(());
            }
        }

        // merge: prefer absorbing into the left sibling
        let freed;
        if index > 0 {
            let left_id = node::internal_child(&parent_guard.read(), index - 1);
            let left_guard = self.engine.get_index_page(left_id)?;
            self.merge_leaves(&left_guard, &guard, left_id)?;
            {
                let mut data = parent_guard.write();
                node::internal_remove_at(&mut data, index - 1, index);
            }
            freed = leaf_id;
        } else {
            let right_id = node::internal_child(&parent_guard.read(), index + 1);
            let right_guard = self.engine.get_index_page(right_id)?;
            self.merge_leaves(&guard, &right_guard, leaf_id)?;
            {
                let mut data = parent_guard.write();
                node::internal_remove_at(&mut data, index, index + 1);
            }
            freed = right_id;
        }

        drop(parent_guard);
        drop(guard);
        self.engine.remove_page(freed)?;
        self.shrink_or_rebalance_parent(parent_id)
    }

    /// Move every entry of `right` into `left` and unlink `right` from the
    /// sibling chain.
    fn merge_leaves(&self, left: &PageGuard, right: &PageGuard, left_id: PageId) -> SmallResult {
        let right_entries = node::leaf_entries(&right.read());
        let right_next = node::leaf_next(&right.read());
        {
            let mut data = left.write();
            let mut count = node::key_count(&data) as usize;
            for entry in &right_entries {
                node::leaf_insert_at(&mut data, count, entry);
                count += 1;
            }
            node::set_leaf_next(&mut data, right_next);
        }
        if right_next != INVALID_PAGE_ID {
            let next_guard = self.engine.get_index_page(right_next)?;
            let mut data = next_guard.write();
            node::set_leaf_prev(&mut data, left_id);
        }
        Ok(())
    }

    /// After a merge removed a separator from `node_id`: collapse the root
    /// when it ran out of keys, or rebalance a non-root internal node that
    /// fell under minimum occupancy.
    fn shrink_or_rebalance_parent(&mut self, node_id: PageId) -> SmallResult {
        let (count, is_root) = {
            let guard = self.engine.get_index_page(node_id)?;
            let data = guard.read();
            (node::key_count(&data) as usize, node_id == self.root)
        };

        if is_root {
            if count == 0 {
                // the root has a single child left; that child is the new root
                let child = {
                    let guard = self.engine.get_index_page(node_id)?;
                    let data = guard.read();
                    node::internal_child(&data, 0)
                };
                self.set_parent_of(child, INVALID_PAGE_ID)?;
                self.engine.remove_page(node_id)?;
                self.root = child;
                debug!("root collapsed to {}", child);
            }
            return Ok(());
        }

        if count >= self.min_internal_keys() {
            return Ok(());
        }
        self.rebalance_internal(node_id)
    }

    /// Borrow or merge for internal nodes. Keys rotate through the parent
    /// separator, children move with their subtrees.
    fn rebalance_internal(&mut self, node_id: PageId) -> SmallResult {
        let guard = self.engine.get_index_page(node_id)?;
        let parent_id = node::parent(&guard.read());

        let parent_guard = self.engine.get_index_page(parent_id)?;
        let index = node::find_child_index(&parent_guard.read(), node_id).ok_or_else(|| {
            SmallError::new(
                ErrorKind::InvalidParam,
                &format!("node {} missing from its parent {}", node_id, parent_id),
            )
        })?;
        let parent_count = node::key_count(&parent_guard.read()) as usize;

        // borrow from the left sibling: the parent separator comes down as
        // our new first key, the left sibling's last child comes along
        if index > 0 {
            let left_id = node::internal_child(&parent_guard.read(), index - 1);
            let left_guard = self.engine.get_index_page(left_id)?;
            let left_count = node::key_count(&left_guard.read()) as usize;
            if left_count > self.min_internal_keys() {
                let separator = node::internal_key(&parent_guard.read(), index - 1);
                let moved_child = node::internal_child(&left_guard.read(), left_count);
                let new_separator = node::internal_key(&left_guard.read(), left_count - 1);

                {
                    let mut data = guard.write();
                    let keys = node::internal_keys(&data);
                    let children = node::internal_children(&data);
                    let mut new_keys = vec![separator];
                    new_keys.extend(keys);
                    let mut new_children = vec![moved_child];
                    new_children.extend(children);
                    node::set_internal_body(&mut data, &new_keys, &new_children);
                }
                {
                    let mut data = left_guard.write();
                    node::internal_remove_at(&mut data, left_count - 1, left_count);
                }
                {
                    let mut data = parent_guard.write();
                    node::set_internal_key(&mut data, index - 1, new_separator);
                }
                drop(left_guard);
                drop(parent_guard);
                drop(guard);
                return self.set_parent_of(moved_child, node_id);
            }
        }

        // borrow from the right sibling, symmetric
        if index < parent_count {
            let right_id = node::internal_child(&parent_guard.read(), index + 1);
            let right_guard = self.engine.get_index_page(right_id)?;
            let right_count = node::key_count(&right_guard.read()) as usize;
            if right_count > self.min_internal_keys() {
                let separator = node::internal_key(&parent_guard.read(), index);
                let moved_child = node::internal_child(&right_guard.read(), 0);
                let new_separator = node::internal_key(&right_guard.read(), 0);

                {
                    let mut data = guard.write();
                    let count = node::key_count(&data) as usize;
                    node::set_internal_key(&mut data, count, separator);
                    node::set_internal_child(&mut data, count + 1, moved_child);
                    node::set_key_count(&mut data, (count + 1) as u16);
                }
                {
                    let mut data = right_guard.write();
                    node::internal_remove_at(&mut data, 0, 0);
                }
                {
                    let mut data = parent_guard.write();
                    node::set_internal_key(&mut data, index, new_separator);
                }
                drop(right_guard);
                drop(parent_guard);
                drop(guard);
                return self.set_parent_of(moved_child, node_id);
            }
        }

        // merge with a sibling; the separator between the pair comes down
        let (absorber_id, victim_id, separator_index) = if index > 0 {
            let left_id = node::internal_child(&parent_guard.read(), index - 1);
            (left_id, node_id, index - 1)
        } else {
            let right_id = node::internal_child(&parent_guard.read(), index + 1);
            (node_id, right_id, index)
        };
        let separator = node::internal_key(&parent_guard.read(), separator_index);

        let moved_children = {
            let absorber_guard = if absorber_id == node_id {
                None
            } else {
                Some(self.engine.get_index_page(absorber_id)?)
            };
            let victim_guard = if victim_id == node_id {
                None
            } else {
                Some(self.engine.get_index_page(victim_id)?)
            };
            let absorber = absorber_guard.as_ref().unwrap_or(&guard);
            let victim = victim_guard.as_ref().unwrap_or(&guard);

            let victim_keys = node::internal_keys(&victim.read());
            let victim_children = node::internal_children(&victim.read());
            {
                let mut data = absorber.write();
                let mut keys = node::internal_keys(&data);
                let mut children = node::internal_children(&data);
                keys.push(separator);
                keys.extend(&victim_keys);
                children.extend(&victim_children);
                node::set_internal_body(&mut data, &keys, &children);
            }
            victim_children
        };
        {
            let victim_slot = node::find_child_index(&parent_guard.read(), victim_id)
                .expect("victim under parent");
            let mut data = parent_guard.write();
            node::internal_remove_at(&mut data, separator_index, victim_slot);
        }

        drop(parent_guard);
        drop(guard);

        for child in &moved_children {
            self.set_parent_of(*child, absorber_id)?;
        }
        self.engine.remove_page(victim_id)?;
        debug!("merged internal {} into {}", victim_id, absorber_id);
        self.shrink_or_rebalance_parent(parent_id)
    }

    // ------------------------------------------------------------------
    // generic keys
    // ------------------------------------------------------------------

    /// Insert under a typed key. Integer keys behave exactly like
    /// [`BPlusTree::insert`]. Hashed keys (strings, doubles) may collide;
    /// the entry is kept next to any colliding ones and the caller is
    /// expected to re-check the original value when it reads rows back.
    pub fn insert_generic<K: IndexKey>(&mut self, key: &K, rid: Rid) -> SmallResult {
        let key32 = key.to_index_key()?;
        if K::is_hashed() {
            self.insert_duplicate(key32, rid)
        } else {
            self.insert(key32, rid)
        }
    }

    /// Point lookup under a typed key. For hashed keys the returned rid
    /// may belong to a colliding value; re-check before trusting it.
    pub fn search_generic<K: IndexKey>(&self, key: &K) -> Result<Option<Rid>, SmallError> {
        let key32 = key.to_index_key()?;
        self.search(key32)
    }

    /// Remove the first entry under a typed key. For hashed keys prefer
    /// [`BPlusTree::delete_exact`] with the rid in hand.
    pub fn delete_generic<K: IndexKey>(&mut self, key: &K) -> SmallResult {
        let key32 = key.to_index_key()?;
        self.delete(key32)
    }

    /// Every rid stored under the 32-bit image of a typed key, in key
    /// order. With hashed keys this is the collision set the executor
    /// filters by re-checking the column value.
    pub fn matches_generic<K: IndexKey>(&self, key: &K) -> Result<Vec<Rid>, SmallError> {
        let key32 = key.to_index_key()?;
        self.range(key32, key32)
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Walk the whole tree and verify its structural invariants: parent
    /// pointers, key ordering, separator bounds, sibling links and (when
    /// `check_occupancy` is set) minimum fill of every non-root node.
    /// Used by tests after bulk workloads.
    pub fn check_integrity(&self, check_occupancy: bool) -> SmallResult {
        {
            let guard = self.engine.get_index_page(self.root)?;
            if node::parent(&guard.read()) != INVALID_PAGE_ID {
                return Err(integrity_error(self.root, "root has a parent"));
            }
        }
        self.check_subtree(self.root, None, None, INVALID_PAGE_ID, check_occupancy, 0)?;
        self.check_leaf_chain()
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        lower: Option<i32>,
        upper: Option<i32>,
        expected_parent: PageId,
        check_occupancy: bool,
        depth: usize,
    ) -> SmallResult {
        if depth > MAX_DEPTH {
            return Err(integrity_error(page_id, "deeper than the depth bound"));
        }
        let guard = self.engine.get_index_page(page_id)?;
        let data = guard.read();
        if node::parent(&data) != expected_parent {
            return Err(integrity_error(page_id, "wrong parent pointer"));
        }
        let count = node::key_count(&data) as usize;

        if node::is_leaf(&data) {
            if check_occupancy && depth > 0 && count < self.min_leaf_entries() {
                return Err(integrity_error(page_id, "leaf under minimum occupancy"));
            }
            let mut previous: Option<i32> = None;
            for i in 0..count {
                let key = node::leaf_entry(&data, i).key;
                if let Some(p) = previous {
                    if key < p {
                        return Err(integrity_error(page_id, "leaf keys out of order"));
                    }
                }
                // duplicate runs may touch the separator itself, so the
                // bounds are inclusive
                if lower.map_or(false, |l| key < l) || upper.map_or(false, |u| key > u) {
                    return Err(integrity_error(page_id, "leaf key outside separator bounds"));
                }
                previous = Some(key);
            }
            return Ok(());
        }

        if count == 0 {
            return Err(integrity_error(page_id, "internal node without keys"));
        }
        if check_occupancy && depth > 0 && count < self.min_internal_keys() {
            return Err(integrity_error(page_id, "internal node under minimum occupancy"));
        }
        let keys = node::internal_keys(&data);
        let children = node::internal_children(&data);
        if keys.windows(2).any(|w| w[0] > w[1]) {
            return Err(integrity_error(page_id, "separator keys out of order"));
        }
        drop(data);
        drop(guard);

        for (i, child) in children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(keys[i - 1]) };
            let child_upper = if i == keys.len() { upper } else { Some(keys[i]) };
            self.check_subtree(
                *child,
                child_lower,
                child_upper,
                page_id,
                check_occupancy,
                depth + 1,
            )?;
        }
        Ok(())
    }

    /// The leaves must form a doubly linked chain totally ordered by key.
    fn check_leaf_chain(&self) -> SmallResult {
        let mut leaf_id = self.leftmost_leaf()?;
        let mut previous_leaf = INVALID_PAGE_ID;
        let mut previous_key: Option<i32> = None;

        while leaf_id != INVALID_PAGE_ID {
            let guard = self.engine.get_index_page(leaf_id)?;
            let data = guard.read();
            if node::leaf_prev(&data) != previous_leaf {
                return Err(integrity_error(leaf_id, "broken prev sibling link"));
            }
            let count = node::key_count(&data) as usize;
            if count > 0 {
                let first = node::leaf_entry(&data, 0).key;
                if previous_key.map_or(false, |p| first < p) {
                    return Err(integrity_error(leaf_id, "sibling chain out of key order"));
                }
                previous_key = Some(node::leaf_entry(&data, count - 1).key);
            }
            previous_leaf = leaf_id;
            leaf_id = node::leaf_next(&data);
        }
        Ok(())
    }

    /// Render the tree structure for debugging, one node per line,
    /// indented by depth.
    pub fn draw_tree(&self) -> Result<String, SmallError> {
        let mut out = String::new();
        self.draw_node(self.root, 0, &mut out)?;
        Ok(out)
    }

    fn draw_node(&self, page_id: PageId, depth: usize, out: &mut String) -> SmallResult {
        let guard = self.engine.get_index_page(page_id)?;
        let data = guard.read();
        let indent = "  ".repeat(depth);
        if node::is_leaf(&data) {
            let keys: Vec<i32> = node::leaf_entries(&data).iter().map(|e| e.key).collect();
            out.push_str(&format!(
                "{}leaf {} prev={} next={} keys={:?}\n",
                indent,
                page_id,
                node::leaf_prev(&data),
                node::leaf_next(&data),
                keys
            ));
            return Ok(());
        }
        out.push_str(&format!(
            "{}internal {} keys={:?}\n",
            indent,
            page_id,
            node::internal_keys(&data)
        ));
        let children = node::internal_children(&data);
        drop(data);
        drop(guard);
        for child in children {
            self.draw_node(child, depth + 1, out)?;
        }
        Ok(())
    }

    /// Page ids of every node in the tree (for dropping an index).
    pub fn collect_pages(&self) -> Result<Vec<PageId>, SmallError> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            pages.push(page_id);
            let guard = self.engine.get_index_page(page_id)?;
            let data = guard.read();
            if !node::is_leaf(&data) {
                stack.extend(node::internal_children(&data));
            }
        }
        Ok(pages)
    }
}
