//! Ordered associative back-end: an AVL tree keyed by pointer.
//!
//! Nodes are boxed through the internal allocator so the tree never touches
//! the public allocation path. Lookups are iterative; the mutating walks are
//! recursive, bounded by the AVL height.

use super::{HookAllocator, MetaStore};
use crate::chunk::ChunkMeta;
use allocator_api2::alloc::Allocator;
use allocator_api2::boxed::Box;

type Link<A> = Option<Box<Node<A>, A>>;

struct Node<A: Allocator> {
    meta: ChunkMeta,
    height: i32,
    left: Link<A>,
    right: Link<A>,
}

#[inline]
fn height<A: Allocator>(link: &Link<A>) -> i32 {
    match link {
        Some(node) => node.height,
        None => 0,
    }
}

#[inline]
fn fix_height<A: Allocator>(node: &mut Node<A>) {
    node.height = 1 + height(&node.left).max(height(&node.right));
}

fn rotate_right<A: Allocator>(mut n: Box<Node<A>, A>) -> Box<Node<A>, A> {
    let Some(mut l) = n.left.take() else { return n };
    n.left = l.right.take();
    fix_height(&mut n);
    l.right = Some(n);
    fix_height(&mut l);
    l
}

fn rotate_left<A: Allocator>(mut n: Box<Node<A>, A>) -> Box<Node<A>, A> {
    let Some(mut r) = n.right.take() else { return n };
    n.right = r.left.take();
    fix_height(&mut n);
    r.left = Some(n);
    fix_height(&mut r);
    r
}

fn rebalance<A: Allocator>(mut n: Box<Node<A>, A>) -> Box<Node<A>, A> {
    fix_height(&mut n);
    let bf = height(&n.left) - height(&n.right);
    if bf > 1 {
        if let Some(l) = n.left.take() {
            let l = if height(&l.left) < height(&l.right) { rotate_left(l) } else { l };
            n.left = Some(l);
        }
        return rotate_right(n);
    }
    if bf < -1 {
        if let Some(r) = n.right.take() {
            let r = if height(&r.right) < height(&r.left) { rotate_right(r) } else { r };
            n.right = Some(r);
        }
        return rotate_left(n);
    }
    n
}

fn insert<A: Allocator + Clone>(link: Link<A>, meta: ChunkMeta, alloc: &A) -> (Link<A>, bool) {
    let Some(mut node) = link else {
        let fresh = Node { meta, height: 1, left: None, right: None };
        return (Some(Box::new_in(fresh, alloc.clone())), true);
    };
    let key = meta.ptr as usize;
    let node_key = node.meta.ptr as usize;
    if key == node_key {
        return (Some(node), false);
    }
    let inserted;
    if key < node_key {
        let (link, ok) = insert(node.left.take(), meta, alloc);
        node.left = link;
        inserted = ok;
    } else {
        let (link, ok) = insert(node.right.take(), meta, alloc);
        node.right = link;
        inserted = ok;
    }
    (Some(rebalance(node)), inserted)
}

fn find<A: Allocator>(mut link: &Link<A>, key: usize) -> Option<&ChunkMeta> {
    while let Some(node) = link {
        let node_key = node.meta.ptr as usize;
        if key == node_key {
            return Some(&node.meta);
        }
        link = if key < node_key { &node.left } else { &node.right };
    }
    None
}

fn find_mut<A: Allocator>(link: &mut Link<A>, key: usize) -> Option<&mut ChunkMeta> {
    let node = link.as_mut()?;
    let node_key = node.meta.ptr as usize;
    if key == node_key {
        Some(&mut node.meta)
    } else if key < node_key {
        find_mut(&mut node.left, key)
    } else {
        find_mut(&mut node.right, key)
    }
}

/// Detach the minimum of a subtree, returning the remaining subtree and the
/// detached metadata.
fn take_min<A: Allocator>(mut node: Box<Node<A>, A>) -> (Link<A>, ChunkMeta) {
    match node.left.take() {
        None => (node.right.take(), node.meta),
        Some(l) => {
            let (rest, min) = take_min(l);
            node.left = rest;
            (Some(rebalance(node)), min)
        }
    }
}

/// Remove by key. Callers have already verified the entry matches.
fn remove_key<A: Allocator>(link: Link<A>, key: usize) -> (Link<A>, bool) {
    let Some(mut node) = link else { return (None, false) };
    let node_key = node.meta.ptr as usize;
    let removed;
    if key < node_key {
        let (link, ok) = remove_key(node.left.take(), key);
        node.left = link;
        removed = ok;
    } else if key > node_key {
        let (link, ok) = remove_key(node.right.take(), key);
        node.right = link;
        removed = ok;
    } else {
        match (node.left.take(), node.right.take()) {
            (None, None) => return (None, true),
            (Some(l), None) => return (Some(l), true),
            (None, Some(r)) => return (Some(r), true),
            (Some(l), Some(r)) => {
                let (rest, successor) = take_min(r);
                node.meta = successor;
                node.left = Some(l);
                node.right = rest;
                removed = true;
            }
        }
    }
    (Some(rebalance(node)), removed)
}

pub struct OrderedStore<A: Allocator + Clone = HookAllocator> {
    root: Link<A>,
    count: usize,
    alloc: A,
}

impl Default for OrderedStore<HookAllocator> {
    fn default() -> Self {
        OrderedStore::new_in(HookAllocator)
    }
}

impl<A: Allocator + Clone> OrderedStore<A> {
    pub fn new_in(alloc: A) -> Self {
        OrderedStore { root: None, count: 0, alloc }
    }

    #[cfg(test)]
    fn tree_height(&self) -> i32 {
        height(&self.root)
    }
}

impl<A: Allocator + Clone> MetaStore for OrderedStore<A> {
    fn put(&mut self, chunk: ChunkMeta) -> bool {
        if chunk.ptr.is_null() {
            return false;
        }
        let (root, inserted) = insert(self.root.take(), chunk, &self.alloc);
        self.root = root;
        if inserted {
            self.count += 1;
        }
        inserted
    }

    fn get(&self, key: *mut u8) -> ChunkMeta {
        find(&self.root, key as usize).copied().unwrap_or(ChunkMeta::EMPTY)
    }

    fn remove(&mut self, key: ChunkMeta) -> bool {
        match find(&self.root, key.ptr as usize) {
            Some(existing) if existing.eq_ptr_size(key) => {}
            _ => return false,
        }
        let (root, removed) = remove_key(self.root.take(), key.ptr as usize);
        self.root = root;
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn update(&mut self, key: ChunkMeta) -> bool {
        match find_mut(&mut self.root, key.ptr as usize) {
            Some(meta) => {
                *meta = key;
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.count
    }

    fn clear(&mut self) {
        self.root = None;
        self.count = 0;
    }
}
