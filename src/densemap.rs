//! A map of densely packed integer key to value, for the graph arenas.

use std::marker::PhantomData;

/// Implemented by the typed id wrappers (NodeId etc.) used as keys.
pub trait Index: From<usize> {
    fn index(&self) -> usize;
}

/// A map of a dense integer key to value, implemented as a vector.
/// Effectively wraps Vec<V> to provide typed keys.
pub struct DenseMap<K, V> {
    vec: Vec<V>,
    key_type: PhantomData<K>,
}

// Not derived: the derive would demand K: Default for no reason.
impl<K, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        DenseMap {
            vec: Vec::new(),
            key_type: PhantomData,
        }
    }
}

impl<K: Index, V> DenseMap<K, V> {
    pub fn new() -> Self {
        DenseMap {
            vec: Vec::new(),
            key_type: PhantomData,
        }
    }

    pub fn get(&self, k: K) -> &V {
        &self.vec[k.index()]
    }

    pub fn get_mut(&mut self, k: K) -> &mut V {
        &mut self.vec[k.index()]
    }

    /// Like get(), but for keys that may be beyond the end of the map.
    pub fn lookup(&self, k: K) -> Option<&V> {
        self.vec.get(k.index())
    }

    pub fn next_id(&self) -> K {
        K::from(self.vec.len())
    }

    pub fn push(&mut self, val: V) -> K {
        let id = self.next_id();
        self.vec.push(val);
        id
    }
}

impl<K: Index, V: Clone> DenseMap<K, V> {
    /// Set the value at a key, growing the map with `default` as needed.
    pub fn set_grow(&mut self, k: K, v: V, default: V) {
        if k.index() >= self.vec.len() {
            self.vec.resize(k.index() + 1, default);
        }
        self.vec[k.index()] = v
    }
}
