use rustc_hash::{FxHashMap, FxHashSet};

pub type HashMap<K, V> = FxHashMap<K, V>;
pub type HashSet<T> = FxHashSet<T>;

/// Number of receptor bases every synapse current is decomposed into.
pub const NUM_RECEPTOR_BASES: usize = 5;
