use std::collections::{HashMap, HashSet};

pub mod metrics;
pub mod serde_helpers;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(any(test, feature = "test"))]
pub mod test {
    pub use self::logger::init_logger;

    mod logger;
}

pub type FastHashMap<K, V> = HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<K> = HashSet<K, ahash::RandomState>;
