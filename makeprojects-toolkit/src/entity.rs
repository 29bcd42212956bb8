//! Entity and key abstractions
//!
//! The toolkit imposes no schema: an entity is any serializable record with a
//! unique key. Key types carry a runtime notion of "unset" so that operations
//! requiring a persisted identity can reject the sentinel value.

use std::fmt::Display;
use std::hash::Hash;

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Bound for entity key types
pub trait EntityKey: Clone + Eq + Hash + Display + Send + Sync + 'static {
    /// Whether the key holds a real value rather than the "no value" sentinel
    fn is_set(&self) -> bool;

    /// Produce a store-generated key from a monotonically increasing sequence
    ///
    /// Returns `None` for key types the store cannot generate.
    fn generate(sequence: u64) -> Option<Self>;
}

macro_rules! integer_key {
    ($($ty:ty),*) => {
        $(
            impl EntityKey for $ty {
                fn is_set(&self) -> bool {
                    *self != 0
                }

                fn generate(sequence: u64) -> Option<Self> {
                    <$ty>::try_from(sequence).ok().filter(|k| *k != 0)
                }
            }
        )*
    };
}

integer_key!(i32, i64, u32, u64);

impl EntityKey for String {
    fn is_set(&self) -> bool {
        !self.is_empty()
    }

    fn generate(_sequence: u64) -> Option<Self> {
        None
    }
}

impl EntityKey for Uuid {
    fn is_set(&self) -> bool {
        !self.is_nil()
    }

    fn generate(_sequence: u64) -> Option<Self> {
        Some(Uuid::now_v7())
    }
}

/// A persistable record identified by a key
///
/// # Example
///
/// ```rust
/// use makeprojects_toolkit::entity::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Project {
///     id: i64,
///     name: String,
/// }
///
/// impl Entity for Project {
///     type Key = i64;
///
///     fn key(&self) -> &i64 {
///         &self.id
///     }
///
///     fn set_key(&mut self, key: i64) {
///         self.id = key;
///     }
/// }
///
/// assert_eq!(Project::entity_name(), "Project");
/// ```
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key type
    type Key: EntityKey;

    /// Borrow the entity's key
    fn key(&self) -> &Self::Key;

    /// Replace the entity's key (used when the store generates one)
    fn set_key(&mut self, key: Self::Key);

    /// Name of the entity type used in logs and error messages
    fn entity_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}
