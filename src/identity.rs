//! Stable identities for connections, queries and transactions.
//!
//! Upstream handles are not trustworthy as keys: the same physical connection
//! can surface under a different native id once a transaction starts. The
//! [`IdentityResolver`] issues a [`ConnectionKey`] the first time it sees a
//! handle and stores it in the handle's [`IdentitySlot`], so every later
//! lookup through any view of that connection lands on the same key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Allocate a fresh, globally unique key.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_key!(
    /// Stable key of one logical connection, constant for its whole lifetime.
    ConnectionKey
);

opaque_key!(
    /// Correlation token tying a query's end notification to its start.
    QueryKey
);

opaque_key!(
    /// Correlation token of a transaction.
    TransactionKey
);

/// Write-once storage for the stable key of a handle.
#[derive(Debug, Default)]
pub struct IdentitySlot(OnceCell<ConnectionKey>);

impl IdentitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The key attached to this slot, if one was issued.
    pub fn get(&self) -> Option<&ConnectionKey> {
        self.0.get()
    }
}

/// Anything the ingestion side can present as "a connection".
pub trait UpstreamHandle {
    /// The identifier the upstream system currently reports. May change over
    /// the lifetime of the connection.
    fn native_id(&self) -> String;

    /// Where a stable key can be attached. `None` means the handle cannot
    /// carry state and resolution falls back to [`native_id`](Self::native_id).
    fn identity_slot(&self) -> Option<&IdentitySlot>;
}

/// Maps volatile upstream handles to stable [`ConnectionKey`]s.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    degraded: AtomicU64,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the stable key of `handle`, issuing one on first sight.
    ///
    /// Handles without an [`IdentitySlot`] are keyed by their native id. Such
    /// keys fork the timeline if the native id changes, so every degraded
    /// resolution is logged at WARN and counted.
    pub fn resolve<H: UpstreamHandle + ?Sized>(&self, handle: &H) -> ConnectionKey {
        match handle.identity_slot() {
            Some(slot) => slot.0.get_or_init(ConnectionKey::generate).clone(),
            None => {
                let native_id = handle.native_id();
                self.degraded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    native_id = %native_id,
                    "Connection handle cannot carry a stable key; keying by native id"
                );
                ConnectionKey::from(native_id)
            }
        }
    }

    /// Number of resolutions that fell back to native-id keying.
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Handle {
        native: Cell<u32>,
        slot: IdentitySlot,
    }

    impl Handle {
        fn new(native: u32) -> Self {
            Self {
                native: Cell::new(native),
                slot: IdentitySlot::new(),
            }
        }
    }

    impl UpstreamHandle for Handle {
        fn native_id(&self) -> String {
            self.native.get().to_string()
        }

        fn identity_slot(&self) -> Option<&IdentitySlot> {
            Some(&self.slot)
        }
    }

    struct Bare(&'static str);

    impl UpstreamHandle for Bare {
        fn native_id(&self) -> String {
            self.0.to_string()
        }

        fn identity_slot(&self) -> Option<&IdentitySlot> {
            None
        }
    }

    #[test]
    fn test_same_handle_resolves_to_same_key() {
        let resolver = IdentityResolver::new();
        let handle = Handle::new(42);

        let first = resolver.resolve(&handle);
        let second = resolver.resolve(&handle);

        assert_eq!(first, second);
        assert_eq!(handle.slot.get(), Some(&first));
    }

    #[test]
    fn test_key_survives_native_id_change() {
        let resolver = IdentityResolver::new();
        let handle = Handle::new(7);
        let before = resolver.resolve(&handle);

        handle.native.set(8);

        assert_eq!(resolver.resolve(&handle), before);
        assert_eq!(resolver.degraded_count(), 0);
    }

    #[test]
    fn test_distinct_handles_never_share_a_key() {
        let resolver = IdentityResolver::new();
        // Same native id on purpose: only the slot decides identity.
        let a = Handle::new(1);
        let b = Handle::new(1);

        assert_ne!(resolver.resolve(&a), resolver.resolve(&b));
    }

    #[test]
    fn test_slotless_handle_degrades_to_native_id() {
        let resolver = IdentityResolver::new();

        let key = resolver.resolve(&Bare("pid-99"));

        assert_eq!(key.as_str(), "pid-99");
        assert_eq!(resolver.degraded_count(), 1);
    }

    #[test]
    fn test_generated_keys_are_unique() {
        assert_ne!(ConnectionKey::generate(), ConnectionKey::generate());
        assert_ne!(QueryKey::generate(), QueryKey::generate());
    }
}
