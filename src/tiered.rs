//! Interface to the tiered (on-disk) value store.
//!
//! The engine only knows how to ask for a value body back, free a stored
//! body, and cancel in-flight I/O. The implementation behind this trait may
//! suspend the calling worker cooperatively; after any call that can
//! suspend, positions into the prime table must be re-derived from the key.

use crate::error::OpResult;
use crate::table::PrimeValue;
use crate::types::DbIndex;

/// Locator of an external value body: (offset, length).
pub type ExternalLocator = (u64, u32);

/// The load/free/cancel surface of the tiered store.
pub trait TieredStorage: Send + Sync {
    /// Materialize an external value. May suspend; the caller must refresh
    /// any table position it held across this call.
    fn load(&self, db_index: DbIndex, key: &[u8], locator: ExternalLocator)
        -> OpResult<PrimeValue>;

    /// Release the backing storage of a deleted external value.
    fn free(&self, locator: ExternalLocator);

    /// Cancel a pending write-out for the key.
    fn cancel_io(&self, db_index: DbIndex, key: &[u8]);

    /// Cancel every pending I/O of one database, ahead of a flush.
    fn cancel_all_ios(&self, db_index: DbIndex);
}

#[cfg(test)]
pub(crate) mod stub {
    //! A tiered store over a plain in-memory map, for tests.

    use super::*;
    use crate::error::OpError;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct StubTiered {
        bodies: Mutex<HashMap<u64, PrimeValue>>,
        pub loads: Mutex<Vec<Vec<u8>>>,
        pub cancels: Mutex<Vec<Vec<u8>>>,
    }

    impl StubTiered {
        pub fn stash(&self, offset: u64, value: PrimeValue) {
            self.bodies.lock().insert(offset, value);
        }
    }

    impl TieredStorage for StubTiered {
        fn load(
            &self,
            _db_index: DbIndex,
            key: &[u8],
            locator: ExternalLocator,
        ) -> OpResult<PrimeValue> {
            self.loads.lock().push(key.to_vec());
            self.bodies
                .lock()
                .get(&locator.0)
                .cloned()
                .ok_or(OpError::KeyNotFound)
        }

        fn free(&self, locator: ExternalLocator) {
            self.bodies.lock().remove(&locator.0);
        }

        fn cancel_io(&self, _db_index: DbIndex, key: &[u8]) {
            self.cancels.lock().push(key.to_vec());
        }

        fn cancel_all_ios(&self, _db_index: DbIndex) {}
    }
}
