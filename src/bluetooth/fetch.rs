//! Probe-then-allocate retrieval of variable-length platform data.
//!
//! Every variable-length read (service descriptors, characteristic lists,
//! characteristic values, descriptor lists) follows the same shape: ask with
//! an empty buffer, learn the required size, allocate exactly that much and
//! ask again. The size can change between attempts, so every attempt is
//! re-checked.

use std::mem;

use log::{debug, warn};

use crate::{
   bluetooth::FetchStatus,
   error::{BridgeError, Result},
};

/// Upper bound on size-query/allocate rounds for a single fetch.
pub const MAX_FETCH_ATTEMPTS: usize = 8;

/// Runs `call` until it completes, growing the buffer to whatever size the
/// platform asks for.
///
/// `what` prefixes the error text when the platform reports a failure, e.g.
/// `"Could not retrieve service characteristics"`. The returned buffer is
/// owned by the caller and holds exactly the elements the platform reported.
pub fn fetch<T, F>(what: &str, mut call: F) -> Result<Vec<T>>
where
   T: Clone + Default,
   F: FnMut(&mut [T]) -> FetchStatus,
{
   let mut buf: Vec<T> = Vec::new();

   for attempt in 1..=MAX_FETCH_ATTEMPTS {
      match call(&mut buf) {
         FetchStatus::Complete(count) => {
            buf.truncate(count);
            return Ok(buf);
         },
         FetchStatus::MoreData(required) => {
            debug!("{what}: attempt {attempt} needs {required} elements (had {})", buf.len());
            buf = allocate_zeroed(required)?;
         },
         FetchStatus::Failed(e) => {
            return Err(BridgeError::os_api(what, e));
         },
      }
   }

   warn!("{what}: required size still changing after {MAX_FETCH_ATTEMPTS} attempts");
   Err(BridgeError::os_api(
      what,
      format!("required size still changing after {MAX_FETCH_ATTEMPTS} attempts"),
   ))
}

fn allocate_zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
   let mut buf = Vec::new();
   buf.try_reserve_exact(len).map_err(|_| BridgeError::BufferAllocation {
      size: len.saturating_mul(mem::size_of::<T>()),
   })?;
   buf.resize(len, T::default());
   Ok(buf)
}
