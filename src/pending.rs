//! Correlation of outbound request ids to their response callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::message::Response;

/// Single-shot completion callback for an outbound request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response, Error>) + Send>;

/// Outstanding outbound request ids mapped to their callbacks.
///
/// Each entry fires exactly once: on the first matching response, on its
/// deadline, or with [`Error::Closed`] when the connection closes. After
/// [`cancel_all`](PendingResponses::cancel_all) the table is sealed and
/// further registrations report `Closed`.
///
/// Callbacks are always invoked outside the table lock.
#[derive(Clone)]
pub(crate) struct PendingResponses {
    // None once sealed by cancel_all.
    inner: Arc<Mutex<Option<HashMap<String, ResponseCallback>>>>,
}

impl PendingResponses {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(HashMap::new()))),
        }
    }

    pub(crate) fn register(&self, id: String, cb: ResponseCallback) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(map) => {
                map.insert(id, cb);
                Ok(())
            }
            None => Err(Error::Closed),
        }
    }

    /// Remove an entry without invoking it (a failed write un-registers).
    pub(crate) fn remove(&self, id: &str) -> Option<ResponseCallback> {
        self.inner.lock().unwrap().as_mut()?.remove(id)
    }

    /// Deliver a response to the matching callback. Returns whether a
    /// callback was invoked; the first matching response wins and later
    /// ones find nothing.
    pub(crate) fn resolve(&self, id: &str, response: Response) -> bool {
        match self.remove(id) {
            Some(cb) => {
                cb(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail a single entry, e.g. on deadline expiry.
    pub(crate) fn fail(&self, id: &str, err: Error) -> bool {
        match self.remove(id) {
            Some(cb) => {
                cb(Err(err));
                true
            }
            None => false,
        }
    }

    /// Seal the table and deliver [`Error::Closed`] to every registered
    /// callback exactly once.
    pub(crate) fn cancel_all(&self) {
        let drained = self.inner.lock().unwrap().take();
        if let Some(map) = drained {
            for (_, cb) in map {
                cb(Err(Error::Closed));
            }
        }
    }
}
