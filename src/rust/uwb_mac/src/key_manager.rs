// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! This module serializes the key fetches toward the secure element.
//!
//! Only one request is serviced by the key provider at a time, the others wait in a FIFO queue.
//! The provider reports the result asynchronously, and the owner of the [`KeyManager`] calls
//! [`KeyManager::complete`] from its own serialized context.

use std::collections::VecDeque;
use std::fmt;

use log::{debug, error, warn};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::params::mac_types::{RegionId, SessionHandle, SessionId, SubSessionId};

/// The maximum number of requests held by the key manager, including the current one.
pub const MAX_PENDING_KEY_REQUESTS: usize = 16;

/// The identifier of a key request, unique for the lifetime of a [`KeyManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRequestId(pub u32);

/// The key requested from the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The key shared by all the devices of the session.
    Session,
    /// The key of one controlee.
    SubSession(SubSessionId),
}

/// A key fetch request, queued until the key provider services it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub id: KeyRequestId,
    pub region: RegionId,
    pub session_handle: SessionHandle,
    pub session_id: SessionId,
    pub kind: KeyKind,
    /// The size of the key in bytes.
    pub size: usize,
}

/// The key returned by the secure element. The content is zeroized when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(key: Vec<u8>) -> Self {
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Explicitly implement Debug trait to prevent logging the key material.
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(redacted, {} bytes)", self.0.len())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// The completion of a key request, posted by the key provider.
#[derive(Debug)]
pub struct KeyCompletion {
    pub id: KeyRequestId,
    pub result: Result<KeyMaterial>,
}

/// The external collaborator which fetches the keys.
///
/// `request_key` must not block: the provider starts the fetch and reports the result later as a
/// [`KeyCompletion`], which is then handed to [`KeyManager::complete`].
pub trait KeyProvider: Send {
    fn request_key(&mut self, request: &KeyRequest);
}

struct CurrentRequest {
    request: KeyRequest,
    canceled: bool,
}

/// The FIFO queue of key requests, with at most one request in flight.
pub struct KeyManager {
    next_id: u32,
    current: Option<CurrentRequest>,
    queue: VecDeque<KeyRequest>,
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyManager {
    pub fn new() -> Self {
        Self { next_id: 0, current: None, queue: VecDeque::new() }
    }

    /// Queue a key request. The request is forwarded to the provider immediately when no other
    /// request is being serviced.
    pub fn submit(
        &mut self,
        region: RegionId,
        session_handle: SessionHandle,
        session_id: SessionId,
        kind: KeyKind,
        size: usize,
        provider: &mut dyn KeyProvider,
    ) -> Result<KeyRequestId> {
        if self.pending_count() >= MAX_PENDING_KEY_REQUESTS {
            warn!("The key request queue is full, reject the request of session {}", session_id);
            return Err(Error::ResourceExhausted);
        }

        let id = KeyRequestId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let request = KeyRequest { id, region, session_handle, session_id, kind, size };
        debug!("Submit key request {:?}", request);
        self.queue.push_back(request);
        self.promote(provider);
        Ok(id)
    }

    /// Cancel a request.
    ///
    /// A queued request is removed. The current request is marked as canceled and `Busy` is
    /// returned: its completion is still expected, and is dropped on arrival.
    pub fn cancel(&mut self, id: KeyRequestId) -> Result<()> {
        if let Some(current) = self.current.as_mut() {
            if current.request.id == id {
                current.canceled = true;
                return Err(Error::Busy);
            }
        }
        match self.queue.iter().position(|request| request.id == id) {
            Some(index) => {
                self.queue.remove(index);
                Ok(())
            }
            None => Err(Error::BadParameters),
        }
    }

    /// Cancel all the requests of a session, without waiting for the current one.
    pub fn cancel_session(&mut self, session_handle: SessionHandle) {
        if let Some(current) = self.current.as_mut() {
            if current.request.session_handle == session_handle {
                current.canceled = true;
            }
        }
        self.queue.retain(|request| request.session_handle != session_handle);
    }

    /// Handle the completion of the current request, and forward the next queued request to the
    /// provider.
    ///
    /// Return the completed request and its result, or None when the request was canceled.
    pub fn complete(
        &mut self,
        completion: KeyCompletion,
        provider: &mut dyn KeyProvider,
    ) -> Option<(KeyRequest, Result<KeyMaterial>)> {
        let current = match self.current.take() {
            Some(current) if current.request.id == completion.id => current,
            other => {
                error!("Received the completion of {:?} which is not current", completion.id);
                self.current = other;
                return None;
            }
        };
        self.promote(provider);

        match current.canceled {
            true => {
                debug!("Drop the completion of the canceled request {:?}", current.request.id);
                None
            }
            false => Some((current.request, completion.result)),
        }
    }

    /// The number of requests held, including the current one.
    pub fn pending_count(&self) -> usize {
        self.queue.len() + self.current.is_some() as usize
    }

    /// The number of requests which can still be submitted.
    pub fn free_slots(&self) -> usize {
        MAX_PENDING_KEY_REQUESTS.saturating_sub(self.pending_count())
    }

    /// The id of the request being serviced by the provider.
    pub fn current_request(&self) -> Option<KeyRequestId> {
        self.current.as_ref().map(|current| current.request.id)
    }

    fn promote(&mut self, provider: &mut dyn KeyProvider) {
        if self.current.is_some() {
            return;
        }
        if let Some(request) = self.queue.pop_front() {
            provider.request_key(&request);
            self.current = Some(CurrentRequest { request, canceled: false });
        }
    }
}

/// A provider recording the forwarded requests, used by the tests.
#[cfg(any(test, feature = "mock-utils"))]
#[derive(Default)]
pub struct RecordingKeyProvider {
    pub requests: Vec<KeyRequest>,
}

#[cfg(any(test, feature = "mock-utils"))]
impl KeyProvider for RecordingKeyProvider {
    fn request_key(&mut self, request: &KeyRequest) {
        self.requests.push(request.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(
        manager: &mut KeyManager,
        provider: &mut RecordingKeyProvider,
        handle: u32,
    ) -> KeyRequestId {
        manager
            .submit(RegionId(0), SessionHandle(handle), handle, KeyKind::Session, 16, provider)
            .unwrap()
    }

    fn success(id: KeyRequestId) -> KeyCompletion {
        KeyCompletion { id, result: Ok(KeyMaterial::new(vec![0x5A; 16])) }
    }

    #[test]
    fn test_queued_request_promoted_on_complete() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();

        let first = submit(&mut manager, &mut provider, 1);
        let second = submit(&mut manager, &mut provider, 2);
        assert_eq!(provider.requests.len(), 1);
        assert_eq!(manager.current_request(), Some(first));

        let (request, result) = manager.complete(success(first), &mut provider).unwrap();
        assert_eq!(request.id, first);
        assert!(result.is_ok());
        assert_eq!(manager.current_request(), Some(second));
        assert_eq!(provider.requests.len(), 2);
        assert_eq!(provider.requests[1].id, second);
    }

    #[test]
    fn test_cancel() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();

        let first = submit(&mut manager, &mut provider, 1);
        let second = submit(&mut manager, &mut provider, 2);
        assert_eq!(manager.cancel(second), Ok(()));
        assert_eq!(manager.cancel(second), Err(Error::BadParameters));
        assert_eq!(manager.cancel(first), Err(Error::Busy));

        // The canceled current request still completes, and nothing is delivered.
        assert!(manager.complete(success(first), &mut provider).is_none());
        assert_eq!(manager.current_request(), None);
        assert_eq!(provider.requests.len(), 1);
    }

    #[test]
    fn test_failure_delivered() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();

        let id = submit(&mut manager, &mut provider, 1);
        let (_, result) = manager
            .complete(KeyCompletion { id, result: Err(Error::KeyFetch) }, &mut provider)
            .unwrap();
        assert_eq!(result, Err(Error::KeyFetch));
    }

    #[test]
    fn test_unexpected_completion_ignored() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();

        let id = submit(&mut manager, &mut provider, 1);
        assert!(manager.complete(success(KeyRequestId(42)), &mut provider).is_none());
        assert_eq!(manager.current_request(), Some(id));
    }

    #[test]
    fn test_bounded_queue() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();

        assert_eq!(manager.free_slots(), MAX_PENDING_KEY_REQUESTS);
        for handle in 0..MAX_PENDING_KEY_REQUESTS as u32 {
            submit(&mut manager, &mut provider, handle);
        }
        assert_eq!(manager.free_slots(), 0);
        assert_eq!(
            manager.submit(RegionId(0), SessionHandle(99), 99, KeyKind::Session, 16, &mut provider),
            Err(Error::ResourceExhausted)
        );
        assert_eq!(manager.pending_count(), MAX_PENDING_KEY_REQUESTS);
    }

    #[test]
    fn test_cancel_session() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();

        let first = submit(&mut manager, &mut provider, 1);
        submit(&mut manager, &mut provider, 1);
        let other = submit(&mut manager, &mut provider, 2);
        manager.cancel_session(SessionHandle(1));
        assert_eq!(manager.pending_count(), 2);

        assert!(manager.complete(success(first), &mut provider).is_none());
        assert_eq!(manager.current_request(), Some(other));
    }

    #[test]
    fn test_at_most_one_in_flight() {
        let mut manager = KeyManager::new();
        let mut provider = RecordingKeyProvider::default();
        let mut ids = Vec::new();
        for handle in 0..5 {
            ids.push(submit(&mut manager, &mut provider, handle));
        }
        manager.cancel(ids[2]).unwrap();
        let mut delivered = 0;
        while let Some(id) = manager.current_request() {
            // Exactly one request is forwarded and not completed at any time.
            assert_eq!(provider.requests.len(), delivered + 1);
            assert!(manager.complete(success(id), &mut provider).is_some());
            delivered += 1;
        }
        assert_eq!(delivered, 4);
    }
}
