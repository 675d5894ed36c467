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

//! The secure element which provides the STS keys, and the worker bridging it to the key manager.

use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::key_manager::{KeyCompletion, KeyKind, KeyMaterial, KeyProvider, KeyRequest};
use crate::params::mac_types::SessionId;

/// The secure element. A fetch may take long; the MAC keeps running meanwhile.
#[async_trait]
pub trait SecureElement: 'static + Send {
    async fn fetch_key(
        &mut self,
        session_id: SessionId,
        kind: KeyKind,
        size: usize,
    ) -> Result<KeyMaterial>;
}

/// The [`KeyProvider`] of the service: the requests are handed to a worker owning the secure
/// element, which posts the completions back to the service.
pub(super) struct SecureElementKeyProvider {
    request_sender: mpsc::UnboundedSender<KeyRequest>,
}

impl SecureElementKeyProvider {
    /// Spawn the worker of `secure_element`. Must be called inside a tokio runtime.
    pub fn spawn<S: SecureElement>(
        secure_element: S,
        completion_sender: mpsc::UnboundedSender<KeyCompletion>,
    ) -> Self {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            run_secure_element(secure_element, request_receiver, completion_sender).await
        });
        Self { request_sender }
    }
}

impl KeyProvider for SecureElementKeyProvider {
    fn request_key(&mut self, request: &KeyRequest) {
        if self.request_sender.send(request.clone()).is_err() {
            error!("The secure element worker is gone, {:?} is lost", request.id);
        }
    }
}

async fn run_secure_element<S: SecureElement>(
    mut secure_element: S,
    mut request_receiver: mpsc::UnboundedReceiver<KeyRequest>,
    completion_sender: mpsc::UnboundedSender<KeyCompletion>,
) {
    while let Some(request) = request_receiver.recv().await {
        debug!("Fetch the {:?} key of session {}", request.kind, request.session_id);
        let result = secure_element.fetch_key(request.session_id, request.kind, request.size).await;
        if completion_sender.send(KeyCompletion { id: request.id, result }).is_err() {
            break;
        }
    }
    debug!("Secure element worker is about to drop");
}

#[cfg(any(test, feature = "mock-utils"))]
pub use mock::MockSecureElement;

#[cfg(any(test, feature = "mock-utils"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::Error;

    /// The mock of [`SecureElement`]. The clones share the same expected calls.
    #[derive(Clone, Default)]
    pub struct MockSecureElement {
        expected_calls: Arc<Mutex<VecDeque<ExpectedCall>>>,
    }

    impl MockSecureElement {
        pub fn new() -> Self {
            Default::default()
        }

        pub fn expect_fetch_key(
            &mut self,
            expected_session_id: SessionId,
            expected_kind: KeyKind,
            out: Result<KeyMaterial>,
        ) {
            self.expected_calls.lock().unwrap().push_back(ExpectedCall {
                expected_session_id,
                expected_kind,
                out,
            });
        }

        pub fn is_done(&self) -> bool {
            self.expected_calls.lock().unwrap().is_empty()
        }
    }

    #[async_trait]
    impl SecureElement for MockSecureElement {
        async fn fetch_key(
            &mut self,
            session_id: SessionId,
            kind: KeyKind,
            _size: usize,
        ) -> Result<KeyMaterial> {
            let mut expected_calls = self.expected_calls.lock().unwrap();
            match expected_calls.pop_front() {
                Some(call)
                    if call.expected_session_id == session_id && call.expected_kind == kind =>
                {
                    call.out
                }
                Some(call) => {
                    expected_calls.push_front(call);
                    Err(Error::MockUndefined)
                }
                None => Err(Error::MockUndefined),
            }
        }
    }

    struct ExpectedCall {
        expected_session_id: SessionId,
        expected_kind: KeyKind,
        out: Result<KeyMaterial>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::key_manager::KeyRequestId;
    use crate::params::mac_types::{RegionId, SessionHandle};

    fn request(id: u32, kind: KeyKind) -> KeyRequest {
        KeyRequest {
            id: KeyRequestId(id),
            region: RegionId(0),
            session_handle: SessionHandle(1),
            session_id: 5,
            kind,
            size: 16,
        }
    }

    #[tokio::test]
    async fn test_completions_are_posted_in_order() {
        let mut secure_element = MockSecureElement::new();
        secure_element.expect_fetch_key(5, KeyKind::Session, Ok(KeyMaterial::new(vec![1; 16])));
        secure_element.expect_fetch_key(5, KeyKind::SubSession(3), Err(Error::KeyFetch));
        let (completion_sender, mut completion_receiver) = mpsc::unbounded_channel();
        let mut provider = SecureElementKeyProvider::spawn(secure_element.clone(), completion_sender);

        provider.request_key(&request(1, KeyKind::Session));
        provider.request_key(&request(2, KeyKind::SubSession(3)));

        let first = completion_receiver.recv().await.unwrap();
        assert_eq!(first.id, KeyRequestId(1));
        assert_eq!(first.result.unwrap().as_bytes(), &[1; 16]);
        let second = completion_receiver.recv().await.unwrap();
        assert_eq!(second.id, KeyRequestId(2));
        assert_eq!(second.result.err(), Some(Error::KeyFetch));
        assert!(secure_element.is_done());
    }
}
