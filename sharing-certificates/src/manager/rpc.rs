//! Client seam for the remote certificate exchange service.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{CertificateError, Result};
use crate::proto::{
    PublishDeviceRequest, PublishDeviceResponse, QuerySharedCredentialsRequest,
    QuerySharedCredentialsResponse,
};

#[async_trait]
pub trait CertificateRpcClient: Send + Sync {
    async fn publish_device(&self, request: PublishDeviceRequest) -> Result<PublishDeviceResponse>;

    /// One page of shared credentials; an empty `next_page_token` ends the
    /// listing.
    async fn query_shared_credentials(
        &self,
        request: QuerySharedCredentialsRequest,
    ) -> Result<QuerySharedCredentialsResponse>;
}

/// Records requests and replays scripted responses. An unscripted call
/// succeeds with an empty response.
#[derive(Default)]
pub struct FakeRpcClient {
    publish_requests: Mutex<Vec<PublishDeviceRequest>>,
    publish_responses: Mutex<VecDeque<Result<PublishDeviceResponse>>>,
    query_requests: Mutex<Vec<QuerySharedCredentialsRequest>>,
    query_responses: Mutex<VecDeque<Result<QuerySharedCredentialsResponse>>>,
}

impl FakeRpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_publish_response(&self, response: Result<PublishDeviceResponse>) {
        if let Ok(mut queue) = self.publish_responses.lock() {
            queue.push_back(response);
        }
    }

    pub fn push_query_response(&self, response: Result<QuerySharedCredentialsResponse>) {
        if let Ok(mut queue) = self.query_responses.lock() {
            queue.push_back(response);
        }
    }

    pub fn publish_requests(&self) -> Vec<PublishDeviceRequest> {
        self.publish_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn query_requests(&self) -> Vec<QuerySharedCredentialsRequest> {
        self.query_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

fn poisoned() -> CertificateError {
    CertificateError::Rpc("fake client lock poisoned".into())
}

#[async_trait]
impl CertificateRpcClient for FakeRpcClient {
    async fn publish_device(&self, request: PublishDeviceRequest) -> Result<PublishDeviceResponse> {
        self.publish_requests
            .lock()
            .map_err(|_| poisoned())?
            .push(request);
        self.publish_responses
            .lock()
            .map_err(|_| poisoned())?
            .pop_front()
            .unwrap_or_else(|| Ok(PublishDeviceResponse::default()))
    }

    async fn query_shared_credentials(
        &self,
        request: QuerySharedCredentialsRequest,
    ) -> Result<QuerySharedCredentialsResponse> {
        self.query_requests
            .lock()
            .map_err(|_| poisoned())?
            .push(request);
        self.query_responses
            .lock()
            .map_err(|_| poisoned())?
            .pop_front()
            .unwrap_or_else(|| Ok(QuerySharedCredentialsResponse::default()))
    }
}
