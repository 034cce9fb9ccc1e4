//! Shared test processors.

use marlin_protocol::{AuthRequest, CallRequest, ClientError, DmlRequest, RequestHeader, RequestType};
use marlin_server::{MemoryProcessor, ProcessError, ReplicaLink, RequestProcessor, Session};
use rmpv::Value;
use std::time::Duration;

/// A processor whose handlers hold their TX fiber for a while, so
/// in-flight requests pile up and the admission control engages.
pub struct SlowProcessor {
    delay: Duration,
    inner: MemoryProcessor,
}

impl SlowProcessor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: MemoryProcessor::new(),
        }
    }
}

impl RequestProcessor for SlowProcessor {
    fn schema_version(&self) -> u64 {
        self.inner.schema_version()
    }

    async fn on_connect(&self, session: &Session) -> Result<(), ClientError> {
        self.inner.on_connect(session).await
    }

    async fn on_disconnect(&self, session: &Session) {
        self.inner.on_disconnect(session).await
    }

    async fn process_dml(
        &self,
        request_type: RequestType,
        request: &DmlRequest,
        session: &Session,
    ) -> Result<Option<Value>, ClientError> {
        tokio::time::sleep(self.delay).await;
        self.inner.process_dml(request_type, request, session).await
    }

    async fn process_select(
        &self,
        request: &DmlRequest,
        session: &Session,
    ) -> Result<Vec<Value>, ClientError> {
        tokio::time::sleep(self.delay).await;
        self.inner.process_select(request, session).await
    }

    async fn process_call(
        &self,
        request: &CallRequest,
        session: &Session,
    ) -> Result<Vec<Value>, ClientError> {
        tokio::time::sleep(self.delay).await;
        self.inner.process_call(request, session).await
    }

    async fn process_eval(
        &self,
        request: &CallRequest,
        session: &Session,
    ) -> Result<Vec<Value>, ClientError> {
        self.inner.process_eval(request, session).await
    }

    async fn process_auth(
        &self,
        request: &AuthRequest,
        session: &Session,
    ) -> Result<(), ClientError> {
        self.inner.process_auth(request, session).await
    }

    async fn process_join(
        &self,
        link: &mut ReplicaLink,
        header: &RequestHeader,
        body: &[u8],
        session: &Session,
    ) -> Result<(), ProcessError> {
        self.inner.process_join(link, header, body, session).await
    }

    async fn process_subscribe(
        &self,
        link: &mut ReplicaLink,
        header: &RequestHeader,
        body: &[u8],
        session: &Session,
    ) -> Result<(), ProcessError> {
        self.inner
            .process_subscribe(link, header, body, session)
            .await
    }
}
