//! Client-side reference to an asynchronous operation.

use std::time::{Duration, Instant};

use crate::client::{Client, ClientError};
use crate::codec::{EncodedStream, Header};
use crate::failure::OperationInfo;
use crate::options::{
    CancelOperationOptions, GetOperationInfoOptions, GetOperationResultOptions,
};
use crate::{GET_RESULT_CONTEXT_PADDING, GET_RESULT_MAX_TIMEOUT, QUERY_WAIT};

/// A reference to an asynchronous operation, sufficient to poll its
/// result, fetch its info, and request cancelation.
///
/// Obtained from an async start response or from
/// [`Client::new_handle`]. Valid until the operation reaches a terminal
/// state and the caller has consumed it.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    client: Client,
    operation: String,
    id: String,
}

impl OperationHandle {
    pub(crate) fn new(client: Client, operation: &str, id: &str) -> Result<Self, ClientError> {
        if operation.is_empty() {
            return Err(ClientError::InvalidHandle("empty operation name"));
        }
        if id.is_empty() {
            return Err(ClientError::InvalidHandle("empty operation ID"));
        }
        Ok(Self {
            client,
            operation: operation.to_owned(),
            id: id.to_owned(),
        })
    }

    /// The operation name this handle refers to.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The server-assigned operation ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fetch the operation result.
    ///
    /// With a zero [`GetOperationResultOptions::wait`] this is a single
    /// peek: a still-running operation surfaces
    /// [`ClientError::OperationStillRunning`]. With a non-zero wait the
    /// call long polls, re-issuing bounded attempts until the budget
    /// runs out; an exhausted budget also surfaces the still-running
    /// sentinel, while a server-side poll bound expiring maps to
    /// [`ClientError::DeadlineExceeded`].
    ///
    /// Dropping the returned future aborts the in-flight request.
    ///
    /// # Errors
    ///
    /// See [`ClientError`]; a terminal unsuccessful completion is
    /// [`ClientError::Unsuccessful`].
    pub async fn get_result(
        &self,
        options: GetOperationResultOptions,
    ) -> Result<EncodedStream, ClientError> {
        if options.wait.is_zero() {
            return self.get_result_once(None, &options.header).await;
        }

        let started = Instant::now();
        loop {
            let remaining = options.wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(ClientError::OperationStillRunning);
            }

            // The issued wait outlives our own per-attempt bound so the
            // server answers instead of racing us at the boundary.
            let issued = remaining + GET_RESULT_CONTEXT_PADDING;
            let bound = remaining.min(GET_RESULT_MAX_TIMEOUT);

            match tokio::time::timeout(
                bound,
                self.get_result_once(Some(issued), &options.header),
            )
            .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(ClientError::OperationStillRunning)) => {}
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    tracing::debug!(
                        operation = %self.operation,
                        id = %self.id,
                        "get-result attempt expired, re-polling"
                    );
                }
            }
        }
    }

    async fn get_result_once(
        &self,
        wait: Option<Duration>,
        header: &Header,
    ) -> Result<EncodedStream, ClientError> {
        let mut url = self.client.url(&[&self.operation, &self.id, "result"])?;
        if let Some(wait) = wait {
            url.query_pairs_mut()
                .append_pair(QUERY_WAIT, &format_wait(wait));
        }

        let response = self.client.get(url, header).await?;
        match response.status().as_u16() {
            200 => Ok(self.client.encoded_stream(response)),
            _ => Err(self.client.error_from_response(response).await),
        }
    }

    /// Fetch current info for the operation.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn get_info(
        &self,
        options: GetOperationInfoOptions,
    ) -> Result<OperationInfo, ClientError> {
        let url = self.client.url(&[&self.operation, &self.id])?;
        let response = self.client.get(url, &options.header).await?;
        if response.status().as_u16() != 200 {
            return Err(self.client.error_from_response(response).await);
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|err| ClientError::Protocol(format!("failed to parse operation info: {err}")))
    }

    /// Request cancelation of the operation.
    ///
    /// Acknowledgement only: the operation may observe the cancel later
    /// or ignore it entirely. Safe to repeat.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn cancel(&self, options: CancelOperationOptions) -> Result<(), ClientError> {
        let url = self.client.url(&[&self.operation, &self.id, "cancel"])?;
        let response = self.client.post_empty(url, &options.header).await?;
        if response.status().as_u16() != 202 {
            return Err(self.client.error_from_response(response).await);
        }
        Ok(())
    }
}

/// The wire form of a wait duration: whole milliseconds, never zero for
/// a non-zero duration.
fn format_wait(wait: Duration) -> String {
    format!("{}ms", wait.as_millis().max(1))
}
