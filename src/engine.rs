//! Task engine boundary: submits one HTTP task and hands back the
//! status and the body as a stream of byte spans.

use std::time::Duration;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use log::{debug, error, trace};
use crate::error::Error;

/// Body spans in arrival order
pub type ByteStream = BoxStream<'static, Result<Bytes, Error>>;

/// One outgoing POST
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTask
{   pub url: String
  , pub headers: Vec<(String, String)>
  , pub body: Vec<u8>
  , /// Allowed wait for the response to start
    pub watch_timeout: Duration
  , /// Allowed wait between two body spans
    pub recv_timeout: Duration
  , pub redirect_max: usize
  , pub stream: bool
}

impl HttpTask
{   /// First header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str>
    {   self.headers
          .iter()
          .find(|(k, _)| k.eq_ignore_ascii_case(name))
          .map(|(_, v)| v.as_str())
    }

    pub fn body_json(&self) -> Result<serde_json::Value, Error>
    {   Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Response head plus the body still in flight
pub struct TaskResponse
{   pub status: u16
  , pub body: ByteStream
}

impl std::fmt::Debug for TaskResponse
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.debug_struct("TaskResponse")
          .field("status", &self.status)
          .finish_non_exhaustive()
    }
}

impl TaskResponse
{   /// Response whose whole body is already known
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self
    {   let body: Bytes = body.into();
        TaskResponse
        {   status
          , body: futures_util::stream::once(async move { Ok::<_, Error>(body) })
              .boxed()
        }
    }

    pub fn is_success(&self) -> bool
    {   (200..300).contains(&self.status)
    }
}

/// Runs HTTP tasks. The orchestrator applies the task timeouts around
/// `submit` and around every body read.
pub trait TaskEngine: Send + Sync + 'static
{   fn submit(&self, task: HttpTask)
      -> BoxFuture<'_, Result<TaskResponse, Error>>;
}

/// reqwest-backed engine
#[derive(Debug, Clone)]
pub struct HttpEngine
{   http_client: reqwest::Client
}

impl HttpEngine
{   pub fn new(redirect_max: usize) -> Result<Self, Error>
    {   debug!("Creating HttpEngine (redirects: {})", redirect_max);
        let http_client = reqwest::Client::builder()
          .redirect(reqwest::redirect::Policy::limited(redirect_max))
          .build()
          .map_err(|e| {
            error!("Failed to build http client: {}", e);
            Error::InvalidConfiguration(e.to_string())
          })?;
        Ok(HttpEngine { http_client })
    }
}

impl TaskEngine for HttpEngine
{   fn submit(&self, task: HttpTask)
      -> BoxFuture<'_, Result<TaskResponse, Error>>
    {   Box::pin(async move {
          trace!("POST {} ({} bytes)", task.url, task.body.len());
          let mut request = self.http_client.post(&task.url);
          for (name, value) in &task.headers
          {   request = request.header(name.as_str(), value.as_str());
          }

          let response = request
            .body(task.body)
            .send()
            .await
            .map_err(|e| {
              error!("HTTP error: {}", e);
              Error::from(e)
            })?;

          let status = response.status().as_u16();
          trace!("Response status: {}", status);
          Ok(TaskResponse
          {   status
            , body: response.bytes_stream().map_err(Error::from).boxed()
          })
        })
    }
}
