//! Result bridge: one pipeline, consumed by callback, by a blocking
//! call, or by pulling chunks.
//!
//! The caller holds an `AsyncResult`, the pipeline holds the matching
//! `ResultSink`. Both share one reference-counted status record, the
//! terminal value travels through a oneshot and streamed chunks through a
//! bounded queue. Either side may be dropped first.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use log::{debug, trace, warn};
use crate::error::Error;
use crate::request::ChatCompletionRequest;
use crate::response::ChatResponse;

/// Terminal value of a call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResult
{   pub success: bool
  , /// HTTP status of the last round, 0 if none was received
    pub status_code: u16
  , pub error_message: String
  , pub response: ChatResponse
  , pub error: Option<Error>
}

/// What the synchronous call returns
pub type SyncResult = ChatResult;

impl ChatResult
{   pub fn ok(status_code: u16, response: ChatResponse) -> Self
    {   ChatResult
        {   success: true
          , status_code
          , error_message: String::new()
          , response
          , error: None
        }
    }

    pub fn failed(error: Error) -> Self
    {   ChatResult
        {   success: false
          , status_code: error.status_code()
          , error_message: error.to_string()
          , response: ChatResponse::default()
          , error: Some(error)
        }
    }

    pub fn into_result(self) -> Result<ChatResponse, Error>
    {   match self.error
        {   Some(e) => Err(e)
          , None => Ok(self.response)
        }
    }
}

#[derive(Debug, Default)]
struct Status
{   done: bool
  , success: bool
  , status_code: u16
  , error_message: String
}

#[derive(Debug, Default)]
struct Shared
{   status: Mutex<Status>
}

impl Shared
{   fn with_status<R>(&self, f: impl FnOnce(&mut Status) -> R) -> R
    {   let mut status = self.status.lock()
          .unwrap_or_else(PoisonError::into_inner);
        f(&mut status)
    }
}

/// Payload of the terminal future
#[derive(Debug)]
pub(crate) struct Completion
{   pub result: ChatResult
  , /// Conversation handed back to a caller that lent it
    pub request: Option<ChatCompletionRequest>
}

impl Completion
{   fn abandoned() -> Self
    {   Completion
        {   result: ChatResult::failed(Error::Other(
              "pipeline ended without a result".to_string()
            ))
          , request: None
        }
    }
}

/// Create the two ends of a bridge. `capacity` bounds the chunk queue
/// of a streaming bridge and is ignored otherwise.
pub fn result_channel(
  streaming: bool
, capacity: usize
) -> (AsyncResult, ResultSink)
{   let shared = Arc::new(Shared::default());
    let (promise, future) = oneshot::channel();
    let (tx, rx) = if streaming
    {   let (tx, rx) = mpsc::channel(capacity.max(1));
        (Some(tx), Some(rx))
    } else
    {   (None, None)
    };
    debug!(
      "Created result bridge (streaming: {}, capacity: {})",
      streaming, capacity
    );

    let handle = AsyncResult
    {   shared: shared.clone()
      , streaming
      , future: Some(future)
      , outcome: None
      , chunks: rx
    };
    let sink = ResultSink
    {   shared
      , streaming
      , promise: Some(promise)
      , chunks: tx
    };
    (handle, sink)
}

// ===== Caller side =====

/// Caller's handle on an in-flight call
#[derive(Debug)]
pub struct AsyncResult
{   shared: Arc<Shared>
  , streaming: bool
  , future: Option<oneshot::Receiver<Completion>>
  , outcome: Option<Completion>
  , chunks: Option<mpsc::Receiver<ChatResponse>>
}

impl AsyncResult
{   pub fn is_streaming(&self) -> bool
    {   self.streaming
    }

    /// Next streamed chunk, blocking the thread until one arrives.
    /// `None` once the terminal chunk has been taken, or at once for
    /// non-streaming calls. Must not be called from async code.
    pub fn get_chunk(&mut self) -> Option<ChatResponse>
    {   let chunk = self.chunks.as_mut()?.blocking_recv();
        if chunk.is_none()
        {   trace!("Chunk queue drained");
        }
        chunk
    }

    /// Async counterpart of `get_chunk`
    pub async fn next_chunk(&mut self) -> Option<ChatResponse>
    {   self.chunks.as_mut()?.recv().await
    }

    /// Terminal value, blocking until the pipeline resolves it.
    /// Must not be called from async code.
    pub fn get_response(&mut self) -> &ChatResult
    {   let future = &mut self.future;
        &self.outcome
          .get_or_insert_with(|| match future.take()
          {   Some(rx) => rx.blocking_recv()
                .unwrap_or_else(|_| Completion::abandoned())
            , None => Completion::abandoned()
          })
          .result
    }

    /// Async counterpart of `get_response`
    pub async fn response(&mut self) -> &ChatResult
    {   if self.outcome.is_none()
        {   let completion = match self.future.take()
            {   Some(rx) => rx.await
                  .unwrap_or_else(|_| Completion::abandoned())
              , None => Completion::abandoned()
            };
            self.outcome = Some(completion);
        }
        &self.outcome
          .get_or_insert_with(Completion::abandoned)
          .result
    }

    /// Block for the terminal value and take it
    pub fn into_result(mut self) -> ChatResult
    {   self.get_response();
        self.outcome.take()
          .map(|c| c.result)
          .unwrap_or_default()
    }

    /// Whether the terminal value has been set
    pub fn is_done(&self) -> bool
    {   self.shared.with_status(|s| s.done)
    }

    pub fn success(&self) -> bool
    {   self.shared.with_status(|s| s.success)
    }

    pub fn status_code(&self) -> u16
    {   self.shared.with_status(|s| s.status_code)
    }

    pub fn error_message(&self) -> String
    {   self.shared.with_status(|s| s.error_message.clone())
    }

    /// Live references to the shared result (this handle included)
    pub fn ref_count(&self) -> usize
    {   Arc::strong_count(&self.shared)
    }

    /// Block for the terminal value together with the lent conversation
    pub(crate) fn into_parts(
      mut self
    ) -> (ChatResult, Option<ChatCompletionRequest>)
    {   self.get_response();
        match self.outcome.take()
        {   Some(c) => (c.result, c.request)
          , None => (Completion::abandoned().result, None)
        }
    }
}

// ===== Pipeline side =====

/// Pipeline's end of the bridge
#[derive(Debug)]
pub struct ResultSink
{   shared: Arc<Shared>
  , streaming: bool
  , promise: Option<oneshot::Sender<Completion>>
  , chunks: Option<mpsc::Sender<ChatResponse>>
}

impl ResultSink
{   pub fn is_streaming(&self) -> bool
    {   self.streaming
    }

    /// Queue still accepts chunks
    pub fn is_open(&self) -> bool
    {   self.chunks.is_some()
    }

    /// Enqueue a chunk, waiting while the queue is full. A chunk marked
    /// `last_chunk` closes the queue after it, so the consumer sees the
    /// end instead of blocking. Returns false if the chunk was not
    /// queued.
    pub async fn put_chunk(&mut self, chunk: ChatResponse) -> bool
    {   let Some(tx) = self.chunks.as_ref() else
        {   trace!("Chunk queue closed, dropping chunk");
            return false;
        };
        let last = chunk.last_chunk;
        let queued = match tx.send(chunk).await
        {   Ok(()) => true
          , Err(_) => {
              debug!("Chunk consumer is gone");
              false
            }
        };
        if last || !queued
        {   self.set_nonblock();
        }
        queued
    }

    /// Close the queue: pending chunks stay readable, then the consumer
    /// gets `None` without blocking.
    pub fn set_nonblock(&mut self)
    {   if self.chunks.take().is_some()
        {   trace!("Chunk queue switched to non-blocking");
        }
    }

    /// Set the terminal value. Consumes the sink, so it happens once.
    pub(crate) fn resolve(
      mut self
    , result: ChatResult
    , request: Option<ChatCompletionRequest>
    )
    {   self.set_nonblock();
        self.shared.with_status(|s| {
          s.done = true;
          s.success = result.success;
          s.status_code = result.status_code;
          s.error_message = result.error_message.clone();
        });
        if let Some(promise) = self.promise.take()
        {   if promise.send(Completion { result, request }).is_err()
            {   debug!("Result handle dropped before completion");
            }
        }
    }

    /// Resolve without handing anything back
    pub fn complete(self, result: ChatResult)
    {   self.resolve(result, None);
    }
}

impl Drop for ResultSink
{   fn drop(&mut self)
    {   if self.promise.is_some()
        {   warn!("Result sink dropped unresolved");
            self.shared.with_status(|s| {
              s.done = true;
              s.error_message =
                "pipeline ended without a result".to_string();
            });
        }
    }
}
