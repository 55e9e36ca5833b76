//! Per-call state carried through every round of a conversation

use log::{debug, trace};
use crate::bridge::{ChatResult, ResultSink};
use crate::error::Error;
use crate::request::ChatCompletionRequest;
use crate::response::ChatResponse;

/// Per-chunk observer, called on the pipeline thread
pub type ChunkObserver
  = Box<dyn FnMut(&ChatCompletionRequest, &ChatResponse) + Send>;

/// Completion handler, called exactly once on the pipeline thread
pub type CompletionHandler
  = Box<dyn FnOnce(&ChatCompletionRequest, ChatResult) + Send>;

/// Who keeps the request once the call is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership
{   /// The session drops it at teardown
    Session
  , /// It is handed back to the caller through the result
    Caller
}

/// Live request and callbacks of one call. Owned by the pipeline for
/// the whole call and consumed by `succeed`/`fail`, so teardown
/// happens exactly once.
pub struct SessionContext
{   pub request: ChatCompletionRequest
  , extract: Option<ChunkObserver>
  , callback: Option<CompletionHandler>
  , result: Option<ResultSink>
  , ownership: Ownership
  , /// Rounds sent so far
    pub rounds: usize
  , /// Rounds that ended in tool dispatch
    pub tool_rounds: usize
}

impl std::fmt::Debug for SessionContext
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.debug_struct("SessionContext")
          .field("model", &self.request.model)
          .field("messages", &self.request.messages.len())
          .field("ownership", &self.ownership)
          .field("rounds", &self.rounds)
          .field("tool_rounds", &self.tool_rounds)
          .field("streaming", &self.is_async_streaming())
          .finish()
    }
}

impl SessionContext
{   pub fn new(
      request: ChatCompletionRequest
    , extract: Option<ChunkObserver>
    , callback: Option<CompletionHandler>
    , ownership: Ownership
    ) -> Self
    {   trace!("Session created for model {}", request.model);
        SessionContext
        {   request
          , extract
          , callback
          , result: None
          , ownership
          , rounds: 0
          , tool_rounds: 0
        }
    }

    pub fn set_async_result(&mut self, sink: ResultSink)
    {   self.result = Some(sink);
    }

    /// A caller is pulling chunks from the queue
    pub fn is_async_streaming(&self) -> bool
    {   self.result.as_ref().map_or(false, |r| r.is_streaming())
    }

    /// Hand a decoded chunk to the observer and, when streaming into a
    /// result handle, to its queue.
    pub async fn deliver_chunk(&mut self, chunk: ChatResponse)
    {   if let Some(extract) = self.extract.as_mut()
        {   extract(&self.request, &chunk);
        }
        if let Some(sink) = self.result.as_mut()
        {   if sink.is_streaming()
            {   sink.put_chunk(chunk).await;
            }
        }
    }

    /// Terminal success
    pub async fn succeed(mut self, status_code: u16, response: ChatResponse)
    {   debug!(
          "Call finished after {} round(s), {} with tools",
          self.rounds, self.tool_rounds
        );
        if let Some(sink) = self.result.as_mut()
        {   sink.set_nonblock();
        }
        self.finish(ChatResult::ok(status_code, response));
    }

    /// Terminal failure. A streaming consumer gets an error chunk first.
    pub async fn fail(mut self, error: Error)
    {   debug!(
          "Call failed in round {}: {}",
          self.rounds, error
        );
        if let Some(sink) = self.result.as_mut()
        {   if sink.is_open()
            {   sink.put_chunk(ChatResponse::error_chunk(error.to_string()))
                  .await;
            }
        }
        self.finish(ChatResult::failed(error));
    }

    fn finish(mut self, result: ChatResult)
    {   let callback = self.callback.take();
        let sink = self.result.take();
        match (callback, sink)
        {   (Some(callback), Some(sink)) => {
              callback(&self.request, result.clone());
              self.resolve(sink, result);
            }
          , (Some(callback), None) => {
              callback(&self.request, result);
            }
          , (None, Some(sink)) => {
              self.resolve(sink, result);
            }
          , (None, None) => {
              trace!("Nobody is waiting for this result");
            }
        }
    }

    fn resolve(&mut self, sink: ResultSink, result: ChatResult)
    {   let request = match self.ownership
        {   Ownership::Caller => Some(std::mem::take(&mut self.request))
          , Ownership::Session => None
        };
        sink.resolve(result, request);
    }
}

impl Drop for SessionContext
{   fn drop(&mut self)
    {   trace!("Session destroyed");
    }
}
