use std::sync::{Arc, OnceLock};
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use log::{debug, error, info, trace, warn};
use crate::bridge::{result_channel, AsyncResult, ChatResult, SyncResult};
use crate::config::ClientConfig;
use crate::decoder::StreamDecoder;
use crate::engine::{ByteStream, HttpEngine, HttpTask, TaskEngine};
use crate::error::Error;
use crate::function::{
  FunctionExecutor, FunctionManager, FunctionResult
};
use crate::request::{
  ChatCompletionRequest, FunctionDefinition, Message, ToolCall, ToolChoice
};
use crate::response::ChatResponse;
use crate::session::{
  ChunkObserver, CompletionHandler, Ownership, SessionContext
};

/// Largest error body kept from a non-2xx response
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Where tool calls are dispatched
#[derive(Clone)]
enum Functions
{   Manager(Arc<FunctionManager>)
  , Custom(Arc<dyn FunctionExecutor>)
}

impl Functions
{   fn executor(&self) -> Arc<dyn FunctionExecutor>
    {   match self
        {   Functions::Manager(m) => m.clone() as Arc<dyn FunctionExecutor>
          , Functions::Custom(e) => e.clone()
        }
    }
}

/// Runtime for clients created outside tokio. Lives for the whole
/// process, so no pipeline outlives the runtime it runs on.
static SHARED_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn shared_runtime() -> Result<&'static Runtime, Error>
{   if let Some(runtime) = SHARED_RUNTIME.get()
    {   return Ok(runtime);
    }
    debug!("No tokio runtime, starting the shared one");
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .thread_name("chatflow-worker")
      .build()
      .map_err(|e| {
        error!("Failed to start runtime: {}", e);
        Error::Other(e.to_string())
      })?;
    // another thread may have won the race, its runtime is kept
    let _ = SHARED_RUNTIME.set(runtime);
    SHARED_RUNTIME.get()
      .ok_or_else(|| Error::Other("shared runtime missing".to_string()))
}

/// Runtime the pipelines are spawned on
#[derive(Clone)]
enum Executor
{   /// Runtime the client was created in
    Current(Handle)
  , /// Process-wide runtime, for callers outside tokio
    Shared(&'static Runtime)
}

impl Executor
{   fn handle(&self) -> &Handle
    {   match self
        {   Executor::Current(handle) => handle
          , Executor::Shared(runtime) => runtime.handle()
        }
    }
}

/// Chat completion client.
///
/// Every call runs as its own pipeline task: send, receive, decode,
/// dispatch tool calls and go round again until the model answers
/// without tools. Results come back through a callback, a blocking
/// call, or an `AsyncResult` handle.
#[derive(Clone)]
pub struct LlmClient
{   config: Arc<ClientConfig>
  , engine: Arc<dyn TaskEngine>
  , functions: Functions
  , executor: Executor
}

impl std::fmt::Debug for LlmClient
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.debug_struct("LlmClient")
          .field("base_url", &self.config.base_url)
          .field("shared_runtime", &matches!(self.executor, Executor::Shared(_)))
          .finish_non_exhaustive()
    }
}

impl LlmClient
{   /// Client for the default endpoint
    pub fn new(api_key: impl Into<String>) -> Result<Self, Error>
    {   LlmClient::with_config(ClientConfig::new(api_key))
    }

    /// Client for another OpenAI-compatible endpoint
    pub fn with_base_url(
      api_key: impl Into<String>
    , base_url: impl Into<String>
    ) -> Result<Self, Error>
    {   LlmClient::with_config(
          ClientConfig::new(api_key).with_base_url(base_url)
        )
    }

    /// Client configured from the environment, see
    /// `ClientConfig::from_env`
    pub fn from_env() -> Result<Self, Error>
    {   let config = ClientConfig::from_env();
        if config.api_key.is_empty()
        {   error!("No API key in the environment");
            return Err(Error::MissingApiKey);
        }
        LlmClient::with_config(config)
    }

    pub fn with_config(config: ClientConfig) -> Result<Self, Error>
    {   if config.base_url.is_empty()
        {   return Err(Error::InvalidConfiguration(
              "base_url is empty".to_string()
            ));
        }
        reqwest::Url::parse(&config.base_url)
          .map_err(|e| Error::InvalidConfiguration(
            format!("base_url '{}': {}", config.base_url, e)
          ))?;

        let engine = HttpEngine::new(config.redirect_max)?;
        let executor = match Handle::try_current()
        {   Ok(handle) => {
              debug!("Using the current tokio runtime");
              Executor::Current(handle)
            }
          , Err(_) => Executor::Shared(shared_runtime()?)
        };

        info!("LlmClient ready for {}", config.base_url);
        Ok(LlmClient
        {   config: Arc::new(config)
          , engine: Arc::new(engine)
          , functions: Functions::Manager(Arc::new(FunctionManager::new()))
          , executor
        })
    }

    /// Replace the HTTP engine
    pub fn with_engine(mut self, engine: Arc<dyn TaskEngine>) -> Self
    {   self.engine = engine;
        self
    }

    pub fn config(&self) -> &ClientConfig
    {   &self.config
    }

    // ===== Functions =====

    pub fn set_function_manager(&mut self, manager: Arc<FunctionManager>)
    {   debug!("Function manager set ({} functions)", manager.len());
        self.functions = Functions::Manager(manager);
    }

    /// Dispatch tool calls to a custom executor instead of a manager
    pub fn set_function_executor(
      &mut self
    , executor: Arc<dyn FunctionExecutor>
    )
    {   debug!("Custom function executor set");
        self.functions = Functions::Custom(executor);
    }

    /// The manager in use, if tool calls go to one
    pub fn function_manager(&self) -> Option<Arc<FunctionManager>>
    {   match &self.functions
        {   Functions::Manager(m) => Some(m.clone())
          , Functions::Custom(_) => None
        }
    }

    /// Register with the current manager. Returns false for a duplicate
    /// name or when a custom executor is installed.
    pub fn register_function<F>(
      &self
    , definition: FunctionDefinition
    , handler: F
    ) -> bool
    where
        F: Fn(&str) -> FunctionResult + Send + Sync + 'static,
    {   match &self.functions
        {   Functions::Manager(m) => m.register_function(definition, handler)
          , Functions::Custom(_) => {
              warn!(
                "Cannot register {} with a custom executor",
                definition.name
              );
              false
            }
        }
    }

    // ===== Calls =====

    /// Callback mode: `extract` sees every chunk, `callback` gets the
    /// terminal result. Both run on the pipeline task.
    pub fn create_chat_task<F>(
      &self
    , request: ChatCompletionRequest
    , extract: Option<ChunkObserver>
    , callback: F
    ) -> JoinHandle<()>
    where
        F: FnOnce(&ChatCompletionRequest, ChatResult) + Send + 'static,
    {   let callback: CompletionHandler = Box::new(callback);
        let session = SessionContext::new(
          request,
          extract,
          Some(callback),
          Ownership::Session
        );
        self.spawn(session)
    }

    /// Pull mode: chunks and the terminal value through a handle
    pub fn chat_completion_async(
      &self
    , request: ChatCompletionRequest
    ) -> AsyncResult
    {   let capacity = request.max_tokens
          .map(|n| n as usize + 2)
          .unwrap_or(self.config.default_queue_capacity);
        let (handle, sink) = result_channel(request.stream, capacity);
        let mut session = SessionContext::new(
          request,
          None,
          None,
          Ownership::Session
        );
        session.set_async_result(sink);
        self.spawn(session);
        handle
    }

    /// Blocking call. The tool exchange is appended to `request`.
    /// Must not be called from async code.
    pub fn chat_completion_sync(
      &self
    , request: &mut ChatCompletionRequest
    ) -> SyncResult
    {   self.chat_completion_sync_with(request, None)
    }

    /// Blocking call with a chunk observer
    pub fn chat_completion_sync_with(
      &self
    , request: &mut ChatCompletionRequest
    , extract: Option<ChunkObserver>
    ) -> SyncResult
    {   let (handle, sink) = result_channel(false, 0);
        let mut session = SessionContext::new(
          request.clone(),
          extract,
          None,
          Ownership::Caller
        );
        session.set_async_result(sink);
        self.spawn(session);

        let (result, returned) = handle.into_parts();
        match returned
        {   Some(conversation) => *request = conversation
          , None => warn!("Conversation was not handed back")
        }
        result
    }

    fn spawn(&self, session: SessionContext) -> JoinHandle<()>
    {   let pipeline = Pipeline
        {   config: self.config.clone()
          , engine: self.engine.clone()
          , executor: self.functions.executor()
        };
        trace!("Spawning pipeline: {:?}", session);
        self.executor.handle().spawn(pipeline.run(session))
    }
}

// ===== Pipeline =====

/// One call's orchestration loop
struct Pipeline
{   config: Arc<ClientConfig>
  , engine: Arc<dyn TaskEngine>
  , executor: Arc<dyn FunctionExecutor>
}

impl Pipeline
{   async fn run(self, mut session: SessionContext)
    {   loop
        {   session.rounds += 1;
            let task = match self.build_task(&session.request)
            {   Ok(task) => task
              , Err(e) => return session.fail(e).await
            };

            let (status, response) = match self.exchange(&mut session, task).await
            {   Ok(reply) => reply
              , Err(e) => {
                  warn!("Round {} failed: {}", session.rounds, e);
                  return session.fail(e).await;
                }
            };

            let calls = response.tool_calls().to_vec();
            if calls.is_empty() || !session.request.tools_enabled()
            {   return session.succeed(status, response).await;
            }

            debug!(
              "Round {} asked for {} tool call(s)",
              session.rounds, calls.len()
            );
            session.request.messages
              .push(Message::assistant_tool_calls(calls.clone()));
            session.tool_rounds += 1;
            if session.tool_rounds >= self.config.max_tool_rounds
            {   trace!("Tool budget spent, next round goes without tools");
                session.request.tool_choice = ToolChoice::None;
                session.request.tools.clear();
            }

            let results = match self.dispatch(&calls).await
            {   Ok(results) => results
              , Err(e) => return session.fail(e).await
            };
            for (call, result) in calls.iter().zip(results.iter())
            {   if !result.success
                {   debug!("Tool {} failed: {}", call.id, result.error_message);
                }
                session.request.messages
                  .push(Message::tool(call.id.clone(), result.content()));
            }
        }
    }

    fn build_task(
      &self
    , request: &ChatCompletionRequest
    ) -> Result<HttpTask, Error>
    {   request.validate()?;
        let registered = if request.tools_enabled()
        {   self.executor.tools()
        } else
        {   vec![]
        };
        let body = request.to_json(&registered)?;
        let (watch_timeout, recv_timeout) = self.config.timeouts(request.stream);

        Ok(HttpTask
        {   url: self.config.base_url.clone()
          , headers: vec![
              ( "Authorization".to_string()
              , format!("Bearer {}", self.config.api_key)
              )
            , ("Content-Type".to_string(), "application/json".to_string())
            , ("Connection".to_string(), "keep-alive".to_string())
            ]
          , body: body.into_bytes()
          , watch_timeout
          , recv_timeout
          , redirect_max: self.config.redirect_max
          , stream: request.stream
        })
    }

    /// Send one round and decode its body
    async fn exchange(
      &self
    , session: &mut SessionContext
    , task: HttpTask
    ) -> Result<(u16, ChatResponse), Error>
    {   let (watch, recv) = (task.watch_timeout, task.recv_timeout);
        let mut decoder = StreamDecoder::for_request(task.stream);
        debug!(
          "Round {}: {} bytes to {}",
          session.rounds, task.body.len(), task.url
        );

        let response = timeout(watch, self.engine.submit(task))
          .await
          .map_err(|_| {
            error!("No response within {:?}", watch);
            Error::Timeout
          })??;
        let status = response.status;
        let mut body = response.body;
        if !(200..300).contains(&status)
        {   let text = read_error_body(&mut body, recv).await;
            error!("API error {}: {}", status, text);
            return Err(Error::ApiError { status, body: text });
        }

        loop
        {   let span = timeout(recv, body.next())
              .await
              .map_err(|_| {
                error!("Body stalled for {:?}", recv);
                Error::Timeout
              })?;
            match span
            {   Some(bytes) => {
                  let chunks = decoder.decode(&bytes?);
                  self.deliver(session, &decoder, chunks).await;
                }
              , None => break
            }
        }

        let (response, chunks) = decoder.finish()?;
        self.deliver(session, &decoder, chunks).await;
        if decoder.dropped_frames() > 0
        {   warn!("{} frame(s) could not be decoded", decoder.dropped_frames());
        }
        Ok((status, response))
    }

    /// Hand chunks on. A finishing chunk is the last one only if no tool
    /// round follows it.
    async fn deliver(
      &self
    , session: &mut SessionContext
    , decoder: &StreamDecoder
    , chunks: Vec<ChatResponse>
    )
    {   let dispatching = session.request.tools_enabled()
          && !decoder.tool_calls().is_empty();
        for mut chunk in chunks
        {   chunk.last_chunk = chunk.finish_reason().is_some() && !dispatching;
            session.deliver_chunk(chunk).await;
        }
    }

    /// Run every call and return the results in call order
    async fn dispatch(
      &self
    , calls: &[ToolCall]
    ) -> Result<Vec<FunctionResult>, Error>
    {   if let [call] = calls
        {   let result = self.executor.clone()
              .submit(call.function.name.clone(), call.function.arguments.clone())
              .await?;
            return Ok(vec![result]);
        }

        let pending = calls.iter().map(|call| {
          self.executor.clone()
            .submit(call.function.name.clone(), call.function.arguments.clone())
        });
        join_all(pending).await.into_iter().collect()
    }
}

/// Collect an error body, giving up at the first stall
async fn read_error_body(
  body: &mut ByteStream
, recv: std::time::Duration
) -> String
{   let mut text = Vec::new();
    while let Ok(Some(Ok(bytes))) = timeout(recv, body.next()).await
    {   text.extend_from_slice(&bytes);
        if text.len() >= MAX_ERROR_BODY
        {   text.truncate(MAX_ERROR_BODY);
            break;
        }
    }
    String::from_utf8_lossy(&text).into_owned()
}
