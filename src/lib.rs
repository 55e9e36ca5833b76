pub mod error;
pub mod config;
pub mod request;
pub mod response;
pub mod decoder;
pub mod engine;
pub mod bridge;
pub mod function;
pub mod session;
pub mod client;

/*

chatflow: a chat completion client for OpenAI-compatible APIs
(DeepSeek by default) that runs every call as a pipeline task
and drives tool calling on its own.

chatflow/
├── Cargo.toml
├── src/
│   ├── lib.rs          # Re-exports
│   ├── error.rs        # Error and ErrorKind
│   ├── config.rs       # ClientConfig, timeouts, logger setup
│   ├── request.rs      # Messages, tools, request serialization
│   ├── response.rs     # Responses, chunks, usage, logprobs
│   ├── decoder.rs      # SSE framing and delta accumulation
│   ├── engine.rs       # HTTP task boundary (reqwest)
│   ├── bridge.rs       # AsyncResult / ResultSink
│   ├── function.rs     # FunctionManager and executors
│   ├── session.rs      # Per-call context
│   └── client.rs       # LlmClient and the pipeline loop
└── tests/

*/

/// CHATFLOW API INTERFACE:

pub use crate::bridge::{
  result_channel, AsyncResult, ChatResult, ResultSink, SyncResult
};
pub use crate::client::LlmClient;
pub use crate::config::{init_logger, ClientConfig, DEFAULT_BASE_URL};
pub use crate::decoder::{StreamDecoder, ToolCallAccumulator};
pub use crate::engine::{HttpEngine, HttpTask, TaskEngine, TaskResponse};
pub use crate::error::{Error, ErrorKind};
pub use crate::function::{
  FunctionExecutor, FunctionHandler, FunctionManager, FunctionResult
};
pub use crate::request::{
  ChatCompletionRequest
, FunctionCall
, FunctionDefinition
, Message
, ParameterProperty
, ParametersSchema
, ResponseFormat
, Role
, StreamOptions
, Tool
, ToolCall
, ToolChoice
, DEFAULT_MODEL
};
pub use crate::response::{
  ChatCompletionChunk
, ChatCompletionResponse
, ChatResponse
, Choice
, ChoiceMessage
, Logprob
, Logprobs
, ResponseShape
, TokenLogprob
, Usage
};
pub use crate::session::{ChunkObserver, CompletionHandler};
