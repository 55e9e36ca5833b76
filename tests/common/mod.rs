#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde_json::{json, Value};
use chatflow::{Error, HttpTask, TaskEngine, TaskResponse};

/// One canned answer of the scripted engine
pub enum Reply
{   Body
    {   status: u16
      , spans: Vec<Vec<u8>>
    }
  , Fail(Error)
  , /// Never answers
    Hang
  , /// Answers with the inner reply after a pause
    Delayed(Duration, Box<Reply>)
}

impl Reply
{   pub fn json(status: u16, body: Value) -> Self
    {   Reply::Body
        {   status
          , spans: vec![body.to_string().into_bytes()]
        }
    }

    pub fn after(self, delay: Duration) -> Self
    {   Reply::Delayed(delay, Box::new(self))
    }

    pub fn sse(chunks: &[Value]) -> Self
    {   Reply::Body
        {   status: 200
          , spans: sse_spans(chunks)
        }
    }
}

/// Engine answering from a script and recording every task
#[derive(Default)]
pub struct ScriptedEngine
{   replies: Mutex<VecDeque<Reply>>
  , tasks: Mutex<Vec<HttpTask>>
}

impl ScriptedEngine
{   pub fn new(replies: Vec<Reply>) -> Self
    {   ScriptedEngine
        {   replies: Mutex::new(replies.into())
          , tasks: Mutex::new(vec![])
        }
    }

    pub fn tasks(&self) -> Vec<HttpTask>
    {   self.tasks.lock().unwrap().clone()
    }

    /// Request bodies sent so far, as JSON
    pub fn bodies(&self) -> Vec<Value>
    {   self.tasks()
          .iter()
          .map(|t| t.body_json().unwrap())
          .collect()
    }
}

impl TaskEngine for ScriptedEngine
{   fn submit(&self, task: HttpTask)
      -> BoxFuture<'_, Result<TaskResponse, Error>>
    {   self.tasks.lock().unwrap().push(task);
        let mut reply = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
          while let Some(Reply::Delayed(delay, inner)) = reply
          {   tokio::time::sleep(delay).await;
              reply = Some(*inner);
          }
          match reply
          {   Some(Reply::Body { status, spans }) => Ok(TaskResponse
              {   status
                , body: futures_util::stream::iter(
                    spans.into_iter().map(|s| Ok(Bytes::from(s)))
                  ).boxed()
              })
            , Some(Reply::Fail(e)) => Err(e)
            , Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Other("hang ended".to_string()))
              }
            , Some(Reply::Delayed(..)) | None =>
                Err(Error::Other("no scripted reply".to_string()))
          }
        })
    }
}

/// `data: ` frames for each chunk followed by `[DONE]`
pub fn sse_spans(chunks: &[Value]) -> Vec<Vec<u8>>
{   let mut spans: Vec<Vec<u8>> = chunks
      .iter()
      .map(|c| format!("data: {}\n\n", c).into_bytes())
      .collect();
    spans.push(b"data: [DONE]\n\n".to_vec());
    spans
}

pub fn sse_body(chunks: &[Value]) -> Vec<u8>
{   sse_spans(chunks).concat()
}

pub fn text_response(content: &str) -> Value
{   json!({
      "id": "chatcmpl-1",
      "object": "chat.completion",
      "created": 1718000000,
      "model": "deepseek-chat",
      "choices": [{
        "index": 0,
        "message": { "role": "assistant", "content": content },
        "finish_reason": "stop"
      }],
      "usage": {
        "prompt_tokens": 10,
        "completion_tokens": 5,
        "total_tokens": 15
      }
    })
}

/// Non-streaming response asking for `calls` as (id, name, arguments)
pub fn tool_call_response(calls: &[(&str, &str, &str)]) -> Value
{   let tool_calls: Vec<Value> = calls
      .iter()
      .enumerate()
      .map(|(i, (id, name, args))| json!({
        "index": i,
        "id": id,
        "type": "function",
        "function": { "name": name, "arguments": args }
      }))
      .collect();
    json!({
      "id": "chatcmpl-tools",
      "object": "chat.completion",
      "created": 1718000000,
      "model": "deepseek-chat",
      "choices": [{
        "index": 0,
        "message": {
          "role": "assistant",
          "content": "",
          "tool_calls": tool_calls
        },
        "finish_reason": "tool_calls"
      }]
    })
}

pub fn text_chunk(content: &str, finish: Option<&str>) -> Value
{   json!({
      "id": "chatcmpl-s",
      "object": "chat.completion.chunk",
      "created": 1718000000,
      "model": "deepseek-chat",
      "choices": [{
        "index": 0,
        "delta": { "content": content },
        "finish_reason": finish
      }]
    })
}

pub fn tool_chunk(
  index: u32
, id: Option<&str>
, name: Option<&str>
, arguments: &str
) -> Value
{   let mut call = json!({
      "index": index,
      "function": { "arguments": arguments }
    });
    if let Some(id) = id
    {   call["id"] = json!(id);
        call["type"] = json!("function");
    }
    if let Some(name) = name
    {   call["function"]["name"] = json!(name);
    }
    json!({
      "id": "chatcmpl-s",
      "object": "chat.completion.chunk",
      "created": 1718000000,
      "model": "deepseek-chat",
      "choices": [{
        "index": 0,
        "delta": { "tool_calls": [call] },
        "finish_reason": null
      }]
    })
}

pub fn finish_chunk(reason: &str) -> Value
{   json!({
      "id": "chatcmpl-s",
      "object": "chat.completion.chunk",
      "created": 1718000000,
      "model": "deepseek-chat",
      "choices": [{
        "index": 0,
        "delta": {},
        "finish_reason": reason
      }]
    })
}
