//! Incremental decoder from HTTP body bytes to responses and chunks

use std::collections::BTreeMap;
use log::{debug, trace, warn};
use crate::error::Error;
use crate::request::{Role, ToolCall};
use crate::response::{
  ChatResponse, Choice, ChoiceMessage, ResponseShape
};

const DATA_MARKER: &[u8] = b"data: ";
const DONE_PAYLOAD: &[u8] = b"[DONE]";

// ===== Tool call accumulation =====

/// Folds streamed tool call fragments into whole calls, keyed by
/// their stream index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallAccumulator
{   calls: BTreeMap<u32, ToolCall>
}

impl ToolCallAccumulator
{   pub fn new() -> Self
    {   ToolCallAccumulator::default()
    }

    /// The first fragment for an index sets id, type and name; every
    /// fragment appends its arguments.
    pub fn fold(&mut self, deltas: &[ToolCall])
    {   for delta in deltas
        {   let mut index = delta.index;

            // Some servers send whole calls without an index; a second
            // id at a taken index is a new call, not a fragment.
            if let Some(existing) = self.calls.get(&index)
            {   if !delta.id.is_empty()
                  && !existing.id.is_empty()
                  && existing.id != delta.id
                {   index = self.calls.keys().next_back()
                      .map_or(0, |k| k + 1);
                    debug!(
                      "Tool call {} collides at index {}, moved to {}",
                      delta.id, delta.index, index
                    );
                }
            }

            let entry = self.calls.entry(index).or_insert_with(|| {
              trace!("New tool call at index {}: {}", index, delta.id);
              ToolCall
              {   id: delta.id.clone()
                , kind: if delta.kind.is_empty()
                  {   "function".to_string()
                  } else
                  {   delta.kind.clone()
                  }
                , function: crate::request::FunctionCall
                  {   name: delta.function.name.clone()
                    , arguments: String::new()
                  }
                , index
              }
            });

            if entry.id.is_empty()
            {   entry.id = delta.id.clone();
            }
            if entry.function.name.is_empty()
            {   entry.function.name = delta.function.name.clone();
            }
            entry.function.arguments
              .push_str(&delta.function.arguments);
        }
    }

    pub fn is_empty(&self) -> bool
    {   self.calls.is_empty()
    }

    pub fn len(&self) -> usize
    {   self.calls.len()
    }

    /// Assembled calls in index order
    pub fn calls(&self) -> Vec<ToolCall>
    {   self.calls.values().cloned().collect()
    }

    pub fn clear(&mut self)
    {   self.calls.clear();
    }
}

// ===== Decoder =====

/// Turns raw body bytes into chunks (streaming) or one response
/// (non-streaming).
///
/// Streaming bodies are SSE: a frame starts after `data: ` at the start
/// of a line and ends before the next such marker, at the first blank
/// line, or at the end of input. A trailing frame that is not yet
/// terminated by a line break is kept until more bytes arrive or the
/// stream is finished.
#[derive(Debug)]
pub struct StreamDecoder
{   shape: ResponseShape
  , /// Whole body (non-streaming) or an unterminated frame (streaming)
    buffer: Vec<u8>
  , accumulated: ChatResponse
  , tool_calls: ToolCallAccumulator
  , done: bool
  , dropped_frames: usize
}

impl StreamDecoder
{   pub fn new(shape: ResponseShape) -> Self
    {   StreamDecoder
        {   shape
          , buffer: Vec::new()
          , accumulated: ChatResponse::default()
          , tool_calls: ToolCallAccumulator::new()
          , done: false
          , dropped_frames: 0
        }
    }

    pub fn for_request(stream: bool) -> Self
    {   StreamDecoder::new(if stream
        {   ResponseShape::Delta
        } else
        {   ResponseShape::Message
        })
    }

    pub fn shape(&self) -> ResponseShape
    {   self.shape
    }

    /// `[DONE]` was seen
    pub fn is_done(&self) -> bool
    {   self.done
    }

    /// Frames whose JSON could not be parsed
    pub fn dropped_frames(&self) -> usize
    {   self.dropped_frames
    }

    pub fn tool_calls(&self) -> &ToolCallAccumulator
    {   &self.tool_calls
    }

    pub fn buffered_len(&self) -> usize
    {   self.buffer.len()
    }

    pub fn buffer_capacity(&self) -> usize
    {   self.buffer.capacity()
    }

    /// Feed one span of body bytes. Returns the chunks completed by
    /// it; always empty for non-streaming bodies, which are buffered
    /// until `finish`.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<ChatResponse>
    {   match self.shape
        {   ResponseShape::Message => {
              self.append_buffer(bytes);
              vec![]
            }
          , ResponseShape::Delta => {
              self.append_buffer(bytes);
              let mut chunks = vec![];
              self.drain_frames(false, &mut chunks);
              chunks
            }
        }
    }

    /// End of body. Streaming: flushes a pending frame and returns the
    /// accumulated response plus any chunk the flush produced.
    /// Non-streaming: parses the buffered body.
    pub fn finish(
      &mut self
    ) -> Result<(ChatResponse, Vec<ChatResponse>), Error>
    {   match self.shape
        {   ResponseShape::Message => {
              let body = std::mem::take(&mut self.buffer);
              trace!("Parsing {} buffered bytes", body.len());
              let response = ChatResponse::parse(
                &body,
                ResponseShape::Message
              )?;
              Ok((response, vec![]))
            }
          , ResponseShape::Delta => {
              let mut chunks = vec![];
              self.drain_frames(true, &mut chunks);
              let mut response = std::mem::take(&mut self.accumulated);
              if response.choices.is_empty()
              {   return Err(Error::NoChoicesInResponse);
              }
              response.shape = ResponseShape::Message;
              if let Some(message) = response.choices[0].message.as_mut()
              {   message.tool_calls = self.tool_calls.calls();
              }
              Ok((response, chunks))
            }
        }
    }

    /// Grow by 1.5x of the required size when full
    fn append_buffer(&mut self, bytes: &[u8])
    {   let needed = self.buffer.len() + bytes.len();
        if needed > self.buffer.capacity()
        {   let target = needed + needed / 2;
            self.buffer.reserve_exact(target - self.buffer.len());
        }
        self.buffer.extend_from_slice(bytes);
    }

    fn drain_frames(
      &mut self
    , at_end: bool
    , chunks: &mut Vec<ChatResponse>
    )
    {   let data = std::mem::take(&mut self.buffer);
        // a marker may be split across spans
        let limit = if at_end
        {   data.len()
        } else
        {   data.len() - partial_marker_len(&data)
        };
        let region = &data[..limit];
        let mut pos = 0;

        while let Some(start) = find_marker(region, pos)
        {   let begin = start + DATA_MARKER.len();
            let end = match find_marker(region, begin)
            {   Some(next) => next
              , None => {
                  let terminated = region.last() == Some(&b'\n');
                  if !terminated && !at_end
                  {   trace!("Holding {} bytes of open frame", data.len() - start);
                      self.buffer.extend_from_slice(&data[start..]);
                      return;
                  }
                  region.len()
                }
            };
            self.handle_payload(frame_payload(&region[begin..end]), chunks);
            pos = end;
        }
        self.buffer.extend_from_slice(&data[limit..]);
    }

    fn handle_payload(
      &mut self
    , payload: &[u8]
    , chunks: &mut Vec<ChatResponse>
    )
    {   if payload.is_empty()
        {   return;
        }
        if payload == DONE_PAYLOAD
        {   debug!("Stream reported [DONE]");
            self.done = true;
            return;
        }
        match ChatResponse::parse(payload, ResponseShape::Delta)
        {   Ok(chunk) => {
              self.fold_chunk(&chunk);
              chunks.push(chunk);
            }
          , Err(e) => {
              self.dropped_frames += 1;
              warn!("Dropping undecodable frame: {}", e);
            }
        }
    }

    fn fold_chunk(&mut self, chunk: &ChatResponse)
    {   let acc = &mut self.accumulated;
        if acc.id.is_empty()
        {   acc.id = chunk.id.clone();
            acc.object = "chat.completion".to_string();
            acc.created = chunk.created;
            acc.model = chunk.model.clone();
        }
        if acc.system_fingerprint.is_empty()
        {   acc.system_fingerprint = chunk.system_fingerprint.clone();
        }
        if chunk.usage.is_some()
        {   acc.usage = chunk.usage;
        }

        for choice in &chunk.choices
        {   let Some(delta) = choice.delta.as_ref() else { continue };

            let slot = match acc.choices
              .iter()
              .position(|c| c.index == choice.index)
            {   Some(i) => i
              , None => {
                  acc.choices.push(Choice
                  {   index: choice.index
                    , message: Some(ChoiceMessage
                      {   role: Some(Role::Assistant)
                        , ..ChoiceMessage::default()
                      })
                    , ..Choice::default()
                  });
                  acc.choices.len() - 1
                }
            };
            let target = &mut acc.choices[slot];
            if let Some(message) = target.message.as_mut()
            {   if delta.role.is_some()
                {   message.role = delta.role;
                }
                message.content.push_str(&delta.content);
                message.reasoning_content
                  .push_str(&delta.reasoning_content);
            }
            if choice.finish_reason.is_some()
            {   target.finish_reason = choice.finish_reason.clone();
            }
            if let Some(logprobs) = choice.logprobs.as_ref()
            {   target.logprobs
                  .get_or_insert_with(Default::default)
                  .content
                  .extend(logprobs.content.iter().cloned());
            }
        }

        if let Some(delta) = chunk.first_choice()
          .and_then(|c| c.delta.as_ref())
        {   if !delta.tool_calls.is_empty()
            {   self.tool_calls.fold(&delta.tool_calls);
            }
        }
    }
}

/// Next `data: ` marker at or after `from` that starts a line
fn find_marker(data: &[u8], from: usize) -> Option<usize>
{   let mut i = from;
    while i + DATA_MARKER.len() <= data.len()
    {   if data[i..].starts_with(DATA_MARKER)
          && (i == 0 || data[i - 1] == b'\n')
        {   return Some(i);
        }
        i += 1;
    }
    None
}

/// Length of a trailing, line-initial prefix of the data marker
fn partial_marker_len(data: &[u8]) -> usize
{   (1..DATA_MARKER.len())
      .rev()
      .find(|n| {
        data.ends_with(&DATA_MARKER[..*n])
          && (data.len() == *n || data[data.len() - n - 1] == b'\n')
      })
      .unwrap_or(0)
}

/// Frame text up to its first blank line, without trailing CR/LF
fn frame_payload(frame: &[u8]) -> &[u8]
{   let mut end = frame.len();
    let mut line_start = 0;
    for (i, b) in frame.iter().enumerate()
    {   if *b == b'\n'
        {   let line = &frame[line_start..i];
            if line.is_empty() || line == b"\r"
            {   end = line_start;
                break;
            }
            line_start = i + 1;
        }
    }
    let mut payload = &frame[..end];
    while let Some((last, rest)) = payload.split_last()
    {   if *last == b'\n' || *last == b'\r'
        {   payload = rest;
        } else
        {   break;
        }
    }
    payload
}
