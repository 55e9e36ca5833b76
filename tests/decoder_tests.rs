mod common;

use serde_json::json;
use chatflow::{
  ErrorKind, ResponseShape, StreamDecoder, ToolCall, ToolCallAccumulator
};
use common::*;

fn decode_all(spans: &[&[u8]]) -> (Vec<chatflow::ChatResponse>, chatflow::ChatResponse)
{   let mut decoder = StreamDecoder::for_request(true);
    let mut chunks = vec![];
    for span in spans
    {   chunks.extend(decoder.decode(span));
    }
    let (response, tail) = decoder.finish().unwrap();
    chunks.extend(tail);
    (chunks, response)
}

fn weather_stream() -> Vec<u8>
{   sse_body(&[
      text_chunk("", None),
      tool_chunk(0, Some("call_1"), Some("get_weather"), ""),
      tool_chunk(0, None, None, "{\"loc"),
      tool_chunk(0, None, None, "ation\": \"Shen"),
      tool_chunk(0, None, None, "zhen\"}"),
      finish_chunk("tool_calls"),
    ])
}

#[test]
fn test_text_chunks_accumulate()
{   let body = sse_body(&[
      text_chunk("Hello", None),
      text_chunk(", ", None),
      text_chunk("world", Some("stop")),
    ]);
    let (chunks, response) = decode_all(&[body.as_slice()]);

    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.shape == ResponseShape::Delta));
    assert_eq!(chunks[2].finish_reason(), Some("stop"));
    assert_eq!(response.shape, ResponseShape::Message);
    assert_eq!(response.object, "chat.completion");
    assert_eq!(response.content(), Some("Hello, world"));
    assert_eq!(response.finish_reason(), Some("stop"));
}

#[test]
fn test_any_split_point_decodes_the_same()
{   let body = weather_stream();
    let (expected_chunks, expected) = decode_all(&[body.as_slice()]);
    assert_eq!(expected_chunks.len(), 6);

    for split in 0..=body.len()
    {   let (chunks, response) = decode_all(&[&body[..split], &body[split..]]);
        assert_eq!(chunks, expected_chunks, "split at {}", split);
        assert_eq!(response, expected, "split at {}", split);
    }
}

#[test]
fn test_byte_by_byte_decodes_the_same()
{   let body = weather_stream();
    let (expected_chunks, expected) = decode_all(&[body.as_slice()]);
    let spans: Vec<&[u8]> = body.chunks(1).collect();
    let (chunks, response) = decode_all(&spans);
    assert_eq!(chunks, expected_chunks);
    assert_eq!(response, expected);
}

#[test]
fn test_streamed_arguments_match_whole_response()
{   let body = weather_stream();
    let (_, streamed) = decode_all(&[body.as_slice()]);
    let whole = chatflow::ChatResponse::parse(
      tool_call_response(&[
        ("call_1", "get_weather", "{\"location\": \"Shenzhen\"}")
      ]).to_string().as_bytes(),
      ResponseShape::Message
    ).unwrap();

    let a = streamed.tool_calls();
    let b = whole.tool_calls();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].id, b[0].id);
    assert_eq!(a[0].kind, "function");
    assert_eq!(a[0].function.name, b[0].function.name);
    assert_eq!(a[0].function.arguments, b[0].function.arguments);
    assert_eq!(streamed.finish_reason(), Some("tool_calls"));
}

#[test]
fn test_parallel_tool_calls_keep_index_order()
{   let body = sse_body(&[
      tool_chunk(0, Some("call_a"), Some("get_weather"), ""),
      tool_chunk(1, Some("call_b"), Some("get_time"), ""),
      tool_chunk(1, None, None, "{\"tz\":\"UTC\"}"),
      tool_chunk(0, None, None, "{\"location\":\"Paris\"}"),
      finish_chunk("tool_calls"),
    ]);
    let (_, response) = decode_all(&[body.as_slice()]);
    let calls = response.tool_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].id, "call_a");
    assert_eq!(calls[0].function.arguments, "{\"location\":\"Paris\"}");
    assert_eq!(calls[1].id, "call_b");
    assert_eq!(calls[1].function.name, "get_time");
    assert_eq!(calls[1].function.arguments, "{\"tz\":\"UTC\"}");
}

#[test]
fn test_malformed_frame_is_dropped()
{   let mut body = format!("data: {}\n\n", text_chunk("a", None)).into_bytes();
    body.extend_from_slice(b"data: {not json\n\n");
    body.extend(sse_body(&[text_chunk("b", Some("stop"))]));

    let mut decoder = StreamDecoder::for_request(true);
    let chunks = decoder.decode(&body);
    assert_eq!(chunks.len(), 2);
    assert_eq!(decoder.dropped_frames(), 1);
    assert!(decoder.is_done());

    let (response, _) = decoder.finish().unwrap();
    assert_eq!(response.content(), Some("ab"));
}

#[test]
fn test_marker_must_start_a_line()
{   let glued = format!(
      "data: {}data: {}\n\n",
      text_chunk("a", None),
      text_chunk("b", None)
    );
    let mut decoder = StreamDecoder::for_request(true);
    assert!(decoder.decode(glued.as_bytes()).is_empty());
    assert_eq!(decoder.dropped_frames(), 1);

    let split = format!(
      "data: {}\ndata: {}\n\n",
      text_chunk("a", None),
      text_chunk("b", Some("stop"))
    );
    let mut decoder = StreamDecoder::for_request(true);
    let chunks = decoder.decode(split.as_bytes());
    assert_eq!(chunks.len(), 2);
    assert_eq!(decoder.dropped_frames(), 0);
    let (response, _) = decoder.finish().unwrap();
    assert_eq!(response.content(), Some("ab"));
}

#[test]
fn test_unterminated_last_frame_flushed_at_finish()
{   let body = format!("data: {}", text_chunk("tail", Some("stop")));
    let mut decoder = StreamDecoder::for_request(true);
    assert!(decoder.decode(body.as_bytes()).is_empty());
    assert!(decoder.buffered_len() > 0);

    let (response, tail) = decoder.finish().unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(response.content(), Some("tail"));
}

#[test]
fn test_usage_only_chunk_is_valid()
{   let usage = json!({
      "id": "chatcmpl-s",
      "object": "chat.completion.chunk",
      "created": 1718000000,
      "model": "deepseek-chat",
      "choices": [],
      "usage": {
        "prompt_tokens": 7,
        "completion_tokens": 3,
        "total_tokens": 10,
        "completion_tokens_details": { "reasoning_tokens": 2 }
      }
    });
    let body = sse_body(&[text_chunk("hi", Some("stop")), usage]);
    let (chunks, response) = decode_all(&[body.as_slice()]);

    assert_eq!(chunks.len(), 2);
    assert!(chunks[1].choices.is_empty());
    let usage = response.usage.unwrap();
    assert_eq!(usage.total_tokens, 10);
    assert_eq!(usage.reasoning(), 2);
}

#[test]
fn test_reasoning_content_accumulates()
{   let reasoning = |text: &str| json!({
      "id": "chatcmpl-r",
      "object": "chat.completion.chunk",
      "created": 1,
      "model": "deepseek-reasoner",
      "choices": [{
        "index": 0,
        "delta": { "role": "assistant", "reasoning_content": text, "content": null },
        "finish_reason": null
      }]
    });
    let body = sse_body(&[
      reasoning("Think"),
      reasoning("ing."),
      text_chunk("Answer", Some("stop")),
    ]);
    let (_, response) = decode_all(&[body.as_slice()]);
    let message = response.choices[0].message.as_ref().unwrap();
    assert_eq!(message.reasoning_content, "Thinking.");
    assert_eq!(message.content, "Answer");
    assert_eq!(response.model, "deepseek-reasoner");
}

#[test]
fn test_stream_without_choices_is_content_error()
{   let mut decoder = StreamDecoder::for_request(true);
    decoder.decode(b"data: [DONE]\n\n");
    let err = decoder.finish().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Content);
}

#[test]
fn test_non_streaming_body_is_buffered()
{   let body = text_response("whole").to_string().into_bytes();
    let mut decoder = StreamDecoder::for_request(false);
    let (a, b) = body.split_at(body.len() / 2);
    assert!(decoder.decode(a).is_empty());
    assert!(decoder.decode(b).is_empty());
    assert!(decoder.buffer_capacity() >= body.len());

    let (response, chunks) = decoder.finish().unwrap();
    assert!(chunks.is_empty());
    assert_eq!(response.content(), Some("whole"));
    assert_eq!(response.usage.unwrap().prompt_tokens, 10);
}

#[test]
fn test_non_streaming_errors_are_classified()
{   let mut malformed = StreamDecoder::for_request(false);
    malformed.decode(b"{\"id\": ");
    assert_eq!(malformed.finish().unwrap_err().kind(), ErrorKind::Parse);

    let mut missing = StreamDecoder::for_request(false);
    missing.decode(b"{\"id\": \"x\"}");
    assert_eq!(missing.finish().unwrap_err().kind(), ErrorKind::Content);

    let mut empty = StreamDecoder::for_request(false);
    empty.decode(b"{\"id\": \"x\", \"choices\": []}");
    assert_eq!(
      empty.finish().unwrap_err(),
      chatflow::Error::NoChoicesInResponse
    );
}

#[test]
fn test_accumulator_moves_colliding_ids()
{   let mut acc = ToolCallAccumulator::new();
    acc.fold(&[ToolCall::new("call_1", "a", "{}")]);
    acc.fold(&[ToolCall::new("call_2", "b", "{}")]);
    let calls = acc.calls();
    assert_eq!(acc.len(), 2);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[1].id, "call_2");
    assert_eq!(calls[1].index, 1);

    acc.clear();
    assert!(acc.is_empty());
}
