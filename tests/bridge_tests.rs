use std::time::Duration;
use chatflow::{result_channel, ChatResponse, ChatResult, Error};

fn chunk(n: usize, last: bool) -> ChatResponse
{   let mut chunk = ChatResponse::error_chunk("");
    chunk.error = None;
    chunk.id = format!("chunk-{}", n);
    chunk.last_chunk = last;
    chunk
}

#[tokio::test]
async fn test_queue_overflow_loses_nothing()
{   let capacity = 4;
    let (mut handle, mut sink) = result_channel(true, capacity);

    let producer = tokio::spawn(async move {
      for n in 0..=capacity
      {   assert!(sink.put_chunk(chunk(n, n == capacity)).await);
      }
      sink.complete(ChatResult::ok(200, ChatResponse::default()));
    });

    let mut ids = vec![];
    while let Some(c) = handle.next_chunk().await
    {   ids.push(c.id);
    }
    producer.await.unwrap();

    let expected: Vec<String> = (0..=capacity)
      .map(|n| format!("chunk-{}", n))
      .collect();
    assert_eq!(ids, expected);
    assert!(handle.response().await.success);
}

#[tokio::test]
async fn test_no_blocking_after_last_chunk()
{   let (mut handle, mut sink) = result_channel(true, 8);
    assert!(sink.put_chunk(chunk(0, true)).await);
    assert!(!sink.is_open());
    assert!(!sink.put_chunk(chunk(1, false)).await);

    let first = tokio::time::timeout(Duration::from_secs(1), handle.next_chunk())
      .await
      .unwrap();
    assert!(first.unwrap().last_chunk);
    let after = tokio::time::timeout(Duration::from_secs(1), handle.next_chunk())
      .await
      .unwrap();
    assert!(after.is_none());
    drop(sink);
}

#[tokio::test]
async fn test_ref_count_drops_with_pipeline()
{   let (mut handle, sink) = result_channel(false, 0);
    assert_eq!(handle.ref_count(), 2);
    assert!(!handle.is_done());

    sink.complete(ChatResult::ok(200, ChatResponse::default()));
    assert_eq!(handle.ref_count(), 1);
    assert!(handle.is_done());
    assert!(handle.success());
    assert_eq!(handle.status_code(), 200);
    assert_eq!(handle.response().await.status_code, 200);
}

#[tokio::test]
async fn test_failed_result_reports_status()
{   let (mut handle, sink) = result_channel(false, 0);
    sink.complete(ChatResult::failed(Error::ApiError
    {   status: 429
      , body: "rate limited".to_string()
    }));

    assert!(!handle.success());
    assert_eq!(handle.status_code(), 429);
    assert!(handle.error_message().contains("rate limited"));
    let result = handle.response().await;
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().status_code(), 429);
}

#[tokio::test]
async fn test_dropped_sink_resolves_as_failure()
{   let (mut handle, sink) = result_channel(true, 2);
    drop(sink);

    assert!(handle.is_done());
    assert!(handle.next_chunk().await.is_none());
    let result = handle.response().await;
    assert!(!result.success);
    assert!(result.error_message.contains("without a result"));
}

#[test]
fn test_blocking_consumer()
{   let (mut handle, mut sink) = result_channel(true, 1);

    let producer = std::thread::spawn(move || {
      tokio_test::block_on(async {
        for n in 0..3
        {   sink.put_chunk(chunk(n, n == 2)).await;
        }
        sink.complete(ChatResult::ok(200, ChatResponse::default()));
      })
    });

    let mut count = 0;
    while let Some(_) = handle.get_chunk()
    {   count += 1;
    }
    assert_eq!(count, 3);
    assert!(handle.get_response().success);
    producer.join().unwrap();
    assert!(handle.into_result().success);
}

#[test]
fn test_non_streaming_handle_has_no_chunks()
{   let (mut handle, sink) = result_channel(false, 16);
    assert!(!handle.is_streaming());
    assert!(!sink.is_streaming());
    assert!(handle.get_chunk().is_none());
    sink.complete(ChatResult::ok(200, ChatResponse::default()));
    assert_eq!(handle.get_response().status_code, 200);
}
