//! A slow subscriber loses frames without holding back a fast one.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use framecast_core::{SessionId, SessionMode, StartRequest};
use framecast_server::ConnectionRegistry;
use framecast_session::{BuiltinResolver, ManagerConfig, SessionManager};

const FRAMES: u64 = 10;
const QUEUE: usize = 4;

fn drain(rx: &mut mpsc::Receiver<Arc<str>>, into: &mut Vec<Value>) {
    while let Ok(text) = rx.try_recv() {
        into.push(serde_json::from_str(&text).unwrap());
    }
}

fn frame_numbers(messages: &[Value]) -> Vec<u64> {
    messages
        .iter()
        .filter(|m| m["type"] == "frame")
        .filter_map(|m| m["frame_number"].as_u64())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn slow_subscriber_drops_while_fast_one_gets_every_frame() {
    let registry = Arc::new(ConnectionRegistry::new(4, QUEUE, CancellationToken::new()));
    let sessions = SessionManager::new(
        ManagerConfig::default(),
        Arc::new(BuiltinResolver {
            default_test_frames: FRAMES,
            frame_test_rate: 10.0,
        }),
        registry.clone(),
        CancellationToken::new(),
    );

    let session = SessionId::new();
    let (fast, mut fast_rx) = registry.register().unwrap();
    let (slow, mut slow_rx) = registry.register().unwrap();
    registry.subscribe(&fast.id, session.clone()).unwrap();
    registry.subscribe(&slow.id, session.clone()).unwrap();

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(text) = fast_rx.recv().await {
            let message: Value = serde_json::from_str(&text).unwrap();
            let done = message["type"] == "complete";
            seen.push(message);
            if done {
                break;
            }
        }
        seen
    });

    let request = StartRequest {
        mode: Some(SessionMode::FrameTest),
        ..StartRequest::default()
    };
    sessions.start(session.clone(), request).await.unwrap();

    // the slow reader only looks at its queue every 350ms, while frames
    // arrive every 100ms
    let mut slow_seen = Vec::new();
    for _ in 0..10 {
        if reader.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(350)).await;
        drain(&mut slow_rx, &mut slow_seen);
    }
    let fast_seen = reader.await.unwrap();
    drain(&mut slow_rx, &mut slow_seen);

    assert_eq!(frame_numbers(&fast_seen), (1..=FRAMES).collect::<Vec<_>>());
    assert_eq!(fast.drop_count(), 0);

    let slow_frames = frame_numbers(&slow_seen);
    assert!(
        slow_frames.windows(2).all(|w| w[0] < w[1]),
        "not increasing: {slow_frames:?}"
    );
    assert!(slow_frames.len() < FRAMES as usize, "slow reader kept up: {slow_frames:?}");
    assert_eq!(slow_frames.first(), Some(&1));
    // every message the fast reader got was offered to the slow one
    assert_eq!(slow.drop_count() as usize, fast_seen.len() - slow_seen.len());
    assert_eq!(registry.total_dropped(), slow.drop_count());

    sessions.shutdown().await;
}
