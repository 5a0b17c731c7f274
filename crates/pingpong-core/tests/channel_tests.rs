//! Integration tests for the channel: calls against a live listener on localhost.

use pingpong_core::error::codes;
use pingpong_core::{
    register_ping_handler, CallContext, Channel, ChannelError, Ping, PingConfig, PingLoop,
    PingLoopConfig, Pong, ServeHandle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SERVICE: &str = PingConfig::SERVICE_NAME;

/// In-memory sink for formatted log output.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture INFO logs emitted on this thread until the guard is dropped.
fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

async fn open_ping_channel() -> (Channel, ServeHandle) {
    let channel = Channel::new(SERVICE);
    register_ping_handler(&channel, SERVICE);
    let handle = channel.open("127.0.0.1:0").await.unwrap();
    (channel, handle)
}

fn fast_loop_config() -> PingLoopConfig {
    PingLoopConfig {
        call_timeout: Duration::from_secs(2),
        interval: Duration::from_millis(20),
        ..PingLoopConfig::default()
    }
}

#[tokio::test]
async fn test_ping_echoes_message() {
    let (channel, _handle) = open_ping_channel().await;
    let peer = channel.peers().add(&channel.host_port().unwrap());

    for message in ["hello", "", "Tue Oct 15 09:00:00 UTC 2026"] {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let pong: Pong = channel
            .call(&ctx, &peer, SERVICE, "ping", &Ping::new(message))
            .await
            .unwrap();
        assert_eq!(pong.message, message);
    }
}

#[tokio::test]
async fn test_unregistered_method_is_remote_error() {
    let (channel, _handle) = open_ping_channel().await;
    let peer = channel.peers().add(&channel.host_port().unwrap());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let result: pingpong_core::Result<Pong> = channel
        .call(&ctx, &peer, SERVICE, "pong", &Ping::new("x"))
        .await;

    match result {
        Err(err @ ChannelError::Remote { .. }) => {
            assert!(err.is_method_not_found());
            assert!(err.to_string().contains("PingService::pong"));
        }
        other => panic!("Expected Remote, got: {:?}", other),
    }

    // The connection survives a remote error.
    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let pong: Pong = channel
        .call(&ctx, &peer, SERVICE, "ping", &Ping::new("still here"))
        .await
        .unwrap();
    assert_eq!(pong.message, "still here");
}

#[tokio::test]
async fn test_expired_deadline_fails_without_io() {
    let channel = Channel::new(PingConfig::CLIENT_NAME);
    // Nothing listens here; any I/O attempt would surface as a connection error.
    let peer = channel.peers().add("127.0.0.1:1");

    let ctx = CallContext::with_timeout(Duration::ZERO);
    let result: pingpong_core::Result<Pong> = channel
        .call(&ctx, &peer, SERVICE, "ping", &Ping::new("late"))
        .await;

    assert!(matches!(result, Err(ChannelError::Timeout(_))));
    assert!(!peer.is_connected());
}

#[tokio::test]
async fn test_connection_refused_is_connection_error() {
    let channel = Channel::new(PingConfig::CLIENT_NAME);
    let peer = channel.peers().add("127.0.0.1:1");

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let result: pingpong_core::Result<Pong> = channel
        .call(&ctx, &peer, SERVICE, "ping", &Ping::new("anyone?"))
        .await;

    match result {
        Err(ChannelError::Connection { peer, .. }) => assert_eq!(peer, "127.0.0.1:1"),
        other => panic!("Expected Connection, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_handler_times_out_and_connection_recovers() {
    let (channel, _handle) = open_ping_channel().await;
    channel.register_fn(SERVICE, "slow", |_call, ping: Ping| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok::<_, ChannelError>(Pong::from(ping))
    });
    let peer = channel.peers().add(&channel.host_port().unwrap());

    for i in 0..5 {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let result: pingpong_core::Result<Pong> = channel
            .call(&ctx, &peer, SERVICE, "slow", &Ping::new(format!("slow {}", i)))
            .await;
        assert!(
            matches!(result, Err(ChannelError::Timeout(_))),
            "attempt {}: {:?}",
            i,
            result
        );
    }

    // Late "slow" replies must never be read by the next call.
    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let pong: Pong = channel
        .call(&ctx, &peer, SERVICE, "ping", &Ping::new("fresh"))
        .await
        .unwrap();
    assert_eq!(pong.message, "fresh");
}

#[tokio::test]
async fn test_whole_millisecond_deadline_always_reports_timeout() {
    let (channel, _handle) = open_ping_channel().await;
    channel.register_fn(SERVICE, "slow", |_call, ping: Ping| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, ChannelError>(Pong::from(ping))
    });
    let peer = channel.peers().add(&channel.host_port().unwrap());

    // Whichever side notices the deadline first, the caller sees its own timeout.
    let timeout = Duration::from_millis(30);
    for i in 0..10 {
        let ctx = CallContext::with_timeout(timeout);
        let result: pingpong_core::Result<Pong> = channel
            .call(&ctx, &peer, SERVICE, "slow", &Ping::new(format!("late {}", i)))
            .await;
        match result {
            Err(ChannelError::Timeout(d)) => assert_eq!(d, timeout),
            other => panic!("attempt {}: expected Timeout, got: {:?}", i, other),
        }
    }
}

#[tokio::test]
async fn test_cancel_aborts_pending_call() {
    let (channel, _handle) = open_ping_channel().await;
    channel.register_fn(SERVICE, "slow", |_call, ping: Ping| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok::<_, ChannelError>(Pong::from(ping))
    });
    let peer = channel.peers().add(&channel.host_port().unwrap());

    let ctx = CallContext::with_timeout(Duration::from_secs(10));
    let token = ctx.token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let result: pingpong_core::Result<Pong> = channel
        .call(&ctx, &peer, SERVICE, "slow", &Ping::new("never mind"))
        .await;

    assert!(matches!(result, Err(ChannelError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_handler_error_is_remote_and_observed_once() {
    let (channel, _handle) = open_ping_channel().await;
    channel.register_fn(SERVICE, "broken", |_call, _ping: Ping| async move {
        Err::<Pong, _>(ChannelError::handler("database on fire"))
    });

    let observed = Arc::new(AtomicUsize::new(0));
    let counter = observed.clone();
    channel.on_error(move |call, err| {
        assert_eq!(call.method, "broken");
        assert!(matches!(err, ChannelError::Handler(_)));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let client = Channel::new(PingConfig::CLIENT_NAME);
    let peer = client.peers().add(&channel.host_port().unwrap());
    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let result: pingpong_core::Result<Pong> = client
        .call(&ctx, &peer, SERVICE, "broken", &Ping::new("x"))
        .await;

    match result {
        Err(ChannelError::Remote { code, message }) => {
            assert_eq!(code, codes::INTERNAL_ERROR);
            assert!(message.contains("database on fire"));
        }
        other => panic!("Expected Remote, got: {:?}", other),
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_undecodable_response_is_encoding_error() {
    let channel = Channel::new(SERVICE);
    channel.register_fn(SERVICE, "ping", |_call, _ping: Ping| async move {
        Ok::<_, ChannelError>(42u32)
    });
    let _handle = channel.open("127.0.0.1:0").await.unwrap();
    let peer = channel.peers().add(&channel.host_port().unwrap());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let result: pingpong_core::Result<Pong> = channel
        .call(&ctx, &peer, SERVICE, "ping", &Ping::new("x"))
        .await;
    assert!(matches!(result, Err(ChannelError::Encoding { .. })));
}

#[tokio::test]
async fn test_undecodable_arguments_are_encoding_error() {
    let (channel, _handle) = open_ping_channel().await;
    let peer = channel.peers().add(&channel.host_port().unwrap());

    let ctx = CallContext::with_timeout(Duration::from_secs(5));
    let result: pingpong_core::Result<Pong> = channel
        .call(&ctx, &peer, SERVICE, "ping", &vec![1, 2, 3])
        .await;
    assert!(matches!(result, Err(ChannelError::Encoding { .. })));
}

#[tokio::test]
async fn test_inbound_calls_are_dispatched_concurrently() {
    let server = Channel::new(SERVICE);
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    server.register_fn(SERVICE, "meet", move |_call, ping: Ping| {
        let barrier = barrier.clone();
        async move {
            barrier.wait().await;
            Ok::<_, ChannelError>(Pong::from(ping))
        }
    });
    let _handle = server.open("127.0.0.1:0").await.unwrap();
    let addr = server.host_port().unwrap();

    // Two clients, two connections; each handler only returns once both are running.
    let calls = (0..2).map(|i| {
        let addr = addr.clone();
        async move {
            let client = Channel::new(format!("client-{}", i));
            let peer = client.peers().add(&addr);
            let ctx = CallContext::with_timeout(Duration::from_secs(2));
            client
                .call::<Ping, Pong>(&ctx, &peer, SERVICE, "meet", &Ping::new(format!("m{}", i)))
                .await
        }
    });

    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().message, format!("m{}", i));
    }
}

#[tokio::test]
async fn test_one_iteration_logs_ping_and_pong() {
    let (logs, _guard) = capture_logs();
    let (channel, _handle) = open_ping_channel().await;

    let ping_loop = PingLoop::new(channel, PingLoopConfig::default());
    let pong = ping_loop.ping_once().await.unwrap();

    let output = logs.contents();
    assert_eq!(output.matches("recv ping:").count(), 1, "{}", output);
    assert_eq!(output.matches("recv pong:").count(), 1, "{}", output);
    assert!(output.contains(&format!("recv ping: '{}'", pong.message)));
    assert!(output.contains(&format!("recv pong: '{}'", pong.message)));
}

#[tokio::test]
async fn test_loop_survives_encoding_failures() {
    let (logs, _guard) = capture_logs();

    let channel = Channel::new(SERVICE);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    channel.register_fn(SERVICE, "ping", move |_call, _ping: Ping| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, ChannelError>("not a pong") }
    });
    let _handle = channel.open("127.0.0.1:0").await.unwrap();

    let ping_loop = PingLoop::new(channel, fast_loop_config());
    let shutdown = ping_loop.shutdown_token();
    let task = ping_loop.spawn();

    tokio::time::timeout(Duration::from_secs(5), async {
        while hits.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("loop should keep calling after failures");

    shutdown.cancel();
    task.await.unwrap();

    let output = logs.contents();
    assert!(output.contains("Ping call failed"), "{}", output);
    assert!(output.contains("Encoding error"), "{}", output);
    assert!(!output.contains("recv pong:"), "{}", output);
}

#[tokio::test]
async fn test_loop_survives_unreachable_peer() {
    let (logs, _guard) = capture_logs();

    let (channel, handle) = open_ping_channel().await;
    let ping_loop = PingLoop::new(channel, fast_loop_config());
    let shutdown = ping_loop.shutdown_token();

    // Take the listener down before the first ping goes out.
    handle.join().await;
    let task = ping_loop.spawn();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!task.is_finished());
    shutdown.cancel();
    task.await.unwrap();

    let output = logs.contents();
    assert!(output.matches("Ping call failed").count() >= 2, "{}", output);
    assert!(output.contains("Ping loop stopped"));
}
