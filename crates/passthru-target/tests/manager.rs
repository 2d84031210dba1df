use std::time::{Duration, Instant};

use bytes::Bytes;
use passthru_core::{Watermarks, WriteOutcome};
use passthru_target::{
    ConnectOptions, ConnectState, TargetConnectionManager, TargetError, TargetSignal,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_opts(max_retries: u32) -> ConnectOptions {
    ConnectOptions {
        reconnect_interval: Duration::from_millis(30),
        max_retries,
        connect_timeout: Duration::from_secs(1),
        ..ConnectOptions::default()
    }
}

/// Echo server on an ephemeral port.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _ = tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let _ = tokio::spawn(async move {
                let (mut rd, mut wr) = sock.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    port
}

/// A port with nothing listening on it.
async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn next_signal(rx: &mut tokio::sync::mpsc::Receiver<TargetSignal>) -> TargetSignal {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}

#[tokio::test]
async fn connects_and_echoes() {
    let port = echo_server().await;
    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let (handle, mut signals) = manager.connect(&fast_opts(3)).await.unwrap().into_parts();
    assert_eq!(manager.state(), ConnectState::Connected);
    assert!(handle.id().as_str().starts_with("tgt_"));

    assert_eq!(handle.write(Bytes::from_static(b"hello")).unwrap(), WriteOutcome::Flowing);
    let mut got = Vec::new();
    while got.len() < 5 {
        match next_signal(&mut signals).await {
            TargetSignal::Data(chunk) => got.extend_from_slice(&chunk),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(got, b"hello");
}

#[tokio::test]
async fn gives_up_after_exactly_max_retries_attempts() {
    let port = refused_port().await;
    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let started = Instant::now();

    let err = manager.connect(&fast_opts(4)).await.unwrap_err();
    match err {
        TargetError::ConnectFailed { attempts, port: p, .. } => {
            assert_eq!(attempts, 4);
            assert_eq!(p, port);
        }
        other => panic!("unexpected {other:?}"),
    }
    // Three sleeps between four attempts.
    assert!(started.elapsed() >= Duration::from_millis(90), "elapsed {:?}", started.elapsed());
    assert_eq!(manager.state(), ConnectState::Idle);
}

#[tokio::test]
async fn zero_retries_makes_a_single_attempt() {
    let port = refused_port().await;
    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let err = manager.connect(&fast_opts(0)).await.unwrap_err();
    assert!(matches!(err, TargetError::ConnectFailed { attempts: 1, .. }));
}

#[tokio::test]
async fn second_connect_while_connecting_is_rejected() {
    let port = refused_port().await;
    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let opts = ConnectOptions {
        reconnect_interval: Duration::from_secs(30),
        ..fast_opts(5)
    };

    let pending = {
        let manager = manager.clone();
        let opts = opts.clone();
        tokio::spawn(async move { manager.connect(&opts).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(manager.state(), ConnectState::Connecting { .. }));

    let err = manager.connect(&opts).await.unwrap_err();
    assert!(matches!(err, TargetError::AlreadyConnecting));

    manager.disconnect();
    let first = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(first, Err(TargetError::Cancelled)));
}

#[tokio::test]
async fn disconnect_cancels_retry_sleep_and_allows_fresh_connect() {
    let port = refused_port().await;
    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let opts = ConnectOptions {
        reconnect_interval: Duration::from_secs(30),
        ..fast_opts(10)
    };

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(&opts).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.disconnect();

    let result = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(TargetError::Cancelled)));
    assert_eq!(manager.state(), ConnectState::Idle);

    let err = manager.connect(&fast_opts(1)).await.unwrap_err();
    assert!(matches!(err, TargetError::ConnectFailed { attempts: 1, .. }));
}

#[tokio::test]
async fn peer_close_is_terminal_and_resets_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _ = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"bye").await.unwrap();
    });

    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let (handle, mut signals) = manager.connect(&fast_opts(1)).await.unwrap().into_parts();

    assert_eq!(next_signal(&mut signals).await, TargetSignal::Data(Bytes::from_static(b"bye")));
    assert_eq!(next_signal(&mut signals).await, TargetSignal::Closed);
    assert!(signals.recv().await.is_none());

    assert_eq!(manager.state(), ConnectState::Idle);
    assert!(handle.is_destroyed());
    assert!(matches!(handle.write(Bytes::from_static(b"x")), Err(TargetError::Closed)));
}

#[tokio::test]
async fn disconnect_half_closes_live_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let _ = sock.read_to_end(&mut received).await.unwrap();
        received
    });

    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let (handle, _signals) = manager.connect(&fast_opts(1)).await.unwrap().into_parts();
    let _ = handle.write(Bytes::from_static(b"last words")).unwrap();
    manager.disconnect();

    let received = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(received, b"last words");
    assert_eq!(manager.state(), ConnectState::Idle);
    assert!(matches!(handle.write(Bytes::from_static(b"more")), Err(TargetError::Closed)));
}

#[tokio::test]
async fn stalled_target_saturates_and_pauses_gate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // Accept and never read.
    let _hold = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(sock);
    });

    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let opts = ConnectOptions {
        watermarks: Watermarks::new(64 * 1024, 16 * 1024),
        ..fast_opts(1)
    };
    let (handle, _signals) = manager.connect(&opts).await.unwrap().into_parts();

    let chunk = Bytes::from(vec![0u8; 32 * 1024]);
    let mut saturated = false;
    for _ in 0..2048 {
        if handle.write(chunk.clone()).unwrap() == WriteOutcome::Saturated {
            saturated = true;
            break;
        }
    }
    assert!(saturated);
    assert!(handle.gate().is_paused());

    handle.destroy();
    assert!(handle.is_destroyed());
}

#[tokio::test]
async fn write_failure_is_reported_behind_queued_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _ = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        for _ in 0..3 {
            sock.write_all(b"chunk").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    });

    let opts = ConnectOptions {
        signal_capacity: 1,
        ..fast_opts(1)
    };
    let manager = TargetConnectionManager::new("127.0.0.1", port);
    let (handle, mut signals) = manager.connect(&opts).await.unwrap().into_parts();

    // Nobody drains the signal queue while the peer goes away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let deadline = Instant::now() + TIMEOUT;
    while handle.write(Bytes::from_static(b"x")).is_ok() {
        assert!(Instant::now() < deadline, "writes to a closed peer never failed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.is_destroyed());

    let mut terminal = None;
    while let Some(signal) = tokio::time::timeout(TIMEOUT, signals.recv()).await.unwrap() {
        if signal.is_terminal() {
            terminal = Some(signal);
        }
    }
    assert!(matches!(terminal, Some(TargetSignal::Error(_))), "got {terminal:?}");
}
