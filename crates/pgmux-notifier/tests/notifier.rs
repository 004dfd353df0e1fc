//! Run loop behavior against the in-memory listener.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use pgmux_core::logging::capture_logs;
use pgmux_notifier::testing::{Command, MemoryListener};
use pgmux_notifier::{
    ChangeKind, Listener, ListenerError, Notifier, NotifierConfig, NotifierError, Subscription,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    notifier: Notifier,
    listener: Arc<MemoryListener>,
    lifetime: CancellationToken,
    handle: JoinHandle<NotifierError>,
}

impl Harness {
    fn start(config: NotifierConfig) -> Self {
        let listener = Arc::new(MemoryListener::connected());
        let notifier = Notifier::new(listener.clone(), config);
        let lifetime = CancellationToken::new();
        let runner = notifier.clone();
        let token = lifetime.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });
        Self {
            notifier,
            listener,
            lifetime,
            handle,
        }
    }

    fn with_defaults() -> Self {
        Self::start(NotifierConfig::default())
    }

    async fn stop(self) -> NotifierError {
        self.lifetime.cancel();
        timeout(TIMEOUT, self.handle)
            .await
            .expect("run loop did not stop")
            .unwrap()
    }

    /// Wait until every notification injected so far has been dispatched.
    async fn sync(&self) {
        let mut marker = self.notifier.listen("__sync");
        established(&marker).await;
        self.listener.notify("__sync", "mark");
        assert_eq!(recv(&mut marker).await, "mark");
    }
}

async fn established(sub: &Subscription) {
    timeout(TIMEOUT, sub.established())
        .await
        .expect("established timed out")
        .unwrap();
}

async fn recv(sub: &mut Subscription) -> Bytes {
    timeout(TIMEOUT, sub.recv())
        .await
        .expect("recv timed out")
        .expect("subscription closed")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn orders_end_to_end() {
    let h = Harness::with_defaults();

    let mut first = h.notifier.listen("orders");
    established(&first).await;
    assert_eq!(h.listener.listen_count("orders"), 1);

    h.listener.notify("orders", "evt1");
    assert_eq!(recv(&mut first).await, "evt1");

    let mut second = h.notifier.listen("orders");
    assert!(second.is_established());
    h.listener.notify("orders", "evt2");
    assert_eq!(recv(&mut first).await, "evt2");
    assert_eq!(recv(&mut second).await, "evt2");
    assert_eq!(h.listener.listen_count("orders"), 1);

    first.unlisten();
    h.listener.notify("orders", "evt3");
    assert_eq!(recv(&mut second).await, "evt3");
    h.sync().await;
    assert_eq!(h.listener.unlisten_count("orders"), 0);

    second.unlisten();
    eventually(|| h.listener.unlisten_count("orders") == 1).await;

    assert_matches!(h.stop().await, NotifierError::Stopped);
}

#[tokio::test]
async fn fan_out_is_independent_of_consumption_rate() {
    let h = Harness::with_defaults();
    let mut slow = h.notifier.listen("orders");
    let mut fast = h.notifier.listen("orders");
    established(&fast).await;

    for i in 0..5 {
        let payload = format!("evt{i}");
        h.listener.notify("orders", payload.clone());
        assert_eq!(recv(&mut fast).await, payload);
    }

    assert_eq!(slow.try_recv().unwrap(), "evt0");
    assert_eq!(slow.try_recv().unwrap(), "evt1");
    assert!(slow.try_recv().is_none());
    assert_eq!(slow.dropped_count(), 3);
    assert_eq!(fast.dropped_count(), 0);

    let _ = h.stop().await;
}

#[tokio::test]
async fn overflow_drops_and_logs() {
    let (logs, _guard) = capture_logs();
    let h = Harness::with_defaults();
    let mut sub = h.notifier.listen("orders");
    established(&sub).await;

    for i in 0..4 {
        h.listener.notify("orders", format!("evt{i}"));
    }
    h.sync().await;

    assert_eq!(sub.try_recv().unwrap(), "evt0");
    assert_eq!(sub.try_recv().unwrap(), "evt1");
    assert!(sub.try_recv().is_none());
    assert_eq!(sub.dropped_count(), 2);

    assert_eq!(logs.count_matching("dropped notification due to full buffer"), 2);
    assert!(logs.has_event(Level::WARN, "dropped notification due to full buffer"));
    let events = logs.events();
    let warned = events
        .iter()
        .find(|e| e.message.contains("full buffer"))
        .unwrap();
    assert_eq!(warned.field("channel"), Some("orders"));
    assert_eq!(warned.field("payload_len"), Some("4"));
    assert_eq!(warned.field("payload"), None);

    let detail = events
        .iter()
        .find(|e| e.message == "dropped payload")
        .unwrap();
    assert_eq!(detail.level, Level::DEBUG);
    assert_eq!(detail.field("payload"), Some("evt2"));

    let _ = h.stop().await;
}

#[tokio::test]
async fn double_unlisten_matches_single() {
    let h = Harness::with_defaults();
    let mut a = h.notifier.listen("orders");
    let mut b = h.notifier.listen("orders");
    established(&a).await;

    a.unlisten();
    a.unlisten();
    assert_eq!(h.notifier.subscriber_count("orders"), 1);

    h.listener.notify("orders", "still here");
    assert_eq!(recv(&mut b).await, "still here");
    assert!(a.recv().await.is_none());
    h.sync().await;
    assert_eq!(h.listener.unlisten_count("orders"), 0);

    let _ = h.stop().await;
}

#[tokio::test]
async fn unlisten_discards_queued_events() {
    let h = Harness::with_defaults();
    let mut sub = h.notifier.listen("orders");
    established(&sub).await;

    h.listener.notify("orders", "queued");
    h.sync().await;
    sub.unlisten();
    assert!(sub.try_recv().is_none());

    let _ = h.stop().await;
}

#[tokio::test]
async fn resubscribe_issues_fresh_listen() {
    let h = Harness::with_defaults();
    let mut sub = h.notifier.listen("orders");
    established(&sub).await;
    sub.unlisten();
    eventually(|| h.listener.unlisten_count("orders") == 1).await;

    let mut again = h.notifier.listen("orders");
    assert!(!again.is_established());
    established(&again).await;
    assert_eq!(h.listener.listen_count("orders"), 2);

    h.listener.notify("orders", "fresh");
    assert_eq!(recv(&mut again).await, "fresh");

    let _ = h.stop().await;
}

#[tokio::test]
async fn commands_follow_request_order() {
    let h = Harness::with_defaults();
    let mut a = h.notifier.listen("a");
    let b = h.notifier.listen("b");
    a.unlisten();
    established(&b).await;
    eventually(|| h.listener.unlisten_count("a") == 1).await;

    assert_eq!(
        h.listener.commands(),
        vec![
            Command::Listen("a".into()),
            Command::Listen("b".into()),
            Command::Unlisten("a".into()),
        ]
    );

    let _ = h.stop().await;
}

#[tokio::test]
async fn events_for_unknown_channels_are_ignored() {
    let h = Harness::with_defaults();
    let mut sub = h.notifier.listen("orders");
    established(&sub).await;

    h.listener.notify("payments", "ignored");
    h.listener.notify("orders", "kept");
    assert_eq!(recv(&mut sub).await, "kept");

    let _ = h.stop().await;
}

#[tokio::test]
async fn subscribe_interrupts_long_heartbeat() {
    let h = Harness::start(NotifierConfig {
        heartbeat: Duration::from_secs(3600),
        ..NotifierConfig::default()
    });
    let first = h.notifier.listen("first");
    established(&first).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = h.notifier.listen("second");
    timeout(Duration::from_secs(1), second.established())
        .await
        .expect("listen waited for the heartbeat")
        .unwrap();

    let _ = h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_expiry_keeps_running() {
    let h = Harness::start(NotifierConfig {
        heartbeat: Duration::from_secs(30),
        ..NotifierConfig::default()
    });
    let mut sub = h.notifier.listen("orders");
    sub.established().await.unwrap();

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert!(!h.handle.is_finished());

    h.listener.notify("orders", "late");
    assert_eq!(sub.recv().await.unwrap(), "late");

    let _ = h.stop().await;
}

#[tokio::test]
async fn transport_failure_ends_run() {
    let h = Harness::with_defaults();
    let sub = h.notifier.listen("orders");
    established(&sub).await;

    h.listener.fail("connection reset");
    let err = timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
    assert_matches!(
        err,
        NotifierError::Listener(ListenerError::ConnectionLost(msg)) if msg == "connection reset"
    );
}

#[tokio::test]
async fn failed_listen_ends_run_and_closes_established() {
    let listener = Arc::new(MemoryListener::connected());
    listener.fail_next_command("permission denied");
    let notifier = Notifier::new(listener.clone(), NotifierConfig::default());
    let sub = notifier.listen("orders");

    let err = notifier.run(CancellationToken::new()).await;
    assert_matches!(
        err,
        NotifierError::Command { kind: ChangeKind::Listen, ref channel, .. } if channel == "orders"
    );
    assert_matches!(sub.established().await, Err(NotifierError::Closed));
    assert_eq!(listener.listen_count("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_command_times_out() {
    let listener = Arc::new(MemoryListener::connected());
    listener.set_command_delay(Duration::from_secs(20));
    let notifier = Notifier::new(listener.clone(), NotifierConfig::default());
    let sub = notifier.listen("orders");

    let err = notifier.run(CancellationToken::new()).await;
    assert_matches!(
        err,
        NotifierError::CommandTimeout { kind: ChangeKind::Listen, timeout: after, .. }
            if after == Duration::from_secs(10)
    );
    assert_matches!(sub.established().await, Err(NotifierError::Closed));
}

#[tokio::test]
async fn cancelled_lifetime_returns_stopped() {
    let listener = Arc::new(MemoryListener::connected());
    let notifier = Notifier::new(listener, NotifierConfig::default());
    let lifetime = CancellationToken::new();
    lifetime.cancel();
    assert_matches!(notifier.run(lifetime).await, NotifierError::Stopped);
}

#[tokio::test]
async fn stop_abandons_pending_registration() {
    let listener = Arc::new(MemoryListener::connected());
    listener.set_command_delay(Duration::from_secs(3600));
    let notifier = Notifier::new(listener.clone(), NotifierConfig::default());
    let lifetime = CancellationToken::new();
    let runner = notifier.clone();
    let token = lifetime.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });

    let sub = notifier.listen("orders");
    tokio::time::sleep(Duration::from_millis(20)).await;
    lifetime.cancel();

    assert_matches!(handle.await.unwrap(), NotifierError::Stopped);
    assert_matches!(sub.established().await, Err(NotifierError::Closed));
}

#[tokio::test]
async fn run_can_restart_after_stop() {
    let h = Harness::with_defaults();
    let sub = h.notifier.listen("orders");
    established(&sub).await;
    let notifier = h.notifier.clone();
    let listener = h.listener.clone();
    assert_matches!(h.stop().await, NotifierError::Stopped);

    let lifetime = CancellationToken::new();
    let runner = notifier.clone();
    let token = lifetime.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });
    let other = notifier.listen("payments");
    established(&other).await;
    assert_eq!(listener.listen_count("payments"), 1);

    lifetime.cancel();
    assert_matches!(handle.await.unwrap(), NotifierError::Stopped);
}

#[tokio::test]
async fn restart_issues_listen_abandoned_by_stop() {
    let listener = Arc::new(MemoryListener::connected());
    listener.set_command_delay(Duration::from_secs(3600));
    let notifier = Notifier::new(listener.clone(), NotifierConfig::default());

    let lifetime = CancellationToken::new();
    let runner = notifier.clone();
    let token = lifetime.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });
    let mut first = notifier.listen("orders");
    tokio::time::sleep(Duration::from_millis(20)).await;
    lifetime.cancel();
    assert_matches!(handle.await.unwrap(), NotifierError::Stopped);
    assert_matches!(first.established().await, Err(NotifierError::Closed));
    assert_eq!(listener.listen_count("orders"), 0);

    listener.clear_command_delay();
    let second = notifier.listen("orders");
    let lifetime = CancellationToken::new();
    let runner = notifier.clone();
    let token = lifetime.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });

    established(&second).await;
    assert_eq!(listener.listen_count("orders"), 1);
    assert_eq!(notifier.subscriber_count("orders"), 2);

    listener.notify("orders", "evt1");
    assert_eq!(recv(&mut first).await, "evt1");

    lifetime.cancel();
    assert_matches!(handle.await.unwrap(), NotifierError::Stopped);
}

#[tokio::test]
async fn restart_issues_unlisten_abandoned_by_stop() {
    let listener = Arc::new(MemoryListener::connected());
    let notifier = Notifier::new(listener.clone(), NotifierConfig::default());

    let lifetime = CancellationToken::new();
    let runner = notifier.clone();
    let token = lifetime.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });
    let mut sub = notifier.listen("orders");
    established(&sub).await;

    listener.set_command_delay(Duration::from_secs(3600));
    sub.unlisten();
    tokio::time::sleep(Duration::from_millis(20)).await;
    lifetime.cancel();
    assert_matches!(handle.await.unwrap(), NotifierError::Stopped);
    assert_eq!(listener.unlisten_count("orders"), 0);
    assert_eq!(notifier.channel_count(), 0);

    listener.clear_command_delay();
    let lifetime = CancellationToken::new();
    let runner = notifier.clone();
    let token = lifetime.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });

    eventually(|| listener.unlisten_count("orders") == 1).await;
    assert_eq!(listener.listen_count("orders"), 1);

    lifetime.cancel();
    assert_matches!(handle.await.unwrap(), NotifierError::Stopped);
}

#[tokio::test]
async fn duplicate_connect_fails_fast() {
    let listener = MemoryListener::connected();
    assert_matches!(listener.connect().await, Err(ListenerError::AlreadyConnected));
}
