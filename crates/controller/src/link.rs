//! MQTT session lifecycle.
//!
//! A background task owns the rumqttc event loop.  It reconnects forever
//! with a fixed delay between attempts, re-subscribes to the trigger topic on
//! every ConnAck, publishes the session state on a `watch` channel, and
//! forwards connectivity changes and inbound messages to the control loop as
//! [`LinkEvent`]s.

use std::fmt;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::config::{MqttSection, Topics};

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 20;

/// Capacity of the event channel towards the control loop.
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Session established; `failed_attempts` counts the failures since the
    /// previous successful connect.
    Connected { failed_attempts: u32 },
    /// Session lost or connect attempt failed; the next attempt follows
    /// after `retry_in`.
    Disconnected { reason: String, retry_in: Duration },
    Message { topic: String, payload: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Session bookkeeping
// ---------------------------------------------------------------------------

/// Connectivity state tracking, separated from the I/O so it can be driven
/// by hand in tests.
#[derive(Debug)]
pub(crate) struct Session {
    state: ConnectivityState,
    failed_attempts: u32,
    retry_delay: Duration,
}

impl Session {
    pub(crate) fn new(retry_delay: Duration) -> Self {
        Self {
            state: ConnectivityState::Connecting,
            failed_attempts: 0,
            retry_delay,
        }
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Fold one `EventLoop::poll` result into the session.
    pub(crate) fn on_poll(&mut self, polled: Result<Event, ConnectionError>) -> Option<LinkEvent> {
        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                self.state = ConnectivityState::Connected;
                let failed_attempts = std::mem::take(&mut self.failed_attempts);
                Some(LinkEvent::Connected { failed_attempts })
            }
            Ok(Event::Incoming(Packet::Publish(p))) => Some(LinkEvent::Message {
                topic: p.topic,
                payload: p.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                self.lose("broker sent disconnect".to_string())
            }
            Ok(_) => None,
            Err(e) => self.lose(e.to_string()),
        }
    }

    /// The retry delay has passed; the next poll reconnects.
    pub(crate) fn retrying(&mut self) {
        if self.state == ConnectivityState::Disconnected {
            self.state = ConnectivityState::Connecting;
        }
    }

    fn lose(&mut self, reason: String) -> Option<LinkEvent> {
        self.state = ConnectivityState::Disconnected;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        Some(LinkEvent::Disconnected {
            reason,
            retry_in: self.retry_delay,
        })
    }
}

// ---------------------------------------------------------------------------
// I/O seams
// ---------------------------------------------------------------------------

/// Source of MQTT events; the rumqttc event loop in production.
pub(crate) trait EventSource {
    async fn next_event(&mut self) -> Result<Event, ConnectionError>;
}

impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        self.poll().await
    }
}

/// Subscription requests issued on every connect.
pub(crate) trait Subscriber {
    fn resubscribe(&self, topic: &str) -> anyhow::Result<()>;
}

impl Subscriber for AsyncClient {
    fn resubscribe(&self, topic: &str) -> anyhow::Result<()> {
        // try_subscribe never waits on the request channel.
        self.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handle + task
// ---------------------------------------------------------------------------

/// Cheap handle to the running session.
#[derive(Clone)]
pub struct Link {
    client: AsyncClient,
    state: watch::Receiver<ConnectivityState>,
}

impl Link {
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectivityState::Connected
    }
}

/// Start the session task.  Must be called from within a tokio runtime.
pub fn spawn(mqtt: &MqttSection, topics: &Topics) -> (Link, mpsc::Receiver<LinkEvent>) {
    let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(mqtt.keep_alive());

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (state_tx, state_rx) = watch::channel(ConnectivityState::Connecting);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

    tracing::info!(
        host = %mqtt.host,
        port = mqtt.port,
        client_id = %mqtt.client_id,
        "mqtt session starting"
    );

    tokio::spawn(pump(
        eventloop,
        client.clone(),
        topics.trigger.clone(),
        Session::new(mqtt.reconnect_delay()),
        state_tx,
        event_tx,
    ));

    (
        Link {
            client,
            state: state_rx,
        },
        event_rx,
    )
}

async fn pump<E: EventSource, C: Subscriber>(
    mut source: E,
    client: C,
    trigger: String,
    mut session: Session,
    state_tx: watch::Sender<ConnectivityState>,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        let polled = source.next_event().await;

        if let Some(event) = session.on_poll(polled) {
            match &event {
                LinkEvent::Connected { failed_attempts } => {
                    tracing::info!(failed_attempts, "mqtt connected");
                    // Clean sessions drop subscriptions, so renew on every connect.
                    if let Err(e) = client.resubscribe(&trigger) {
                        tracing::error!(topic = %trigger, "subscribe failed: {e}");
                    }
                }
                LinkEvent::Disconnected { reason, retry_in } => {
                    tracing::warn!(
                        retry_in_secs = retry_in.as_secs(),
                        "mqtt connection failed: {reason}"
                    );
                }
                LinkEvent::Message { .. } => {}
            }

            state_tx.send_replace(session.state());
            if events.send(event).await.is_err() {
                tracing::info!("control loop gone — stopping mqtt session");
                return;
            }
        }

        if session.state() == ConnectivityState::Disconnected {
            sleep(session.retry_delay).await;
            session.retrying();
            state_tx.send_replace(session.state());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::time::{timeout, Instant};

    fn connack() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
    }

    fn io_error() -> Result<Event, ConnectionError> {
        Err(ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }

    #[test]
    fn starts_connecting() {
        let s = Session::new(Duration::from_secs(5));
        assert_eq!(s.state(), ConnectivityState::Connecting);
    }

    #[test]
    fn connack_connects() {
        let mut s = Session::new(Duration::from_secs(5));
        assert_eq!(
            s.on_poll(connack()),
            Some(LinkEvent::Connected { failed_attempts: 0 })
        );
        assert_eq!(s.state(), ConnectivityState::Connected);
    }

    #[test]
    fn error_disconnects_with_fixed_retry_delay() {
        let mut s = Session::new(Duration::from_secs(5));
        let event = s.on_poll(io_error()).unwrap();
        assert!(matches!(
            event,
            LinkEvent::Disconnected { retry_in, .. } if retry_in == Duration::from_secs(5)
        ));
        assert_eq!(s.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn retries_are_unbounded_and_counted() {
        let mut s = Session::new(Duration::from_secs(5));
        for _ in 0..50 {
            s.on_poll(io_error());
            s.retrying();
            assert_eq!(s.state(), ConnectivityState::Connecting);
        }
        assert_eq!(
            s.on_poll(connack()),
            Some(LinkEvent::Connected { failed_attempts: 50 })
        );
        // Counter resets after a successful connect.
        s.on_poll(io_error());
        s.retrying();
        assert_eq!(
            s.on_poll(connack()),
            Some(LinkEvent::Connected { failed_attempts: 1 })
        );
    }

    #[test]
    fn broker_disconnect_drops_session() {
        let mut s = Session::new(Duration::from_secs(5));
        s.on_poll(connack());
        let event = s.on_poll(Ok(Event::Incoming(Packet::Disconnect)));
        assert!(matches!(event, Some(LinkEvent::Disconnected { .. })));
        assert_eq!(s.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn publish_is_forwarded() {
        let mut s = Session::new(Duration::from_secs(5));
        s.on_poll(connack());
        let publish = Publish::new("trigger", QoS::AtLeastOnce, b"ON".to_vec());
        assert_eq!(
            s.on_poll(Ok(Event::Incoming(Packet::Publish(publish)))),
            Some(LinkEvent::Message {
                topic: "trigger".into(),
                payload: b"ON".to_vec(),
            })
        );
        assert_eq!(s.state(), ConnectivityState::Connected);
    }

    #[test]
    fn other_packets_are_silent() {
        let mut s = Session::new(Duration::from_secs(5));
        s.on_poll(connack());
        assert_eq!(s.on_poll(Ok(Event::Incoming(Packet::PingResp))), None);
        assert_eq!(s.on_poll(Ok(Event::Outgoing(rumqttc::Outgoing::PingReq))), None);
        assert_eq!(s.state(), ConnectivityState::Connected);
    }

    #[test]
    fn retrying_only_leaves_disconnected() {
        let mut s = Session::new(Duration::from_secs(5));
        s.on_poll(connack());
        s.retrying();
        assert_eq!(s.state(), ConnectivityState::Connected);
    }

    // -- Session task -------------------------------------------------------

    /// Replays poll results, then stays pending.  Records when each poll
    /// started.
    struct ScriptedSource {
        script: VecDeque<Result<Event, ConnectionError>>,
        polled_at: Arc<Mutex<Vec<Instant>>>,
    }

    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<Event, ConnectionError> {
            self.polled_at.lock().unwrap().push(Instant::now());
            match self.script.pop_front() {
                Some(polled) => polled,
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Clone, Default)]
    struct Subscriptions(Arc<Mutex<Vec<(String, Instant)>>>);

    impl Subscriber for Subscriptions {
        fn resubscribe(&self, topic: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push((topic.to_string(), Instant::now()));
            Ok(())
        }
    }

    struct Run {
        events: Vec<LinkEvent>,
        polled_at: Vec<Instant>,
        subscriptions: Vec<(String, Instant)>,
        final_state: ConnectivityState,
    }

    /// Drive the session task over a script until it goes idle.
    async fn run_script(script: Vec<Result<Event, ConnectionError>>, delay: Duration) -> Run {
        let polled_at = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            script: script.into(),
            polled_at: polled_at.clone(),
        };
        let subs = Subscriptions::default();
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Connecting);
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CAPACITY);

        let task = pump(
            source,
            subs.clone(),
            "trigger".to_string(),
            Session::new(delay),
            state_tx,
            event_tx,
        );
        // The script ends pending, so the task only stops on the timeout.
        assert!(timeout(Duration::from_secs(60), task).await.is_err());

        let mut events = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            events.push(event);
        }
        let polled_at = polled_at.lock().unwrap().clone();
        let subscriptions = subs.0.lock().unwrap().clone();
        let final_state = *state_rx.borrow();
        Run {
            events,
            polled_at,
            subscriptions,
            final_state,
        }
    }

    /// The paused clock only advances in whole timer-wheel milliseconds.
    fn assert_waited(gap: Duration, delay: Duration) {
        assert!(
            gap >= delay && gap < delay + Duration::from_millis(1),
            "waited {gap:?}, expected {delay:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_on_first_connect_and_every_reconnect() {
        let run = run_script(
            vec![connack(), io_error(), connack(), io_error(), connack()],
            Duration::from_secs(5),
        )
        .await;

        let topics: Vec<&str> = run.subscriptions.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(topics, vec!["trigger", "trigger", "trigger"]);
        assert_eq!(run.final_state, ConnectivityState::Connected);

        let connects: Vec<u32> = run
            .events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Connected { failed_attempts } => Some(*failed_attempts),
                _ => None,
            })
            .collect();
        assert_eq!(connects, vec![0, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_exactly_the_reconnect_delay() {
        let delay = Duration::from_secs(5);
        let run = run_script(vec![io_error(), io_error(), connack()], delay).await;

        // Polls: fail, (wait), fail, (wait), connect, then idle.
        assert_eq!(run.polled_at.len(), 4);
        assert_waited(run.polled_at[1] - run.polled_at[0], delay);
        assert_waited(run.polled_at[2] - run.polled_at[1], delay);
        // No wait after a successful connect.
        assert_eq!(run.polled_at[3], run.polled_at[2]);

        assert_eq!(run.subscriptions.len(), 1);
        assert_eq!(run.subscriptions[0].1, run.polled_at[2]);
        assert!(matches!(
            run.events.last(),
            Some(LinkEvent::Connected { failed_attempts: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_disconnect_also_backs_off() {
        let delay = Duration::from_secs(5);
        let run = run_script(
            vec![connack(), Ok(Event::Incoming(Packet::Disconnect)), connack()],
            delay,
        )
        .await;

        assert_waited(run.polled_at[2] - run.polled_at[1], delay);
        assert_eq!(run.subscriptions.len(), 2);
    }

    #[tokio::test]
    async fn link_handle_reports_state() {
        let mqtt = MqttSection {
            host: "127.0.0.1".into(),
            port: 1,
            ..MqttSection::default()
        };
        let (link, _events) = spawn(&mqtt, &Topics::default());
        assert!(!link.is_connected());
        assert_eq!(*link.state().borrow(), ConnectivityState::Connecting);
    }
}
