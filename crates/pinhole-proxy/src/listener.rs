//! Observer fanout.
//!
//! Observers implement [`EventListener`] and are registered on an
//! [`EventFanout`], which is itself an `EventListener` that forwards every
//! event to each registration in order. A failing or panicking observer is
//! logged and skipped; it never affects the other observers or the traffic.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ObserverError, ProxyError};
use crate::message::{Direction, HttpRequest, HttpResponse, Upstream, WebSocketFrame};
use crate::pipeline::ConnectionInfo;

/// Receives traffic events. Every method defaults to doing nothing.
///
/// Callbacks run inline on the connection task, so they should return
/// quickly. Messages are shared references and cannot be mutated here;
/// use a [`Rewriter`](crate::rewrite::Rewriter) to change traffic.
pub trait EventListener: Send + Sync {
    /// A request is about to be forwarded (or answered locally).
    fn on_request(
        &self,
        _conn: &ConnectionInfo,
        _upstream: &Upstream,
        _request: &HttpRequest,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// A response is about to be written back to the client.
    fn on_response(
        &self,
        _conn: &ConnectionInfo,
        _upstream: &Upstream,
        _request: &HttpRequest,
        _response: &HttpResponse,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// A WebSocket frame was relayed. `upgrade` is the handshake request.
    fn on_message(
        &self,
        _conn: &ConnectionInfo,
        _upgrade: &HttpRequest,
        _direction: Direction,
        _frame: &WebSocketFrame,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// A connection failed to decode or reach its upstream.
    fn on_error(&self, _conn: &ConnectionInfo, _error: &ProxyError) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Broadcasts events to registered observers in registration order.
#[derive(Default)]
pub struct EventFanout {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    failures: AtomicUsize,
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFanout")
            .field("listeners", &self.len())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl EventFanout {
    /// Creates an empty fanout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Registering the same observer twice delivers
    /// each event to it twice.
    pub fn add(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Number of observer calls that returned an error or panicked.
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    fn dispatch<F>(&self, event: &'static str, call: F)
    where
        F: Fn(&dyn EventListener) -> Result<(), ObserverError>,
    {
        let snapshot = self.listeners.read().clone();
        for (index, listener) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(observer = index, event, error = %e, "Observer failed");
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(observer = index, event, "Observer panicked");
                }
            }
        }
    }
}

impl EventListener for EventFanout {
    fn on_request(
        &self,
        conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
    ) -> Result<(), ObserverError> {
        self.dispatch("request", |l| l.on_request(conn, upstream, request));
        Ok(())
    }

    fn on_response(
        &self,
        conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<(), ObserverError> {
        self.dispatch("response", |l| l.on_response(conn, upstream, request, response));
        Ok(())
    }

    fn on_message(
        &self,
        conn: &ConnectionInfo,
        upgrade: &HttpRequest,
        direction: Direction,
        frame: &WebSocketFrame,
    ) -> Result<(), ObserverError> {
        self.dispatch("message", |l| l.on_message(conn, upgrade, direction, frame));
        Ok(())
    }

    fn on_error(&self, conn: &ConnectionInfo, error: &ProxyError) -> Result<(), ObserverError> {
        self.dispatch("error", |l| l.on_error(conn, error));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Scheme;
    use crate::testing::{Event, RecordingListener};
    use parking_lot::Mutex;

    struct Tagged {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EventListener for Tagged {
        fn on_request(
            &self,
            _conn: &ConnectionInfo,
            _upstream: &Upstream,
            _request: &HttpRequest,
        ) -> Result<(), ObserverError> {
            self.log.lock().push(self.tag);
            Ok(())
        }
    }

    struct Failing;

    impl EventListener for Failing {
        fn on_request(
            &self,
            _conn: &ConnectionInfo,
            _upstream: &Upstream,
            _request: &HttpRequest,
        ) -> Result<(), ObserverError> {
            Err(ObserverError::new("disk full"))
        }
    }

    struct Panicking;

    impl EventListener for Panicking {
        fn on_request(
            &self,
            _conn: &ConnectionInfo,
            _upstream: &Upstream,
            _request: &HttpRequest,
        ) -> Result<(), ObserverError> {
            panic!("observer bug");
        }
    }

    fn fire_request(fanout: &EventFanout) {
        let conn = ConnectionInfo::new("127.0.0.1:50000".parse().unwrap());
        let upstream = Upstream::new(Scheme::Http, "example.test", 80);
        let request = HttpRequest::new("GET", "/").with_header("Host", "example.test");
        fanout.on_request(&conn, &upstream, &request).unwrap();
    }

    #[test]
    fn delivers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fanout = EventFanout::new();
        for tag in ["o1", "o2", "o3"] {
            fanout.add(Arc::new(Tagged {
                tag,
                log: log.clone(),
            }));
        }

        fire_request(&fanout);
        assert_eq!(*log.lock(), vec!["o1", "o2", "o3"]);
    }

    #[test]
    fn failing_observer_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fanout = EventFanout::new();
        fanout.add(Arc::new(Tagged {
            tag: "o1",
            log: log.clone(),
        }));
        fanout.add(Arc::new(Failing));
        fanout.add(Arc::new(Tagged {
            tag: "o3",
            log: log.clone(),
        }));

        fire_request(&fanout);
        assert_eq!(*log.lock(), vec!["o1", "o3"]);
        assert_eq!(fanout.failure_count(), 1);
    }

    #[test]
    fn panicking_observer_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fanout = EventFanout::new();
        fanout.add(Arc::new(Tagged {
            tag: "o1",
            log: log.clone(),
        }));
        fanout.add(Arc::new(Panicking));
        fanout.add(Arc::new(Tagged {
            tag: "o3",
            log: log.clone(),
        }));

        fire_request(&fanout);
        fire_request(&fanout);
        assert_eq!(*log.lock(), vec!["o1", "o3", "o1", "o3"]);
        assert_eq!(fanout.failure_count(), 2);
    }

    #[test]
    fn duplicate_registration_is_delivered_twice() {
        let recorder = Arc::new(RecordingListener::default());
        let fanout = EventFanout::new();
        fanout.add(recorder.clone());
        fanout.add(recorder.clone());

        fire_request(&fanout);
        assert_eq!(fanout.len(), 2);
        assert_eq!(recorder.requests().len(), 2);
    }

    #[test]
    fn empty_fanout_is_a_no_op() {
        let fanout = EventFanout::new();
        assert!(fanout.is_empty());
        fire_request(&fanout);
        assert_eq!(fanout.failure_count(), 0);
    }

    #[test]
    fn forwards_every_event_kind() {
        let recorder = Arc::new(RecordingListener::default());
        let fanout = EventFanout::new();
        fanout.add(recorder.clone());

        let conn = ConnectionInfo::new("127.0.0.1:50001".parse().unwrap());
        let upstream = Upstream::new(Scheme::Https, "example.test", 443);
        let request = HttpRequest::new("GET", "/chat");
        let response = HttpResponse::new(101);
        let frame = WebSocketFrame::text("hi");

        fanout.on_request(&conn, &upstream, &request).unwrap();
        fanout
            .on_response(&conn, &upstream, &request, &response)
            .unwrap();
        fanout
            .on_message(&conn, &request, Direction::ServerToClient, &frame)
            .unwrap();
        fanout
            .on_error(&conn, &ProxyError::Tls("handshake".into()))
            .unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], Event::Request { target, .. } if target == "/chat"));
        assert!(matches!(&events[1], Event::Response { status: 101, .. }));
        assert!(matches!(
            &events[2],
            Event::Message { direction: Direction::ServerToClient, payload } if payload == "hi"
        ));
        assert!(matches!(&events[3], Event::Error(msg) if msg.contains("handshake")));
    }
}
