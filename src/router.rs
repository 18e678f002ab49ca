/// Typed-dispatch table from event name to prioritized handlers.
///
/// The bridge registers observers here (recording, transcripts, stats) and
/// dispatches every normalized event through the table. Handlers run in
/// priority order (lower first); a failing handler is isolated unless it was
/// registered terminal, in which case the remaining handlers are skipped.
/// Middleware runs before dispatch and may transform or drop events.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// A routed event: name + JSON payload + arrival timestamp.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Event {
            name: name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

pub type HandlerFn = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;
pub type MiddlewareFn = Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>;

/// Token returned by `register`; needed to unregister the same handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("no handlers registered for event type '{0}'")]
    UnknownEventType(String),
}

struct Route {
    id: HandlerId,
    priority: i32,
    terminal: bool,
    handler: HandlerFn,
}

pub struct EventRouter {
    routes: HashMap<String, Vec<Route>>,
    middleware: Vec<MiddlewareFn>,
    strict: bool,
    next_id: u64,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    /// Permissive router: unmatched event types are logged and ignored.
    pub fn new() -> Self {
        EventRouter {
            routes: HashMap::new(),
            middleware: Vec::new(),
            strict: false,
            next_id: 0,
        }
    }

    /// Strict router: unmatched event types are an error.
    pub fn strict() -> Self {
        EventRouter {
            strict: true,
            ..Self::new()
        }
    }

    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        priority: i32,
        handler: HandlerFn,
    ) -> HandlerId {
        self.insert(event_type.into(), priority, false, handler)
    }

    /// A terminal handler's failure skips all lower-priority handlers.
    pub fn register_terminal(
        &mut self,
        event_type: impl Into<String>,
        priority: i32,
        handler: HandlerFn,
    ) -> HandlerId {
        self.insert(event_type.into(), priority, true, handler)
    }

    fn insert(
        &mut self,
        event_type: String,
        priority: i32,
        terminal: bool,
        handler: HandlerFn,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let routes = self.routes.entry(event_type).or_default();
        routes.push(Route {
            id,
            priority,
            terminal,
            handler,
        });
        routes.sort_by_key(|r| r.priority);
        id
    }

    /// Remove a previously registered handler. Returns whether it existed.
    pub fn unregister(&mut self, event_type: &str, id: HandlerId) -> bool {
        match self.routes.get_mut(event_type) {
            Some(routes) => {
                let before = routes.len();
                routes.retain(|r| r.id != id);
                before != routes.len()
            }
            None => false,
        }
    }

    /// Middleware runs in registration order before any handler; returning
    /// `None` drops the event.
    pub fn add_middleware(&mut self, mw: MiddlewareFn) {
        self.middleware.push(mw);
    }

    /// Run the event through middleware, then invoke matching handlers in
    /// priority order.
    pub fn dispatch(&self, event: Event) -> Result<(), RouterError> {
        let mut event = event;
        for mw in &self.middleware {
            match mw(event) {
                Some(e) => event = e,
                None => {
                    debug!("event dropped by middleware");
                    return Ok(());
                }
            }
        }

        let routes = match self.routes.get(&event.name) {
            Some(r) if !r.is_empty() => r,
            _ => {
                if self.strict {
                    return Err(RouterError::UnknownEventType(event.name));
                }
                debug!(event_type = %event.name, "no handlers for event");
                return Ok(());
            }
        };

        for route in routes {
            if let Err(e) = (route.handler)(&event) {
                warn!(event_type = %event.name, error = %e, "event handler failed");
                if route.terminal {
                    break;
                }
            }
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> HandlerFn {
        let tag = tag.to_string();
        Arc::new(move |_ev| {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        })
    }

    #[test]
    fn test_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        router.register("x", 10, recording_handler(log.clone(), "second"));
        router.register("x", 1, recording_handler(log.clone(), "first"));

        router.dispatch(Event::new("x", json!({}))).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failure_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        router.register(
            "x",
            0,
            Arc::new(|_| anyhow::bail!("handler exploded")),
        );
        router.register("x", 1, recording_handler(log.clone(), "survivor"));

        router.dispatch(Event::new("x", json!({}))).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_terminal_failure_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        router.register_terminal(
            "x",
            0,
            Arc::new(|_| anyhow::bail!("terminal failure")),
        );
        router.register("x", 1, recording_handler(log.clone(), "skipped"));

        router.dispatch(Event::new("x", json!({}))).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_middleware_transforms_and_drops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        let log_for_handler = log.clone();
        router.register(
            "x",
            0,
            Arc::new(move |ev| {
                log_for_handler
                    .lock()
                    .unwrap()
                    .push(ev.payload["tagged"].as_bool().unwrap_or(false).to_string());
                Ok(())
            }),
        );
        router.add_middleware(Arc::new(|mut ev| {
            ev.payload["tagged"] = json!(true);
            Some(ev)
        }));
        router.add_middleware(Arc::new(|ev| {
            if ev.payload["drop"].as_bool().unwrap_or(false) {
                None
            } else {
                Some(ev)
            }
        }));

        router.dispatch(Event::new("x", json!({}))).unwrap();
        router
            .dispatch(Event::new("x", json!({"drop": true})))
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["true"]);
    }

    #[test]
    fn test_unregister() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        let id = router.register("x", 0, recording_handler(log.clone(), "gone"));
        assert!(router.unregister("x", id));
        assert!(!router.unregister("x", id));

        router.dispatch(Event::new("x", json!({}))).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_strict_vs_permissive() {
        let permissive = EventRouter::new();
        assert!(permissive.dispatch(Event::new("nope", json!({}))).is_ok());

        let strict = EventRouter::strict();
        assert_eq!(
            strict.dispatch(Event::new("nope", json!({}))),
            Err(RouterError::UnknownEventType("nope".into()))
        );
    }
}
