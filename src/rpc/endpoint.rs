use crate::rpc::message::MessageAddress;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Rpc peer identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndPoint {
    pub kind: u32,
    pub id: u32,
}

impl EndPoint {
    pub const fn new(kind: u32, id: u32) -> Self {
        Self { kind, id }
    }
}

impl Display for EndPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:#x}, {})", self.kind, self.id)
    }
}

/// Error raised by a served method, delivered to the caller as a remote fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub type_name: String,
    pub message: String,
}

impl Fault {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

type Handler =
    Box<dyn Fn(&serde_json::Value) -> Option<Result<serde_json::Value, Fault>> + Send + Sync>;

/// Method table of a served object. A method may be overloaded, the first
/// overload that accepts call arguments wins.
#[derive(Default)]
pub struct ServerObject {
    methods: HashMap<String, Vec<Handler>>,
}

impl ServerObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, Fault> + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |args| {
            let args = serde_json::from_value::<A>(args.clone()).ok()?;
            Some(f(args).and_then(|result| {
                serde_json::to_value(result)
                    .map_err(|e| Fault::new("SerializationError", e.to_string()))
            }))
        });
        self.methods.entry(name.to_string()).or_default().push(handler);
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub(crate) fn invoke(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, Fault> {
        let Some(overloads) = self.methods.get(name) else {
            return Err(Fault::new(
                "MissingMethod",
                format!("method `{name}` not found"),
            ));
        };
        overloads
            .iter()
            .find_map(|handler| handler(args))
            .unwrap_or_else(|| {
                Err(Fault::new(
                    "ArgumentMismatch",
                    format!("no overload of `{name}` accepts arguments {args}"),
                ))
            })
    }
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Replied(bytes::Bytes),
    Cancelled,
}

/// Call awaiting a `MESSAGING_REPLY`.
pub(crate) struct OutboundRequest {
    pub(crate) address: MessageAddress,
    outcome: Mutex<Option<Outcome>>,
    cv: Condvar,
}

impl OutboundRequest {
    pub(crate) fn new(address: MessageAddress) -> Self {
        Self {
            address,
            outcome: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, outcome: Outcome) {
        let mut current = self.outcome.lock().unwrap();
        if current.is_none() {
            *current = Some(outcome);
            self.cv.notify_all();
        }
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let outcome = self.outcome.lock().unwrap();
        let (mut outcome, _) = self
            .cv
            .wait_timeout_while(outcome, timeout, |o| o.is_none())
            .unwrap();
        outcome.take()
    }
}

/// Registered endpoint with its outstanding calls.
pub(crate) struct Registration {
    pub(crate) endpoint: EndPoint,
    pub(crate) server: Option<Arc<ServerObject>>,
    pub(crate) outbound: Mutex<HashMap<u32, Arc<OutboundRequest>>>,
    /// Calls served right now, keyed by sequence of the call.
    pub(crate) inbound: Mutex<HashMap<u32, MessageAddress>>,
}

impl Registration {
    pub(crate) fn new(endpoint: EndPoint, server: Option<ServerObject>) -> Self {
        Self {
            endpoint,
            server: server.map(Arc::new),
            outbound: Mutex::default(),
            inbound: Mutex::default(),
        }
    }

    /// Cancel all outstanding calls, callers return immediately.
    pub(crate) fn cancel_all(&self) -> usize {
        let outbound = std::mem::take(&mut *self.outbound.lock().unwrap());
        for req in outbound.values() {
            req.complete(Outcome::Cancelled);
        }
        self.inbound.lock().unwrap().clear();
        outbound.len()
    }
}
