//! Rpc messaging between host and device objects.
//!
//! A call is a three step exchange:
//! 1. `MESSAGING_QUERY` - check that destination endpoint exists on the remote side
//! 2. `MESSAGING_SEND` - deliver serialized method name and arguments
//! 3. `MESSAGING_REPLY` - remote side returns result or fault, correlated by message address
//!
//! Inbound calls are served on a worker pool, so a slow method never stalls the dispatch thread.

mod endpoint;
mod message;

pub use endpoint::{EndPoint, Fault, ServerObject};
pub use message::MessageAddress;

use crate::engine::{Engine, EngineListener};
use crate::error::Error;
use crate::wire::{Command, Packet, PacketFlags};
use crate::weak_error;
use bytes::Bytes;
use endpoint::{OutboundRequest, Outcome, Registration};
use indexmap::IndexMap;
use log::{debug, info, warn};
use message::{CallMessage, ReplyMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

pub struct Rpc {
    engine: Engine,
    registrations: RwLock<IndexMap<EndPoint, Arc<Registration>>>,
    seq: AtomicU32,
    pool: rayon::ThreadPool,
    me: Weak<Rpc>,
}

impl Rpc {
    /// Create rpc subsystem and subscribe it to engine notifications.
    pub fn new(engine: &Engine) -> Result<Arc<Self>, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(engine.config().rpc.workers.max(1))
            .thread_name(|i| format!("mfdbg-rpc-{i}"))
            .build()
            .map_err(|e| Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let rpc = Arc::new_cyclic(|me| Rpc {
            engine: engine.clone(),
            registrations: RwLock::default(),
            seq: AtomicU32::new(1),
            pool,
            me: me.clone(),
        });
        engine.add_listener(Arc::downgrade(&rpc) as Weak<dyn EngineListener>);
        Ok(rpc)
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn registration(&self, endpoint: EndPoint) -> Option<Arc<Registration>> {
        self.registrations.read().unwrap().get(&endpoint).cloned()
    }

    pub fn is_registered(&self, endpoint: EndPoint) -> bool {
        self.registrations.read().unwrap().contains_key(&endpoint)
    }

    pub fn endpoints(&self) -> Vec<EndPoint> {
        self.registrations.read().unwrap().keys().copied().collect()
    }

    /// Register a caller endpoint (`server` is `None`) or a served object.
    /// If a device is connected it must accept the endpoint.
    pub fn register(&self, endpoint: EndPoint, server: Option<ServerObject>) -> Result<(), Error> {
        if self.is_registered(endpoint) {
            return Err(Error::EndpointAlreadyRegistered(endpoint.kind, endpoint.id));
        }

        if self.engine.is_connected() {
            let address = MessageAddress {
                seq: self.next_seq(),
                from: endpoint,
                to: endpoint,
            };
            if !self.query(address)? {
                return Err(Error::EndpointRejected(endpoint.kind, endpoint.id));
            }
        }

        let mut registrations = self.registrations.write().unwrap();
        if registrations.contains_key(&endpoint) {
            return Err(Error::EndpointAlreadyRegistered(endpoint.kind, endpoint.id));
        }
        registrations.insert(endpoint, Arc::new(Registration::new(endpoint, server)));
        info!(target: "rpc", "endpoint {endpoint} registered");
        Ok(())
    }

    /// Deregister endpoint, outstanding calls made from it fail immediately.
    pub fn deregister(&self, endpoint: EndPoint) -> bool {
        let Some(registration) = self.registrations.write().unwrap().shift_remove(&endpoint) else {
            return false;
        };
        let cancelled = registration.cancel_all();
        info!(target: "rpc", "endpoint {endpoint} deregistered, {cancelled} calls cancelled");
        true
    }

    /// Ask remote side about `address.to`. Announcement addresses ask to accept the endpoint.
    fn query(&self, address: MessageAddress) -> Result<bool, Error> {
        let payload = address.write(self.engine.writer()).finish();
        let Some(mut reader) =
            self.engine
                .request_reader(Command::MESSAGING_QUERY, payload, "messaging query")?
        else {
            return Ok(false);
        };
        Ok(reader.u32()? != 0)
    }

    /// Invoke `method` of remote endpoint `to` on behalf of local endpoint `from`.
    pub fn call<A, R>(
        &self,
        from: EndPoint,
        to: EndPoint,
        method: &str,
        args: A,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let registration = self
            .registration(from)
            .ok_or(Error::EndpointNotFound(from.kind, from.id))?;

        let address = MessageAddress {
            seq: self.next_seq(),
            from,
            to,
        };
        if !self.query(address)? {
            return Err(Error::EndpointNotFound(to.kind, to.id));
        }

        let body = serde_json::to_vec(&CallMessage {
            method: method.to_string(),
            args: serde_json::to_value(args)?,
        })?;
        let request = Arc::new(OutboundRequest::new(address));
        registration
            .outbound
            .lock()
            .unwrap()
            .insert(address.seq, request.clone());

        let payload = address.write(self.engine.writer()).blob(&body).finish();
        if let Err(e) = self
            .engine
            .post(Command::MESSAGING_SEND, PacketFlags::NON_CRITICAL, payload)
        {
            registration.outbound.lock().unwrap().remove(&address.seq);
            return Err(e);
        }
        debug!(target: "rpc", "call {address} `{method}`");

        let outcome = request.wait(timeout);
        registration.outbound.lock().unwrap().remove(&address.seq);
        match outcome {
            None => Err(Error::RpcTimeout),
            Some(Outcome::Cancelled) => Err(Error::EndpointNotFound(from.kind, from.id)),
            Some(Outcome::Replied(body)) => match serde_json::from_slice(&body)? {
                ReplyMessage::Ok(value) => Ok(serde_json::from_value(value)?),
                ReplyMessage::Fault { type_name, message } => {
                    Err(Error::RemoteFault { type_name, message })
                }
            },
        }
    }

    /// Same as [`Rpc::call`] with configured timeout.
    pub fn call_default<A, R>(
        &self,
        from: EndPoint,
        to: EndPoint,
        method: &str,
        args: A,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let timeout = Duration::from_millis(self.engine.config().rpc.timeout_ms);
        self.call(from, to, method, args, timeout)
    }

    fn on_query(&self, engine: &Engine, packet: &Packet, address: MessageAddress) -> Result<(), Error> {
        let registered = self.is_registered(address.to);
        // announcement of a remote endpoint is accepted if it does not clash with a local one
        let answer = if address.is_announcement() {
            !registered
        } else {
            registered
        };
        debug!(target: "rpc", "query {address}: {answer}");
        engine.reply(
            packet,
            PacketFlags::empty(),
            engine.writer().u32(answer as u32).finish(),
        )
    }

    fn on_send(&self, address: MessageAddress, body: Bytes) {
        let Some(registration) = self.registration(address.to) else {
            warn!(target: "rpc", "call {address} to unknown endpoint");
            self.send_reply(
                address,
                ReplyMessage::Fault {
                    type_name: "EndpointNotFound".to_string(),
                    message: format!("endpoint {} not registered", address.to),
                },
            );
            return;
        };
        let Some(server) = registration.server.clone() else {
            warn!(target: "rpc", "call {address} to non-served endpoint");
            self.send_reply(
                address,
                ReplyMessage::Fault {
                    type_name: "EndpointNotServed".to_string(),
                    message: format!("endpoint {} has no server", address.to),
                },
            );
            return;
        };

        registration
            .inbound
            .lock()
            .unwrap()
            .insert(address.seq, address);
        let me = self.me.clone();
        self.pool.spawn(move || {
            let reply = match serde_json::from_slice::<CallMessage>(&body) {
                Ok(call) => match server.invoke(&call.method, &call.args) {
                    Ok(value) => ReplyMessage::Ok(value),
                    Err(fault) => ReplyMessage::Fault {
                        type_name: fault.type_name,
                        message: fault.message,
                    },
                },
                Err(e) => ReplyMessage::Fault {
                    type_name: "SerializationError".to_string(),
                    message: e.to_string(),
                },
            };

            let Some(rpc) = me.upgrade() else { return };
            // endpoint deregistered while call was served
            if registration.inbound.lock().unwrap().remove(&address.seq).is_none() {
                return;
            }
            rpc.send_reply(address, reply);
        });
    }

    fn send_reply(&self, address: MessageAddress, reply: ReplyMessage) {
        let body = match serde_json::to_vec(&reply) {
            Ok(body) => body,
            Err(e) => {
                warn!(target: "rpc", "reply {address} serialization: {e}");
                return;
            }
        };
        let payload = address.write(self.engine.writer()).blob(&body).finish();
        weak_error!(
            self.engine
                .post(Command::MESSAGING_REPLY, PacketFlags::NON_CRITICAL, payload),
            "rpc reply:"
        );
    }

    fn on_reply(&self, address: MessageAddress, body: Bytes) {
        let request = self
            .registration(address.from)
            .and_then(|reg| reg.outbound.lock().unwrap().remove(&address.seq));
        match request {
            Some(request) if request.address == address => {
                request.complete(Outcome::Replied(body));
            }
            Some(request) => {
                warn!(target: "rpc", "reply {address} does not match call {}", request.address);
                request.complete(Outcome::Cancelled);
            }
            None => debug!(target: "rpc", "reply {address} without a call"),
        }
    }
}

impl EngineListener for Rpc {
    fn on_rpc(&self, engine: &Engine, packet: &Packet) -> anyhow::Result<()> {
        let mut reader = engine.reader(packet.payload.clone(), "message");
        let address = MessageAddress::read(&mut reader)?;
        match packet.cmd() {
            Command::MESSAGING_QUERY => self.on_query(engine, packet, address)?,
            Command::MESSAGING_SEND => {
                engine.acknowledge(packet);
                self.on_send(address, reader.blob()?);
            }
            Command::MESSAGING_REPLY => {
                engine.acknowledge(packet);
                self.on_reply(address, reader.blob()?);
            }
            cmd => debug!(target: "rpc", "unexpected messaging command {cmd}"),
        }
        Ok(())
    }

    fn on_shutdown(&self, _: &Engine) {
        for endpoint in self.endpoints() {
            self.deregister(endpoint);
        }
    }
}
