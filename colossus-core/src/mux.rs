//! Protocol multiplexer: several sub-protocols sharing one message-type space.
//!
//! Protocol *i* with range `[lo, hi]` owns global types `offset + lo ..= offset + hi`,
//! where `offset` is the summed width of every protocol registered before it.
//! Inbound types are translated to local ones by subtracting the offset, replies
//! by adding it back. The table is built once and never changes.

use async_trait::async_trait;

use crate::protocol::{Message, Outcome, Protocol, ProtocolDescriptor, ProtocolError};

const GLOBAL_TYPES: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    offset: u8,
    index: usize,
}

/// Ordered composition of protocols presented as one protocol.
pub struct Multiplexer {
    protocols: Vec<Box<dyn Protocol>>,
    offsets: Vec<u8>,
    routes: Vec<Option<Route>>,
    width: u16,
}

impl Multiplexer {
    /// Build the routing table. Registration order matters: the first protocol that
    /// can initiate is the one `initiate` delegates to.
    pub fn new(protocols: Vec<Box<dyn Protocol>>) -> Result<Self, ProtocolError> {
        let mut routes = vec![None; GLOBAL_TYPES];
        let mut offsets = Vec::with_capacity(protocols.len());
        let mut running: u16 = 0;
        for (index, protocol) in protocols.iter().enumerate() {
            let d = protocol.descriptor();
            if d.low > d.high {
                return Err(ProtocolError::InvalidRange {
                    name: d.name,
                    low: d.low,
                    high: d.high,
                });
            }
            if running > u16::from(u8::MAX) {
                return Err(ProtocolError::RangeCollision {
                    name: d.name,
                    global: running,
                });
            }
            let offset = running as u8;
            for local in d.low..=d.high {
                let global = u16::from(offset) + u16::from(local);
                let slot = routes
                    .get_mut(global as usize)
                    .ok_or(ProtocolError::RangeCollision { name: d.name, global })?;
                if slot.is_some() {
                    return Err(ProtocolError::RangeCollision { name: d.name, global });
                }
                *slot = Some(Route { offset, index });
            }
            tracing::debug!(
                protocol = d.name,
                offset,
                low = d.low,
                high = d.high,
                "registered sub-protocol"
            );
            offsets.push(offset);
            running += d.width();
        }
        Ok(Self {
            protocols,
            offsets,
            routes,
            width: running,
        })
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Descriptor of the sub-protocol at `index`.
    pub fn protocol_descriptor(&self, index: usize) -> Option<ProtocolDescriptor> {
        self.protocols.get(index).map(|p| p.descriptor())
    }

    /// Resolve a global type to `(protocol index, local type)`.
    pub fn route(&self, global: u8) -> Result<(usize, u8), ProtocolError> {
        match self.routes[global as usize] {
            Some(route) => Ok((route.index, global - route.offset)),
            None => Err(ProtocolError::UnknownMessageType(global)),
        }
    }

    /// Translate a local reply of protocol `index` into global space.
    fn to_global(&self, index: usize, message: Message) -> Result<Message, ProtocolError> {
        let protocol = self
            .protocols
            .get(index)
            .ok_or(ProtocolError::UnknownProtocol(index))?;
        let d = protocol.descriptor();
        if !d.contains(message.message_type) {
            return Err(ProtocolError::ResponseOutOfRange {
                name: d.name,
                message_type: message.message_type,
            });
        }
        let global = u16::from(self.offsets[index]) + u16::from(message.message_type);
        Ok(Message::new(global as u8, message.payload))
    }

    /// Map a locally-typed message originated for protocol `index` into global space.
    pub fn outbound(&self, index: usize, message: Message) -> Result<Message, ProtocolError> {
        self.to_global(index, message)
    }

    /// Map a globally-typed message to its owning protocol and local type.
    pub fn inbound(&self, message: Message) -> Result<(usize, Message), ProtocolError> {
        let (index, local) = self.route(message.message_type)?;
        Ok((index, Message::new(local, message.payload)))
    }
}

#[async_trait]
impl Protocol for Multiplexer {
    fn descriptor(&self) -> ProtocolDescriptor {
        let high = self.width.saturating_sub(1).min(u16::from(u8::MAX)) as u8;
        ProtocolDescriptor::new("Multiplexer", 0, high)
    }

    fn can_initiate(&self) -> bool {
        self.protocols.iter().any(|p| p.can_initiate())
    }

    async fn initiate(&mut self) -> Result<Message, ProtocolError> {
        let index = self
            .protocols
            .iter()
            .position(|p| p.can_initiate())
            .ok_or(ProtocolError::CannotInitiate("Multiplexer"))?;
        let message = self.protocols[index].initiate().await?;
        self.to_global(index, message)
    }

    async fn consume(&mut self, message_type: u8, payload: &[u8]) -> Result<Outcome, ProtocolError> {
        let (index, local) = self.route(message_type)?;
        tracing::trace!(global = message_type, local, index, "routing message");
        match self.protocols[index].consume(local, payload).await? {
            Outcome::Reply(reply) => Ok(Outcome::Reply(self.to_global(index, reply)?)),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Log = Arc<Mutex<Vec<(&'static str, u8)>>>;

    /// Records every local type it sees and echoes it back.
    struct Echo {
        name: &'static str,
        low: u8,
        high: u8,
        initiator: bool,
        log: Log,
    }

    impl Echo {
        fn boxed(name: &'static str, low: u8, high: u8, log: &Log) -> Box<dyn Protocol> {
            Box::new(Echo {
                name,
                low,
                high,
                initiator: false,
                log: log.clone(),
            })
        }
    }

    #[async_trait]
    impl Protocol for Echo {
        fn descriptor(&self) -> ProtocolDescriptor {
            ProtocolDescriptor::new(self.name, self.low, self.high)
        }

        fn can_initiate(&self) -> bool {
            self.initiator
        }

        async fn initiate(&mut self) -> Result<Message, ProtocolError> {
            self.log.lock().unwrap().push((self.name, u8::MAX));
            Ok(Message::new(self.high, b"hello".to_vec()))
        }

        async fn consume(&mut self, message_type: u8, payload: &[u8]) -> Result<Outcome, ProtocolError> {
            self.log.lock().unwrap().push((self.name, message_type));
            Ok(Outcome::Reply(Message::new(message_type, payload.to_vec())))
        }
    }

    fn two_protocols(log: &Log) -> Multiplexer {
        Multiplexer::new(vec![Echo::boxed("first", 0, 2, log), Echo::boxed("second", 0, 1, log)])
            .unwrap()
    }

    #[test]
    fn routes_every_boundary() {
        let log = Log::default();
        let mux = two_protocols(&log);
        assert_eq!(mux.route(0).unwrap(), (0, 0));
        assert_eq!(mux.route(1).unwrap(), (0, 1));
        assert_eq!(mux.route(2).unwrap(), (0, 2));
        assert_eq!(mux.route(3).unwrap(), (1, 0));
        assert_eq!(mux.route(4).unwrap(), (1, 1));
        assert!(matches!(mux.route(5), Err(ProtocolError::UnknownMessageType(5))));
        assert!(matches!(mux.route(255), Err(ProtocolError::UnknownMessageType(255))));
    }

    #[tokio::test]
    async fn consume_remaps_both_directions() {
        let log = Log::default();
        let mut mux = two_protocols(&log);
        for global in 0u8..5 {
            let outcome = mux.consume(global, &[global]).await.unwrap();
            assert_eq!(outcome, Outcome::Reply(Message::new(global, vec![global])));
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec![("first", 0), ("first", 1), ("first", 2), ("second", 0), ("second", 1)]
        );
        assert!(matches!(
            mux.consume(5, &[]).await,
            Err(ProtocolError::UnknownMessageType(5))
        ));
    }

    #[test]
    fn nonzero_low_bound_keeps_local_numbering() {
        let log = Log::default();
        let mux = Multiplexer::new(vec![
            Echo::boxed("first", 0, 1, &log),
            Echo::boxed("second", 1, 3, &log),
        ])
        .unwrap();
        // second: offset 2, globals 3..=5
        assert!(matches!(mux.route(2), Err(ProtocolError::UnknownMessageType(2))));
        assert_eq!(mux.route(3).unwrap(), (1, 1));
        assert_eq!(mux.route(5).unwrap(), (1, 3));
        assert!(matches!(mux.route(6), Err(ProtocolError::UnknownMessageType(6))));
    }

    #[test]
    fn inverted_range_fails_construction() {
        let log = Log::default();
        let err = Multiplexer::new(vec![Echo::boxed("bad", 3, 1, &log)]).err().unwrap();
        assert!(matches!(err, ProtocolError::InvalidRange { low: 3, high: 1, .. }));
    }

    #[test]
    fn colliding_ranges_fail_construction() {
        let log = Log::default();
        // first owns 1..=2 with width 2, second at offset 2 would own 2
        let err = Multiplexer::new(vec![
            Echo::boxed("first", 1, 2, &log),
            Echo::boxed("second", 0, 0, &log),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, ProtocolError::RangeCollision { global: 2, .. }));
    }

    #[test]
    fn type_space_overflow_fails_construction() {
        let log = Log::default();
        let err = Multiplexer::new(vec![
            Echo::boxed("first", 0, 200, &log),
            Echo::boxed("second", 0, 100, &log),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, ProtocolError::RangeCollision { .. }));
    }

    #[tokio::test]
    async fn initiate_uses_first_initiator_only() {
        let log = Log::default();
        let mut mux = Multiplexer::new(vec![
            Echo::boxed("passive", 0, 1, &log),
            Box::new(Echo {
                name: "boot",
                low: 0,
                high: 2,
                initiator: true,
                log: log.clone(),
            }),
            Box::new(Echo {
                name: "late",
                low: 0,
                high: 0,
                initiator: true,
                log: log.clone(),
            }),
        ])
        .unwrap();
        let first = mux.initiate().await.unwrap();
        // boot's local type 2 at offset 2
        assert_eq!(first, Message::new(4, b"hello".to_vec()));
        assert_eq!(*log.lock().unwrap(), vec![("boot", u8::MAX)]);
    }

    #[tokio::test]
    async fn initiate_without_initiator_fails() {
        let log = Log::default();
        let mut mux = two_protocols(&log);
        assert!(!mux.can_initiate());
        assert!(matches!(
            mux.initiate().await,
            Err(ProtocolError::CannotInitiate(_))
        ));
    }

    #[test]
    fn outbound_and_inbound_mapping() {
        let log = Log::default();
        let mux = two_protocols(&log);
        let global = mux.outbound(1, Message::new(1, vec![9])).unwrap();
        assert_eq!(global, Message::new(4, vec![9]));
        assert_eq!(mux.inbound(global).unwrap(), (1, Message::new(1, vec![9])));
        assert!(matches!(
            mux.outbound(1, Message::empty(2)),
            Err(ProtocolError::ResponseOutOfRange { .. })
        ));
        assert!(matches!(
            mux.outbound(7, Message::empty(0)),
            Err(ProtocolError::UnknownProtocol(7))
        ));
    }

    #[test]
    fn multiplexer_descriptor_spans_all() {
        let log = Log::default();
        let mux = two_protocols(&log);
        assert_eq!(mux.descriptor(), ProtocolDescriptor::new("Multiplexer", 0, 4));
        assert_eq!(mux.len(), 2);
    }
}
