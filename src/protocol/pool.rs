//! Bounded reuse of message instances.
//!
//! One queue per message type. A released message is cleaned and queued
//! again; when the queue for its type is full it is simply dropped.
use std::net::SocketAddr;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::trace;

use super::{Message, MessageType, ProtocolError};

pub const DEFAULT_POOL_CAPACITY: usize = 30;

#[derive(Debug)]
struct Store {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// Shared message pool, safe to use from any number of threads.
#[derive(Debug)]
pub struct MessagePool {
    stores: Vec<Store>,
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        let stores = MessageType::ALL
            .iter()
            .map(|_| {
                let (tx, rx) = bounded(capacity);
                Store { tx, rx }
            })
            .collect();
        Self { stores }
    }

    fn store(&self, kind: MessageType) -> &Store {
        &self.stores[kind.tag() as usize]
    }

    /// Takes a clean instance of `kind`, constructing one if none is pooled.
    pub fn acquire(&self, kind: MessageType) -> Message {
        self.store(kind)
            .rx
            .try_recv()
            .unwrap_or_else(|_| Message::new(kind))
    }

    /// Returns a message for reuse.
    pub fn release(&self, mut message: Message) {
        message.clean();
        let kind = message.kind();
        match self.store(kind).tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("{kind} pool full, dropping instance"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Number of idle instances of `kind`.
    pub fn pooled(&self, kind: MessageType) -> usize {
        self.store(kind).rx.len()
    }

    pub fn clear(&self) {
        for store in &self.stores {
            while store.rx.try_recv().is_ok() {}
        }
    }

    /// Decodes a datagram into a pooled instance.
    ///
    /// An unknown tag yields `Ok(None)`. On a decode failure the instance
    /// goes back to the pool before the error is returned.
    pub fn decode(
        &self,
        bytes: &[u8],
        origin: Option<SocketAddr>,
    ) -> Result<Option<Message>, ProtocolError> {
        let tag = *bytes.first().ok_or(ProtocolError::Empty)?;
        let Some(kind) = MessageType::from_tag(tag) else {
            return Ok(None);
        };

        let mut message = self.acquire(kind);
        match message.deserialize(bytes, origin) {
            Ok(()) => Ok(Some(message)),
            Err(e) => {
                self.release(message);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::protocol::{Payload, QueryRequest};
    use crate::statement::StatementType;

    #[test]
    fn released_messages_come_back_clean() {
        let pool = MessagePool::default();
        let mut msg = pool.acquire(MessageType::QueryRequest);
        msg.set_header("q1", 0);
        msg.payload = Payload::QueryRequest(QueryRequest {
            statement_type: Some(StatementType::Plain),
            query: Some("select 1".into()),
        });
        pool.release(msg);
        assert_eq!(pool.pooled(MessageType::QueryRequest), 1);

        let reused = pool.acquire(MessageType::QueryRequest);
        assert_eq!(reused, Message::new(MessageType::QueryRequest));
        assert_eq!(pool.pooled(MessageType::QueryRequest), 0);
    }

    #[test]
    fn full_pool_drops_instances() {
        let pool = MessagePool::new(2);
        for _ in 0..5 {
            pool.release(Message::new(MessageType::CloseRequest));
        }
        assert_eq!(pool.pooled(MessageType::CloseRequest), 2);
        assert_eq!(pool.pooled(MessageType::MetaData), 0);

        pool.clear();
        assert_eq!(pool.pooled(MessageType::CloseRequest), 0);
    }

    #[test]
    fn unknown_tag_is_unroutable() {
        let pool = MessagePool::default();
        assert_eq!(pool.decode(&[42, 0, 0], None), Ok(None));
        assert_eq!(pool.decode(&[], None), Err(ProtocolError::Empty));
    }

    #[test]
    fn failed_decode_returns_instance() {
        let pool = MessagePool::default();
        let err = pool.decode(&[MessageType::MetaData.tag(), 0], None);
        assert!(matches!(err, Err(ProtocolError::Truncated { .. })));
        assert_eq!(pool.pooled(MessageType::MetaData), 1);
    }

    #[test]
    fn decode_records_origin() {
        let pool = MessagePool::default();
        let mut msg = Message::new(MessageType::NextValuesRequest);
        msg.set_header("abc", 4);
        let bytes = msg.serialize().unwrap();

        let from: SocketAddr = "127.0.0.1:6414".parse().unwrap();
        let decoded = pool.decode(&bytes, Some(from)).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.origin(), Some(from));
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = Arc::new(MessagePool::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..200u32 {
                        let mut msg = pool.acquire(MessageType::NextValuesRequest);
                        assert_eq!(msg.query_id, None);
                        msg.set_header(&format!("t{t}"), i);
                        pool.release(msg);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.pooled(MessageType::NextValuesRequest) <= 8);
    }
}
