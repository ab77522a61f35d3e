//! Reading and dispatching inbound packets on the client thread.

use core::time::Duration;
use std::time::Instant;

use super::ack::{AckHandler, AckType, PacketBuffer, ScanAction};
use super::client::Client;
use super::codec::{self, FixedHeader, PacketType, QoS, SUBACK_FAILURE};
use super::error::{Error, Result};
use super::event::{DisconnectReason, Event, Message};
use super::message::MessageHandler;
use super::timer::Timer;
use crate::network::{Connect, Connection};

/// One complete packet as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundPacket {
    pub(crate) header: FixedHeader,
    pub(crate) body: Vec<u8>,
}

impl<N: Connect + 'static> Client<N> {
    /// Wait up to `timeout` for the start of a packet and read all of it.
    ///
    /// `Ok(None)` means nothing arrived. Staged ack handlers are migrated
    /// before returning, whatever the outcome.
    pub(crate) fn read_incoming_packet(
        &self,
        connection: &N::Connection,
        timeout: Duration,
    ) -> core::result::Result<Option<InboundPacket>, DisconnectReason> {
        let result = self.read_packet(connection, timeout);
        self.migrate_acks();
        result
    }

    pub(crate) fn migrate_acks(&self) {
        if let Some(count) = self.inner.acks.migrate() {
            log::warn!("{count} transactions outstanding");
            self.raise(Event::AckCountWarning { count });
        }
    }

    fn read_packet(
        &self,
        connection: &N::Connection,
        timeout: Duration,
    ) -> core::result::Result<Option<InboundPacket>, DisconnectReason> {
        let (command_timeout, max_packet_size) = {
            let config = self.inner.config.read();
            (
                Duration::from_millis(u64::from(config.command_timeout_ms)),
                config.max_packet_size,
            )
        };

        // Fixed header: type byte plus up to four length bytes.
        let mut header = [0u8; 5];
        let mut filled = match connection.recv_timeout(&mut header[..2], timeout) {
            Ok(0) => {
                log::info!("connection closed by peer");
                return Err(DisconnectReason::NetworkFailure);
            }
            Ok(n) => n,
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => {
                log::warn!("receive failed: {e}");
                return Err(DisconnectReason::NetworkFailure);
            }
        };

        let deadline = Instant::now() + command_timeout;
        let (fixed, used) = loop {
            match codec::decode_fixed_header(&header[..filled]) {
                Ok(Some(decoded)) => break decoded,
                Ok(None) if filled < header.len() => {
                    recv_exact(connection, &mut header[filled..=filled], deadline)?;
                    filled += 1;
                }
                Ok(None) => return Err(DisconnectReason::ProtocolError),
                Err(e) => {
                    log::warn!("bad fixed header: {e}");
                    return Err(DisconnectReason::ProtocolError);
                }
            }
        };

        if fixed.remaining_length > max_packet_size {
            log::warn!(
                "{:?} of {} bytes exceeds the {} byte limit",
                fixed.packet_type,
                fixed.remaining_length,
                max_packet_size
            );
            return Err(DisconnectReason::ProtocolError);
        }

        let mut body = vec![0u8; fixed.remaining_length];
        let over_read = (filled - used).min(body.len());
        body[..over_read].copy_from_slice(&header[used..used + over_read]);
        recv_exact(connection, &mut body[over_read..], deadline)?;

        log::trace!("received {:?}, {} bytes", fixed.packet_type, body.len());
        Ok(Some(InboundPacket {
            header: fixed,
            body,
        }))
    }

    /// Act on one inbound packet. Malformed packets are logged and dropped;
    /// only transport failures of replies are returned.
    pub(crate) fn dispatch(&self, packet: &InboundPacket) -> Result<()> {
        let body = packet.body.as_slice();
        let result = match packet.header.packet_type {
            PacketType::Publish => self.handle_publish(packet.header.flags, body),
            PacketType::PubAck => self.handle_publish_done(AckType::PubAck, body),
            PacketType::PubComp => self.handle_publish_done(AckType::PubComp, body),
            PacketType::PubRec => self.handle_pubrec(body),
            PacketType::PubRel => self.handle_pubrel(body),
            PacketType::SubAck => self.handle_suback(body),
            PacketType::UnsubAck => self.handle_unsuback(body),
            PacketType::PingResp => {
                let now = self.now();
                self.inner.keepalive.lock().pong(now);
                Ok(())
            }
            other => {
                log::warn!("unexpected {other:?} from broker");
                Ok(())
            }
        };
        match result {
            Err(Error::Codec(e)) => {
                log::warn!("dropping malformed {:?}: {e}", packet.header.packet_type);
                Ok(())
            }
            other => other,
        }
    }

    fn handle_publish(&self, flags: u8, body: &[u8]) -> Result<()> {
        let publish = codec::decode_publish(flags, body)?;
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
        };

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => {
                self.deliver(message);
                self.send_bytes(&codec::encode_ack(PacketType::PubAck, id))
            }
            (QoS::ExactlyOnce, Some(id)) => {
                let pubrec = codec::encode_ack(PacketType::PubRec, id);
                if self.inner.acks.contains(AckType::PubRel, id) {
                    log::debug!("QoS 2 publish {id} delivered already");
                } else {
                    self.deliver(message);
                    self.track(
                        AckType::PubRel,
                        id,
                        PacketBuffer::Ack(pubrec),
                        MessageHandler::new(publish.topic, publish.qos, Some(id)),
                    );
                }
                self.send_bytes(&pubrec)
            }
            _ => {
                self.deliver(message);
                Ok(())
            }
        }
    }

    fn deliver(&self, message: Message<'_>) {
        if self.inner.msg_handlers.find(message.topic, true).is_some() {
            self.raise(Event::Data(message));
        } else {
            log::debug!("no subscription matches {}", message.topic);
            self.raise(Event::UnsubscribedData(message));
        }
    }

    /// PUBACK or PUBCOMP: the outbound publish is complete.
    fn handle_publish_done(&self, kind: AckType, body: &[u8]) -> Result<()> {
        let packet_id = codec::decode_ack(body)?;
        match self.inner.acks.take(kind, packet_id) {
            Some(handler) => {
                let context = handler.context();
                self.raise(Event::Published {
                    topic: context.topic(),
                    qos: context.qos(),
                    packet_id,
                });
            }
            None => log::debug!("{kind:?} {packet_id} matches no transaction"),
        }
        Ok(())
    }

    fn handle_pubrec(&self, body: &[u8]) -> Result<()> {
        let packet_id = codec::decode_ack(body)?;
        let pubrel = codec::encode_ack(PacketType::PubRel, packet_id);
        if let Some(handler) = self.inner.acks.take(AckType::PubRec, packet_id) {
            self.track(
                AckType::PubComp,
                packet_id,
                PacketBuffer::Ack(pubrel),
                handler.into_context(),
            );
        } else if !self.inner.acks.contains(AckType::PubComp, packet_id) {
            log::warn!("PUBREC {packet_id} matches no transaction, rejected");
            return Ok(());
        }
        self.send_bytes(&pubrel)
    }

    fn handle_pubrel(&self, body: &[u8]) -> Result<()> {
        let packet_id = codec::decode_ack(body)?;
        if self.inner.acks.take(AckType::PubRel, packet_id).is_none() {
            log::debug!("PUBREL {packet_id} matches no transaction");
        }
        self.send_bytes(&codec::encode_ack(PacketType::PubComp, packet_id))
    }

    fn handle_suback(&self, body: &[u8]) -> Result<()> {
        let (packet_id, codes) = codec::decode_suback(body)?;
        if self.inner.acks.take(AckType::SubAck, packet_id).is_none() {
            log::debug!("SUBACK {packet_id} matches no transaction");
            return Ok(());
        }

        let handlers = self.inner.msg_handlers.take_transaction(packet_id);
        if handlers.len() != codes.len() {
            log::warn!(
                "SUBACK {packet_id} carries {} codes for {} filters",
                codes.len(),
                handlers.len()
            );
            for handler in &handlers {
                self.raise(Event::SubscribeFailed {
                    topic: handler.topic(),
                    packet_id,
                });
            }
            return Ok(());
        }

        for (handler, &code) in handlers.into_iter().zip(codes) {
            let granted = match QoS::try_from(code) {
                Ok(qos) if code != SUBACK_FAILURE => qos,
                _ => {
                    log::info!("subscription to {} refused", handler.topic());
                    self.raise(Event::SubscribeFailed {
                        topic: handler.topic(),
                        packet_id,
                    });
                    continue;
                }
            };
            self.inner
                .msg_handlers
                .find_and_destroy_duplicates(handler.topic(), packet_id);
            let handler = handler.into_confirmed(granted);
            self.raise(Event::Subscribed {
                topic: handler.topic(),
                qos: granted,
                packet_id,
            });
            self.inner.msg_handlers.add(handler);
        }
        Ok(())
    }

    fn handle_unsuback(&self, body: &[u8]) -> Result<()> {
        let packet_id = codec::decode_ack(body)?;
        if self.inner.acks.take(AckType::UnsubAck, packet_id).is_none() {
            log::debug!("UNSUBACK {packet_id} matches no transaction");
            return Ok(());
        }
        for handler in self.inner.msg_handlers.take_transaction(packet_id) {
            self.inner.msg_handlers.remove(handler.topic());
            self.raise(Event::Unsubscribed {
                topic: handler.topic(),
                packet_id,
            });
        }
        Ok(())
    }

    /// Register a handler created on the client thread.
    fn track(&self, kind: AckType, packet_id: u16, packet: PacketBuffer, context: MessageHandler) {
        let timeout = self.inner.config.read().ack_timeout_ms;
        let handler = AckHandler::new(kind, packet_id, packet, context, Timer::new(self.now(), timeout));
        if let Some(count) = self.inner.acks.insert(handler) {
            log::warn!("{count} transactions outstanding");
            self.raise(Event::AckCountWarning { count });
        }
    }

    /// Resend or expire timed out transactions.
    ///
    /// Sends that time out are left to the next scan. The first hard
    /// transport failure is returned after every action was handled.
    pub(crate) fn scan_acks(&self, force: bool) -> Result<()> {
        let repeat_warning = self.inner.config.read().repeat_count_warning;
        let actions = self.inner.acks.scan(self.now(), repeat_warning, force);
        let mut failure = None;

        for action in actions {
            match action {
                ScanAction::Resend {
                    kind,
                    packet_id,
                    retry_count,
                    packet,
                } => {
                    if failure.is_some() {
                        continue;
                    }
                    match self.send_bytes(&packet) {
                        Ok(()) => {
                            log::debug!("resent {kind:?} transaction {packet_id} ({retry_count})");
                            self.raise(Event::RepeatPublishPacket {
                                kind,
                                packet_id,
                                retry_count,
                            });
                        }
                        Err(Error::Transport(e)) if e.is_timeout() => {
                            log::debug!("resend of {packet_id} timed out");
                        }
                        Err(e) => failure = Some(e),
                    }
                }
                ScanAction::RepeatWarning {
                    kind,
                    packet_id,
                    retry_count,
                } => {
                    log::warn!("{kind:?} transaction {packet_id} unanswered after {retry_count} resends");
                    self.raise(Event::AckRepeatCountWarning {
                        kind,
                        packet_id,
                        retry_count,
                    });
                }
                ScanAction::Expired(handler) => self.expire(handler),
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn expire(&self, handler: AckHandler) {
        let packet_id = handler.packet_id();
        let kind = handler.kind();
        log::warn!("{kind:?} {packet_id} timed out");

        let mut topics = self.inner.msg_handlers.take_transaction(packet_id);
        if topics.is_empty() {
            topics.push(handler.into_context());
        }
        for topic in &topics {
            let topic = topic.topic();
            let event = if kind == AckType::SubAck {
                Event::SubscribeFailed { topic, packet_id }
            } else {
                Event::UnsubscribeFailed { topic, packet_id }
            };
            self.raise(event);
        }
    }
}

/// Fill `buf` completely before `deadline`.
fn recv_exact<C: Connection + ?Sized>(
    connection: &C,
    buf: &mut [u8],
    deadline: Instant,
) -> core::result::Result<(), DisconnectReason> {
    let mut pos = 0;
    while pos < buf.len() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            log::warn!("packet incomplete at deadline, {pos} of {} bytes", buf.len());
            return Err(DisconnectReason::NetworkFailure);
        }
        match connection.recv_timeout(&mut buf[pos..], left) {
            Ok(0) => return Err(DisconnectReason::NetworkFailure),
            Ok(n) => pos += n,
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                log::warn!("receive failed: {e}");
                return Err(DisconnectReason::NetworkFailure);
            }
        }
    }
    Ok(())
}
