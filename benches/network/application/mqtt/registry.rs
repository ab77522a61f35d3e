use criterion::Criterion;
use libiot_mqtt::network::application::mqtt::ack::{AckHandler, AckHandlers, PacketBuffer};
use libiot_mqtt::network::application::mqtt::codec::{self, PacketType, QoS};
use libiot_mqtt::network::application::mqtt::message::{MessageHandler, MessageHandlers};
use libiot_mqtt::network::application::mqtt::timer::Timer;
use libiot_mqtt::network::application::mqtt::AckType;
use std::hint::black_box;

pub fn bench_topic_match(c: &mut Criterion) {
    let registry = MessageHandlers::new();
    for i in 0..64 {
        registry.add(MessageHandler::new(&format!("site/{i}/+/temp"), QoS::AtMostOnce, None));
    }
    registry.add(MessageHandler::new("site/#", QoS::AtLeastOnce, None));

    c.bench_function("topic_match_65_filters", |b| {
        b.iter(|| registry.find(black_box("site/99/room/humidity"), true))
    });
}

pub fn bench_ack_round_trip(c: &mut Criterion) {
    let acks = AckHandlers::new(0);
    c.bench_function("ack_stage_migrate_take", |b| {
        let mut id: u16 = 0;
        b.iter(|| {
            id = id % 60_000 + 1;
            acks.stage(AckHandler::new(
                AckType::PubRel,
                id,
                PacketBuffer::Ack(codec::encode_ack(PacketType::PubRec, id)),
                MessageHandler::new("bench", QoS::ExactlyOnce, Some(id)),
                Timer::new(0, 1_000),
            ));
            acks.migrate();
            black_box(acks.take(AckType::PubRel, id))
        })
    });
}
