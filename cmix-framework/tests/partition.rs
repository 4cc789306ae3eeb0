use cmix_framework::{
    model::{cell::contents_len, id::ReceptionId},
    partition::{MessageType, PartitionConfig, PartitionError, Partitioner, MAX_PARTS},
};
use rand::{rngs::OsRng, RngCore};

fn partitioner() -> Partitioner {
    Partitioner::new(PartitionConfig {
        part_size: contents_len(1024),
        ..Default::default()
    })
}

#[test]
fn test_part_count_bounds() {
    let p = partitioner();
    let bob = ReceptionId::generate(&mut OsRng);
    let two = p.first_capacity() + p.subsequent_capacity();

    for (len, parts) in [
        (1, 1),
        (p.first_capacity(), 1),
        (p.first_capacity() + 1, 2),
        (two, 2),
        (p.max_payload(), MAX_PARTS),
    ] {
        let sent = p
            .partition(&bob, MessageType::XxMessage, 0, &vec![1u8; len])
            .unwrap();
        assert_eq!(sent.parts.len(), parts, "{} bytes", len);
        assert!(sent.parts.iter().all(|part| part.len() == contents_len(1024)));
    }

    let err = p
        .partition(&bob, MessageType::XxMessage, 0, &vec![1u8; p.max_payload() + 1])
        .unwrap_err();
    assert!(matches!(err, PartitionError::PayloadTooLong { .. }));
}

#[test]
fn test_largest_message_reassembles_out_of_order() {
    let sender = partitioner();
    let receiver = partitioner();
    let alice = ReceptionId::generate(&mut OsRng);
    let bob = ReceptionId::generate(&mut OsRng);

    let mut payload = vec![0u8; sender.max_payload()];
    OsRng.fill_bytes(&mut payload);
    let sent = sender
        .partition(&bob, MessageType::XxMessage, 1_700_000_000_000, &payload)
        .unwrap();

    let mut parts = sent.parts.into_iter().rev();
    let last = parts.next().unwrap();
    for part in parts {
        assert!(receiver.handle_partition(&alice, &part).unwrap().is_none());
    }
    let message = receiver.handle_partition(&alice, &last).unwrap().unwrap();
    assert_eq!(message.payload, payload);
    assert_eq!(message.sender, alice);
    assert_eq!(message.full_id, sent.full_id);
}
