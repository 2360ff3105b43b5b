mod common;

use std::collections::{HashMap, HashSet};

use common::{access, bundle, recipient, Harness};
use message_delivery::{
    CancellationSignal, ContentHint, DataMessage, DeviceAddress, DistributionId,
    EnvelopeContent, Error, GroupAudience, GroupId, GroupMismatchedDevices,
    GroupSendEndorsements, GroupSendToken, GroupStaleDevices, MismatchedDevices,
    RecipientIdentity, SealedSenderAccess, SendGroupMessageResponse, SendMessageResult,
    SendOutcome, SenderKeyStore, StaleDevices, SyncMessage, TransportError, TypingAction,
    TypingMessage,
};

fn audience(size: usize) -> GroupAudience {
    GroupAudience {
        distribution_id: DistributionId::random(),
        recipients: (0..size).map(|_| recipient()).collect(),
        accesses: (0..size).map(|i| Some(access(i as u8 + 1))).collect(),
        endorsements: None,
    }
}

fn group_text(timestamp: u64) -> DataMessage {
    let mut message = DataMessage::text(timestamp, "hello group");
    message.group_id = Some(GroupId(vec![0x67; 32]));
    message
}

async fn send(h: &Harness, audience: &GroupAudience, timestamp: u64) -> Vec<SendMessageResult> {
    h.engine
        .send_group_data_message(
            audience,
            &group_text(timestamp),
            ContentHint::Resendable,
            true,
            None,
            &CancellationSignal::new(),
        )
        .await
        .unwrap()
}

fn result_for<'a>(
    results: &'a [SendMessageResult],
    recipient: &RecipientIdentity,
) -> &'a SendMessageResult {
    results.iter().find(|r| &r.address == recipient).unwrap()
}

#[tokio::test]
async fn sender_key_is_distributed_once() {
    let h = Harness::new();
    let audience = audience(2);

    let results = send(&h, &audience, 1).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(h.sent_to_others(), 2);
    assert_eq!(h.rest.group_sent().len(), 1);

    let results = send(&h, &audience, 2).await;
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(h.sent_to_others(), 2);
    assert_eq!(h.rest.group_sent().len(), 2);
}

#[tokio::test]
async fn distribution_message_carries_sender_key() {
    let h = Harness::new();
    let audience = audience(1);
    send(&h, &audience, 1).await;

    let sent = h.rest.sent_to(&audience.recipients[0]);
    let content: EnvelopeContent =
        serde_json::from_slice(&sent[0].list.messages[0].content).unwrap();
    assert!(content
        .content()
        .and_then(|c| c.sender_key_distribution_message.as_ref())
        .is_some());
    assert_eq!(content.hint(), ContentHint::Implicit);
    assert_eq!(content.group_id(), Some(&GroupId(vec![0x67; 32])));
    assert!(sent[0].access.is_sealed());
}

#[tokio::test]
async fn group_results_are_sealed_with_devices() {
    let h = Harness::new();
    let audience = audience(2);

    let results = send(&h, &audience, 1).await;
    for r in &results {
        let success = r.success_details().unwrap();
        assert_eq!(success.devices, vec![1]);
        assert!(success.unidentified);
        assert_eq!(success.duration, None);
    }
    let (request, access) = &h.rest.group_sent()[0];
    assert!(access.is_sealed());
    assert!(request.urgent);
}

#[tokio::test]
async fn failed_distribution_blocks_group_send() {
    let h = Harness::new();
    let audience = audience(5);
    for r in &audience.recipients[..3] {
        h.rest.fail_destination(r, TransportError::Io("reset".into()));
    }

    let results = send(&h, &audience, 1).await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.is_network_failure()));
    assert!(h.rest.group_sent().is_empty());
    assert!(h
        .sender_keys
        .shared_with(audience.distribution_id)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn classified_distribution_failures_are_kept() {
    let h = Harness::new();
    let audience = audience(3);
    let gone = audience.recipients[0].clone();
    h.rest.fail_destination(&gone, TransportError::Unregistered);

    let results = send(&h, &audience, 1).await;

    assert_eq!(results.len(), 3);
    assert_eq!(result_for(&results, &gone).outcome, SendOutcome::UnregisteredFailure);
    for r in &audience.recipients[1..] {
        assert!(result_for(&results, r).is_network_failure());
    }
    assert!(h.rest.group_sent().is_empty());
}

#[tokio::test]
async fn unsent_targets_are_unregistered() {
    let h = Harness::new();
    let audience = audience(2);
    let gone = audience.recipients[1].clone();
    h.rest.push_group(Ok(SendGroupMessageResponse {
        unsent_targets: vec![gone.service_id()],
    }));

    let results = send(&h, &audience, 1).await;

    assert!(result_for(&results, &audience.recipients[0]).is_success());
    assert_eq!(result_for(&results, &gone).outcome, SendOutcome::UnregisteredFailure);
}

#[tokio::test]
async fn new_device_gets_key_before_retry() {
    let h = Harness::new();
    let audience = audience(2);
    let alice = audience.recipients[0].clone();
    h.rest.push_group(Err(TransportError::GroupMismatchedDevices(vec![
        GroupMismatchedDevices {
            service_id: alice.service_id(),
            devices: MismatchedDevices {
                missing_devices: vec![2],
                extra_devices: vec![],
            },
        },
    ])));

    let results = send(&h, &audience, 1).await;

    assert_eq!(
        result_for(&results, &alice).success_details().unwrap().devices,
        vec![1, 2]
    );
    assert_eq!(h.rest.sent_to(&alice).len(), 2);
    assert_eq!(h.rest.group_sent().len(), 2);
    let shared = h.sender_keys.shared_with(audience.distribution_id).unwrap();
    assert!(shared.contains(&alice.device(2)));
}

#[tokio::test]
async fn stale_device_is_redistributed() {
    let h = Harness::new();
    let audience = audience(2);
    let alice = audience.recipients[0].clone();
    send(&h, &audience, 1).await;

    h.rest.push_group(Err(TransportError::GroupStaleDevices(vec![GroupStaleDevices {
        service_id: alice.service_id(),
        devices: StaleDevices {
            stale_devices: vec![1],
        },
    }])));
    let results = send(&h, &audience, 2).await;

    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(h.sessions.archived_count(&alice.device(1)).unwrap(), 1);
    assert_eq!(h.rest.sent_to(&alice).len(), 2);
    assert_eq!(h.rest.sent_to(&audience.recipients[1]).len(), 1);
}

#[tokio::test]
async fn endorsement_rejection_falls_back_to_access_key() {
    let h = Harness::new();
    let mut audience = audience(2);
    audience.endorsements = Some(GroupSendEndorsements {
        combined: Some(GroupSendToken(vec![1, 2, 3])),
        members: HashMap::new(),
    });
    h.rest.push_group(Err(TransportError::AuthorizationFailed));

    let results = send(&h, &audience, 1).await;

    assert!(results.iter().all(|r| r.is_success()));
    let accesses: Vec<SealedSenderAccess> =
        h.rest.group_sent().into_iter().map(|(_, a)| a).collect();
    assert!(matches!(accesses[0], SealedSenderAccess::GroupSend { .. }));
    assert!(matches!(accesses[1], SealedSenderAccess::Individual(_)));
}

#[tokio::test]
async fn rejection_without_fallback_is_fatal() {
    let h = Harness::new();
    let mut audience = audience(2);
    audience.accesses[1] = None;
    audience.endorsements = Some(GroupSendEndorsements {
        combined: Some(GroupSendToken(vec![1])),
        members: HashMap::new(),
    });
    h.rest.push_group(Err(TransportError::AuthorizationFailed));

    let err = h
        .engine
        .send_group_data_message(
            &audience,
            &group_text(1),
            ContentHint::Default,
            true,
            None,
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Transport(TransportError::AuthorizationFailed)
    ));
    assert_eq!(h.rest.group_sent().len(), 1);
}

#[tokio::test]
async fn group_send_needs_a_certificate() {
    let h = Harness::new();
    let mut audience = audience(2);
    audience.accesses = vec![None, None];

    let err = h
        .engine
        .send_group_data_message(
            &audience,
            &group_text(1),
            ContentHint::Default,
            true,
            None,
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(h.rest.total_calls(), 0);
}

#[tokio::test]
async fn empty_group_sends_nothing() {
    let h = Harness::new();
    let audience = audience(0);

    let results = send(&h, &audience, 1).await;

    assert!(results.is_empty());
    assert_eq!(h.rest.total_calls(), 0);
}

#[tokio::test]
async fn oversized_group_message_is_rejected_first() {
    let h = Harness::builder().max_envelope_size(32).build();
    let audience = audience(2);

    let err = h
        .engine
        .send_group_data_message(
            &audience,
            &group_text(1),
            ContentHint::Default,
            true,
            None,
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ContentTooLarge { .. }));
    assert_eq!(h.rest.total_calls(), 0);
}

#[tokio::test]
async fn group_typing_requires_group_id() {
    let h = Harness::new();
    let audience = audience(2);
    let typing = TypingMessage {
        timestamp: 1,
        action: TypingAction::Started,
        group_id: None,
    };

    let err = h
        .engine
        .send_group_typing(&audience, &typing, &CancellationSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn group_typing_is_online_only() {
    let h = Harness::new();
    let audience = audience(2);
    let typing = TypingMessage {
        timestamp: 1,
        action: TypingAction::Started,
        group_id: Some(GroupId(vec![1])),
    };

    h.engine
        .send_group_typing(&audience, &typing, &CancellationSignal::new())
        .await
        .unwrap();

    let (request, _) = &h.rest.group_sent()[0];
    assert!(request.online);
    assert!(!request.urgent);
}

#[tokio::test]
async fn explicit_distribution_marks_devices() {
    let h = Harness::new();
    let audience = audience(2);
    let group_id = GroupId(vec![0x67; 32]);

    let results = h
        .engine
        .send_sender_key_distribution(&audience, Some(&group_id), false, &CancellationSignal::new())
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(h.sent_to_others(), 2);

    send(&h, &audience, 2).await;
    assert_eq!(h.sent_to_others(), 2);
}

#[tokio::test]
async fn group_session_is_created_on_demand() {
    let h = Harness::new();
    let distribution_id = DistributionId::random();

    let message = h.engine.get_or_create_group_session(distribution_id).unwrap();

    assert_eq!(message.serialize(), distribution_id.as_uuid().as_bytes());
    assert_eq!(h.cipher.distribution_messages(), 1);
}

#[tokio::test]
async fn group_send_syncs_once() {
    let h = Harness::new();
    h.sessions.set_multi_device(true);
    let audience = audience(3);

    let results = send(&h, &audience, 7).await;
    assert!(results.iter().all(|r| r.success_details().unwrap().needs_sync));

    let syncs = h.rest.sent_to(&h.me());
    assert_eq!(syncs.len(), 1);
    let content: EnvelopeContent =
        serde_json::from_slice(&syncs[0].list.messages[0].content).unwrap();
    match content.content().and_then(|c| c.sync_message.clone()) {
        Some(SyncMessage::Sent(transcript)) => {
            assert_eq!(transcript.destination, None);
            assert_eq!(transcript.timestamp, 7);
            assert_eq!(transcript.unidentified_statuses.len(), 3);
        }
        other => panic!("unexpected sync {other:?}"),
    }
}

#[tokio::test]
async fn unrepairable_member_leaves_the_group_send() {
    let h = Harness::new();
    let audience = audience(3);
    let alice = audience.recipients[0].clone();
    send(&h, &audience, 1).await;

    h.rest.push_group(Err(TransportError::GroupMismatchedDevices(vec![
        GroupMismatchedDevices {
            service_id: alice.service_id(),
            devices: MismatchedDevices {
                missing_devices: vec![2],
                extra_devices: vec![],
            },
        },
    ])));
    h.rest.push_pre_keys(Ok(vec![bundle(2, b"bad")]));

    let results = send(&h, &audience, 2).await;

    assert_eq!(results.len(), 3);
    assert_eq!(result_for(&results, &alice).outcome, SendOutcome::InvalidPreKeyFailure);
    for r in &audience.recipients[1..] {
        assert!(result_for(&results, r).is_success());
    }
    let group_sent = h.rest.group_sent();
    assert_eq!(group_sent.len(), 3);
    // Only the remaining members' access keys are combined for the retry.
    assert!(matches!(group_sent[2].1, SealedSenderAccess::Individual(_)));
    assert_eq!(h.sessions.load_session(&alice.device(2)).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_group_sends_share_one_key_record() {
    let h = Harness::new();
    let distribution_id = DistributionId::random();
    let members: Vec<RecipientIdentity> = (0..4).map(|_| recipient()).collect();
    let audiences: Vec<GroupAudience> = (0..members.len())
        .map(|i| GroupAudience {
            distribution_id,
            recipients: vec![
                members[i].clone(),
                members[(i + 1) % members.len()].clone(),
            ],
            accesses: vec![Some(access(1)), Some(access(2))],
            endorsements: None,
        })
        .collect();

    let sends = audiences
        .iter()
        .enumerate()
        .map(|(i, audience)| send(&h, audience, i as u64 + 1));
    let all = futures::future::join_all(sends).await;

    for results in &all {
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));
    }

    let shared = h.sender_keys.shared_with(distribution_id).unwrap();
    let expected: HashSet<DeviceAddress> = members.iter().map(|m| m.device(1)).collect();
    assert_eq!(shared, expected);

    let requests = h.rest.prekey_requests();
    for member in &members {
        let bootstraps = requests.iter().filter(|r| &r.recipient == member).count();
        assert_eq!(bootstraps, 1, "{member} bootstrapped more than once");
    }
}

#[tokio::test]
async fn distribution_uses_each_members_own_access() {
    let h = Harness::new();
    let audience = audience(2);
    let (alice, bob) = (audience.recipients[0].clone(), audience.recipients[1].clone());
    let first = GroupAudience {
        recipients: vec![alice.clone()],
        accesses: vec![audience.accesses[0].clone()],
        ..audience.clone()
    };
    h.engine
        .send_sender_key_distribution(&first, None, false, &CancellationSignal::new())
        .await
        .unwrap();

    send(&h, &audience, 2).await;

    assert_eq!(h.rest.sent_to(&alice).len(), 1);
    let to_bob = h.rest.sent_to(&bob);
    assert_eq!(to_bob.len(), 1);
    assert_eq!(to_bob[0].access, SealedSenderAccess::Individual(access(2)));
}
