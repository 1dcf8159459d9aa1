//! Unit tests for the handshake state machines

use std::time::Duration;

use tidewire_shared::ContentPackageInfo;

use crate::net::disconnect::DisconnectReason;
use crate::net::header::InitStep;

use super::*;

const RESEND: Duration = Duration::from_secs(1);

fn settings(password: Option<&str>) -> HostSettings {
    HostSettings {
        game_version: "1.0.0".to_string(),
        content_packages: vec![ContentPackageInfo::new("Vanilla", 1), ContentPackageInfo::new("Mod", 2)],
        password: password.map(str::to_string),
    }
}

fn identity() -> ClientIdentity {
    ClientIdentity {
        player_name: "Alice".to_string(),
        game_version: "1.0.0".to_string(),
        ticket: None,
        // Client lists them in a different order
        content_packages: vec![ContentPackageInfo::new("Mod", 2), ContentPackageInfo::new("Vanilla", 1)],
    }
}

fn sent_by_host(actions: &[HostAction]) -> Vec<HostInit> {
    actions
        .iter()
        .filter_map(|a| match a {
            HostAction::Send(msg) => Some(msg.clone()),
            _ => None,
        })
        .collect()
}

fn deliver_to_client(client: &mut ClientHandshake, msg: &HostInit) -> Vec<ClientAction> {
    client.handle(msg.step(), &msg.encode()).unwrap()
}

fn deliver_to_host(host: &mut HostHandshake, msg: &ClientInit, settings: &HostSettings) -> Vec<HostAction> {
    host.handle(msg.step(), &msg.encode(), settings).unwrap()
}

fn client_sends(actions: &[ClientAction]) -> Vec<ClientInit> {
    actions
        .iter()
        .filter_map(|a| match a {
            ClientAction::Send(msg) => Some(msg.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_full_handshake_without_password() {
    let settings = settings(None);
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    let mut host = HostHandshake::new(3, 64);

    let hello = client.start();
    let actions = deliver_to_host(&mut host, &hello, &settings);
    assert!(matches!(actions[0], HostAction::Authenticate { ref player_name, ticket: None } if player_name == "Alice"));
    assert_eq!(host.phase(), HostPhase::Authenticating);

    let order = sent_by_host(&host.authenticated(&settings));
    assert_eq!(host.init_step(), InitStep::ContentPackageOrder);

    let ack = client_sends(&deliver_to_client(&mut client, &order[0]));
    assert_eq!(client.step(), InitStep::ContentPackageOrder);
    assert_eq!(client.negotiated_content_packages(), settings.content_packages.as_slice());

    let actions = deliver_to_host(&mut host, &ack[0], &settings);
    assert!(actions.contains(&HostAction::Complete));
    let success = sent_by_host(&actions);

    let actions = deliver_to_client(&mut client, &success[0]);
    assert_eq!(actions, vec![ClientAction::Complete]);
    assert!(client.is_complete());
    assert!(host.is_complete());
}

#[test]
fn test_password_flow_with_retry() {
    let settings = settings(Some("hunter2"));
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    let mut host = HostHandshake::new(3, 64);

    deliver_to_host(&mut host, &client.start(), &settings);
    let prompt = sent_by_host(&host.authenticated(&settings));
    assert_eq!(host.phase(), HostPhase::Password);

    let actions = deliver_to_client(&mut client, &prompt[0]);
    assert!(matches!(actions[0], ClientAction::PasswordRequested { retries_left: 3, .. }));
    assert!(client.is_awaiting_password());

    // Wrong password gets a re-prompt with fewer retries
    let wrong = client.submit_password("letmein").unwrap();
    let reprompt = sent_by_host(&deliver_to_host(&mut host, &wrong, &settings));
    assert!(matches!(reprompt[0], HostInit::Password(PasswordPrompt { retries_left: 2, .. })));
    let actions = deliver_to_client(&mut client, &reprompt[0]);
    assert!(matches!(actions[0], ClientAction::PasswordRequested { retries_left: 2, .. }));

    let right = client.submit_password("hunter2").unwrap();
    let order = sent_by_host(&deliver_to_host(&mut host, &right, &settings));
    assert!(matches!(order[0], HostInit::ContentPackageOrder(_)));
    assert_eq!(host.phase(), HostPhase::ContentPackageOrder);
}

#[test]
fn test_password_retries_exhausted() {
    let settings = settings(Some("hunter2"));
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    let mut host = HostHandshake::new(2, 64);

    deliver_to_host(&mut host, &client.start(), &settings);
    let prompt = sent_by_host(&host.authenticated(&settings));
    deliver_to_client(&mut client, &prompt[0]);

    let wrong = client.submit_password("nope").unwrap();
    let reprompt = sent_by_host(&deliver_to_host(&mut host, &wrong, &settings));
    assert!(matches!(reprompt[0], HostInit::Password(PasswordPrompt { retries_left: 1, .. })));
    deliver_to_client(&mut client, &reprompt[0]);

    let wrong_again = client.submit_password("still nope").unwrap();
    let actions = deliver_to_host(&mut host, &wrong_again, &settings);
    assert!(matches!(&actions[0], HostAction::Fail(p) if p.reason == DisconnectReason::WrongPassword));
}

#[test]
fn test_retransmitted_wrong_password_costs_one_retry() {
    let settings = settings(Some("hunter2"));
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    let mut host = HostHandshake::new(3, 64);

    deliver_to_host(&mut host, &client.start(), &settings);
    let prompt = sent_by_host(&host.authenticated(&settings));
    deliver_to_client(&mut client, &prompt[0]);

    let wrong = client.submit_password("letmein").unwrap();
    let first = sent_by_host(&deliver_to_host(&mut host, &wrong, &settings));
    assert!(matches!(first[0], HostInit::Password(PasswordPrompt { retries_left: 2, .. })));

    // The re-prompt was lost and the client resends its answer
    let resent = client.update(RESEND).unwrap();
    assert_eq!(resent, wrong);
    let again = sent_by_host(&deliver_to_host(&mut host, &resent, &settings));
    assert_eq!(again, first);
    assert_eq!(host.phase(), HostPhase::Password);

    // The same wrong password typed again is hashed with the new salt and counts
    deliver_to_client(&mut client, &first[0]);
    let retyped = client.submit_password("letmein").unwrap();
    assert_ne!(retyped, wrong);
    let reprompt = sent_by_host(&deliver_to_host(&mut host, &retyped, &settings));
    assert!(matches!(reprompt[0], HostInit::Password(PasswordPrompt { retries_left: 1, .. })));

    deliver_to_client(&mut client, &reprompt[0]);
    let right = client.submit_password("hunter2").unwrap();
    let order = sent_by_host(&deliver_to_host(&mut host, &right, &settings));
    assert!(matches!(order[0], HostInit::ContentPackageOrder(_)));
}

#[test]
fn test_client_ignores_out_of_step_messages() {
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    client.start();

    // Success before the content order is ignored
    assert!(deliver_to_client(&mut client, &HostInit::Success).is_empty());
    assert_eq!(client.step(), InitStep::AuthInfoAndVersion);

    let order = HostInit::ContentPackageOrder(ContentPackageOrder {
        packages: settings(None).content_packages,
    });
    deliver_to_client(&mut client, &order);
    assert_eq!(client.step(), InitStep::ContentPackageOrder);

    // A late password prompt cannot move the step backwards
    let prompt = HostInit::Password(PasswordPrompt {
        salt: 5,
        retries_left: 3,
    });
    assert!(deliver_to_client(&mut client, &prompt).is_empty());
    assert_eq!(client.step(), InitStep::ContentPackageOrder);
    assert!(client.submit_password("x").is_none());
}

#[test]
fn test_client_rejects_order_with_missing_package() {
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    client.start();

    let order = HostInit::ContentPackageOrder(ContentPackageOrder {
        packages: vec![ContentPackageInfo::new("Unknown", 99)],
    });
    let actions = deliver_to_client(&mut client, &order);
    assert!(matches!(&actions[0], ClientAction::Fail(p) if p.reason == DisconnectReason::MissingContentPackage));
    assert_eq!(client.step(), InitStep::AuthInfoAndVersion);
}

#[test]
fn test_client_resends_current_step() {
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    client.start();

    assert!(client.update(Duration::from_millis(999)).is_none());
    assert!(matches!(
        client.update(Duration::from_millis(1)),
        Some(ClientInit::AuthInfoAndVersion(_))
    ));

    // Waiting on the user for a password sends nothing
    let prompt = HostInit::Password(PasswordPrompt {
        salt: 5,
        retries_left: 3,
    });
    deliver_to_client(&mut client, &prompt);
    assert!(client.update(RESEND).is_none());

    client.submit_password("pw").unwrap();
    assert!(matches!(client.update(RESEND), Some(ClientInit::Password(_))));
}

#[test]
fn test_host_reprompts_on_duplicate_hello() {
    let settings = settings(None);
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    let mut host = HostHandshake::new(3, 64);

    let hello = client.start();
    deliver_to_host(&mut host, &hello, &settings);

    // Duplicate while verifying: nothing
    assert!(deliver_to_host(&mut host, &hello, &settings).is_empty());

    host.authenticated(&settings);
    let resent = sent_by_host(&deliver_to_host(&mut host, &hello, &settings));
    assert!(matches!(resent[0], HostInit::ContentPackageOrder(_)));
    assert_eq!(host.phase(), HostPhase::ContentPackageOrder);
}

#[test]
fn test_host_rejects_invalid_hello() {
    let settings = settings(None);
    let mut identity = identity();
    identity.game_version = "2.0.0".to_string();
    let mut host = HostHandshake::new(3, 64);

    let hello = ClientInit::AuthInfoAndVersion(identity.hello());
    let actions = deliver_to_host(&mut host, &hello, &settings);
    assert!(matches!(&actions[0], HostAction::Fail(p) if p.reason == DisconnectReason::InvalidVersion));
    assert_eq!(host.phase(), HostPhase::AwaitingHello);
}

#[test]
fn test_host_message_budget() {
    let settings = settings(None);
    let mut host = HostHandshake::new(3, 2);
    let hello = ClientInit::AuthInfoAndVersion(identity().hello());

    deliver_to_host(&mut host, &hello, &settings);
    deliver_to_host(&mut host, &hello, &settings);
    let actions = deliver_to_host(&mut host, &hello, &settings);
    assert!(matches!(&actions[0], HostAction::Fail(p) if p.reason == DisconnectReason::TimedOut));
}

#[test]
fn test_host_malformed_body() {
    let mut host = HostHandshake::new(3, 64);
    let result = host.handle(InitStep::AuthInfoAndVersion, &[0xFF, 0x00], &settings(None));
    assert_eq!(result, Err(InitMessageError::Malformed(InitStep::AuthInfoAndVersion)));
}

#[test]
fn test_client_ignores_repeated_password_prompt() {
    let mut client = ClientHandshake::new(identity().hello(), RESEND);
    client.start();

    let prompt = HostInit::Password(PasswordPrompt {
        salt: 9,
        retries_left: 3,
    });
    assert_eq!(deliver_to_client(&mut client, &prompt).len(), 1);
    client.submit_password("pw").unwrap();

    // The host re-sent the same prompt after a stale hello; the answer stands
    assert!(deliver_to_client(&mut client, &prompt).is_empty());
    assert!(!client.is_awaiting_password());
    assert!(matches!(client.update(RESEND), Some(ClientInit::Password(_))));
}
