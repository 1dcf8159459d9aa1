//! Handshake validation
//!
//! Validates a client's first message against the host's settings.

use tidewire_shared::check_content_compatibility;

use crate::net::disconnect::{DisconnectPacket, DisconnectReason};

use super::messages::{AuthInfoAndVersion, MAX_PLAYER_NAME_LEN};
use super::HostSettings;

/// Validate a client hello against host settings
///
/// Returns None if valid, or the disconnect to send if invalid.
pub fn validate_hello(hello: &AuthInfoAndVersion, settings: &HostSettings) -> Option<DisconnectPacket> {
    let name = hello.player_name.trim();
    if name.is_empty() || hello.player_name.len() > MAX_PLAYER_NAME_LEN {
        return Some(DisconnectPacket::with_message(
            DisconnectReason::MalformedData,
            format!("Player name must be 1-{} bytes", MAX_PLAYER_NAME_LEN),
        ));
    }

    if hello.game_version != settings.game_version {
        return Some(DisconnectPacket::with_message(
            DisconnectReason::InvalidVersion,
            format!(
                "Version mismatch: host={}, client={}",
                settings.game_version, hello.game_version
            ),
        ));
    }

    if let Err(mismatch) = check_content_compatibility(&settings.content_packages, &hello.content_packages) {
        return Some(DisconnectPacket::with_message(
            DisconnectReason::MissingContentPackage,
            mismatch.to_string(),
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_shared::ContentPackageInfo;

    fn settings() -> HostSettings {
        HostSettings {
            game_version: "1.0.0".to_string(),
            content_packages: vec![ContentPackageInfo::new("Vanilla", 1)],
            password: None,
        }
    }

    fn hello(name: &str, version: &str, packages: Vec<ContentPackageInfo>) -> AuthInfoAndVersion {
        AuthInfoAndVersion {
            player_name: name.to_string(),
            game_version: version.to_string(),
            ticket: None,
            content_packages: packages,
        }
    }

    #[test]
    fn test_valid_hello() {
        let hello = hello("Alice", "1.0.0", vec![ContentPackageInfo::new("Vanilla", 1)]);
        assert!(validate_hello(&hello, &settings()).is_none());
    }

    #[test]
    fn test_version_mismatch() {
        let hello = hello("Alice", "0.9.0", vec![ContentPackageInfo::new("Vanilla", 1)]);
        let reject = validate_hello(&hello, &settings()).unwrap();
        assert_eq!(reject.reason, DisconnectReason::InvalidVersion);
        assert!(reject.message.unwrap().contains("0.9.0"));
    }

    #[test]
    fn test_missing_content() {
        let hello = hello("Alice", "1.0.0", vec![]);
        let reject = validate_hello(&hello, &settings()).unwrap();
        assert_eq!(reject.reason, DisconnectReason::MissingContentPackage);
    }

    #[test]
    fn test_bad_player_name() {
        let packages = vec![ContentPackageInfo::new("Vanilla", 1)];
        let empty = hello("   ", "1.0.0", packages.clone());
        assert_eq!(
            validate_hello(&empty, &settings()).unwrap().reason,
            DisconnectReason::MalformedData
        );

        let long = hello(&"x".repeat(MAX_PLAYER_NAME_LEN + 1), "1.0.0", packages);
        assert_eq!(
            validate_hello(&long, &settings()).unwrap().reason,
            DisconnectReason::MalformedData
        );
    }
}
