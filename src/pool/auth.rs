//! Credential challenge responder backed by configured credentials

use crate::config::Credentials;
use crate::transport::{AuthResponder, CredentialChallenge, CredentialType, TransportError};

const SUPPORTED: [CredentialType; 2] = [CredentialType::AuthName, CredentialType::Passphrase];

/// Answers AUTHNAME and PASSPHRASE challenges; anything else fails the open
pub struct CredentialResponder<'a> {
    credentials: &'a Credentials,
}

impl<'a> CredentialResponder<'a> {
    pub fn new(credentials: &'a Credentials) -> Self {
        Self { credentials }
    }
}

impl AuthResponder for CredentialResponder<'_> {
    fn supported(&self) -> &[CredentialType] {
        &SUPPORTED
    }

    fn respond(&self, challenges: &mut [CredentialChallenge]) -> Result<(), TransportError> {
        for challenge in challenges.iter_mut() {
            match challenge.kind {
                CredentialType::AuthName => {
                    let username = if self.credentials.username.is_empty() {
                        challenge.default.clone()
                    } else {
                        self.credentials.username.clone()
                    };
                    challenge.result = Some(username);
                }
                CredentialType::Passphrase => {
                    challenge.result = Some(self.credentials.passphrase.clone());
                }
                CredentialType::Other(code) => {
                    return Err(TransportError::AuthFailed(format!(
                        "unsupported credential type {} ({})",
                        code, challenge.prompt
                    )));
                }
            }
        }
        Ok(())
    }
}
