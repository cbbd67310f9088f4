// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use russh::client::{AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::PrivateKeyWithHashAlg;
use std::sync::Arc;

use crate::adapters::ssh::AuthenticationFailure;

use super::{ClientHandler, SessionManager};

/// Servers that keep asking are given up on after this many challenge rounds.
const MAX_KEYBOARD_INTERACTIVE_ROUNDS: usize = 5;

#[derive(Debug)]
enum AuthDecision {
    Success,
    KeyboardInteractive,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } if partial_success
            && remaining_methods.contains(&russh::MethodKind::KeyboardInteractive) =>
        {
            AuthDecision::KeyboardInteractive
        }
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

impl SessionManager {
    /// Ensure we have a connected and authenticated handle, reconnecting
    /// when the previous one was closed.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut handle_field = self.handle.lock().await;

        let needs_connect = match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        };
        if !needs_connect {
            return Ok(());
        }

        tracing::info!(
            "establishing connection with {}@{}",
            &self.params.username,
            &self.params.addr
        );
        let handler = ClientHandler::new(
            self.params.host.clone(),
            self.params.addr,
            self.params.known_hosts_path.clone(),
        );
        let mut handle = russh::client::connect(self.config.clone(), self.params.addr, handler)
            .await
            .context("SSH connect failed")?;
        tracing::info!(
            "established connection with {}@{}, proceeding with auth",
            &self.params.username,
            &self.params.addr
        );
        self.authenticate(&mut handle).await?;
        *handle_field = Some(handle);
        drop(handle_field);

        self.start_keepalive().await;
        Ok(())
    }

    /// Public key first when configured, then password, then keyboard-interactive.
    async fn authenticate(&self, handle: &mut russh::client::Handle<ClientHandler>) -> Result<()> {
        if let Some(path) = &self.params.identity_path {
            let key = russh::keys::load_secret_key(path, None)
                .with_context(|| format!("failed to load secret key at {}", path.display()))?;
            // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
            let pk = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                handle.best_supported_rsa_hash().await?.flatten(),
            );
            let result = handle
                .authenticate_publickey(self.params.username.clone(), pk)
                .await?;
            match auth_decision(result) {
                AuthDecision::Success => return Ok(()),
                AuthDecision::KeyboardInteractive => {
                    return self.do_keyboard_interactive(handle).await;
                }
                AuthDecision::Failure => {
                    tracing::info!("public key was not accepted, falling back to password");
                }
            }
        }

        let Some(password) = self.params.password.clone() else {
            return Err(AuthenticationFailure::NoPassword {
                user: self.params.username.clone(),
            }
            .into());
        };
        let result = handle
            .authenticate_password(self.params.username.clone(), password)
            .await?;
        match auth_decision(result) {
            AuthDecision::Success => Ok(()),
            AuthDecision::KeyboardInteractive | AuthDecision::Failure => {
                self.do_keyboard_interactive(handle).await
            }
        }
    }

    /// Answers every keyboard-interactive prompt with the configured password.
    async fn do_keyboard_interactive(
        &self,
        handle: &mut russh::client::Handle<ClientHandler>,
    ) -> Result<()> {
        let Some(password) = self.params.password.clone() else {
            return Err(AuthenticationFailure::NoPassword {
                user: self.params.username.clone(),
            }
            .into());
        };
        let mut ki = handle
            .authenticate_keyboard_interactive_start(self.params.username.clone(), None)
            .await
            .context("KI start failed")?;

        for _ in 0..MAX_KEYBOARD_INTERACTIVE_ROUNDS {
            match ki {
                KeyboardInteractiveAuthResponse::Success => return Ok(()),
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    tracing::debug!(
                        "authentication failed (partial_success={}, remaining={:?})",
                        partial_success,
                        remaining_methods
                    );
                    return Err(AuthenticationFailure::Rejected {
                        user: self.params.username.clone(),
                        method: "keyboard-interactive",
                    }
                    .into());
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    tracing::debug!(
                        name = %name,
                        instructions = %instructions,
                        prompts = prompts.len(),
                        "keyboard-interactive challenge"
                    );
                    let answers = prompts.iter().map(|_| password.clone()).collect();
                    ki = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .context("KI respond failed")?;
                }
            }
        }
        Err(AuthenticationFailure::TooManyPrompts {
            user: self.params.username.clone(),
            rounds: MAX_KEYBOARD_INTERACTIVE_ROUNDS,
        }
        .into())
    }

    async fn start_keepalive(&self) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        let handle_clone = self.handle.clone();
        let jh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let guard = handle_clone.lock().await;
                let Some(handle) = guard.as_ref() else {
                    continue;
                };
                if handle.is_closed() {
                    tracing::debug!("keepalive handle is closed");
                    break;
                }
                if let Err(e) = handle.send_keepalive(true).await {
                    tracing::debug!("error when sending a keepalive: {}", e);
                }
            }
        });
        if let Some(previous) = self.keepalive_task_handle.lock().await.replace(jh) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthDecision, auth_decision};
    use russh::client::AuthResult;
    use russh::{MethodKind, MethodSet};

    #[test]
    fn auth_decision_success() {
        let decision = auth_decision(AuthResult::Success);
        assert!(matches!(decision, AuthDecision::Success));
    }

    #[test]
    fn auth_decision_keyboard_interactive_on_partial_success() {
        let methods = [MethodKind::KeyboardInteractive];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: true,
        });
        assert!(matches!(decision, AuthDecision::KeyboardInteractive));
    }

    #[test]
    fn auth_decision_failure_without_partial_success() {
        let methods = [MethodKind::KeyboardInteractive, MethodKind::Password];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: false,
        });
        assert!(matches!(decision, AuthDecision::Failure));
    }
}
