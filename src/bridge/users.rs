use std::collections::HashMap;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::db::{NewVirtualUser, VirtualUserRecord};
use crate::matrix::MatrixClient;
use crate::utils::text::{random_lower, sanitize_username};

use super::{BridgeCore, BridgeError};

impl BridgeCore {
    /// Look up the virtual user for a remote user id, registering a fresh
    /// appservice account on first sight. Registration failures propagate;
    /// retrying inline would risk a second half-registered identity.
    pub async fn resolve_or_create_user(
        &self,
        remote_user_id: &str,
        display_name: &str,
    ) -> Result<VirtualUserRecord, BridgeError> {
        if let Some(existing) = self.db().user_store().get_by_remote_id(remote_user_id).await? {
            return Ok(existing);
        }

        let localpart = format!("{}_{}", sanitize_username(display_name), random_lower(3));
        let username = format!(
            "{}{}{}",
            self.config().bridge.account_prefix,
            localpart,
            self.config().bridge.user_suffix
        );
        debug!(
            "registering virtual user remote_id={} localpart={}",
            remote_user_id, username
        );

        let registered = self.bot().register_appservice_user(&username).await?;

        // Fresh accounts get their display name set through appservice
        // impersonation; the stored token takes over from there.
        let client = self.bot().acting_as(&registered.user_id);
        if let Err(e) = client
            .set_display_name(&registered.user_id, display_name)
            .await
        {
            warn!(
                "failed to set display name for {}: {}",
                registered.user_id, e
            );
        }

        let record = NewVirtualUser {
            username: display_name.to_string(),
            matrix_token: registered.access_token,
            matrix_id: registered.user_id.clone(),
            remote_id: remote_user_id.to_string(),
            registered: true,
        };
        self.db().user_store().create(&record).await?;

        self.db()
            .user_store()
            .get_by_remote_id(remote_user_id)
            .await?
            .ok_or_else(|| BridgeError::UserNotFound(remote_user_id.to_string()))
    }

    /// Subset of `members` (remote id -> username) with no virtual-user row
    /// yet. Store errors are logged and the member kept, so a flaky query
    /// only costs a redundant registration attempt.
    pub async fn unknown_members(
        &self,
        members: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let lookups = members.iter().map(|(remote_id, username)| async move {
            let known = match self.db().user_store().get_by_remote_id(remote_id).await {
                Ok(found) => found.is_some(),
                Err(e) => {
                    warn!("error getting user info from database: {}", e);
                    false
                }
            };
            (remote_id.clone(), username.clone(), known)
        });
        futures::future::join_all(lookups)
            .await
            .into_iter()
            .filter(|(_, _, known)| !known)
            .map(|(remote_id, username, _)| (remote_id, username))
            .collect()
    }

    /// Bulk provisioner for a whole channel membership, run detached. Paces
    /// registrations, logs and skips members that keep failing.
    pub async fn register_users(&self, members: HashMap<String, String>) {
        let pace = Duration::from_millis(self.config().limits.registration_delay);
        for (remote_id, username) in members {
            match self.resolve_or_create_user(&remote_id, &username).await {
                Ok(record) => {
                    debug!(
                        "registered virtual user remote_id={} matrix_id={}",
                        remote_id, record.matrix_id
                    );
                    tokio::time::sleep(pace).await;
                }
                Err(e) => {
                    warn!(
                        "skipping virtual user registration remote_id={}: {}",
                        remote_id, e
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// A Matrix client authenticated as the given virtual user.
    pub fn virtual_client(
        &self,
        _matrix_id: &str,
        token: secrecy::SecretString,
    ) -> Result<MatrixClient, BridgeError> {
        Ok(MatrixClient::new(
            &self.config().bridge.homeserver_url,
            token,
        )?)
    }

    /// Client for an already-registered virtual user, located by Matrix ID.
    /// An unknown id is an error, not a panic.
    pub async fn client_for_matrix_id(
        &self,
        matrix_id: &str,
    ) -> Result<(VirtualUserRecord, MatrixClient), BridgeError> {
        let record = self
            .db()
            .user_store()
            .get_by_matrix_id(matrix_id)
            .await?
            .ok_or_else(|| BridgeError::UserNotFound(matrix_id.to_string()))?;
        let client = self.virtual_client(
            &record.matrix_id,
            record.matrix_token.expose_secret().to_string().into(),
        )?;
        Ok((record, client))
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::text::{random_lower, sanitize_username};

    #[test]
    fn localpart_shape_matches_registration_format() {
        let localpart = format!("{}_{}", sanitize_username("al ice!"), random_lower(3));
        assert!(localpart.starts_with("al__ice___"));
        assert_eq!(localpart.len(), "al__ice__".len() + 1 + 3);
    }
}
