use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::db::NewChannel;
use crate::matrix::CreateRoomRequest;
use crate::media::MediaHandler;
use crate::utils::text::{random_lower, sanitize_alias};

use super::{BridgeCore, BridgeError};

const ROOM_VISIBILITY_ATTEMPTS: u32 = 10;
const ROOM_VISIBILITY_POLL: Duration = Duration::from_millis(200);

impl BridgeCore {
    /// Idempotent remote-channel -> Matrix-room mapping. A second call with
    /// the same remote id returns the already-persisted room.
    pub async fn ensure_channel(
        &self,
        remote_id: &str,
        name: &str,
        is_direct: bool,
    ) -> Result<String, BridgeError> {
        if let Some(existing) = self.db().channel_store().get_by_remote_id(remote_id).await? {
            return Ok(existing.matrix_room_id);
        }

        let request = if is_direct {
            CreateRoomRequest {
                preset: Some("private_chat".to_string()),
                invite: vec![self.config().bridge.main_user.clone()],
                is_direct: Some(true),
                ..Default::default()
            }
        } else {
            let display = format!("{} ( {} )", name, self.protocol_label());
            let alias = sanitize_alias(&format!("{}-{}", name, random_lower(4)));
            CreateRoomRequest {
                name: Some(display),
                preset: Some("public_chat".to_string()),
                room_alias_name: Some(alias),
                invite: vec![self.config().bridge.main_user.clone()],
                ..Default::default()
            }
        };

        let room_id = self
            .limiter()
            .run(|| self.bot().create_room(&request))
            .await?;

        self.send_room_avatar(&room_id).await;

        self.db()
            .channel_store()
            .create(&NewChannel {
                remote_name: name.to_string(),
                matrix_room_id: room_id.clone(),
                is_direct,
                remote_id: remote_id.to_string(),
            })
            .await?;
        self.set_room_mapping(&room_id, remote_id);
        info!(
            "channel mapped remote_id={} room_id={} direct={}",
            remote_id, room_id, is_direct
        );
        Ok(room_id)
    }

    /// Create the per-instance control room on first startup. Failure only
    /// costs the admin command surface, so it logs and gives up.
    pub async fn init_control_room(&self) {
        let control = format!("{}appservice_control", self.config().bridge.account_prefix);
        match self.db().channel_store().get_by_remote_id(&control).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!("control room lookup failed: {}", e);
                return;
            }
        }

        let request = CreateRoomRequest {
            name: Some(control.clone()),
            invite: vec![self.config().bridge.main_user.clone()],
            is_direct: Some(true),
            ..Default::default()
        };
        let room_id = match self.limiter().run(|| self.bot().create_room(&request)).await {
            Ok(room_id) => room_id,
            Err(e) => {
                debug!("failed creating control room: {}", e);
                return;
            }
        };

        self.send_room_avatar(&room_id).await;

        if let Err(e) = self
            .db()
            .channel_store()
            .create(&NewChannel {
                remote_name: control.clone(),
                matrix_room_id: room_id.clone(),
                is_direct: true,
                remote_id: control.clone(),
            })
            .await
        {
            warn!("failed to persist control room mapping: {}", e);
            return;
        }
        self.set_room_mapping(&room_id, &control);
        info!("control room ready room_id={}", room_id);
    }

    /// Upload the configured avatar image once and remember its mxc URL in
    /// the instance info row.
    pub async fn upload_avatar(&self) {
        if self.avatar_url.read().is_some() {
            return;
        }
        let Some(path) = self.config().bridge.avatar_path.clone() else {
            return;
        };

        let media = match self.media.load_local_file(&path).await {
            Ok(media) => media,
            Err(e) => {
                debug!("failed to read avatar file: {}", e);
                return;
            }
        };
        if let Err(e) = MediaHandler::check_upload_size(media.size) {
            debug!("avatar not uploaded: {}", e);
            return;
        }

        let url = match self
            .limiter()
            .run(|| {
                self.bot()
                    .upload_media(media.data.clone(), &media.content_type, &media.filename)
            })
            .await
        {
            Ok(url) => url,
            Err(e) => {
                debug!("failed to upload avatar to server: {}", e);
                return;
            }
        };

        *self.avatar_url.write() = Some(url.clone());
        if let Err(e) = self
            .db()
            .info_store()
            .set_avatar_url(&self.config().bridge.account_prefix, &url)
            .await
        {
            warn!("failed to persist avatar url: {}", e);
        }
    }

    /// Attach the cached avatar to a room. Best effort.
    pub async fn send_room_avatar(&self, room_id: &str) {
        let Some(url) = self.avatar_url.read().clone() else {
            return;
        };
        let content = json!({
            "url": url,
            "info": { "mimetype": "image/png", "h": 128, "w": 128 },
        });
        if let Err(e) = self
            .bot()
            .send_state_event(room_id, "m.room.avatar", "", &content)
            .await
        {
            debug!("failed to set room avatar room_id={}: {}", room_id, e);
        }
    }

    /// Wait for a freshly created room to become queryable before inviting
    /// into it, falling back to the configured settle delay if the poll keeps
    /// failing.
    pub async fn wait_room_visible(&self, room_id: &str) {
        for _ in 0..ROOM_VISIBILITY_ATTEMPTS {
            if self.bot().joined_members(room_id).await.is_ok() {
                return;
            }
            tokio::time::sleep(ROOM_VISIBILITY_POLL).await;
        }
        debug!(
            "room {} still not visible, falling back to settle delay",
            room_id
        );
        tokio::time::sleep(Duration::from_millis(self.config().limits.room_settle_delay)).await;
    }

    /// Invite every member of a channel whose join is not confirmed yet.
    /// Runs detached; the channel may be gone by the time it fires, which is
    /// a normal outcome. A "already joined" refusal confirms the join.
    pub async fn invite_pending_members(&self, channel_id: &str) {
        let channel = match self.db().channel_store().get_by_remote_id(channel_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => return,
            Err(e) => {
                warn!("invite loop lookup failed channel={}: {}", channel_id, e);
                return;
            }
        };

        let members = match self.db().membership_store().members_for_channel(channel_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!("invite loop member listing failed: {}", e);
                return;
            }
        };

        let pace = Duration::from_millis(self.config().limits.invite_delay);
        for member in members.into_iter().filter(|m| !m.joined) {
            tokio::time::sleep(pace).await;
            match self
                .limiter()
                .run(|| self.bot().invite(&channel.matrix_room_id, &member.matrix_id))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_forbidden() => {
                    // The homeserver refuses invites for users already in the
                    // room; treat that as join confirmation.
                    if let Err(db_err) = self
                        .db()
                        .membership_store()
                        .set_joined(channel_id, &member.matrix_id, true)
                        .await
                    {
                        warn!("failed to confirm join: {}", db_err);
                    }
                }
                Err(e) => {
                    warn!(
                        "invite failed room={} user={}: {}",
                        channel.matrix_room_id, member.matrix_id, e
                    );
                }
            }
        }
    }

    /// Kick a virtual user out of a room, e.g. on a remote part/quit.
    pub async fn remove_user_from_room(&self, matrix_id: &str, room_id: &str, reason: &str) {
        if let Err(e) = self
            .limiter()
            .run(|| self.bot().kick(room_id, matrix_id, reason))
            .await
        {
            warn!("kick failed room={} user={}: {}", room_id, matrix_id, e);
        }
    }
}
