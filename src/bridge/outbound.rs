use std::sync::Arc;

use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::matrix::MatrixClient;
use crate::media::{content_type_for_name, msgtype_for, MediaHandler};
use crate::message::{ActionCommand, CommonMessage, MessageEvent, RemoteProtocol};

use super::{adapter_for, BridgeCore, BridgeError};

impl BridgeCore {
    /// Route one message from the gateway into Matrix. Returns the event id
    /// of whatever landed on the homeserver, or an empty string when the
    /// message was consumed without producing an event (membership sync,
    /// action commands, unroutable messages).
    pub async fn send(self: &Arc<Self>, mut msg: CommonMessage) -> Result<String, BridgeError> {
        // The `api` pseudo-network carries control traffic, not chat.
        // iMessage is the exception: it rides the api connector and is
        // re-tagged as ordinary remote traffic.
        if msg.protocol == Some(RemoteProtocol::Api) {
            if msg.action_command == Some(ActionCommand::IMessage) {
                msg.protocol = Some(RemoteProtocol::IMessage);
            } else {
                self.control_action(msg).await;
                return Ok(String::new());
            }
        }

        if let Some(protocol) = msg.protocol {
            self.bind_protocol(protocol).await;
        }
        adapter_for(msg.protocol).normalize_outbound(&mut msg);

        // Some gateways put the event name in the body of sync messages.
        if msg.text == "new_users" {
            msg.text.clear();
        }

        match msg.event {
            MessageEvent::NewUsers => self.sync_channel(&msg).await?,
            MessageEvent::DirectMsg => self.ensure_direct_channel(&mut msg).await?,
            MessageEvent::JoinLeave if msg.action_command.is_some() => {
                self.handle_action_command(&msg).await?;
                return Ok(String::new());
            }
            _ => {}
        }

        if msg.text.is_empty() && !msg.has_files() {
            return Ok(String::new());
        }
        self.send_to_matrix(&msg).await
    }

    /// Membership sync for a remote channel: remember the operator's remote
    /// username, provision missing virtual users in the background, make sure
    /// the room exists, and queue invites for unjoined members.
    async fn sync_channel(self: &Arc<Self>, msg: &CommonMessage) -> Result<(), BridgeError> {
        self.set_remote_username(&msg.username);

        let missing = self.unknown_members(&msg.users_member_id).await;
        if !missing.is_empty() {
            let core = self.clone();
            tokio::spawn(async move {
                core.register_users(missing).await;
            });
        }

        if self.resolve_room(&msg.channel).await.is_none() {
            let name = if msg.channel_name.is_empty() {
                &msg.channel
            } else {
                &msg.channel_name
            };
            let room_id = self.ensure_channel(&msg.channel, name, false).await?;
            self.wait_room_visible(&room_id).await;
        }

        for remote_id in msg.users_member_id.keys() {
            match self.db().user_store().get_by_remote_id(remote_id).await {
                Ok(Some(record)) => {
                    if let Err(e) = self
                        .db()
                        .membership_store()
                        .ensure(&msg.channel, &record.matrix_id, false)
                        .await
                    {
                        warn!("failed to record membership for {}: {}", record.matrix_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("member lookup failed remote_id={}: {}", remote_id, e),
            }
        }

        let core = self.clone();
        let channel = msg.channel.clone();
        tokio::spawn(async move {
            core.invite_pending_members(&channel).await;
        });
        Ok(())
    }

    /// First direct message from a remote user: provision the virtual user,
    /// open a private room with the main user, and key the channel by the
    /// sender's remote id so later DMs find it.
    async fn ensure_direct_channel(&self, msg: &mut CommonMessage) -> Result<(), BridgeError> {
        let remote_id = msg.user_id.clone();
        if self
            .db()
            .channel_store()
            .get_by_remote_id(&remote_id)
            .await?
            .is_none()
        {
            let record = self.resolve_or_create_user(&remote_id, &msg.username).await?;
            let room_id = self.ensure_channel(&remote_id, &msg.username, true).await?;
            self.wait_room_visible(&room_id).await;

            if let Err(e) = self
                .limiter()
                .run(|| self.bot().invite(&room_id, &record.matrix_id))
                .await
            {
                warn!("failed to invite {} to DM: {}", record.matrix_id, e);
            }
            let client = self.virtual_client(
                &record.matrix_id,
                record.matrix_token.expose_secret().to_string().into(),
            )?;
            if let Err(e) = self.limiter().run(|| client.join_room(&room_id)).await {
                warn!("virtual user {} failed to join DM: {}", record.matrix_id, e);
            }

            self.db()
                .membership_store()
                .ensure(&remote_id, &record.matrix_id, true)
                .await?;
            if let Err(e) = self
                .db()
                .membership_store()
                .set_joined(&remote_id, &record.matrix_id, true)
                .await
            {
                warn!("failed to confirm DM join: {}", e);
            }
        }
        msg.channel = remote_id;
        Ok(())
    }

    /// Explicit membership changes on the remote side: join invites the
    /// virtual user into the mapped room, part and quit kick and forget.
    async fn handle_action_command(&self, msg: &CommonMessage) -> Result<(), BridgeError> {
        let Some(command) = msg.action_command else {
            return Ok(());
        };
        match command {
            ActionCommand::Join => {
                let room_id = match self.resolve_room(&msg.channel).await {
                    Some(room_id) => room_id,
                    None => self.ensure_channel(&msg.channel, &msg.channel, false).await?,
                };
                let record = self.resolve_or_create_user(&msg.user_id, &msg.username).await?;
                self.db()
                    .membership_store()
                    .ensure(&msg.channel, &record.matrix_id, false)
                    .await?;
                match self
                    .limiter()
                    .run(|| self.bot().invite(&room_id, &record.matrix_id))
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_forbidden() => {
                        self.db()
                            .membership_store()
                            .set_joined(&msg.channel, &record.matrix_id, true)
                            .await?;
                    }
                    Err(e) => warn!("join invite failed user={}: {}", record.matrix_id, e),
                }
            }
            ActionCommand::Part => {
                // Gateways deliver the affected users as a list; a lone
                // user_id is the degenerate single-user form.
                let mut targets = msg.channel_users_member.clone();
                if targets.is_empty() && !msg.user_id.is_empty() {
                    targets.push(msg.user_id.clone());
                }
                let room_id = self.resolve_room(&msg.channel).await;
                for remote_id in &targets {
                    let Some(record) =
                        self.db().user_store().get_by_remote_id(remote_id).await?
                    else {
                        continue;
                    };
                    if let Some(room_id) = room_id.as_deref() {
                        self.remove_user_from_room(&record.matrix_id, room_id, "user parts")
                            .await;
                    }
                    self.db()
                        .membership_store()
                        .remove(&msg.channel, &record.matrix_id)
                        .await?;
                }
            }
            ActionCommand::Quit => {
                let mut targets: Vec<String> = msg.users_member_id.keys().cloned().collect();
                if targets.is_empty() && !msg.user_id.is_empty() {
                    targets.push(msg.user_id.clone());
                }
                let channels = self.db().channel_store().list().await?;
                for remote_id in &targets {
                    let Some(record) =
                        self.db().user_store().get_by_remote_id(remote_id).await?
                    else {
                        continue;
                    };
                    for channel in &channels {
                        let member = self
                            .db()
                            .membership_store()
                            .get(&channel.remote_id, &record.matrix_id)
                            .await?;
                        if member.is_some() {
                            self.remove_user_from_room(
                                &record.matrix_id,
                                &channel.matrix_room_id,
                                "user quits",
                            )
                            .await;
                            self.db()
                                .membership_store()
                                .remove(&channel.remote_id, &record.matrix_id)
                                .await?;
                        }
                    }
                }
            }
            // Never consumed here: api traffic is re-tagged before routing.
            ActionCommand::IMessage => {}
        }
        Ok(())
    }

    /// Control traffic from the `api` connector is translated and pushed
    /// back onto the gateway bus addressed at the bound remote network.
    async fn control_action(&self, mut msg: CommonMessage) {
        match msg.event {
            MessageEvent::Join => {
                self.emit(CommonMessage {
                    text: "join".to_string(),
                    channel: msg.channel_name.clone(),
                    channel_name: msg.channel_name,
                    username: RemoteProtocol::Appservice.as_str().to_string(),
                    user_id: self.config().bridge.bot_mxid.clone(),
                    account: self.config().bridge.bot_mxid.clone(),
                    event: MessageEvent::Join,
                    protocol: Some(RemoteProtocol::Appservice),
                    target_platform: self.protocol(),
                    timestamp: Utc::now(),
                    ..Default::default()
                })
                .await;
            }
            MessageEvent::FacebookEvent | MessageEvent::TwitterEvent | MessageEvent::EmailEvent => {
                msg.protocol = Some(RemoteProtocol::Appservice);
                msg.target_platform = self.protocol();
                msg.username = RemoteProtocol::Appservice.as_str().to_string();
                msg.user_id = self.config().bridge.bot_mxid.clone();
                msg.account = self.config().bridge.bot_mxid.clone();
                self.emit(msg).await;
            }
            other => debug!("unhandled api control event {:?}, dropped", other),
        }
    }

    async fn resolve_room(&self, channel_id: &str) -> Option<String> {
        if let Some(room_id) = self.room_for_channel(channel_id) {
            return Some(room_id);
        }
        match self.db().channel_store().get_by_remote_id(channel_id).await {
            Ok(Some(channel)) => {
                self.set_room_mapping(&channel.matrix_room_id, channel_id);
                Some(channel.matrix_room_id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("room lookup failed channel={}: {}", channel_id, e);
                None
            }
        }
    }

    async fn send_to_matrix(&self, msg: &CommonMessage) -> Result<String, BridgeError> {
        let Some(room_id) = self.resolve_room(&msg.channel).await else {
            info!("no room mapped for channel {}, message dropped", msg.channel);
            return Ok(String::new());
        };
        let Some(record) = self.db().user_store().get_by_remote_id(&msg.user_id).await? else {
            debug!(
                "no virtual user for remote id {}, message dropped",
                msg.user_id
            );
            return Ok(String::new());
        };
        let client = self.virtual_client(
            &record.matrix_id,
            record.matrix_token.expose_secret().to_string().into(),
        )?;

        if msg.event == MessageEvent::UserAction {
            let content = json!({ "msgtype": "m.emote", "body": msg.text });
            return Ok(self
                .limiter()
                .run(|| client.send_message_event(&room_id, "m.room.message", &content))
                .await?);
        }

        if msg.event == MessageEvent::MsgDelete {
            if msg.id.is_empty() {
                return Ok(String::new());
            }
            return Ok(self
                .limiter()
                .run(|| client.redact(&room_id, &msg.id, ""))
                .await?);
        }

        if msg.has_files() {
            return self.send_files(&client, &room_id, msg).await;
        }

        let formatted = self.render_mentions(msg.protocol, &msg.text, &msg.mentions).await;

        if !msg.id.is_empty() {
            let mut content = self.text_content(&msg.text, &formatted);
            let new_content = content.clone();
            content["m.new_content"] = new_content;
            content["m.relates_to"] = json!({ "rel_type": "m.replace", "event_id": msg.id });
            self.limiter()
                .run(|| client.send_message_event(&room_id, "m.room.message", &content))
                .await?;
            // The remote side keeps referring to the original event.
            return Ok(msg.id.clone());
        }

        if msg.event == MessageEvent::JoinLeave {
            let content = json!({ "msgtype": "m.notice", "body": msg.text });
            return Ok(self
                .limiter()
                .run(|| client.send_message_event(&room_id, "m.room.message", &content))
                .await?);
        }

        let mut content = self.text_content(&msg.text, &formatted);
        if msg.parent_valid() {
            content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": msg.parent_id } });
        }
        Ok(self
            .limiter()
            .run(|| client.send_message_event(&room_id, "m.room.message", &content))
            .await?)
    }

    async fn send_files(
        &self,
        client: &MatrixClient,
        room_id: &str,
        msg: &CommonMessage,
    ) -> Result<String, BridgeError> {
        let mut last = String::new();
        for file in &msg.extra {
            let (data, content_type) = if file.data.is_empty() && !file.url.is_empty() {
                match self.media.download_from_url(&file.url).await {
                    Ok(media) => (media.data, media.content_type),
                    Err(e) => {
                        warn!("skipping attachment {}: {}", file.name, e);
                        continue;
                    }
                }
            } else {
                (file.data.clone(), content_type_for_name(&file.name).to_string())
            };
            if let Err(e) = MediaHandler::check_upload_size(data.len()) {
                warn!("skipping attachment {}: {}", file.name, e);
                continue;
            }

            let size = if file.size > 0 { file.size } else { data.len() as u64 };
            let mxc = self
                .limiter()
                .run(|| client.upload_media(data.clone(), &content_type, &file.name))
                .await?;
            let content = json!({
                "msgtype": msgtype_for(&content_type),
                "body": file.name,
                "url": mxc,
                "info": { "mimetype": content_type, "size": size },
            });
            last = self
                .limiter()
                .run(|| client.send_message_event(room_id, "m.room.message", &content))
                .await?;

            if !file.comment.is_empty() {
                let comment = json!({ "msgtype": "m.text", "body": file.comment });
                last = self
                    .limiter()
                    .run(|| client.send_message_event(room_id, "m.room.message", &comment))
                    .await?;
            }
        }
        Ok(last)
    }

    fn text_content(&self, body: &str, formatted: &str) -> Value {
        let mut content = json!({ "msgtype": "m.text", "body": body });
        if !self.config().bridge.html_disable && !formatted.is_empty() && formatted != body {
            content["format"] = json!("org.matrix.custom.html");
            content["formatted_body"] = json!(formatted);
        }
        content
    }
}
