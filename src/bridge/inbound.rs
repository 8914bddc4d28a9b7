use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::NewChannel;
use crate::media::attachment_filename;
use crate::message::{CommonMessage, FileInfo, MessageEvent, RemoteProtocol};
use crate::utils::text::strip_homeserver_suffix;

use super::{adapter_for, BridgeCore};

// Transactions can be replayed after an outage; events older than this are
// assumed already relayed.
const MAX_EVENT_AGE_MS: i64 = 15 * 60 * 1000;

/// A single event out of an appservice transaction. Content stays untyped
/// here and is decoded per event type, with unknown shapes dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender: String,
    pub state_key: Option<String>,
    pub origin_server_ts: Option<i64>,
    pub redacts: Option<String>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Deserialize)]
struct MemberContent {
    membership: String,
    is_direct: Option<bool>,
    displayname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    msgtype: Option<String>,
    body: Option<Value>,
    formatted_body: Option<String>,
    url: Option<String>,
    info: Option<AttachmentInfo>,
    #[serde(rename = "m.relates_to")]
    relates_to: Option<RelatesTo>,
    #[serde(rename = "m.new_content")]
    new_content: Option<Box<MessageContent>>,
}

#[derive(Debug, Deserialize)]
struct AttachmentInfo {
    mimetype: Option<String>,
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RelatesTo {
    rel_type: Option<String>,
    event_id: Option<String>,
    #[serde(rename = "m.in_reply_to")]
    in_reply_to: Option<InReplyTo>,
}

#[derive(Debug, Deserialize)]
struct InReplyTo {
    event_id: Option<String>,
}

impl BridgeCore {
    /// Entry point for every event delivered by the homeserver. Failures are
    /// logged, never returned: the transaction endpoint must ack regardless.
    pub async fn handle_event(&self, event: MatrixEvent) {
        if let Some(ts) = event.origin_server_ts {
            if Utc::now().timestamp_millis() - ts > MAX_EVENT_AGE_MS {
                debug!("skipping stale event id={} ts={}", event.event_id, ts);
                return;
            }
        }

        match event.event_type.as_str() {
            "m.room.member" => self.handle_member_event(event).await,
            "m.room.message" | "m.room.redaction" => self.handle_message_event(event).await,
            other => debug!("ignoring event type {}", other),
        }
    }

    async fn handle_member_event(&self, event: MatrixEvent) {
        let content: MemberContent = match serde_json::from_value(event.content.clone()) {
            Ok(content) => content,
            Err(e) => {
                debug!("undecodable member event {}: {}", event.event_id, e);
                return;
            }
        };

        match content.membership.as_str() {
            "invite" => self.handle_invite(&event, &content).await,
            "join" => {
                let member = event.state_key.as_deref().unwrap_or(&event.sender);
                if let Some(name) = content.displayname.as_deref() {
                    self.cache_display_name(member, name);
                }
            }
            _ => {}
        }
    }

    async fn handle_invite(&self, event: &MatrixEvent, content: &MemberContent) {
        let Some(invited) = event.state_key.as_deref().filter(|s| !s.is_empty()) else {
            return;
        };

        if invited == self.config().bridge.bot_mxid {
            if let Err(e) = self
                .limiter()
                .run(|| self.bot().join_room(&event.room_id))
                .await
            {
                warn!("bot failed to join {}: {}", event.room_id, e);
            }
            return;
        }

        if content.is_direct.unwrap_or(false) {
            self.handle_direct_invite(event, invited).await;
        } else {
            self.handle_room_invite(event, invited).await;
        }
    }

    /// A Matrix user opened a DM with a virtual user. The virtual user joins
    /// and, unless the bot itself created the room, the DM is recorded as a
    /// direct channel keyed by that user's remote id.
    async fn handle_direct_invite(&self, event: &MatrixEvent, invited: &str) {
        let (record, client) = match self.client_for_matrix_id(invited).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("direct invite for non-virtual user {}: {}", invited, e);
                return;
            }
        };

        let display = format!("{} ( {} )", record.username, self.protocol_label());
        if let Err(e) = client.set_display_name(invited, &display).await {
            warn!("failed to set display name for {}: {}", invited, e);
        }
        if let Err(e) = self.limiter().run(|| client.join_room(&event.room_id)).await {
            warn!("virtual user {} failed to join DM: {}", invited, e);
            return;
        }

        // Rooms the bot set up are already persisted by the send path.
        if event.sender == self.config().bridge.bot_mxid {
            return;
        }

        if let Err(e) = self
            .db()
            .channel_store()
            .create(&NewChannel {
                remote_name: record.username.clone(),
                matrix_room_id: event.room_id.clone(),
                is_direct: true,
                remote_id: record.remote_id.clone(),
            })
            .await
        {
            warn!("failed to persist DM channel for {}: {}", invited, e);
            return;
        }
        self.set_room_mapping(&event.room_id, &record.remote_id);
        if let Err(e) = self
            .db()
            .membership_store()
            .ensure(&record.remote_id, &record.matrix_id, true)
            .await
        {
            warn!("failed to record DM membership: {}", e);
        }
        if let Err(e) = self
            .db()
            .membership_store()
            .set_joined(&record.remote_id, &record.matrix_id, true)
            .await
        {
            warn!("failed to confirm DM join: {}", e);
        }
    }

    /// A virtual user was invited into a bridged room, usually by our own
    /// invite loop. Accept and mark the membership row joined.
    async fn handle_room_invite(&self, event: &MatrixEvent, invited: &str) {
        let (record, client) = match self.client_for_matrix_id(invited).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("invite for non-virtual user {}: {}", invited, e);
                return;
            }
        };

        if let Err(e) = self.limiter().run(|| client.join_room(&event.room_id)).await {
            warn!("virtual user {} failed to join {}: {}", invited, event.room_id, e);
            return;
        }

        let Some(channel_id) = self.channel_for_room(&event.room_id) else {
            return;
        };
        if let Err(e) = self
            .db()
            .membership_store()
            .set_joined(&channel_id, &record.matrix_id, true)
            .await
        {
            warn!("failed to confirm join for {}: {}", invited, e);
        }
    }

    async fn handle_message_event(&self, event: MatrixEvent) {
        // Our own traffic echoes back through the transaction stream.
        if event.sender == self.config().bridge.bot_mxid
            || event.sender.contains(&self.config().bridge.account_prefix)
        {
            return;
        }

        let Some(channel_id) = self.resolve_channel(&event.room_id).await else {
            debug!("message from unmapped room {}", event.room_id);
            return;
        };

        let mut msg = self.base_message(&event, &channel_id).await;

        if event.event_type == "m.room.redaction" {
            let Some(redacts) = event.redacts.as_deref().filter(|s| !s.is_empty()) else {
                return;
            };
            msg.event = MessageEvent::MsgDelete;
            msg.id = redacts.to_string();
            msg.text = "msg_delete".to_string();
            self.emit(msg).await;
            return;
        }

        let content: MessageContent = match serde_json::from_value(event.content.clone()) {
            Ok(content) => content,
            Err(e) => {
                debug!("undecodable message event {}: {}", event.event_id, e);
                return;
            }
        };
        let Some(body) = content.body.as_ref().and_then(Value::as_str) else {
            debug!("message {} has no string body, dropped", event.event_id);
            return;
        };

        let (text, mentions) = self
            .unrender_mentions(
                self.protocol(),
                body,
                content.formatted_body.as_deref().unwrap_or_default(),
            )
            .await;
        msg.text = text;
        msg.mentions = mentions;

        if self.handle_control_command(&mut msg, &channel_id) {
            self.emit(msg).await;
            return;
        }

        if content.msgtype.as_deref() == Some("m.emote") {
            msg.event = MessageEvent::UserAction;
        }

        if let Some(relates) = content.relates_to.as_ref() {
            if relates.rel_type.as_deref() == Some("m.replace") {
                if let (Some(original), Some(new_content)) =
                    (relates.event_id.as_deref(), content.new_content.as_deref())
                {
                    if let Some(new_body) = new_content.body.as_ref().and_then(Value::as_str) {
                        let (text, mentions) = self
                            .unrender_mentions(
                                self.protocol(),
                                new_body,
                                new_content.formatted_body.as_deref().unwrap_or_default(),
                            )
                            .await;
                        msg.id = original.to_string();
                        msg.text = text;
                        msg.mentions = mentions;
                        self.emit(msg).await;
                        return;
                    }
                }
            }

            if let Some(parent) = relates
                .in_reply_to
                .as_ref()
                .and_then(|r| r.event_id.as_deref())
            {
                msg.parent_id = parent.to_string();
                if !self.config().bridge.keep_quoted_reply {
                    msg.text = strip_quoted_reply(&msg.text);
                }
                self.emit(msg).await;
                return;
            }
        }

        self.attach_media(&mut msg, &content).await;

        self.emit(msg).await;
        if let Err(e) = self.bot().mark_read(&event.room_id, &event.event_id).await {
            warn!("failed to mark {} read: {}", event.event_id, e);
        }
    }

    async fn resolve_channel(&self, room_id: &str) -> Option<String> {
        if let Some(channel_id) = self.channel_for_room(room_id) {
            return Some(channel_id);
        }
        // Index miss, fall back to the store and backfill.
        match self.db().channel_store().get_by_matrix_room(room_id).await {
            Ok(Some(channel)) => {
                self.set_room_mapping(room_id, &channel.remote_id);
                Some(channel.remote_id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("channel lookup failed room={}: {}", room_id, e);
                None
            }
        }
    }

    async fn base_message(&self, event: &MatrixEvent, channel_id: &str) -> CommonMessage {
        let mut username = self.display_name(&event.sender).await;
        if self.config().bridge.no_homeserver_suffix {
            username = strip_homeserver_suffix(&username);
        }

        let mut msg = CommonMessage {
            username,
            user_id: event.sender.clone(),
            channel: channel_id.to_string(),
            channel_id: channel_id.to_string(),
            account: self.config().bridge.bot_mxid.clone(),
            protocol: Some(RemoteProtocol::Appservice),
            target_platform: self.protocol(),
            event: MessageEvent::Text,
            timestamp: Utc::now(),
            ..Default::default()
        };

        match self.db().channel_store().get_by_remote_id(channel_id).await {
            Ok(Some(channel)) => {
                msg.channel_name = channel.remote_name;
                if channel.is_direct {
                    msg.event = MessageEvent::DirectMsg;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("channel detail lookup failed: {}", e),
        }

        adapter_for(self.protocol()).adjust_channel_id(&mut msg);
        msg
    }

    /// `/appservice join <channel>` in the control room re-targets the
    /// message as a join request for the gateway.
    fn handle_control_command(&self, msg: &mut CommonMessage, channel_id: &str) -> bool {
        let control = format!("{}appservice_control", self.config().bridge.account_prefix);
        if channel_id != control {
            return false;
        }
        let parts: Vec<&str> = msg.text.split_whitespace().collect();
        if parts.len() == 3 && parts[0] == "/appservice" && parts[1] == "join" {
            msg.channel = parts[2].to_string();
            msg.event = MessageEvent::Join;
            return true;
        }
        false
    }

    async fn attach_media(&self, msg: &mut CommonMessage, content: &MessageContent) {
        let is_attachment = matches!(
            content.msgtype.as_deref(),
            Some("m.image") | Some("m.video") | Some("m.audio") | Some("m.file")
        );
        let Some(url) = content.url.as_deref().filter(|_| is_attachment) else {
            return;
        };

        let data = match self.bot().download_media(url).await {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to download attachment {}: {}", url, e);
                return;
            }
        };

        let mimetype = content
            .info
            .as_ref()
            .and_then(|i| i.mimetype.as_deref())
            .unwrap_or("image/png");
        let size = content
            .info
            .as_ref()
            .and_then(|i| i.size)
            .unwrap_or(data.len() as u64);
        let name = attachment_filename(&msg.text, mimetype);

        msg.extra.push(FileInfo {
            name,
            data,
            size,
            url: url.to_string(),
            ..Default::default()
        });
        // The body of an attachment event is its filename, not chat text.
        msg.text = String::new();
    }
}

fn strip_quoted_reply(text: &str) -> String {
    text.lines()
        .skip_while(|line| line.starts_with("> ") || line.starts_with('>') && line.len() <= 1)
        .skip_while(|line| line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
