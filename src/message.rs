use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event tag carried by a [`CommonMessage`]. The serialized forms are the
/// historical string tags of the gateway bus, so existing adapters keep
/// speaking the same wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageEvent {
    #[default]
    #[serde(rename = "")]
    Text,
    #[serde(rename = "user_action")]
    UserAction,
    #[serde(rename = "msg_delete")]
    MsgDelete,
    #[serde(rename = "join_leave")]
    JoinLeave,
    #[serde(rename = "new_users")]
    NewUsers,
    #[serde(rename = "direct_msg")]
    DirectMsg,
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "facebook-event")]
    FacebookEvent,
    #[serde(rename = "twitter-event")]
    TwitterEvent,
    #[serde(rename = "email-event")]
    EmailEvent,
}

/// Action carried alongside a [`MessageEvent::JoinLeave`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCommand {
    Join,
    Part,
    Quit,
    /// iMessage traffic arrives tagged as an `api` control message and is
    /// re-routed as ordinary remote traffic instead of being consumed.
    #[serde(rename = "imessage")]
    IMessage,
}

/// The remote network a bridge instance is paired with. Exactly one value is
/// bound per instance, fixed on first successful send and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProtocol {
    Irc,
    Discord,
    Telegram,
    Slack,
    WhatsApp,
    Twitter,
    Instagram,
    Facebook,
    Email,
    IMessage,
    Api,
    Appservice,
}

impl RemoteProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteProtocol::Irc => "irc",
            RemoteProtocol::Discord => "discord",
            RemoteProtocol::Telegram => "telegram",
            RemoteProtocol::Slack => "slack",
            RemoteProtocol::WhatsApp => "whatsapp",
            RemoteProtocol::Twitter => "twitter",
            RemoteProtocol::Instagram => "instagram",
            RemoteProtocol::Facebook => "facebook",
            RemoteProtocol::Email => "email",
            RemoteProtocol::IMessage => "imessage",
            RemoteProtocol::Api => "api",
            RemoteProtocol::Appservice => "appservice",
        }
    }
}

impl fmt::Display for RemoteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown remote protocol: {0}")]
pub struct UnknownProtocol(String);

impl FromStr for RemoteProtocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "irc" => RemoteProtocol::Irc,
            "discord" => RemoteProtocol::Discord,
            "telegram" => RemoteProtocol::Telegram,
            "slack" => RemoteProtocol::Slack,
            "whatsapp" => RemoteProtocol::WhatsApp,
            "twitter" => RemoteProtocol::Twitter,
            "instagram" => RemoteProtocol::Instagram,
            "facebook" => RemoteProtocol::Facebook,
            "email" => RemoteProtocol::Email,
            "imessage" => RemoteProtocol::IMessage,
            "api" => RemoteProtocol::Api,
            "appservice" => RemoteProtocol::Appservice,
            other => return Err(UnknownProtocol(other.to_string())),
        })
    }
}

/// A file attachment travelling on the bus as message extra data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub avatar: bool,
}

/// The common internal message format exchanged with the gateway. The bridge
/// reads these to deliver outward to Matrix and writes them to carry
/// translated Matrix traffic back to the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub channel_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub account: String,
    pub protocol: Option<RemoteProtocol>,
    #[serde(default)]
    pub target_platform: Option<RemoteProtocol>,
    #[serde(default)]
    pub event: MessageEvent,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<FileInfo>,
    /// Mention text -> remote user id, for networks that carry structured
    /// mention metadata (e.g. Telegram).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub mentions: HashMap<String, String>,
    /// Remote user id -> username, the full member listing delivered with
    /// `new_users` events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub users_member_id: HashMap<String, String>,
    /// Remote user ids affected by a part action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_users_member: Vec<String>,
    #[serde(default)]
    pub action_command: Option<ActionCommand>,
}

impl CommonMessage {
    /// A parent id correlates a reply; the gateway uses a sentinel when the
    /// parent could not be resolved on the source network.
    pub fn parent_valid(&self) -> bool {
        !self.parent_id.is_empty() && self.parent_id != "msg-parent-not-found"
    }

    pub fn has_files(&self) -> bool {
        !self.extra.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tags_serialize_to_historical_strings() {
        assert_eq!(
            serde_json::to_string(&MessageEvent::NewUsers).unwrap(),
            "\"new_users\""
        );
        assert_eq!(
            serde_json::to_string(&MessageEvent::DirectMsg).unwrap(),
            "\"direct_msg\""
        );
        assert_eq!(
            serde_json::to_string(&MessageEvent::MsgDelete).unwrap(),
            "\"msg_delete\""
        );
        assert_eq!(serde_json::to_string(&MessageEvent::Text).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&MessageEvent::FacebookEvent).unwrap(),
            "\"facebook-event\""
        );
        assert_eq!(
            serde_json::to_string(&ActionCommand::IMessage).unwrap(),
            "\"imessage\""
        );
    }

    #[test]
    fn protocol_round_trips_through_str() {
        for p in [
            RemoteProtocol::Irc,
            RemoteProtocol::Discord,
            RemoteProtocol::Telegram,
            RemoteProtocol::WhatsApp,
            RemoteProtocol::IMessage,
        ] {
            assert_eq!(p.as_str().parse::<RemoteProtocol>().unwrap(), p);
        }
        assert!("matrixx".parse::<RemoteProtocol>().is_err());
    }

    #[test]
    fn parent_valid_rejects_sentinel_and_empty() {
        let mut msg = CommonMessage::default();
        assert!(!msg.parent_valid());
        msg.parent_id = "msg-parent-not-found".to_string();
        assert!(!msg.parent_valid());
        msg.parent_id = "$abc".to_string();
        assert!(msg.parent_valid());
    }

    #[test]
    fn message_deserializes_with_missing_optionals() {
        let msg: CommonMessage = serde_json::from_str(
            r##"{"text":"hello","channel":"#ubuntu","protocol":"irc","event":"join_leave"}"##,
        )
        .unwrap();
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.protocol, Some(RemoteProtocol::Irc));
        assert_eq!(msg.event, MessageEvent::JoinLeave);
        assert!(msg.extra.is_empty());
    }
}
