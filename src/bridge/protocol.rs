use crate::message::{CommonMessage, MessageEvent, RemoteProtocol};

/// Per-network behavior seams. Each remote network gets one implementation
/// instead of string switches scattered across the send and receive paths.
pub trait ProtocolAdapter: Send + Sync {
    /// The network's native mention form for a username.
    fn format_mention(&self, username: &str) -> String {
        username.to_string()
    }

    /// Inbound adjustment of the routing channel field before a message
    /// leaves for the gateway.
    fn adjust_channel_id(&self, _msg: &mut CommonMessage) {}

    /// Outbound pre-normalization: map provider-specific channel/user fields
    /// onto the generic ones the rest of the pipeline expects.
    fn normalize_outbound(&self, _msg: &mut CommonMessage) {}
}

struct DefaultAdapter;

impl ProtocolAdapter for DefaultAdapter {}

struct IrcAdapter;

impl ProtocolAdapter for IrcAdapter {}

struct DiscordAdapter;

impl ProtocolAdapter for DiscordAdapter {
    fn format_mention(&self, username: &str) -> String {
        format!("@{}", username)
    }

    fn adjust_channel_id(&self, msg: &mut CommonMessage) {
        msg.channel = format!("ID:{}", msg.channel);
    }

    fn normalize_outbound(&self, msg: &mut CommonMessage) {
        // Discord routes by numeric channel id, not display name.
        msg.channel = msg.channel_id.clone();
    }
}

struct TelegramAdapter;

impl ProtocolAdapter for TelegramAdapter {
    fn format_mention(&self, username: &str) -> String {
        username.replace('-', " ")
    }

    fn normalize_outbound(&self, msg: &mut CommonMessage) {
        match msg.channel_type.as_str() {
            "channel" => {
                msg.username = format!("{}_bot", msg.channel_name);
                msg.event = MessageEvent::DirectMsg;
            }
            "private" => {
                msg.event = MessageEvent::DirectMsg;
                msg.channel = msg.user_id.clone();
                msg.channel_name = msg.username.clone();
            }
            _ => {
                msg.event = MessageEvent::NewUsers;
            }
        }
    }
}

struct WhatsAppAdapter;

impl ProtocolAdapter for WhatsAppAdapter {
    fn normalize_outbound(&self, msg: &mut CommonMessage) {
        msg.username = msg.username.trim_start_matches('+').to_string();
    }
}

struct IMessageAdapter;

impl ProtocolAdapter for IMessageAdapter {
    fn normalize_outbound(&self, msg: &mut CommonMessage) {
        msg.username = msg.channel_name.clone();
        msg.user_id = msg.channel_id.clone();
        msg.channel = msg.channel_id.clone();
    }
}

static DEFAULT: DefaultAdapter = DefaultAdapter;
static IRC: IrcAdapter = IrcAdapter;
static DISCORD: DiscordAdapter = DiscordAdapter;
static TELEGRAM: TelegramAdapter = TelegramAdapter;
static WHATSAPP: WhatsAppAdapter = WhatsAppAdapter;
static IMESSAGE: IMessageAdapter = IMessageAdapter;

pub fn adapter_for(protocol: Option<RemoteProtocol>) -> &'static dyn ProtocolAdapter {
    match protocol {
        Some(RemoteProtocol::Irc) => &IRC,
        Some(RemoteProtocol::Discord) => &DISCORD,
        Some(RemoteProtocol::Telegram) => &TELEGRAM,
        Some(RemoteProtocol::WhatsApp) => &WHATSAPP,
        Some(RemoteProtocol::IMessage) => &IMESSAGE,
        _ => &DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_routes_by_channel_id() {
        let mut msg = CommonMessage {
            channel: "general".to_string(),
            channel_id: "123456".to_string(),
            ..Default::default()
        };
        adapter_for(Some(RemoteProtocol::Discord)).normalize_outbound(&mut msg);
        assert_eq!(msg.channel, "123456");

        let mut inbound = CommonMessage {
            channel: "123456".to_string(),
            ..Default::default()
        };
        adapter_for(Some(RemoteProtocol::Discord)).adjust_channel_id(&mut inbound);
        assert_eq!(inbound.channel, "ID:123456");
    }

    #[test]
    fn telegram_private_chat_becomes_direct_message() {
        let mut msg = CommonMessage {
            channel_type: "private".to_string(),
            username: "alice".to_string(),
            user_id: "42".to_string(),
            ..Default::default()
        };
        adapter_for(Some(RemoteProtocol::Telegram)).normalize_outbound(&mut msg);
        assert_eq!(msg.event, MessageEvent::DirectMsg);
        assert_eq!(msg.channel, "42");
        assert_eq!(msg.channel_name, "alice");
    }

    #[test]
    fn telegram_group_chat_syncs_members() {
        let mut msg = CommonMessage {
            channel_type: "group".to_string(),
            ..Default::default()
        };
        adapter_for(Some(RemoteProtocol::Telegram)).normalize_outbound(&mut msg);
        assert_eq!(msg.event, MessageEvent::NewUsers);
    }

    #[test]
    fn whatsapp_strips_phone_prefix() {
        let mut msg = CommonMessage {
            username: "+15551234".to_string(),
            ..Default::default()
        };
        adapter_for(Some(RemoteProtocol::WhatsApp)).normalize_outbound(&mut msg);
        assert_eq!(msg.username, "15551234");
    }

    #[test]
    fn unknown_protocol_gets_passthrough_adapter() {
        let mut msg = CommonMessage {
            channel: "keep".to_string(),
            ..Default::default()
        };
        adapter_for(None).normalize_outbound(&mut msg);
        adapter_for(Some(RemoteProtocol::Slack)).normalize_outbound(&mut msg);
        assert_eq!(msg.channel, "keep");
        assert_eq!(adapter_for(Some(RemoteProtocol::Irc)).format_mention("bob"), "bob");
        assert_eq!(
            adapter_for(Some(RemoteProtocol::Discord)).format_mention("bob"),
            "@bob"
        );
    }
}
