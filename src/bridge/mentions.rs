use std::collections::HashMap;

use tracing::warn;

use crate::message::RemoteProtocol;

use super::{adapter_for, BridgeCore};

const PILL_PREFIX: &str = "<a href=\"https://matrix.to/#/";
const PILL_SUFFIX: &str = "</a>";
// Upper bound on pill scanning so malformed HTML cannot loop forever.
const MAX_PILLS: usize = 100;

fn pill(mxid: &str, text: &str) -> String {
    format!("{}{}\">{}{}", PILL_PREFIX, mxid, text, PILL_SUFFIX)
}

/// Extract (matrix id, anchor text) pairs from matrix.to anchor pills,
/// scanning left to right.
fn extract_pills(html: &str) -> Vec<(String, String)> {
    let mut pills = Vec::new();
    let mut rest = html;
    for _ in 0..MAX_PILLS {
        let Some(start) = rest.find(PILL_PREFIX) else {
            break;
        };
        rest = &rest[start + PILL_PREFIX.len()..];
        let Some(quote) = rest.find('"') else {
            break;
        };
        let mxid = &rest[..quote];
        rest = &rest[quote..];
        let Some(gt) = rest.find('>') else {
            break;
        };
        rest = &rest[gt + 1..];
        let Some(end) = rest.find(PILL_SUFFIX) else {
            break;
        };
        pills.push((mxid.to_string(), rest[..end].to_string()));
        rest = &rest[end + PILL_SUFFIX.len()..];
    }
    pills
}

impl BridgeCore {
    /// Remote -> Matrix direction: rewrite the network's native mention
    /// syntax into matrix.to anchor pills, resolving usernames through the
    /// virtual-user table. Text without resolvable mentions passes through.
    pub async fn render_mentions(
        &self,
        protocol: Option<RemoteProtocol>,
        text: &str,
        mentions: &HashMap<String, String>,
    ) -> String {
        match protocol {
            Some(RemoteProtocol::Irc) => self.render_irc_mentions(text).await,
            Some(RemoteProtocol::Discord) => self.render_discord_mentions(text).await,
            Some(RemoteProtocol::Telegram) => self.render_mapped_mentions(text, mentions).await,
            _ => text.to_string(),
        }
    }

    // IRC addresses users as "name: rest of line".
    async fn render_irc_mentions(&self, text: &str) -> String {
        let mut out = text.to_string();
        for token in text.split_whitespace() {
            let Some(name) = token.strip_suffix(':') else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if let Some(mxid) = self.mxid_for_username(name).await {
                out = out.replace(&format!("{}:", name), &pill(&mxid, name));
            }
        }
        out
    }

    async fn render_discord_mentions(&self, text: &str) -> String {
        let mut out = text.to_string();
        for token in text.split_whitespace() {
            let Some(name) = token.strip_prefix('@') else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if let Some(mxid) = self.mxid_for_username(name).await {
                out = out.replace(&format!("@{}", name), &pill(&mxid, name));
            }
        }
        out
    }

    // Networks with structured mention metadata hand us text -> remote id.
    async fn render_mapped_mentions(
        &self,
        text: &str,
        mentions: &HashMap<String, String>,
    ) -> String {
        let mut out = text.to_string();
        for (mention_text, remote_id) in mentions {
            match self.db().user_store().get_by_remote_id(remote_id).await {
                Ok(Some(record)) => {
                    out = out.replace(mention_text, &pill(&record.matrix_id, &record.username));
                }
                Ok(None) => {}
                Err(e) => warn!("mention lookup failed remote_id={}: {}", remote_id, e),
            }
        }
        out
    }

    async fn mxid_for_username(&self, name: &str) -> Option<String> {
        if name == self.remote_username() {
            return Some(self.config().bridge.main_user.clone());
        }
        match self.db().user_store().get_by_username(name).await {
            Ok(Some(record)) => Some(record.matrix_id),
            Ok(None) => None,
            Err(e) => {
                warn!("mention lookup failed username={}: {}", name, e);
                None
            }
        }
    }

    /// Matrix -> remote direction: replace anchor-pill mention text in the
    /// plain body with the network's native mention form, and collect a
    /// mention-text -> remote-id map for networks that want it.
    pub async fn unrender_mentions(
        &self,
        protocol: Option<RemoteProtocol>,
        plain: &str,
        html: &str,
    ) -> (String, HashMap<String, String>) {
        let adapter = adapter_for(protocol);
        let mut text = plain.to_string();
        let mut mentions = HashMap::new();

        for (mxid, pill_text) in extract_pills(html) {
            if mxid == self.config().bridge.main_user {
                let formatted = adapter.format_mention(&pill_text);
                text = text.replace(&pill_text, &formatted);
                continue;
            }
            match self.db().user_store().get_by_matrix_id(&mxid).await {
                Ok(Some(record)) => {
                    let formatted = adapter.format_mention(&record.username);
                    text = text.replace(&pill_text, &formatted);
                    mentions.insert(formatted, record.remote_id);
                }
                Ok(None) => {}
                Err(e) => warn!("mention lookup failed matrix_id={}: {}", mxid, e),
            }
        }

        (text, mentions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::super::tests::test_config;
    use super::super::BridgeCore;
    use super::*;
    use crate::db::{DatabaseManager, NewVirtualUser};

    async fn core_with_alice() -> Arc<BridgeCore> {
        let file = tempfile::NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        std::mem::forget(file);
        let config = test_config("http://localhost:8008", &db_path);
        let db = DatabaseManager::new(&config.database)
            .await
            .expect("db manager");
        db.migrate().await.expect("migrate");
        db.user_store()
            .create(&NewVirtualUser {
                username: "alice".to_string(),
                matrix_token: "tok".to_string().into(),
                matrix_id: "@_bridge_alice_1:srv".to_string(),
                remote_id: "u_alice".to_string(),
                registered: true,
            })
            .await
            .expect("seed user");
        let (tx, _rx) = mpsc::channel(4);
        let core = BridgeCore::new(config, db, tx).expect("bridge core");
        Arc::new(core)
    }

    #[test]
    fn pill_extraction_is_bounded_and_ordered(){
        let html = format!(
            "hello {} and {}",
            pill("@a:srv", "a"),
            pill("@b:srv", "b")
        );
        let pills = extract_pills(&html);
        assert_eq!(
            pills,
            vec![
                ("@a:srv".to_string(), "a".to_string()),
                ("@b:srv".to_string(), "b".to_string())
            ]
        );

        // Unterminated anchor must not loop.
        let broken = "<a href=\"https://matrix.to/#/@x:srv\">no close";
        assert!(extract_pills(broken).is_empty());
    }

    #[tokio::test]
    async fn discord_mention_round_trips() {
        let core = core_with_alice().await;

        let rendered = core
            .render_mentions(
                Some(crate::message::RemoteProtocol::Discord),
                "@alice hi",
                &HashMap::new(),
            )
            .await;
        assert_eq!(
            rendered,
            format!("{} hi", pill("@_bridge_alice_1:srv", "alice"))
        );

        let (unrendered, mentions) = core
            .unrender_mentions(
                Some(crate::message::RemoteProtocol::Discord),
                "alice hi",
                &rendered,
            )
            .await;
        assert_eq!(unrendered, "@alice hi");
        assert_eq!(mentions.get("@alice").map(String::as_str), Some("u_alice"));
    }

    #[tokio::test]
    async fn irc_mention_renders_and_unrenders_plain() {
        let core = core_with_alice().await;

        let rendered = core
            .render_mentions(
                Some(crate::message::RemoteProtocol::Irc),
                "alice: ping",
                &HashMap::new(),
            )
            .await;
        assert_eq!(
            rendered,
            format!("{} ping", pill("@_bridge_alice_1:srv", "alice"))
        );

        let (unrendered, mentions) = core
            .unrender_mentions(
                Some(crate::message::RemoteProtocol::Irc),
                "alice ping",
                &rendered,
            )
            .await;
        assert_eq!(unrendered, "alice ping");
        assert_eq!(mentions.get("alice").map(String::as_str), Some("u_alice"));
    }

    #[tokio::test]
    async fn unknown_mentions_pass_through() {
        let core = core_with_alice().await;
        let rendered = core
            .render_mentions(
                Some(crate::message::RemoteProtocol::Discord),
                "@nobody hi",
                &HashMap::new(),
            )
            .await;
        assert_eq!(rendered, "@nobody hi");
    }
}
