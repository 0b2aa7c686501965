//! Pure rendering of a [`MessageRecord`] into a chat message body.

use crate::config::ComposerConfig;
use crate::coordinator::policy::authoritative_platform;
use crate::coordinator::{MessageRecord, Platform, StreamMetadata, Subscription};
use crate::util::truncate_with_ellipsis;
use serde::Serialize;

/// Discord caps embed titles at 256 characters.
const EMBED_TITLE_MAX_CHARS: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    pub url: Option<String>,
    pub color: u32,
    pub thumbnail_url: Option<String>,
    pub fields: Vec<EmbedField>,
    pub buttons: Vec<LinkButton>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedBody {
    pub text: String,
    /// Structured part; `None` clears any embed on update.
    pub embed: Option<Embed>,
}

#[derive(Debug, Clone)]
pub struct NotificationComposer {
    live_template: String,
    offline_template: String,
    embed_color: u32,
}

impl NotificationComposer {
    pub fn new(config: &ComposerConfig) -> Self {
        Self {
            live_template: config.live_template.clone(),
            offline_template: config.offline_template.clone(),
            embed_color: config.embed_color,
        }
    }

    /// Body for the record's current state: live content while any side is
    /// live, the combined offline text otherwise.
    pub fn compose(&self, record: &MessageRecord) -> RenderedBody {
        let live = record.live_platforms();
        if live.is_empty() {
            return self.compose_offline(record, &record.participants());
        }

        let lead = authoritative_platform(record);
        let meta = record.side(lead).metadata.clone().unwrap_or_default();
        let template = subscription_template(record, lead, |s| s.live_template.as_deref())
            .unwrap_or(&self.live_template);
        let text = render(template, lead, &meta);

        let buttons = live
            .iter()
            .filter_map(|platform| {
                let url = record.side(*platform).metadata.as_ref()?.url.clone();
                (!url.is_empty()).then(|| LinkButton {
                    label: format!("Watch on {}", platform.display_name()),
                    url,
                })
            })
            .collect();

        let mut fields = Vec::new();
        if !meta.category.is_empty() {
            fields.push(EmbedField {
                name: "Category".into(),
                value: meta.category.clone(),
            });
        }

        let title = if meta.title.is_empty() {
            format!("{} is live", display_name(&meta, record))
        } else {
            truncate_with_ellipsis(&meta.title, EMBED_TITLE_MAX_CHARS)
        };

        RenderedBody {
            text,
            embed: Some(Embed {
                title,
                url: (!meta.url.is_empty()).then(|| meta.url.clone()),
                color: self.embed_color,
                thumbnail_url: meta.thumbnail_url.clone(),
                fields,
                buttons,
            }),
        }
    }

    /// Offline text for one side, rendered from that side's last metadata.
    pub fn offline_text(&self, record: &MessageRecord, platform: Platform) -> String {
        let meta = record.side(platform).metadata.clone().unwrap_or_default();
        let template = subscription_template(record, platform, |s| s.offline_template.as_deref())
            .unwrap_or(&self.offline_template);
        render(template, platform, &meta)
    }

    /// Offline body covering `platforms`, one line each, identical lines collapsed.
    pub fn compose_offline(&self, record: &MessageRecord, platforms: &[Platform]) -> RenderedBody {
        let mut lines: Vec<String> = Vec::new();
        for platform in platforms {
            let line = self.offline_text(record, *platform);
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
        RenderedBody {
            text: lines.join("\n"),
            embed: None,
        }
    }
}

fn subscription_template<'a>(
    record: &'a MessageRecord,
    platform: Platform,
    pick: impl Fn(&'a Subscription) -> Option<&'a str>,
) -> Option<&'a str> {
    record
        .side(platform)
        .subscription
        .as_ref()
        .and_then(pick)
        .filter(|t| !t.trim().is_empty())
}

fn display_name(meta: &StreamMetadata, record: &MessageRecord) -> String {
    if meta.display_name.is_empty() {
        record.key.channel_name().to_string()
    } else {
        meta.display_name.clone()
    }
}

/// Substitute `{name}`, `{title}`, `{category}`, `{url}` and `{platform}`.
fn render(template: &str, platform: Platform, meta: &StreamMetadata) -> String {
    template
        .replace("{name}", &meta.display_name)
        .replace("{title}", &meta.title)
        .replace("{category}", &meta.category)
        .replace("{url}", &meta.url)
        .replace("{platform}", platform.display_name())
}
