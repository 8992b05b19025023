use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of footer appended to served tips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FooterType {
    #[serde(rename = "video_relacionado")]
    RelatedVideo,
    #[serde(rename = "app_descarga")]
    AppDownload,
    #[serde(rename = "playlists_youtube")]
    YoutubePlaylists,
    #[serde(rename = "membresia_youtube")]
    YoutubeMembership,
    #[serde(rename = "llamada_coaching")]
    CoachingCall,
    #[serde(rename = "reflexion")]
    Reflection,
    #[serde(rename = "libro")]
    Book,
    #[serde(rename = "comunidad")]
    Community,
}

impl FooterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FooterType::RelatedVideo => "video_relacionado",
            FooterType::AppDownload => "app_descarga",
            FooterType::YoutubePlaylists => "playlists_youtube",
            FooterType::YoutubeMembership => "membresia_youtube",
            FooterType::CoachingCall => "llamada_coaching",
            FooterType::Reflection => "reflexion",
            FooterType::Book => "libro",
            FooterType::Community => "comunidad",
        }
    }
}

impl fmt::Display for FooterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FooterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video_relacionado" => Ok(FooterType::RelatedVideo),
            "app_descarga" => Ok(FooterType::AppDownload),
            "playlists_youtube" => Ok(FooterType::YoutubePlaylists),
            "membresia_youtube" => Ok(FooterType::YoutubeMembership),
            "llamada_coaching" => Ok(FooterType::CoachingCall),
            "reflexion" => Ok(FooterType::Reflection),
            "libro" => Ok(FooterType::Book),
            "comunidad" => Ok(FooterType::Community),
            other => Err(format!("unknown footer type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterTemplate {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub footer_type: FooterType,
    pub name: String,
    /// Text with `{frase}` and `{<url key>}` placeholders.
    pub template: String,
    pub urls: BTreeMap<String, String>,
    /// Selection weight, 0-100.
    pub probability: i32,
    pub priority: i32,
    pub is_active: bool,
    pub notes: Option<String>,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FooterTemplate {
    pub fn from_new(input: NewFooter, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            footer_type: input.footer_type,
            name: input.name,
            template: input.template,
            urls: input.urls,
            probability: input.probability.unwrap_or(10),
            priority: input.priority.unwrap_or(0),
            is_active: input.is_active.unwrap_or(true),
            notes: input.notes,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Weight in the draw; negative probabilities count as zero.
    pub fn weight(&self) -> u32 {
        self.probability.max(0) as u32
    }

    /// Fill in `{frase}` and every `{<url key>}` placeholder. Without a key
    /// phrase the placeholder is removed, along with any line left holding
    /// nothing but decoration.
    pub fn render(&self, key_phrase: Option<&str>) -> String {
        let mut text = match key_phrase {
            Some(phrase) => self.template.replace(PHRASE_PLACEHOLDER, phrase),
            None => strip_phrase(&self.template),
        };
        for (key, url) in &self.urls {
            text = text.replace(&format!("{{{}}}", key), url);
        }
        text
    }
}

const PHRASE_PLACEHOLDER: &str = "{frase}";

fn strip_phrase(template: &str) -> String {
    template
        .lines()
        .filter_map(|line| {
            if !line.contains(PHRASE_PLACEHOLDER) {
                return Some(line.to_string());
            }
            let rest = line.replace(PHRASE_PLACEHOLDER, "");
            if !rest.chars().any(char::is_alphanumeric) {
                return None;
            }
            Some(rest.split_whitespace().collect::<Vec<_>>().join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFooter {
    #[serde(rename = "type")]
    pub footer_type: FooterType,
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
    pub probability: Option<i32>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterPatch {
    #[serde(rename = "type")]
    pub footer_type: Option<FooterType>,
    pub name: Option<String>,
    pub template: Option<String>,
    pub urls: Option<BTreeMap<String, String>>,
    pub probability: Option<i32>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
    pub notes: Option<String>,
}

impl FooterPatch {
    pub fn apply(self, footer: &mut FooterTemplate) {
        if let Some(v) = self.footer_type {
            footer.footer_type = v;
        }
        if let Some(v) = self.name {
            footer.name = v;
        }
        if let Some(v) = self.template {
            footer.template = v;
        }
        if let Some(v) = self.urls {
            footer.urls = v;
        }
        if let Some(v) = self.probability {
            footer.probability = v;
        }
        if let Some(v) = self.is_active {
            footer.is_active = v;
        }
        if let Some(v) = self.priority {
            footer.priority = v;
        }
        if let Some(v) = self.notes {
            footer.notes = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footer(template: &str) -> FooterTemplate {
        let now = Utc::now();
        FooterTemplate {
            id: Uuid::new_v4(),
            footer_type: FooterType::AppDownload,
            name: "App".to_string(),
            template: template.to_string(),
            urls: BTreeMap::from([
                ("app_ios".to_string(), "https://apps.example/ios".to_string()),
                ("app_android".to_string(), "https://apps.example/android".to_string()),
            ]),
            probability: 25,
            priority: 0,
            is_active: true,
            notes: None,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn render_fills_phrase_and_urls() {
        let f = footer("PD: {frase}. Bajate la app: {app_ios} / {app_android}");
        assert_eq!(
            f.render(Some("Tu proceso es único")),
            "PD: Tu proceso es único. Bajate la app: https://apps.example/ios / https://apps.example/android"
        );
    }

    #[test]
    fn render_without_phrase_drops_placeholder() {
        assert_eq!(footer("PD: {frase}").render(None), "PD:");
        assert_eq!(footer("Pensá en {frase} hoy").render(None), "Pensá en hoy");
        assert_eq!(
            footer("💡 {frase}\n📱 {app_ios}").render(None),
            "📱 https://apps.example/ios"
        );
        assert!(!footer("{frase}").render(None).contains('{'));
    }

    #[test]
    fn footer_type_uses_wire_names() {
        let json = serde_json::to_string(&FooterType::CoachingCall).unwrap();
        assert_eq!(json, "\"llamada_coaching\"");
        assert_eq!("libro".parse::<FooterType>().unwrap(), FooterType::Book);
    }

    #[test]
    fn negative_probability_weighs_zero() {
        let mut f = footer("x");
        f.probability = -5;
        assert_eq!(f.weight(), 0);
    }
}
