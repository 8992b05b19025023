use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of source material a knowledge item was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Article,
    Book,
    Video,
    Methodology,
    Tip,
    Course,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Article => "article",
            ContentType::Book => "book",
            ContentType::Video => "video",
            ContentType::Methodology => "methodology",
            ContentType::Tip => "tip",
            ContentType::Course => "course",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "article" => Ok(ContentType::Article),
            "book" => Ok(ContentType::Book),
            "video" => Ok(ContentType::Video),
            "methodology" => Ok(ContentType::Methodology),
            "tip" => Ok(ContentType::Tip),
            "course" => Ok(ContentType::Course),
            other => Err(format!("unknown content type '{}'", other)),
        }
    }
}

/// Thematic category. The seven steps of the coaching method plus the generic
/// topics; anything else round-trips through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    ContactoCero,
    RedesSociales,
    LookVestuario,
    VidaSocialAlfa,
    ResponderAlfa,
    Confundido,
    VolverAlfa,
    RupturaPareja,
    Autoestima,
    Comunicacion,
    Emociones,
    CrecimientoPersonal,
    Relaciones,
    CoachingOntologico,
    Mindfulness,
    #[default]
    General,
    Custom(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::ContactoCero => "paso_1_contacto_cero",
            Category::RedesSociales => "paso_2_redes_sociales",
            Category::LookVestuario => "paso_3_look_vestuario",
            Category::VidaSocialAlfa => "paso_4_vida_social_alfa",
            Category::ResponderAlfa => "paso_5_responder_alfa",
            Category::Confundido => "paso_6_confundido",
            Category::VolverAlfa => "paso_7_volver_alfa",
            Category::RupturaPareja => "ruptura_pareja",
            Category::Autoestima => "autoestima",
            Category::Comunicacion => "comunicacion",
            Category::Emociones => "emociones",
            Category::CrecimientoPersonal => "crecimiento_personal",
            Category::Relaciones => "relaciones",
            Category::CoachingOntologico => "coaching_ontologico",
            Category::Mindfulness => "mindfulness",
            Category::General => "general",
            Category::Custom(s) => s,
        }
    }

    /// Step number (1-7) for the seven-step taxonomy.
    pub fn step(&self) -> Option<u8> {
        match self {
            Category::ContactoCero => Some(1),
            Category::RedesSociales => Some(2),
            Category::LookVestuario => Some(3),
            Category::VidaSocialAlfa => Some(4),
            Category::ResponderAlfa => Some(5),
            Category::Confundido => Some(6),
            Category::VolverAlfa => Some(7),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("category cannot be empty".to_string());
        }
        Ok(match s {
            "paso_1_contacto_cero" => Category::ContactoCero,
            "paso_2_redes_sociales" => Category::RedesSociales,
            "paso_3_look_vestuario" => Category::LookVestuario,
            "paso_4_vida_social_alfa" => Category::VidaSocialAlfa,
            "paso_5_responder_alfa" => Category::ResponderAlfa,
            "paso_6_confundido" => Category::Confundido,
            "paso_7_volver_alfa" => Category::VolverAlfa,
            "ruptura_pareja" => Category::RupturaPareja,
            "autoestima" => Category::Autoestima,
            "comunicacion" => Category::Comunicacion,
            "emociones" => Category::Emociones,
            "crecimiento_personal" => Category::CrecimientoPersonal,
            "relaciones" => Category::Relaciones,
            "coaching_ontologico" => Category::CoachingOntologico,
            "mindfulness" => Category::Mindfulness,
            "general" => Category::General,
            other => Category::Custom(other.to_string()),
        })
    }
}

impl TryFrom<String> for Category {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub content_type: ContentType,
    pub category: Category,
    /// Null until computed; such items never take part in ranking.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub is_active: bool,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Priority assigned when the ingestion payload leaves it out.
pub const DEFAULT_PRIORITY: i32 = 5;

impl KnowledgeItem {
    /// Build a fresh, active, not-yet-embedded item from an ingestion payload.
    pub fn from_new(input: NewKnowledge, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: input.title.trim().to_string(),
            content: input.content.trim().to_string(),
            content_type: input.content_type,
            category: input.category,
            embedding: None,
            tags: input.tags,
            priority: input.priority.unwrap_or(DEFAULT_PRIORITY),
            is_active: true,
            usage_count: 0,
            last_used_at: None,
            source_url: input.source_url,
            metadata: input.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        }
    }

    /// Text handed to the embedding provider for this item.
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }

    pub fn summary(&self) -> KnowledgeSummary {
        KnowledgeSummary {
            id: self.id,
            title: self.title.clone(),
            content_type: self.content_type,
            category: self.category.clone(),
            tags: self.tags.clone(),
            priority: self.priority,
            is_active: self.is_active,
            has_embedding: self.embedding.is_some(),
            usage_count: self.usage_count,
        }
    }
}

/// Compact view returned by the ingestion and listing surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSummary {
    pub id: Uuid,
    pub title: String,
    pub content_type: ContentType,
    pub category: Category,
    pub tags: Vec<String>,
    pub priority: i32,
    pub is_active: bool,
    pub has_embedding: bool,
    pub usage_count: i64,
}

/// Ingestion payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKnowledge {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: Option<i32>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Partial edit of an existing item.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub content_type: Option<ContentType>,
    pub category: Option<Category>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    pub source_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl KnowledgePatch {
    /// Whether applying this patch changes the embedded text.
    pub fn touches_embedding(&self) -> bool {
        self.title.is_some() || self.content.is_some()
    }

    pub fn apply(self, item: &mut KnowledgeItem) {
        if let Some(v) = self.title {
            item.title = v.trim().to_string();
        }
        if let Some(v) = self.content {
            item.content = v.trim().to_string();
        }
        if let Some(v) = self.content_type {
            item.content_type = v;
        }
        if let Some(v) = self.category {
            item.category = v;
        }
        if let Some(v) = self.tags {
            item.tags = v;
        }
        if let Some(v) = self.priority {
            item.priority = v;
        }
        if let Some(v) = self.is_active {
            item.is_active = v;
        }
        if let Some(v) = self.source_url {
            item.source_url = Some(v);
        }
        if let Some(v) = self.metadata {
            item.metadata = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_known_and_custom_values() {
        let step: Category = "paso_3_look_vestuario".parse().unwrap();
        assert_eq!(step, Category::LookVestuario);
        assert_eq!(step.step(), Some(3));

        let custom: Category = serde_json::from_str("\"duelo_migratorio\"").unwrap();
        assert_eq!(custom, Category::Custom("duelo_migratorio".to_string()));
        assert_eq!(serde_json::to_string(&custom).unwrap(), "\"duelo_migratorio\"");
        assert_eq!(custom.step(), None);
    }

    #[test]
    fn empty_category_is_rejected() {
        assert!(serde_json::from_str::<Category>("\"  \"").is_err());
    }

    #[test]
    fn content_type_parses_wire_names() {
        assert_eq!("video".parse::<ContentType>().unwrap(), ContentType::Video);
        assert!("podcast".parse::<ContentType>().is_err());
    }
}
