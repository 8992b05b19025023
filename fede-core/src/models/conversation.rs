use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::knowledge::{Category, ContentType};

/// A knowledge item as it was used in one exchange, with its score at the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSource {
    pub id: Uuid,
    pub title: String,
    pub category: Category,
    pub content_type: ContentType,
    pub score: f32,
}

/// How the engine resolved a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered,
    OutOfScope,
    CrisisEscalation,
    Degraded,
    Failed,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Answered => "answered",
            TurnOutcome::OutOfScope => "out_of_scope",
            TurnOutcome::CrisisEscalation => "crisis_escalation",
            TurnOutcome::Degraded => "degraded",
            TurnOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "answered" => Some(TurnOutcome::Answered),
            "out_of_scope" => Some(TurnOutcome::OutOfScope),
            "crisis_escalation" => Some(TurnOutcome::CrisisEscalation),
            "degraded" => Some(TurnOutcome::Degraded),
            "failed" => Some(TurnOutcome::Failed),
            _ => None,
        }
    }
}

/// One recorded exchange. Immutable after creation apart from the rating and
/// feedback fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub user_message: String,
    pub assistant_response: String,
    pub knowledge_sources: Vec<KnowledgeSource>,
    pub detected_category: Option<Category>,
    pub outcome: TurnOutcome,
    /// Top similarity among the knowledge used, if any.
    pub confidence: Option<f32>,
    pub was_successful: bool,
    pub user_rating: Option<i16>,
    pub user_feedback: Option<String>,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Aggregates over one session's turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_messages: usize,
    pub avg_rating: f64,
    pub avg_processing_time: i64,
    pub categories: std::collections::BTreeMap<String, usize>,
    pub outcomes: std::collections::BTreeMap<String, usize>,
}

impl SessionStats {
    pub fn from_turns(turns: &[ConversationTurn]) -> Self {
        let rated: Vec<f64> = turns
            .iter()
            .filter_map(|t| t.user_rating.map(f64::from))
            .collect();
        let avg_rating = if rated.is_empty() {
            0.0
        } else {
            let avg = rated.iter().sum::<f64>() / rated.len() as f64;
            (avg * 100.0).round() / 100.0
        };

        let avg_processing_time = if turns.is_empty() {
            0
        } else {
            let total: i64 = turns.iter().map(|t| t.processing_time_ms).sum();
            (total as f64 / turns.len() as f64).round() as i64
        };

        let mut categories = std::collections::BTreeMap::new();
        let mut outcomes = std::collections::BTreeMap::new();
        for turn in turns {
            if let Some(category) = &turn.detected_category {
                *categories.entry(category.to_string()).or_insert(0) += 1;
            }
            *outcomes.entry(turn.outcome.as_str().to_string()).or_insert(0) += 1;
        }

        Self {
            total_messages: turns.len(),
            avg_rating,
            avg_processing_time,
            categories,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(rating: Option<i16>, ms: i64, category: Option<Category>) -> ConversationTurn {
        ConversationTurn {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            user_id: Uuid::nil(),
            user_message: "hola".to_string(),
            assistant_response: "hola!".to_string(),
            knowledge_sources: vec![],
            detected_category: category,
            outcome: TurnOutcome::Answered,
            confidence: None,
            was_successful: true,
            user_rating: rating,
            user_feedback: None,
            processing_time_ms: ms,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn session_stats_average_only_rated_turns() {
        let turns = vec![
            turn(Some(5), 100, Some(Category::Autoestima)),
            turn(None, 200, Some(Category::Autoestima)),
            turn(Some(4), 300, None),
        ];
        let stats = SessionStats::from_turns(&turns);
        assert_eq!(stats.total_messages, 3);
        assert!((stats.avg_rating - 4.5).abs() < 1e-9);
        assert_eq!(stats.avg_processing_time, 200);
        assert_eq!(stats.categories.get("autoestima"), Some(&2));
        assert_eq!(stats.outcomes.get("answered"), Some(&3));
    }

    #[test]
    fn session_stats_of_empty_session_are_zero() {
        let stats = SessionStats::from_turns(&[]);
        assert_eq!(stats, SessionStats::default());
    }
}
