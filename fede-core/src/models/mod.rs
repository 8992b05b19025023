pub mod conversation;
pub mod footer;
pub mod knowledge;
pub mod session;

pub use conversation::{ConversationTurn, KnowledgeSource, SessionStats, TurnOutcome};
pub use footer::{FooterPatch, FooterTemplate, FooterType, NewFooter};
pub use knowledge::{
    Category, ContentType, KnowledgeItem, KnowledgePatch, KnowledgeSummary, NewKnowledge,
};
pub use session::{HistoryMessage, Role};
