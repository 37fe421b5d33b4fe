pub mod article;
pub mod session;
pub mod state;

pub use article::{Article, ArticleUpdate, Category, EntityMap, RawArticle};
pub use session::{
    EndReason, NewSessionRecord, RecordFilter, SessionDescriptor, SessionRecord,
    SessionRecordUpdate,
};
pub use state::ReadState;
