//! Core types and builders for the sessionized event materializer.

pub mod error;
pub mod event_facts;
pub mod event_union;
pub mod relation;
pub mod schema;
pub mod selector;
pub mod sessions;
pub mod tenant;

pub use error::{Error, Result};
pub use event_facts::{EventFact, EventFacts, CAMPAIGN_PREFIX};
pub use event_union::{EventSource, EventUnion, EventUnionRow, RawSource};
pub use relation::*;
pub use sessions::{Session, Sessions, SESSION_TIMEOUT_MINUTES};
pub use tenant::*;
