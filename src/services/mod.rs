pub mod nl_query;

pub use nl_query::{GenerationRequest, NlQueryEngine, QueryAnswer, SqlGenerator};
