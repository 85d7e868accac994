pub mod error;
pub mod index;
pub mod oracle;
pub mod store;

pub use error::{CollaboratorError, Result};
pub use index::{cosine_similarity, Embedder, HashingEmbedder, InMemoryVectorIndex, IndexHit, VectorIndex};
pub use oracle::{
    build_oracle, map_oracle_label, ClassificationOracle, ClaudeOracle, OllamaOracle, OpenAIOracle,
    OracleConfig, OracleProvider, OracleVerdict,
};
pub use store::{ContentStore, DirectoryContentStore, MemoryContentStore};
