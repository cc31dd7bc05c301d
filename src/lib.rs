//! A local knowledge base for retrieval-augmented answering.
//!
//! Documents are split into overlapping chunks, each chunk is embedded, and
//! queries are answered by nearest-neighbour search over those vectors. Every
//! hit carries enough metadata to trace it back to the document it came from.
//!
//! ```
//! # let tmp = tempfile::tempdir().unwrap();
//! use std::sync::Arc;
//! use knowbase::{Chunker, ChunkingConfig, HashingEmbedder, KnowledgeBase};
//! use knowbase::tokenizer::WhitespaceTokenizer;
//!
//! let chunker = Chunker::new(ChunkingConfig::new(3, 0), Arc::new(WhitespaceTokenizer)).unwrap();
//! let kb = KnowledgeBase::open(
//!     tmp.path().join("knowledge.redb"),
//!     chunker,
//!     Arc::new(HashingEmbedder::default()),
//! )
//! .unwrap();
//!
//! kb.add_document("pets.md", "the cat sat\n\nthe dog ran").unwrap();
//! let hits = kb.search("dog", 1, None).unwrap();
//! assert_eq!(hits[0].content, "the dog ran");
//! ```

pub mod answer;
pub mod chunking;
pub mod data_dir;
pub mod doc_id;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod knowledge_base;
pub mod mcp;
pub mod model_manager;
pub mod openai;
pub mod registry;
pub mod settings;
pub mod store;
pub mod tokenizer;
pub mod vector_index;
pub mod walker;

pub use answer::{Answer, AnswerGenerator};
pub use chunking::{Chunk, Chunker, ChunkingConfig};
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use embedding::{EmbeddingProvider, HashingEmbedder};
pub use error::{Error, Result};
pub use extract::{FileExtractor, PdfExtractor, PlainTextExtractor, TextExtractor};
pub use knowledge_base::{KnowledgeBase, SearchResult};
pub use model_manager::ColbertEmbedder;
pub use registry::Document;
pub use settings::{Settings, SettingsDb};
pub use vector_index::{ChunkMetadata, VectorIndex};
