pub mod chat_stream;
pub mod embeddings;
pub mod generate;
pub mod prompts;
