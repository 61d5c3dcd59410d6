pub mod analysis;
pub mod characters;
pub mod decode;
pub mod enrichment;
pub mod illustration;
pub mod image;
pub mod llm;
pub mod router;
pub mod safety;
pub mod story;
pub mod variants;
pub mod vocabulary;
pub mod workflow;

#[cfg(test)]
pub mod testing;
