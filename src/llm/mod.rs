pub mod grader;
pub mod openai;

pub use grader::LlmGrader;
pub use openai::{LlmClient, LlmConfig};
