pub mod embedding;
pub mod hash;
pub mod image;
pub mod pipeline;
pub mod scanner;
pub mod similarity;
pub mod thumbnail;
