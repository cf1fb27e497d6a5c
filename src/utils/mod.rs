pub mod chunking;
pub mod hash;
