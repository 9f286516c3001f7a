mod extract;
pub mod offer;
pub mod spec;
pub mod writer;

pub use extract::FieldScraper;
pub use spec::{FieldSpec, MrpPolicy};
pub use writer::{CsvCheckpoint, CsvWriterConfig};

pub use anyhow;
