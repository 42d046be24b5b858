pub mod data_container;

pub use data_container::{DataContainer, PasteOutcome};
