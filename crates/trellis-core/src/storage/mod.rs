pub mod memory;
#[cfg(test)]
pub mod testing;

pub use memory::MemoryStore;
