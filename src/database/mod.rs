pub mod memory;

pub use memory::MemoryEventStore;
