pub mod affinity;
pub mod defer;
pub mod memory;
