pub mod interrupts;
pub mod kvm;
pub mod memory;
pub mod sampling;
pub mod scheduler;
