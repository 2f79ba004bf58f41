pub mod coordinator;
pub mod gate;
pub mod locks;
pub mod refusals;
